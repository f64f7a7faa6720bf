//! Execution of flash-resident binaries through a host environment.
#![allow(unused)]

mod common;

use std::sync::Arc;

use common::{fresh_fs, RamNvm};
use xipfs::Error;
use xipfs::ExecCtx;
use xipfs::ExecEnv;
use xipfs::MemoryProtection;
use xipfs::MpuRegion;
use xipfs::NvmError;
use xipfs::OpenFlags;
use xipfs::UserSyscalls;
use xipfs::Xipfs;
use xipfs::EXEC_ARGC_MAX;
use xipfs::EXEC_FREE_RAM_SIZE;
use xipfs::EXEC_STACK_SIZE;
use xipfs::HEADER_SIZE;
use xipfs::PAGE_SIZE;

fn sys_print(_msg: &str) -> i32 {
    0
}

fn sys_get_temp() -> i32 {
    21
}

fn sys_get_led(_pos: i32) -> i32 {
    0
}

fn sys_set_led(_pos: i32, _val: i32) -> i32 {
    0
}

fn sys_copy_file(_name: &str, _buf: &mut [u8]) -> isize {
    -1
}

fn sys_get_file_size(_name: &str) -> Option<usize> {
    None
}

fn syscalls() -> UserSyscalls {
    UserSyscalls {
        print: sys_print,
        get_temp: sys_get_temp,
        get_led: sys_get_led,
        set_led: sys_set_led,
        copy_file: sys_copy_file,
        get_file_size: sys_get_file_size,
    }
}

/// A host-side stand-in for the board's stack-switch trampoline: it
/// records the context it saw and reads the "binary" straight out of
/// flash, the way the CPU would execute it in place.
struct HostEnv {
    device: Arc<RamNvm>,
    status: i32,
    seen_args: Vec<String>,
    seen_image: Vec<u8>,
    entered: bool,
}

impl HostEnv {
    fn new(device: Arc<RamNvm>, status: i32) -> Self {
        HostEnv {
            device,
            status,
            seen_args: Vec::new(),
            seen_image: Vec::new(),
            entered: false,
        }
    }
}

impl ExecEnv for HostEnv {
    fn enter(&mut self, ctx: &mut ExecCtx<'_>) -> i32 {
        self.entered = true;
        self.seen_args = ctx.argv[..ctx.argc].iter().map(|s| s.to_string()).collect();

        let snapshot = self.device.snapshot();
        self.seen_image = snapshot[ctx.crt0.bin_base..ctx.crt0.nvm_start].to_vec();

        // The binary exercises an outbound call through the table.
        assert_eq!((ctx.syscalls.get_temp)(), 21);
        self.status
    }
}

fn install_binary(fs: &mut Xipfs<RamNvm>, path: &str, image: &[u8], exec: bool) {
    fs.new_file(path, image.len() as u32, exec).unwrap();
    let fd = fs.open(path, OpenFlags::WRITE_ONLY).unwrap();
    assert_eq!(fs.write(fd, image).unwrap(), image.len());
    fs.close(fd).unwrap();
}

#[test]
fn test_exec_runs_binary() {
    let mut fs = fresh_fs();
    install_binary(&mut fs, "/prog", b"\x13\x37machine code", true);

    let mut env = HostEnv::new(fs.device(), 42);
    let status = fs
        .exec("/prog", &["prog", "--flag"], &mut env, &syscalls())
        .unwrap();

    assert_eq!(status, 42);
    assert!(env.entered);
    assert_eq!(env.seen_args, vec!["prog", "--flag"]);
    assert_eq!(env.seen_image, b"\x13\x37machine code");
}

#[test]
fn test_exec_context_layout() {
    let mut fs = fresh_fs();
    install_binary(&mut fs, "/prog", b"entry", true);

    struct LayoutEnv;
    impl ExecEnv for LayoutEnv {
        fn enter(&mut self, ctx: &mut ExecCtx<'_>) -> i32 {
            // First record sits at the window start, so the image
            // begins right after the header.
            assert_eq!(ctx.crt0.bin_base, HEADER_SIZE);
            assert_eq!(ctx.crt0.nvm_start, HEADER_SIZE + 5);
            assert_eq!(ctx.crt0.nvm_end, PAGE_SIZE);
            assert_eq!(
                ctx.crt0.ram_end - ctx.crt0.ram_start,
                EXEC_FREE_RAM_SIZE
            );
            assert_eq!(ctx.stack.len(), EXEC_STACK_SIZE);
            assert!(ctx.stack.iter().all(|&b| b == 0));
            0
        }
    }

    fs.exec("/prog", &[], &mut LayoutEnv, &syscalls()).unwrap();
}

#[test]
fn test_exec_argv_truncation() {
    let mut fs = fresh_fs();
    install_binary(&mut fs, "/prog", b"entry", true);

    struct CountEnv(usize);
    impl ExecEnv for CountEnv {
        fn enter(&mut self, ctx: &mut ExecCtx<'_>) -> i32 {
            self.0 = ctx.argc;
            0
        }
    }

    let args: Vec<&str> = std::iter::repeat("a").take(EXEC_ARGC_MAX + 8).collect();
    let mut env = CountEnv(0);
    fs.exec("/prog", &args, &mut env, &syscalls()).unwrap();
    assert_eq!(env.0, EXEC_ARGC_MAX);
}

#[test]
fn test_exec_requires_exec_bit() {
    let mut fs = fresh_fs();
    install_binary(&mut fs, "/data", b"not code", false);

    let mut env = HostEnv::new(fs.device(), 0);
    assert_eq!(
        fs.exec("/data", &[], &mut env, &syscalls()),
        Err(Error::AccessDenied)
    );
    assert!(!env.entered);
}

#[test]
fn test_exec_path_errors() {
    let mut fs = fresh_fs();
    fs.mkdir("/d").unwrap();

    let mut env = HostEnv::new(fs.device(), 0);
    assert_eq!(
        fs.exec("/missing", &[], &mut env, &syscalls()),
        Err(Error::NotFound)
    );
    assert_eq!(
        fs.exec("/d", &[], &mut env, &syscalls()),
        Err(Error::IsDirectory)
    );
    assert_eq!(
        fs.exec("/", &[], &mut env, &syscalls()),
        Err(Error::IsDirectory)
    );
}

/// Protection hooks that refuse the first region, the way a
/// misconfigured MPU driver would.
struct FailingMpu;

impl MemoryProtection for FailingMpu {
    fn configure(
        &self,
        region: MpuRegion,
        _base: usize,
        _len: usize,
        _executable: bool,
        _writable: bool,
    ) -> Result<(), ()> {
        match region {
            MpuRegion::Text => Err(()),
            _ => Ok(()),
        }
    }

    fn enable(&self) -> Result<(), ()> {
        Ok(())
    }

    fn disable(&self) -> Result<(), ()> {
        Ok(())
    }
}

struct ProtectedEnv {
    mpu: FailingMpu,
}

impl ExecEnv for ProtectedEnv {
    fn enter(&mut self, _ctx: &mut ExecCtx<'_>) -> i32 {
        panic!("must not enter with a failing protection setup");
    }

    fn protection(&self) -> Option<&dyn MemoryProtection> {
        Some(&self.mpu)
    }
}

#[test]
fn test_exec_protection_failure() {
    let mut fs = fresh_fs();
    install_binary(&mut fs, "/prog", b"entry", true);

    let mut env = ProtectedEnv { mpu: FailingMpu };
    let err = fs.exec("/prog", &[], &mut env, &syscalls()).unwrap_err();
    assert_eq!(err, Error::Io(NvmError::TextRegion));
    assert_eq!(err.errno(), libc::EIO);

    // The execution lock is released on failure.
    let mut env = HostEnv::new(fs.device(), 7);
    assert_eq!(fs.exec("/prog", &[], &mut env, &syscalls()), Ok(7));
}
