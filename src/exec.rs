//! Execution of position-independent binaries directly from flash.
//!
//! The core builds a fixed-layout execution context (CRT0 addresses,
//! stack, arguments, syscall table, scratch RAM) and delegates the
//! actual branch into the binary to an [`ExecEnv`], the only
//! architecture-specific seam. An environment may expose a
//! [`MemoryProtection`] implementation, in which case the text, data
//! and stack regions are fenced before entry.

use crate::config::*;
use crate::error::NvmError;

/// Memory layout handed to the binary's CRT0: where its image lives,
/// which RAM it may use, and where the free flash area begins.
/// Addresses describing flash are byte offsets from the flash base.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crt0Ctx {
    /// Start of the binary image (the record payload).
    pub bin_base: usize,
    /// Available scratch RAM, as host addresses of the context's own
    /// free-RAM window.
    pub ram_start: usize,
    pub ram_end: usize,
    /// First free flash byte past the binary image.
    pub nvm_start: usize,
    /// End of the record's reserved span.
    pub nvm_end: usize,
}

/// Outbound services a binary may call through the syscall table.
/// One entry per permitted service; `exit` is not listed because the
/// environment's trampoline handles the return itself.
#[derive(Clone, Copy)]
pub struct UserSyscalls {
    pub print: fn(&str) -> i32,
    pub get_temp: fn() -> i32,
    pub get_led: fn(pos: i32) -> i32,
    pub set_led: fn(pos: i32, val: i32) -> i32,
    pub copy_file: fn(name: &str, buf: &mut [u8]) -> isize,
    pub get_file_size: fn(name: &str) -> Option<usize>,
}

impl core::fmt::Debug for UserSyscalls {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("UserSyscalls { .. }")
    }
}

/// The per-execution context, zeroed before and after every run.
#[derive(Debug)]
pub struct ExecCtx<'a> {
    pub crt0: Crt0Ctx,
    /// Stack reserved for the binary; the environment switches to its
    /// top before branching to the entry point.
    pub stack: [u8; EXEC_STACK_SIZE],
    pub argc: usize,
    pub argv: [&'a str; EXEC_ARGC_MAX],
    pub syscalls: UserSyscalls,
    /// Scratch RAM window described by `crt0.ram_start`/`ram_end`.
    pub free_ram: [u8; EXEC_FREE_RAM_SIZE],
}

impl<'a> ExecCtx<'a> {
    pub(crate) fn new(
        bin_base: usize,
        bin_size: u64,
        record_end: usize,
        argv: &[&'a str],
        syscalls: &UserSyscalls,
    ) -> Self {
        let mut ctx = ExecCtx {
            crt0: Crt0Ctx::default(),
            stack: [0u8; EXEC_STACK_SIZE],
            argc: 0,
            argv: [""; EXEC_ARGC_MAX],
            syscalls: *syscalls,
            free_ram: [0u8; EXEC_FREE_RAM_SIZE],
        };

        ctx.crt0.bin_base = bin_base;
        ctx.crt0.ram_start = ctx.free_ram.as_ptr() as usize;
        ctx.crt0.ram_end = ctx.crt0.ram_start + EXEC_FREE_RAM_SIZE;
        ctx.crt0.nvm_start = bin_base + bin_size as usize;
        ctx.crt0.nvm_end = record_end;

        while ctx.argc < EXEC_ARGC_MAX && ctx.argc < argv.len() {
            ctx.argv[ctx.argc] = argv[ctx.argc];
            ctx.argc += 1;
        }

        ctx
    }

    /// Clears everything the binary may have written.
    pub(crate) fn cleanup(&mut self) {
        self.stack.fill(0);
        self.free_ram.fill(0);
        self.crt0 = Crt0Ctx::default();
        self.argc = 0;
        self.argv = [""; EXEC_ARGC_MAX];
    }
}

/// The protected regions configured around an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpuRegion {
    /// The binary image: read and execute.
    Text,
    /// The free-RAM window: read and write, never execute.
    Data,
    /// The execution stack: read and write, never execute.
    Stack,
}

/// Board-provided memory protection hooks.
pub trait MemoryProtection {
    fn configure(
        &self,
        region: MpuRegion,
        base: usize,
        len: usize,
        executable: bool,
        writable: bool,
    ) -> core::result::Result<(), ()>;

    fn enable(&self) -> core::result::Result<(), ()>;

    fn disable(&self) -> core::result::Result<(), ()>;
}

/// The architecture-specific boundary: saves the caller's stack,
/// switches to the context's stack top, branches to the binary entry
/// at `crt0.bin_base`, and restores the stack when the binary calls
/// the exit trampoline. A host environment typically interprets or
/// dispatches the payload instead of branching into it.
pub trait ExecEnv {
    fn enter(&mut self, ctx: &mut ExecCtx<'_>) -> i32;

    /// Memory protection hooks, when the environment supports safe
    /// execution.
    fn protection(&self) -> Option<&dyn MemoryProtection> {
        None
    }
}

/// Runs the binary described by `ctx` in `env`, fencing memory when
/// the environment provides protection hooks.
pub(crate) fn run(env: &mut dyn ExecEnv, ctx: &mut ExecCtx<'_>) -> Result<i32, NvmError> {
    if let Some(mpu) = env.protection() {
        let text_len = ctx.crt0.nvm_end - ctx.crt0.bin_base;
        mpu.configure(MpuRegion::Text, ctx.crt0.bin_base, text_len, true, false)
            .map_err(|_| NvmError::TextRegion)?;
        mpu.configure(
            MpuRegion::Data,
            ctx.crt0.ram_start,
            EXEC_FREE_RAM_SIZE,
            false,
            true,
        )
        .map_err(|_| NvmError::DataRegion)?;
        mpu.configure(
            MpuRegion::Stack,
            ctx.stack.as_ptr() as usize,
            EXEC_STACK_SIZE,
            false,
            true,
        )
        .map_err(|_| NvmError::StackRegion)?;
        mpu.enable().map_err(|_| NvmError::EnableProtection)?;
    }

    let status = env.enter(ctx);

    if let Some(mpu) = env.protection() {
        mpu.disable().map_err(|_| NvmError::DisableProtection)?;
    }

    Ok(status)
}
