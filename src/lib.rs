//! Xipfs is an execute-in-place file system for word-addressable NOR
//! flash: files live as contiguous, page-aligned records the CPU can
//! run binaries from directly, without loading them into RAM.
//!
//! On-flash layout, head first:
//! - File records, a singly-linked contiguous chain
//! - Erased pages (or none, when the tail carries the full sentinel)
//!
//! Xipfs's layers (from bottom to top):
//! 1. NVM device: board-provided erase/program/read primitives.       | User implemented (hardware-specific)
//! 2. Flash: range predicates, verified erase, unaligned writes.      | Fs implemented
//! 3. Page buffer: the single-page staging area all mutations use.    | Fs implemented
//! 4. File records / record store: layout, size log, compaction.      | Fs implemented
//! 5. Path classifier: a path's kind inferred from the record list.   | Fs implemented
//! 6. Xipfs: the POSIX-flavored facade and the executor.              | Fs implemented

mod buffer;
mod config;
mod desc;
mod error;
mod exec;
mod file;
mod flash;
mod fs;
mod nvm;
mod path;
mod store;

pub use config::*;
pub use desc::{DirFd, Fd};
pub use error::FsError as Error;
pub use error::{NvmError, NvmResult, Result};
pub use exec::{Crt0Ctx, ExecCtx, ExecEnv, MemoryProtection, MpuRegion, UserSyscalls};
pub use file::{RecordPtr, HEADER_SIZE, OFF_EXEC, OFF_NEXT, OFF_PATH, OFF_RESERVED, OFF_SIZE_LOG};
pub use fs::{FileKind, OpenFlags, Stat, StatVfs, Xipfs, ST_NOSUID};
pub use nvm::NvmDevice;
pub use path::{PathInfo, PathKind};
