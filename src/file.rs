//! On-flash file records and the per-record operations: validation,
//! size log, byte I/O, rename, erase.

use crate::buffer::PageBuffer;
use crate::config::*;
use crate::error::NvmError;
use crate::flash;
use crate::nvm::NvmDevice;

/// A record is identified by its byte offset from the flash base.
/// Compaction moves records, so a pointer is only stable while the
/// global lock is held and no removal happens.
pub type RecordPtr = usize;

/*
 * Record layout, native-endian words in declared order. The offsets
 * are part of the on-flash format and visible to external tooling.
 */
pub const OFF_NEXT: usize = 0;
pub const OFF_PATH: usize = 4;
pub const OFF_RESERVED: usize = OFF_PATH + PATH_MAX;
pub const OFF_SIZE_LOG: usize = OFF_RESERVED + 4;
pub const OFF_EXEC: usize = OFF_SIZE_LOG + FSLOT_MAX * 4;
/// Total header length; the payload starts here.
pub const HEADER_SIZE: usize = OFF_EXEC + 4;

/// Checks whether a byte belongs to the path charset.
fn path_charset_check(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'/' || c == b'.' || c == b'-' || c == b'_'
}

/// Checks that a null-terminated path buffer holds a valid path:
/// non-empty, terminated within `PATH_MAX`, and drawn from the
/// charset.
pub(crate) fn path_check(path: &[u8; PATH_MAX]) -> Result<(), NvmError> {
    if path[0] == b'\0' {
        return Err(NvmError::EmptyPath);
    }
    for i in 0..PATH_MAX {
        if path[i] == b'\0' {
            return Ok(());
        }
        if !path_charset_check(path[i]) {
            return Err(NvmError::BadPathChar);
        }
    }
    Err(NvmError::UnterminatedPath)
}

/// Checks a path supplied by the caller before it is stored.
pub(crate) fn path_check_str(path: &str) -> Result<(), NvmError> {
    if path.is_empty() {
        return Err(NvmError::EmptyPath);
    }
    if path.len() >= PATH_MAX {
        return Err(NvmError::UnterminatedPath);
    }
    if !path.bytes().all(path_charset_check) {
        return Err(NvmError::BadPathChar);
    }
    Ok(())
}

pub(crate) fn read_next(device: &impl NvmDevice, record: RecordPtr) -> Result<u32, NvmError> {
    flash::read_u32(device, record + OFF_NEXT)
}

pub(crate) fn read_reserved(device: &impl NvmDevice, record: RecordPtr) -> Result<usize, NvmError> {
    Ok(flash::read_u32(device, record + OFF_RESERVED)? as usize)
}

pub(crate) fn read_exec(device: &impl NvmDevice, record: RecordPtr) -> Result<u32, NvmError> {
    flash::read_u32(device, record + OFF_EXEC)
}

/// Reads the stored path, including its null terminator and padding.
pub(crate) fn read_path(
    device: &impl NvmDevice,
    record: RecordPtr,
) -> Result<[u8; PATH_MAX], NvmError> {
    let mut path = [0u8; PATH_MAX];
    device.read(record + OFF_PATH, &mut path)?;
    Ok(path)
}

/// Validates a record's structure: alignment, membership in the flash
/// address space, link coherence, path validity and permission bits.
pub(crate) fn record_check(device: &impl NvmDevice, record: RecordPtr) -> Result<(), NvmError> {
    if !flash::page_aligned(record) {
        return Err(NvmError::Unaligned);
    }
    if !flash::in_flash(device, record) {
        return Err(NvmError::OutOfNvm);
    }

    let next = read_next(device, record)? as usize;
    let reserved = read_reserved(device, record)?;
    if reserved == 0 || reserved % PAGE_SIZE != 0 {
        return Err(NvmError::BrokenLink);
    }
    if next != record {
        if !flash::page_aligned(next) {
            return Err(NvmError::Unaligned);
        }
        if !flash::in_flash(device, next) {
            return Err(NvmError::OutOfNvm);
        }
        if record >= next {
            return Err(NvmError::BrokenLink);
        }
        if record + reserved != next {
            return Err(NvmError::BrokenLink);
        }
    }

    path_check(&read_path(device, record)?)?;

    let exec = read_exec(device, record)?;
    if exec != 0 && exec != 1 {
        return Err(NvmError::BadPerm);
    }

    Ok(())
}

/// The maximum byte position inside a record's payload.
pub(crate) fn max_pos(device: &impl NvmDevice, record: RecordPtr) -> Result<u64, NvmError> {
    record_check(device, record)?;
    let reserved = read_reserved(device, record)?;
    Ok((reserved - HEADER_SIZE) as u64)
}

/// Retrieves the current file size: the last programmed entry of the
/// size log, or zero when no size has ever been committed.
pub(crate) fn get_size(device: &impl NvmDevice, record: RecordPtr) -> Result<u64, NvmError> {
    record_check(device, record)?;

    let slot = |i: usize| flash::read_u32(device, record + OFF_SIZE_LOG + i * 4);

    if slot(0)? == ERASED_WORD {
        // No size committed to flash yet.
        return Ok(0);
    }
    for i in 1..FSLOT_MAX {
        if slot(i)? == ERASED_WORD {
            return Ok(slot(i - 1)? as u64);
        }
    }
    Ok(slot(FSLOT_MAX - 1)? as u64)
}

/// Appends the new file size to the size log. Slots fill strictly
/// left to right; once exhausted the write wraps to slot zero, which
/// only yields a readable size again after the record is erased and
/// recreated.
pub(crate) fn set_size(
    device: &impl NvmDevice,
    buffer: &mut PageBuffer,
    record: RecordPtr,
    size: u64,
) -> Result<(), NvmError> {
    record_check(device, record)?;

    let mut slot = 0;
    while slot < FSLOT_MAX {
        if flash::read_u32(device, record + OFF_SIZE_LOG + slot * 4)? == ERASED_WORD {
            break;
        }
        slot += 1;
    }
    let slot = slot % FSLOT_MAX;

    buffer.write_u32(device, record + OFF_SIZE_LOG + slot * 4, size as u32)?;
    buffer.flush(device)
}

/// Reads the payload byte at `pos` through the page buffer.
pub(crate) fn read_byte(
    device: &impl NvmDevice,
    buffer: &mut PageBuffer,
    record: RecordPtr,
    pos: u64,
) -> Result<u8, NvmError> {
    if pos > max_pos(device, record)? {
        return Err(NvmError::MaxOffset);
    }
    let mut byte = [0u8];
    buffer.read(device, &mut byte, record + HEADER_SIZE + pos as usize)?;
    Ok(byte[0])
}

/// Writes the payload byte at `pos` through the page buffer. The
/// write stays in RAM until the buffer flushes.
pub(crate) fn write_byte(
    device: &impl NvmDevice,
    buffer: &mut PageBuffer,
    record: RecordPtr,
    pos: u64,
    byte: u8,
) -> Result<(), NvmError> {
    if pos > max_pos(device, record)? {
        return Err(NvmError::MaxOffset);
    }
    buffer.write(device, record + HEADER_SIZE + pos as usize, &[byte])
}

/// Rewrites the record's path field. The whole enclosing page is
/// erased and reprogrammed by the buffer flush, so this is the one
/// metadata update that is not a pure bit-clearing program.
pub(crate) fn rename(
    device: &impl NvmDevice,
    buffer: &mut PageBuffer,
    record: RecordPtr,
    to_path: &str,
) -> Result<(), NvmError> {
    record_check(device, record)?;
    path_check_str(to_path)?;

    let mut bytes = [0u8; PATH_MAX];
    bytes[..to_path.len()].copy_from_slice(to_path.as_bytes());
    buffer.write(device, record + OFF_PATH, &bytes[..to_path.len() + 1])?;
    buffer.flush(device)
}

/// Erases every page of the record.
pub(crate) fn erase(device: &impl NvmDevice, record: RecordPtr) -> Result<(), NvmError> {
    record_check(device, record)?;

    let start = flash::page_of(record);
    let pages = read_reserved(device, record)? / PAGE_SIZE;
    for page in start..start + pages {
        flash::erase_page(device, page)?;
    }

    Ok(())
}
