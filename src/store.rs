//! The record store: a singly-linked, contiguous sequence of file
//! records inside the mount window. Records are created at the tail
//! and removal compacts the survivors down so the chain never holds a
//! hole.

use crate::buffer::PageBuffer;
use crate::config::*;
use crate::error::NvmError;
use crate::file::{self, RecordPtr, HEADER_SIZE};
use crate::flash;
use crate::nvm::NvmDevice;

/// The contiguous run of flash pages a file system instance owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub first_page: usize,
    pub page_count: usize,
}

impl Window {
    pub(crate) fn start(&self) -> usize {
        flash::page_addr(self.first_page)
    }

    pub(crate) fn end(&self) -> usize {
        flash::page_addr(self.first_page + self.page_count)
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }
}

/// Retrieves the first record of the chain, or `None` when the file
/// system holds no file.
pub(crate) fn head(
    device: &impl NvmDevice,
    window: &Window,
) -> Result<Option<RecordPtr>, NvmError> {
    let head = window.start();
    if file::read_next(device, head)? == ERASED_WORD {
        return Ok(None);
    }
    file::record_check(device, head)?;
    Ok(Some(head))
}

/// Retrieves the successor of a record: `None` past the last record,
/// whether the chain ends with erased pages or with the full sentinel.
pub(crate) fn next_of(
    device: &impl NvmDevice,
    record: RecordPtr,
) -> Result<Option<RecordPtr>, NvmError> {
    file::record_check(device, record)?;

    let next = file::read_next(device, record)? as usize;
    if next == record {
        // Full sentinel: the chain occupies every page of the window.
        return Ok(None);
    }
    if file::read_next(device, next)? == ERASED_WORD {
        return Ok(None);
    }
    file::record_check(device, next)?;
    Ok(Some(next))
}

/// Retrieves the last record of the chain.
pub(crate) fn tail(
    device: &impl NvmDevice,
    window: &Window,
) -> Result<Option<RecordPtr>, NvmError> {
    let mut tail = match head(device, window)? {
        Some(record) => record,
        None => return Ok(None),
    };
    while let Some(next) = next_of(device, tail)? {
        tail = next;
    }
    Ok(Some(tail))
}

/// Retrieves the address where the next record would be allocated, or
/// fails with `Full` when the tail carries the full sentinel.
pub(crate) fn tail_next(device: &impl NvmDevice, window: &Window) -> Result<RecordPtr, NvmError> {
    let tail = match tail(device, window)? {
        Some(record) => record,
        None => return Ok(window.start()),
    };
    let next = file::read_next(device, tail)? as usize;
    if next == tail {
        return Err(NvmError::Full);
    }
    Ok(next)
}

/// Counts the erased pages remaining past the tail of the chain.
pub(crate) fn free_pages(device: &impl NvmDevice, window: &Window) -> Result<usize, NvmError> {
    let head = match head(device, window)? {
        Some(record) => record,
        None => return Ok(window.page_count),
    };
    let tail = tail(device, window)?.unwrap_or(head);
    let used = (tail + file::read_reserved(device, tail)? - head) / PAGE_SIZE;
    Ok(window.page_count - used)
}

/// Creates a new record at the tail of the chain and returns its
/// address.
///
/// `size` is the requested payload capacity; the record spans the
/// smallest whole number of pages holding the header plus `size`
/// bytes. When the allocation consumes the last free page the record
/// is written with the full sentinel.
pub(crate) fn new_file(
    device: &impl NvmDevice,
    buffer: &mut PageBuffer,
    window: &Window,
    path: &str,
    size: u32,
    exec: bool,
) -> Result<RecordPtr, NvmError> {
    file::path_check_str(path)?;

    let record = tail_next(device, window)?;
    let free = free_pages(device, window)?;

    let reserved = (HEADER_SIZE + size as usize).div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let reserved_pages = reserved / PAGE_SIZE;

    let next = if reserved_pages < free {
        record + reserved
    } else if reserved_pages == free {
        record
    } else {
        return Err(NvmError::NoSpace);
    };

    // Build the header in RAM over the erased pattern; the size log
    // stays erased until the first size commit.
    let mut header = [ERASED_BYTE; HEADER_SIZE];
    header[file::OFF_NEXT..file::OFF_NEXT + 4].copy_from_slice(&(next as u32).to_ne_bytes());
    header[file::OFF_PATH..file::OFF_PATH + path.len()].copy_from_slice(path.as_bytes());
    header[file::OFF_PATH + path.len()] = b'\0';
    header[file::OFF_RESERVED..file::OFF_RESERVED + 4]
        .copy_from_slice(&(reserved as u32).to_ne_bytes());
    header[file::OFF_EXEC..file::OFF_EXEC + 4].copy_from_slice(&(exec as u32).to_ne_bytes());

    buffer.write(device, record, &header)?;
    buffer.flush(device)?;

    log::debug!("created {:?} at {:#x}, {} page(s)", path, record, reserved_pages);
    Ok(record)
}

/// Removes a record and compacts the chain: every record after the
/// victim shifts down by the victim's span, and the vacated tail pages
/// are left erased.
///
/// The page buffer must have been flushed beforehand and reset
/// afterwards; the shift writes around it.
pub(crate) fn remove(device: &impl NvmDevice, victim: RecordPtr) -> Result<(), NvmError> {
    let mut source = next_of(device, victim)?;

    log::debug!("removing record at {:#x}", victim);
    file::erase(device, victim)?;

    let mut dst = victim;
    while let Some(src) = source {
        source = next_of(device, src)?;

        let reserved = file::read_reserved(device, src)?;

        // Rebuild the header at its new address with a fixed-up link.
        let mut header = [0u8; HEADER_SIZE];
        device.read(src, &mut header)?;
        header[file::OFF_NEXT..file::OFF_NEXT + 4]
            .copy_from_slice(&((dst + reserved) as u32).to_ne_bytes());
        flash::write_unaligned(device, dst, &header)?;

        // The remainder of the first page, then the other pages,
        // erasing each source page once copied. Already erased source
        // pages cost nothing: their destination is erased too.
        let mut page = vec![0u8; PAGE_SIZE - HEADER_SIZE];
        device.read(src + HEADER_SIZE, &mut page)?;
        flash::write_unaligned(device, dst + HEADER_SIZE, &page)?;
        flash::erase_page(device, flash::page_of(src))?;

        let mut page = vec![0u8; PAGE_SIZE];
        for i in 1..reserved / PAGE_SIZE {
            let src_page = flash::page_of(src) + i;
            if !flash::is_erased_page(device, src_page)? {
                device.read(flash::page_addr(src_page), &mut page)?;
                flash::write_unaligned(device, dst + i * PAGE_SIZE, &page)?;
                flash::erase_page(device, src_page)?;
            }
        }

        dst += reserved;
    }

    Ok(())
}

/// Renames every record whose path starts with `from` to carry the
/// `to` prefix instead. Returns the number of records renamed.
pub(crate) fn rename_all(
    device: &impl NvmDevice,
    buffer: &mut PageBuffer,
    window: &Window,
    from: &str,
    to: &str,
) -> Result<usize, NvmError> {
    if from.len() >= PATH_MAX || to.len() >= PATH_MAX {
        return Err(NvmError::UnterminatedPath);
    }

    let mut renamed = 0;
    let mut cursor = head(device, window)?;
    while let Some(record) = cursor {
        let path = file::read_path(device, record)?;
        if path.starts_with(from.as_bytes()) {
            let tail_len = path[from.len()..]
                .iter()
                .position(|&b| b == b'\0')
                .ok_or(NvmError::UnterminatedPath)?;
            let mut new_path = String::with_capacity(to.len() + tail_len);
            new_path.push_str(to);
            new_path.push_str(core::str::from_utf8(&path[from.len()..from.len() + tail_len])
                .map_err(|_| NvmError::BadPathChar)?);
            new_path.truncate(PATH_MAX - 1);
            file::rename(device, buffer, record, &new_path)?;
            renamed += 1;
        }
        cursor = next_of(device, record)?;
    }

    Ok(renamed)
}

/// Erases every page of the mount window.
pub(crate) fn format(device: &impl NvmDevice, window: &Window) -> Result<(), NvmError> {
    for page in window.first_page..window.first_page + window.page_count {
        flash::erase_page(device, page)?;
    }
    Ok(())
}
