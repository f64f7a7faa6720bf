//! Flash primitives: address predicates, page erase with verify, and
//! unaligned byte writes by read-modify-write of the enclosing write
//! block.

use crate::config::*;
use crate::error::NvmError;
use crate::nvm::NvmDevice;

/// First byte past the end of the flash address space.
pub(crate) fn flash_end(device: &impl NvmDevice) -> usize {
    device.num_pages() * PAGE_SIZE
}

/// Checks whether an address points into the flash address space.
pub(crate) fn in_flash(device: &impl NvmDevice, addr: usize) -> bool {
    addr < flash_end(device)
}

/// Checks whether copying `n` bytes from `addr` overflows the flash
/// address space.
pub(crate) fn overflows_flash(device: &impl NvmDevice, addr: usize, n: usize) -> bool {
    !in_flash(device, addr + n)
}

/// Checks whether copying `n` bytes from `addr` overflows the flash
/// page containing `addr`.
pub(crate) fn overflows_page(addr: usize, n: usize) -> bool {
    addr % PAGE_SIZE + n > PAGE_SIZE
}

pub(crate) fn page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

/// Translates an address into the number of the page containing it.
pub(crate) fn page_of(addr: usize) -> usize {
    addr / PAGE_SIZE
}

/// Translates a page number into the page's starting address.
pub(crate) fn page_addr(page: usize) -> usize {
    page * PAGE_SIZE
}

/// Checks whether every byte of the given page is in the erased state.
pub(crate) fn is_erased_page(device: &impl NvmDevice, page: usize) -> Result<bool, NvmError> {
    let mut buf = vec![0u8; PAGE_SIZE];
    device.read(page_addr(page), &mut buf)?;
    Ok(buf.iter().all(|&b| b == ERASED_BYTE))
}

/// Erases a flash page, if needed, and verifies the result.
pub(crate) fn erase_page(device: &impl NvmDevice, page: usize) -> Result<(), NvmError> {
    if is_erased_page(device, page)? {
        return Ok(());
    }

    device.erase(page)?;

    if is_erased_page(device, page)? {
        return Ok(());
    }

    log::error!("page {} still dirty after erase", page);
    Err(NvmError::VerifyFailed)
}

/// Reads the flash word enclosing `addr`.
fn read_word(device: &impl NvmDevice, word_addr: usize) -> Result<u32, NvmError> {
    let mut buf = [0u8; WRITE_BLOCK_SIZE];
    device.read(word_addr, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

/// Copies `src` to the unaligned flash address `dst`, one byte at a
/// time, by read-modify-write of the enclosing write block.
///
/// The target area must have been erased beforehand: programming can
/// only clear bits, and each written byte is verified by readback.
/// The copy must not overflow the flash page containing `dst`.
pub(crate) fn write_unaligned(
    device: &impl NvmDevice,
    dst: usize,
    src: &[u8],
) -> Result<(), NvmError> {
    if !in_flash(device, dst) || overflows_flash(device, dst, src.len()) {
        return Err(NvmError::OutOfNvm);
    }
    if overflows_page(dst, src.len()) {
        return Err(NvmError::Unaligned);
    }

    for (i, &byte) in src.iter().enumerate() {
        let addr = dst + i;
        let shift = (addr % WRITE_BLOCK_ALIGNMENT) as u32 * 8;
        let word_addr = addr - addr % WRITE_BLOCK_ALIGNMENT;

        let mut word = read_word(device, word_addr)?;
        word &= !((ERASED_BYTE as u32) << shift);
        word |= (byte as u32) << shift;
        device.program(word_addr, &word.to_ne_bytes())?;

        let mut readback = [0u8];
        device.read(addr, &mut readback)?;
        if readback[0] != byte {
            log::error!("verify mismatch at {:#x}: wrote {:#04x}, read {:#04x}", addr, byte, readback[0]);
            return Err(NvmError::VerifyFailed);
        }
    }

    Ok(())
}

/// Reads a word directly from flash, bypassing the page buffer.
pub(crate) fn read_u32(device: &impl NvmDevice, addr: usize) -> Result<u32, NvmError> {
    let mut buf = [0u8; 4];
    device.read(addr, &mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}
