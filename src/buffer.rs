//! The single page-sized staging buffer every flash mutation goes
//! through. Writes to the same page coalesce in RAM; the facade
//! flushes at every externally visible commit point, which makes the
//! flush the crash-consistency boundary.

use crate::config::*;
use crate::error::NvmError;
use crate::flash;
use crate::nvm::NvmDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    /// No page association; the buffer content is meaningless.
    Clean,
    /// A page is loaded and may carry pending modifications.
    Loaded,
}

/// A one-page read-through write-back cache over the flash device.
/// At most one page is loaded at a time.
#[derive(Debug)]
pub(crate) struct PageBuffer {
    state: BufferState,
    page: usize,
    buf: Box<[u8; PAGE_SIZE]>,
}

impl PageBuffer {
    pub(crate) fn new() -> Self {
        PageBuffer {
            state: BufferState::Clean,
            page: 0,
            buf: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Drops the page association without writing anything back.
    /// Required after compaction or format, which rewrite pages behind
    /// the buffer's back.
    pub(crate) fn reset(&mut self) {
        self.state = BufferState::Clean;
        self.page = 0;
    }

    fn load(&mut self, device: &impl NvmDevice, page: usize) -> Result<(), NvmError> {
        device.read(flash::page_addr(page), self.buf.as_mut())?;
        self.page = page;
        self.state = BufferState::Loaded;
        Ok(())
    }

    /// Checks whether the buffer content diverged from the underlying
    /// flash page.
    fn need_flush(&self, device: &impl NvmDevice) -> Result<bool, NvmError> {
        if self.state == BufferState::Clean {
            return Ok(false);
        }
        let mut current = vec![0u8; PAGE_SIZE];
        device.read(flash::page_addr(self.page), &mut current)?;
        Ok(current.as_slice() != &self.buf[..])
    }

    /// Writes the buffer back by erase-and-program if it diverged from
    /// the flash page, and drops the association. A buffer that did
    /// not diverge stays loaded.
    pub(crate) fn flush(&mut self, device: &impl NvmDevice) -> Result<(), NvmError> {
        if !self.need_flush(device)? {
            return Ok(());
        }

        log::trace!("flushing page {}", self.page);
        flash::erase_page(device, self.page)?;
        device.program(flash::page_addr(self.page), self.buf.as_ref())?;
        self.reset();

        Ok(())
    }

    /// Ensures the page containing `addr` is loaded, flushing any
    /// previously loaded page first.
    fn fault_in(&mut self, device: &impl NvmDevice, addr: usize) -> Result<(), NvmError> {
        let page = flash::page_of(addr);
        match self.state {
            BufferState::Clean => self.load(device, page),
            BufferState::Loaded if self.page != page => {
                self.flush(device)?;
                self.load(device, page)
            }
            BufferState::Loaded => Ok(()),
        }
    }

    /// Buffered byte-wise read from flash.
    pub(crate) fn read(
        &mut self,
        device: &impl NvmDevice,
        dest: &mut [u8],
        src: usize,
    ) -> Result<(), NvmError> {
        for (i, slot) in dest.iter_mut().enumerate() {
            let addr = src + i;
            if !flash::in_flash(device, addr) {
                return Err(NvmError::OutOfNvm);
            }
            self.fault_in(device, addr)?;
            *slot = self.buf[addr % PAGE_SIZE];
        }
        Ok(())
    }

    /// Buffered byte-wise write to flash. Nothing is programmed until
    /// the next flush or page change.
    pub(crate) fn write(
        &mut self,
        device: &impl NvmDevice,
        dst: usize,
        src: &[u8],
    ) -> Result<(), NvmError> {
        for (i, &byte) in src.iter().enumerate() {
            let addr = dst + i;
            if !flash::in_flash(device, addr) {
                return Err(NvmError::OutOfNvm);
            }
            self.fault_in(device, addr)?;
            self.buf[addr % PAGE_SIZE] = byte;
        }
        Ok(())
    }

    pub(crate) fn read_u32(
        &mut self,
        device: &impl NvmDevice,
        src: usize,
    ) -> Result<u32, NvmError> {
        let mut buf = [0u8; 4];
        self.read(device, &mut buf, src)?;
        Ok(u32::from_ne_bytes(buf))
    }

    pub(crate) fn write_u32(
        &mut self,
        device: &impl NvmDevice,
        dst: usize,
        val: u32,
    ) -> Result<(), NvmError> {
        self.write(device, dst, &val.to_ne_bytes())
    }
}
