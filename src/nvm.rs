use crate::error::NvmError;

/// Board-provided non-volatile memory primitives.
///
/// The device models word-addressable NOR flash: programming can only
/// clear bits (the erased state is all-ones), erasing works on whole
/// pages, and programming is aligned to the write block.
pub trait NvmDevice: Send + Sync {
    /// Returns the number of flash pages exposed by the device.
    fn num_pages(&self) -> usize;

    /// Reads `buf.len()` bytes starting at byte `offset`.
    /// Any offset inside the device is valid; no alignment is required.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), NvmError>;

    /// Erases the given page, restoring every byte to the erased state.
    fn erase(&self, page: usize) -> Result<(), NvmError>;

    /// Programs `data` at byte `offset` and verifies the result.
    /// `offset` and `data.len()` must be multiples of the write block;
    /// only bit-clearing transitions are possible.
    fn program(&self, offset: usize, data: &[u8]) -> Result<(), NvmError>;
}
