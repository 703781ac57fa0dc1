use core::cmp::min;
use log::{debug, warn};

/// Errors that may happen when working with the flash memory
/// (reading, erasing, writing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Address is outside of the flash window or is not aligned.
    Address,
    /// Page erase failed.
    Erase,
    /// Program memory function failed.
    Prog,
    /// Programmed memory failed verification.
    Verify,
    /// Something went wrong, but the device does not know what it was.
    Unknown,
}

/// Trait that describes the flash memory an image is transferred into.
///
/// Both [`XmodemEngine`](crate::xmodem::XmodemEngine) (through
/// [`FlashProgrammer`] and [`FlashReader`]) and
/// [`Uf2Disk`](crate::disk::Uf2Disk) use it. Register sequences that
/// actually erase and program the device are provided by the library user.
///
/// All functions are blocking: they must not return before the flash
/// controller is idle again.
pub trait FlashSink {
    /// Absolute address of the first byte of the application flash window.
    const FLASH_START: u32;

    /// Size of the application flash window in bytes. Must be a multiple
    /// of `256` for UF2.
    const FLASH_SIZE: u32;

    /// Erase granularity in bytes. Default is `1024`.
    const PAGE_SIZE: u32 = 1024;

    /// Copy `buf.len()` bytes of flash starting at `address` into `buf`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erase the page that starts at `address`.
    ///
    /// `address` is always aligned to [`PAGE_SIZE`](FlashSink::PAGE_SIZE).
    fn erase_page(&mut self, address: u32) -> Result<(), FlashError>;

    /// Program `data` at `address`. The target range was erased before.
    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;
}

impl<F: FlashSink> FlashSink for &mut F {
    const FLASH_START: u32 = F::FLASH_START;
    const FLASH_SIZE: u32 = F::FLASH_SIZE;
    const PAGE_SIZE: u32 = F::PAGE_SIZE;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(address, buf)
    }

    fn erase_page(&mut self, address: u32) -> Result<(), FlashError> {
        (**self).erase_page(address)
    }

    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write_block(address, data)
    }
}

/// Offset of `address` inside the flash window, if `len` bytes starting
/// there fit into it.
pub(crate) fn window_offset<F: FlashSink>(address: u32, len: u32) -> Option<u32> {
    let offset = address.checked_sub(F::FLASH_START)?;
    let end = offset.checked_add(len)?;
    if end <= F::FLASH_SIZE {
        Some(offset)
    } else {
        None
    }
}

/// Writes an image sequentially from the start of the flash window.
///
/// Every page is erased right before the first write that lands in it.
/// Intended as the `on_rx_data` callback of
/// [`XmodemEngine::receive_file`](crate::xmodem::XmodemEngine::receive_file):
///
/// ```no_run
/// # use flashload::*;
/// # fn run<T: ByteTransport, F: FlashSink>(engine: &mut XmodemEngine<T>, flash: &mut F) {
/// let mut programmer = FlashProgrammer::new(flash);
/// let result = engine.receive_file(|data| programmer.write(data));
/// # }
/// ```
pub struct FlashProgrammer<F: FlashSink> {
    flash: F,
    address: u32,
    erased_until: u32,
}

impl<F: FlashSink> FlashProgrammer<F> {
    /// Creates a programmer positioned at [`FLASH_START`](FlashSink::FLASH_START).
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            address: F::FLASH_START,
            erased_until: F::FLASH_START,
        }
    }

    /// Append `data` to the image.
    pub fn write(&mut self, data: &[u8]) -> Result<(), FlashError> {
        let len = data.len() as u32;
        let offset = window_offset::<F>(self.address, len).ok_or(FlashError::Address)?;
        let end = F::FLASH_START + offset + len;

        while self.erased_until < end {
            debug!("erase page {:#010x}", self.erased_until);
            self.flash.erase_page(self.erased_until)?;
            self.erased_until += F::PAGE_SIZE;
        }

        self.flash.write_block(self.address, data)?;
        self.address = end;
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn bytes_written(&self) -> u32 {
        self.address - F::FLASH_START
    }

    /// Return the wrapped flash.
    pub fn release(self) -> F {
        self.flash
    }
}

/// Reads an image of a known length sequentially from the start of the
/// flash window. The tail of the last chunk is padded with `0xff`.
///
/// Intended as the `on_tx_data` callback of
/// [`XmodemEngine::send_file`](crate::xmodem::XmodemEngine::send_file).
pub struct FlashReader<F: FlashSink> {
    flash: F,
    address: u32,
    remaining: u32,
}

impl<F: FlashSink> FlashReader<F> {
    /// Creates a reader for the first `length` bytes of the flash window.
    /// `length` is clamped to [`FLASH_SIZE`](FlashSink::FLASH_SIZE).
    pub fn new(flash: F, length: u32) -> Self {
        if length > F::FLASH_SIZE {
            warn!("image length {} clamped to flash size", length);
        }
        Self {
            flash,
            address: F::FLASH_START,
            remaining: min(length, F::FLASH_SIZE),
        }
    }

    /// Fill `buf` with the next chunk. Returns `Ok(false)` when the whole
    /// image has been read already.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<bool, FlashError> {
        if self.remaining == 0 {
            return Ok(false);
        }

        let len = min(buf.len() as u32, self.remaining) as usize;
        self.flash.read(self.address, &mut buf[..len])?;
        buf[len..].fill(0xff);

        self.address += len as u32;
        self.remaining -= len as u32;
        Ok(true)
    }

    /// Return the wrapped flash.
    pub fn release(self) -> F {
        self.flash
    }
}
