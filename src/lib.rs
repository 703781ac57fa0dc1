#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! Firmware transfer for bootloaders: XMODEM-CRC over a serial link and
//! UF2 over an emulated FAT16 USB drive.
//!
//! ## About
//!
//! A bootloader has to get a new application image from a host into
//! internal flash without an operating system or a heap. This library
//! implements two ways to do that:
//!
//! * [`XmodemEngine`] - the classic XMODEM-CRC protocol (128-byte packets,
//!   CRC16-CCITT, ACK/NAK with retries) on top of any byte stream,
//!   for example a UART.
//!
//! * [`Uf2Disk`] - a synthetic FAT16 volume for a USB mass-storage class
//!   driver. The host sees a drive with a few small files and a
//!   `CURRENT.UF2` that always reflects the current flash contents.
//!   Copying a `.uf2` file to the drive programs the flash, block by block,
//!   whatever order the host writes sectors in.
//!
//! This library is a protocol implementation only. Code that talks to the
//! UART, the USB peripheral, or programs the flash is not a part of the
//! library and is expected to be provided by the library user through the
//! [`ByteTransport`], [`FlashSink`] and [`Uf2Target`] traits.
//!
//! ### Limitations
//!
//! * No resuming of a partially received transfer after a reset.
//!
//! * One transfer at a time.
//!
//! * Images are neither encrypted nor signed. The bootloader must check
//!   the image (e.g. vector table sanity) before jumping to it.
//!
//! ## Example
//!
//! ```no_run
//! use flashload::*;
//!
//! const FLASH_START: u32 = 0x0800_4000;
//! const FLASH_SIZE: usize = 64 * 1024;
//!
//! // Flash emulated in RAM. A real implementation drives the
//! // flash controller registers instead.
//! struct MyFlash {
//!     memory: [u8; FLASH_SIZE],
//! }
//!
//! impl FlashSink for MyFlash {
//!     const FLASH_START: u32 = FLASH_START;
//!     const FLASH_SIZE: u32 = FLASH_SIZE as u32;
//!     const PAGE_SIZE: u32 = 1024;
//!
//!     fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
//!         let offset = (address - FLASH_START) as usize;
//!         buf.copy_from_slice(&self.memory[offset..offset + buf.len()]);
//!         Ok(())
//!     }
//!
//!     fn erase_page(&mut self, address: u32) -> Result<(), FlashError> {
//!         let offset = (address - FLASH_START) as usize;
//!         self.memory[offset..offset + 1024].fill(0xff);
//!         Ok(())
//!     }
//!
//!     fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
//!         let offset = (address - FLASH_START) as usize;
//!         self.memory[offset..offset + data.len()].copy_from_slice(data);
//!         Ok(())
//!     }
//! }
//!
//! impl Uf2Target for MyFlash {
//!     const FAMILY_ID: u32 = 0x57755a57;
//!
//!     fn transfer_complete(&mut self) {
//!         // schedule a reset into the new application
//!     }
//! }
//!
//! let mut disk: Uf2Disk<MyFlash> = Uf2Disk::new(MyFlash {
//!     memory: [0xff; FLASH_SIZE],
//! });
//!
//! // Called by the USB mass-storage class driver for every sector.
//! let mut sector = [0u8; 512];
//! disk.on_rd_sector(0, &mut sector);
//! disk.on_wr_sector(1000, &sector);
//! ```
//!
//! XMODEM reception straight into flash:
//!
//! ```no_run
//! # use flashload::*;
//! # fn run<T: ByteTransport, F: FlashSink>(serial: T, flash: F) -> Result<(), XmodemError> {
//! let mut engine = XmodemEngine::new(serial);
//! let mut programmer = FlashProgrammer::new(flash);
//! engine.receive_file(|data| programmer.write(data))?;
//! # Ok(())
//! # }
//! ```

mod bitmap;
/// Emulated UF2 disk
pub mod disk;
/// Flash memory abstraction
pub mod flash;
pub mod uf2;
pub mod volume;
pub mod writer;
/// XMODEM-CRC protocol
pub mod xmodem;

#[doc(inline)]
pub use crate::disk::Uf2Disk;
#[doc(inline)]
pub use crate::flash::{FlashError, FlashProgrammer, FlashReader, FlashSink};
#[doc(inline)]
pub use crate::uf2::{BlockError, Uf2Block, Uf2Target};
#[doc(inline)]
pub use crate::volume::{StaticFile, Uf2VirtualVolume, VolumeLayout};
#[doc(inline)]
pub use crate::writer::{Uf2BlockWriter, WriteOutcome, WriteState};
#[doc(inline)]
pub use crate::xmodem::{ByteTransport, XmodemEngine, XmodemError, XmodemPacket};
