//! UF2 block format.
//!
//! A UF2 file is a sequence of self-describing 512-byte blocks, each
//! carrying up to 476 bytes of payload (256 in practice) and the flash
//! address it belongs to. Blocks may arrive in any order.

use scroll::{ctx, Endian, Pread, Pwrite, LE};

use crate::flash::{window_offset, FlashSink};
use crate::volume::{StaticFile, DEFAULT_FILES};

/// First magic number, `"UF2\n"`.
pub const UF2_MAGIC_START0: u32 = 0x0A32_4655;
/// Second magic number.
pub const UF2_MAGIC_START1: u32 = 0x9E5D_5157;
/// Final magic number at the end of a block.
pub const UF2_MAGIC_END: u32 = 0x0AB1_6F30;

/// Block is not meant to be written to main flash.
pub const UF2_FLAG_NOT_MAIN_FLASH: u32 = 0x0000_0001;
/// Block belongs to a file container.
pub const UF2_FLAG_FILE_CONTAINER: u32 = 0x0000_1000;
/// `family_id` field is valid.
pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x0000_2000;
/// Block carries an MD5 checksum of its payload.
pub const UF2_FLAG_MD5_PRESENT: u32 = 0x0000_4000;

/// Size of an encoded block.
pub const BLOCK_SIZE: usize = 512;
/// Size of the data area inside a block.
pub const BLOCK_DATA_LEN: usize = 476;
/// Payload size of every block this crate flashes or produces.
pub const PAYLOAD_SIZE: u32 = 256;

/// Why a 512-byte sector is not accepted as a firmware block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// One of the magic numbers does not match.
    Magic,
    /// Family id flag missing or family id belongs to another device.
    Family,
    /// `payload_size` is not 256.
    PayloadSize,
    /// `target_addr` is not aligned to 256 bytes.
    Alignment,
    /// Payload does not fit into the flash window.
    Address,
    /// Buffer too short for a block.
    Length,
}

impl From<scroll::Error> for BlockError {
    fn from(_: scroll::Error) -> Self {
        BlockError::Length
    }
}

/// Configuration of a UF2 target.
///
/// Like [`FlashSink`], implemented by the library user. Everything here
/// is fixed at compile time, the emulated volume geometry is derived from
/// these constants.
pub trait Uf2Target: FlashSink {
    /// Family id blocks must carry to be accepted.
    const FAMILY_ID: u32;

    /// Volume label, 11 bytes padded with spaces. Default is `"UF2BOOT    "`.
    const VOLUME_LABEL: [u8; 11] = *b"UF2BOOT    ";

    /// Total number of 512-byte sectors of the emulated disk. Default is
    /// `65535`, the largest FAT16 volume with 1-sector clusters that still
    /// uses the 16-bit sector count.
    const MEDIA_SECTORS: u32 = 0xffff;

    /// Files shown next to `CURRENT.UF2`. Each must fit in one sector.
    const FILES: &'static [StaticFile] = &DEFAULT_FILES;

    /// Called once when all blocks of a UF2 file have been received.
    ///
    /// Bootloader usually validates the image and resets into it a bit
    /// later, after the host has finished its own writes.
    fn transfer_complete(&mut self) {}
}

/// A single UF2 block. Magic numbers are implied.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Uf2Block {
    /// `UF2_FLAG_*` bits.
    pub flags: u32,
    /// Flash address of the first payload byte.
    pub target_addr: u32,
    /// Payload bytes used in `data`.
    pub payload_size: u32,
    /// Sequential block number, starting at `0`.
    pub block_nr: u32,
    /// Total number of blocks in the file.
    pub nr_of_blocks: u32,
    /// Board family id, or file size when the family flag is not set.
    pub family_id: u32,
    /// Payload, padded.
    pub data: [u8; BLOCK_DATA_LEN],
}

impl<'a> ctx::TryFromCtx<'a, Endian> for Uf2Block {
    type Error = BlockError;

    fn try_from_ctx(src: &'a [u8], le: Endian) -> Result<(Self, usize), Self::Error> {
        let mut offset = 0;

        let magic0: u32 = src.gread_with(&mut offset, le)?;
        let magic1: u32 = src.gread_with(&mut offset, le)?;
        let flags: u32 = src.gread_with(&mut offset, le)?;
        let target_addr: u32 = src.gread_with(&mut offset, le)?;
        let payload_size: u32 = src.gread_with(&mut offset, le)?;
        let block_nr: u32 = src.gread_with(&mut offset, le)?;
        let nr_of_blocks: u32 = src.gread_with(&mut offset, le)?;
        let family_id: u32 = src.gread_with(&mut offset, le)?;

        let mut data = [0u8; BLOCK_DATA_LEN];
        src.gread_inout_with(&mut offset, &mut data, le)?;

        let magic_end: u32 = src.gread_with(&mut offset, le)?;

        if magic0 != UF2_MAGIC_START0 || magic1 != UF2_MAGIC_START1 || magic_end != UF2_MAGIC_END {
            return Err(BlockError::Magic);
        }

        Ok((
            Self {
                flags,
                target_addr,
                payload_size,
                block_nr,
                nr_of_blocks,
                family_id,
                data,
            },
            offset,
        ))
    }
}

impl<'a> ctx::TryIntoCtx<Endian> for &'a Uf2Block {
    type Error = scroll::Error;

    fn try_into_ctx(self, dst: &mut [u8], le: Endian) -> Result<usize, Self::Error> {
        let mut offset = 0;

        dst.gwrite_with(UF2_MAGIC_START0, &mut offset, le)?;
        dst.gwrite_with(UF2_MAGIC_START1, &mut offset, le)?;
        dst.gwrite_with(self.flags, &mut offset, le)?;
        dst.gwrite_with(self.target_addr, &mut offset, le)?;
        dst.gwrite_with(self.payload_size, &mut offset, le)?;
        dst.gwrite_with(self.block_nr, &mut offset, le)?;
        dst.gwrite_with(self.nr_of_blocks, &mut offset, le)?;
        dst.gwrite_with(self.family_id, &mut offset, le)?;
        dst.gwrite_with(&self.data[..], &mut offset, ())?;
        dst.gwrite_with(UF2_MAGIC_END, &mut offset, le)?;

        Ok(offset)
    }
}

impl Uf2Block {
    /// Produces an empty block for `family_id` with the family flag set.
    pub fn new(family_id: u32) -> Self {
        Self {
            flags: UF2_FLAG_FAMILY_ID_PRESENT,
            target_addr: 0,
            payload_size: PAYLOAD_SIZE,
            block_nr: 0,
            nr_of_blocks: 0,
            family_id,
            data: [0; BLOCK_DATA_LEN],
        }
    }

    /// Decode a sector, checking only the magic numbers.
    pub fn parse(buf: &[u8; BLOCK_SIZE]) -> Result<Self, BlockError> {
        buf[..].pread_with(0, LE)
    }

    /// Encode into a sector.
    pub fn encode(&self, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), BlockError> {
        buf[..].pwrite_with(self, 0, LE)?;
        Ok(())
    }

    /// Returns `true` if all bits of `flag` are set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    /// Payload part of `data`. Only meaningful for accepted blocks.
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_size as usize).min(BLOCK_DATA_LEN);
        &self.data[..len]
    }

    /// Check that the block is meant for a device of `family_id`.
    pub fn check_family(&self, family_id: u32) -> Result<(), BlockError> {
        if self.has_flag(UF2_FLAG_FAMILY_ID_PRESENT) && self.family_id == family_id {
            Ok(())
        } else {
            Err(BlockError::Family)
        }
    }

    /// Check payload size, alignment and address against the flash window.
    pub fn check_target<F: FlashSink>(&self) -> Result<(), BlockError> {
        if self.payload_size != PAYLOAD_SIZE {
            return Err(BlockError::PayloadSize);
        }
        if self.target_addr % PAYLOAD_SIZE != 0 {
            return Err(BlockError::Alignment);
        }
        match window_offset::<F>(self.target_addr, PAYLOAD_SIZE) {
            Some(_) => Ok(()),
            None => Err(BlockError::Address),
        }
    }
}
