//! Write side of the emulated disk.
//!
//! The host OS copies a `.uf2` file by writing its blocks to whatever
//! sectors its FAT driver picked, interleaved with directory and FAT
//! updates and in no guaranteed order. Every written sector is inspected;
//! anything that is not a UF2 block for this target is dropped.

use log::{debug, info, warn};

use crate::bitmap::BlockBitmap;
use crate::flash::FlashSink;
use crate::uf2::{Uf2Block, Uf2Target, BLOCK_SIZE, PAYLOAD_SIZE, UF2_FLAG_NOT_MAIN_FLASH};

/// `nr_of_blocks` value that never completes.
pub const UNBOUNDED: u32 = u32::MAX;

/// Default bitmap size in 32-bit words: images of up to 4095 blocks.
pub const DEFAULT_MASK_WORDS: usize = 128;

/// What happened to a written sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Not a UF2 block for this target, dropped.
    Ignored,
    /// Block payload was written to flash.
    Written,
    /// Block was counted but not written to flash.
    Skipped,
    /// Block was the last missing one of the file.
    Complete,
}

/// Completion tracking of one UF2 file.
#[derive(Clone, Copy, Debug)]
pub struct WriteState<const WORDS: usize> {
    nr_of_blocks: u32,
    num_written: u32,
    written_mask: BlockBitmap<WORDS>,
    completed: bool,
}

impl<const WORDS: usize> Default for WriteState<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> WriteState<WORDS> {
    /// Block counts from here on are treated as bogus.
    pub const MAX_BLOCKS: u32 = BlockBitmap::<WORDS>::CAPACITY;

    /// Creates an empty state.
    pub const fn new() -> Self {
        Self {
            nr_of_blocks: 0,
            num_written: 0,
            written_mask: BlockBitmap::new(),
            completed: false,
        }
    }

    /// Pinned block count, `0` before the first block and [`UNBOUNDED`]
    /// after blocks disagreed.
    pub fn nr_of_blocks(&self) -> u32 {
        self.nr_of_blocks
    }

    /// Distinct blocks seen.
    pub fn num_written(&self) -> u32 {
        self.num_written
    }

    /// Returns `true` if `block_nr` has been seen.
    pub fn is_written(&self, block_nr: u32) -> bool {
        self.written_mask.contains(block_nr)
    }

    /// Returns `true` once all blocks were seen.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Account for block `block_nr` of a `nr_of_blocks` long file.
    /// Returns `true` exactly once, for the block that completes the file.
    pub fn track(&mut self, block_nr: u32, nr_of_blocks: u32) -> bool {
        if nr_of_blocks == 0 {
            return false;
        }

        if self.nr_of_blocks != nr_of_blocks {
            // A second file, or CURRENT.UF2 written back, without a reset
            // in between. Once pinned to UNBOUNDED it stays there.
            if nr_of_blocks >= Self::MAX_BLOCKS || self.nr_of_blocks != 0 {
                warn!(
                    "block count {} conflicts with {}, transfer will not complete",
                    nr_of_blocks, self.nr_of_blocks
                );
                self.nr_of_blocks = UNBOUNDED;
            } else {
                self.nr_of_blocks = nr_of_blocks;
            }
        }

        if self.written_mask.insert(block_nr) == Some(true) {
            self.num_written += 1;
            if !self.completed && self.num_written == self.nr_of_blocks {
                self.completed = true;
                return true;
            }
        }

        false
    }

    /// Forget everything seen so far.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Validates written sectors as UF2 blocks, programs the flash and detects
/// the end of the transfer.
///
/// `WORDS` sizes the bitmaps: up to `WORDS * 32` blocks are tracked.
#[derive(Clone, Debug, Default)]
pub struct Uf2BlockWriter<const WORDS: usize = DEFAULT_MASK_WORDS> {
    state: WriteState<WORDS>,
    erased_pages: BlockBitmap<WORDS>,
    /// 256-byte flash slots programmed since their page was erased.
    programmed: BlockBitmap<WORDS>,
}

impl<const WORDS: usize> Uf2BlockWriter<WORDS> {
    /// Creates a writer with nothing seen yet.
    pub const fn new() -> Self {
        Self {
            state: WriteState::new(),
            erased_pages: BlockBitmap::new(),
            programmed: BlockBitmap::new(),
        }
    }

    /// Completion tracking state.
    pub fn state(&self) -> &WriteState<WORDS> {
        &self.state
    }

    /// Start over, as after a device reset.
    pub fn reset(&mut self) {
        self.state.reset();
        self.erased_pages.clear();
        self.programmed.clear();
    }

    /// Handle a sector written by the host.
    ///
    /// [`Uf2Target::transfer_complete`] is called on `flash` right before
    /// [`WriteOutcome::Complete`] is returned.
    pub fn on_wr_sector<T: Uf2Target>(
        &mut self,
        flash: &mut T,
        sector: u32,
        buf: &[u8; BLOCK_SIZE],
    ) -> WriteOutcome {
        let block = match Uf2Block::parse(buf) {
            Ok(block) => block,
            Err(_) => return WriteOutcome::Ignored,
        };

        if let Err(e) = block.check_family(T::FAMILY_ID) {
            debug!("sector {}: block {} dropped: {:?}", sector, block.block_nr, e);
            return WriteOutcome::Ignored;
        }

        let mut outcome = match block.check_target::<T>() {
            Ok(()) if block.has_flag(UF2_FLAG_NOT_MAIN_FLASH) => WriteOutcome::Skipped,
            Ok(()) => {
                self.program(flash, &block);
                WriteOutcome::Written
            }
            Err(e) => {
                // Typically CURRENT.UF2 of another build being copied back.
                warn!(
                    "block {} at {:#010x} not flashed: {:?}",
                    block.block_nr, block.target_addr, e
                );
                WriteOutcome::Skipped
            }
        };

        if self.state.track(block.block_nr, block.nr_of_blocks) {
            info!("uf2: all {} blocks received", self.state.nr_of_blocks());
            flash.transfer_complete();
            outcome = WriteOutcome::Complete;
        }

        outcome
    }

    fn program<T: FlashSink>(&mut self, flash: &mut T, block: &Uf2Block) {
        let offset = block.target_addr - T::FLASH_START;
        let slot = offset / PAYLOAD_SIZE;

        if self.programmed.contains(slot) {
            if Self::unchanged(flash, block) {
                debug!("block {} unchanged", block.block_nr);
                return;
            }
            // Slot already holds data of this session: another image is
            // being copied without a reset. Erase every page again.
            info!("uf2: block {} overwritten, new image", block.block_nr);
            self.erased_pages.clear();
            self.programmed.clear();
        }

        let first_page = offset / T::PAGE_SIZE;
        let last_page = (offset + PAYLOAD_SIZE - 1) / T::PAGE_SIZE;

        for page in first_page..=last_page {
            let fresh = match self.erased_pages.insert(page) {
                Some(fresh) => fresh,
                // too many pages to track, assume blocks arrive in order
                None => (page * T::PAGE_SIZE) >= offset,
            };
            if fresh {
                let address = T::FLASH_START + page * T::PAGE_SIZE;
                debug!("erase page {:#010x}", address);
                if let Err(e) = flash.erase_page(address) {
                    warn!("erase at {:#010x} failed: {:?}", address, e);
                }
            }
        }

        debug!("block {} -> {:#010x}", block.block_nr, block.target_addr);
        if let Err(e) = flash.write_block(block.target_addr, block.payload()) {
            warn!("write at {:#010x} failed: {:?}", block.target_addr, e);
        }
        self.programmed.insert(slot);
    }

    fn unchanged<T: FlashSink>(flash: &mut T, block: &Uf2Block) -> bool {
        let mut current = [0u8; PAYLOAD_SIZE as usize];
        flash.read(block.target_addr, &mut current).is_ok() && current[..] == *block.payload()
    }
}
