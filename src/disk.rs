use crate::uf2::{Uf2Target, BLOCK_SIZE};
use crate::volume::{Uf2VirtualVolume, SECTOR_SIZE};
use crate::writer::{Uf2BlockWriter, WriteOutcome, DEFAULT_MASK_WORDS};

/// Emulated UF2 mass-storage disk.
///
/// Owns the flash and routes sector reads to [`Uf2VirtualVolume`] and
/// sector writes to [`Uf2BlockWriter`]. A USB mass-storage class driver
/// calls [`on_rd_sector`](Uf2Disk::on_rd_sector) and
/// [`on_wr_sector`](Uf2Disk::on_wr_sector); bulk-only transport never
/// overlaps two sector operations.
pub struct Uf2Disk<T: Uf2Target, const WORDS: usize = DEFAULT_MASK_WORDS> {
    flash: T,
    volume: Uf2VirtualVolume<T>,
    writer: Uf2BlockWriter<WORDS>,
}

impl<T: Uf2Target, const WORDS: usize> Uf2Disk<T, WORDS> {
    /// Creates the disk on top of `flash`.
    pub fn new(flash: T) -> Self {
        Self {
            flash,
            volume: Uf2VirtualVolume::new(),
            writer: Uf2BlockWriter::new(),
        }
    }

    /// Number of sectors reported to the host.
    pub fn num_sectors(&self) -> u32 {
        self.volume.layout().media_sectors
    }

    /// Sector size reported to the host.
    pub fn sector_size(&self) -> u32 {
        SECTOR_SIZE as u32
    }

    /// Handle a sector read.
    pub fn on_rd_sector(&mut self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        self.volume.on_rd_sector(&mut self.flash, sector, buf);
    }

    /// Handle a sector write.
    pub fn on_wr_sector(&mut self, sector: u32, buf: &[u8; BLOCK_SIZE]) -> WriteOutcome {
        self.writer.on_wr_sector(&mut self.flash, sector, buf)
    }

    /// The read side.
    pub fn volume(&self) -> &Uf2VirtualVolume<T> {
        &self.volume
    }

    /// The write side.
    pub fn writer(&self) -> &Uf2BlockWriter<WORDS> {
        &self.writer
    }

    /// Forget the blocks seen so far, as after a device reset.
    pub fn reset(&mut self) {
        self.writer.reset();
    }

    /// Access the flash.
    pub fn flash(&self) -> &T {
        &self.flash
    }

    /// Mutable access to the flash.
    pub fn flash_mut(&mut self) -> &mut T {
        &mut self.flash
    }

    /// Return the flash.
    pub fn release(self) -> T {
        self.flash
    }
}
