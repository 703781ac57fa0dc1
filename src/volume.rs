//! Read side of the emulated FAT16 disk.
//!
//! The disk does not exist anywhere: every sector is synthesized on request
//! from the configuration constants and, for `CURRENT.UF2`, from the live
//! flash contents. Layout, in 512-byte sectors:
//!
//! | region         | size                                 |
//! |----------------|--------------------------------------|
//! | boot sector    | 1                                    |
//! | FAT0, FAT1     | `ceil(media_sectors * 2 / 512)` each |
//! | root directory | 4                                    |
//! | fixed files    | 1 each                               |
//! | `CURRENT.UF2`  | `flash_size / 256`                   |
//!
//! One sector per cluster, so cluster `n` is data sector `n - 2`.

use core::cmp::min;
use core::marker::PhantomData;
use log::warn;
use scroll::{Pwrite, LE};

use crate::flash::FlashError;
use crate::uf2::{BlockError, Uf2Block, Uf2Target, BLOCK_SIZE, PAYLOAD_SIZE};

/// Sector size of the emulated disk.
pub const SECTOR_SIZE: usize = 512;

const RESERVED_SECTORS: u32 = 1;
const ROOT_DIR_SECTORS: u32 = 4;
const DIR_ENTRY_SIZE: usize = 32;
const ROOT_DIR_ENTRIES: u32 = ROOT_DIR_SECTORS * SECTOR_SIZE as u32 / DIR_ENTRY_SIZE as u32;
const FAT_ENTRIES_PER_SECTOR: u32 = SECTOR_SIZE as u32 / 2;
const FIRST_CLUSTER: u32 = 2;
/// Smallest cluster count a FAT16 volume may have.
const FAT16_MIN_CLUSTERS: u32 = 4085;

const MEDIA_DESCRIPTOR: u8 = 0xf8;
const FAT_EOC: u16 = 0xffff;
const VOLUME_SERIAL: u32 = 0x0042_0042;

/// FAT directory entry attribute: read-only file.
pub const ATTR_READ_ONLY: u8 = 0x01;
/// FAT directory entry attribute: volume label.
pub const ATTR_VOLUME_ID: u8 = 0x08;
/// FAT directory entry attribute: archive.
pub const ATTR_ARCHIVE: u8 = 0x20;

const CURRENT_UF2_NAME: [u8; 11] = *b"CURRENT UF2";

/// A read-only file with fixed contents.
#[derive(Clone, Copy, Debug)]
pub struct StaticFile {
    /// 8.3 name without the dot, space padded, e.g. `b"INFO_UF2TXT"`.
    pub name: [u8; 11],
    /// File contents, at most one sector.
    pub content: &'static str,
}

/// Files shown by default: an info file and an HTML page.
pub const DEFAULT_FILES: [StaticFile; 2] = [
    StaticFile {
        name: *b"INFO_UF2TXT",
        content: "UF2 Bootloader\r\nModel: Generic\r\nBoard-ID: Generic\r\n",
    },
    StaticFile {
        name: *b"INDEX   HTM",
        content: "<!doctype html>\n<html><body>\n\
                  <p>Copy a .uf2 file to this drive to update the firmware.</p>\n\
                  </body></html>\n",
    },
];

/// Sector map of the emulated disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeLayout {
    /// Total sectors.
    pub media_sectors: u32,
    /// Sectors in one FAT copy.
    pub sectors_per_fat: u32,
    /// First sector of FAT0.
    pub start_fat0: u32,
    /// First sector of FAT1.
    pub start_fat1: u32,
    /// First root directory sector.
    pub start_rootdir: u32,
    /// First data sector, cluster `2`.
    pub start_clusters: u32,
    /// Number of fixed files.
    pub num_files: u32,
    /// Sectors, and UF2 blocks, of `CURRENT.UF2`.
    pub uf2_sectors: u32,
}

/// What a sector address maps to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    /// Boot sector with the BPB.
    Boot,
    /// Sector of a FAT copy, index within the copy.
    Fat(u32),
    /// Root directory sector, index within the directory.
    RootDir(u32),
    /// Contents of fixed file `n`.
    File(usize),
    /// Block `n` of `CURRENT.UF2`.
    Current(u32),
    /// Anything else.
    Unmapped,
}

impl VolumeLayout {
    /// Compute the layout. Panics, at compile time when used in a constant,
    /// if the configuration does not describe a valid FAT16 volume.
    pub const fn new(flash_size: u32, files: &[StaticFile], media_sectors: u32) -> Self {
        assert!(flash_size >= PAYLOAD_SIZE, "flash window is empty");
        assert!(flash_size % PAYLOAD_SIZE == 0, "flash size must be a multiple of 256");
        assert!(media_sectors <= 0xffff, "too many sectors for FAT16");
        assert!(
            files.len() + 2 <= SECTOR_SIZE / DIR_ENTRY_SIZE,
            "files do not fit in the first root directory sector"
        );

        let mut i = 0;
        while i < files.len() {
            assert!(files[i].content.len() <= SECTOR_SIZE, "file does not fit in a cluster");
            i += 1;
        }

        let sectors_per_fat = (media_sectors * 2 + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32;
        let start_fat0 = RESERVED_SECTORS;
        let start_fat1 = start_fat0 + sectors_per_fat;
        let start_rootdir = start_fat1 + sectors_per_fat;
        let start_clusters = start_rootdir + ROOT_DIR_SECTORS;
        let num_files = files.len() as u32;
        let uf2_sectors = flash_size / PAYLOAD_SIZE;

        assert!(
            start_clusters + num_files + uf2_sectors <= media_sectors,
            "flash image does not fit in the volume"
        );
        assert!(
            media_sectors - start_clusters >= FAT16_MIN_CLUSTERS,
            "volume too small for FAT16"
        );

        Self {
            media_sectors,
            sectors_per_fat,
            start_fat0,
            start_fat1,
            start_rootdir,
            start_clusters,
            num_files,
            uf2_sectors,
        }
    }

    /// First cluster of `CURRENT.UF2`.
    pub const fn first_uf2_cluster(&self) -> u32 {
        FIRST_CLUSTER + self.num_files
    }

    /// Last cluster of `CURRENT.UF2`.
    pub const fn last_uf2_cluster(&self) -> u32 {
        self.first_uf2_cluster() + self.uf2_sectors - 1
    }

    /// Size of `CURRENT.UF2` in bytes, twice the flash size.
    pub const fn current_uf2_size(&self) -> u32 {
        self.uf2_sectors * BLOCK_SIZE as u32
    }

    /// Map a sector address to its region.
    pub fn region(&self, sector: u32) -> Region {
        if sector >= self.media_sectors {
            Region::Unmapped
        } else if sector < self.start_fat0 {
            Region::Boot
        } else if sector < self.start_rootdir {
            let mut index = sector - self.start_fat0;
            if index >= self.sectors_per_fat {
                index -= self.sectors_per_fat;
            }
            Region::Fat(index)
        } else if sector < self.start_clusters {
            Region::RootDir(sector - self.start_rootdir)
        } else {
            let index = sector - self.start_clusters;
            if index < self.num_files {
                Region::File(index as usize)
            } else if index - self.num_files < self.uf2_sectors {
                Region::Current(index - self.num_files)
            } else {
                Region::Unmapped
            }
        }
    }

    /// FAT entry of `cluster`.
    fn fat_entry(&self, cluster: u32) -> Option<u16> {
        match cluster {
            0 => Some(0xff00 | MEDIA_DESCRIPTOR as u16),
            1 => Some(FAT_EOC),
            c if c < self.first_uf2_cluster() => Some(FAT_EOC),
            c if c < self.last_uf2_cluster() => Some((c + 1) as u16),
            c if c == self.last_uf2_cluster() => Some(FAT_EOC),
            _ => None,
        }
    }
}

fn write_dir_entry(
    entry: &mut [u8],
    name: &[u8; 11],
    attrs: u8,
    start_cluster: u16,
    size: u32,
) -> Result<(), scroll::Error> {
    // name[8] + ext[3]
    entry.pwrite(&name[..], 0)?;
    entry.pwrite_with(attrs, 11, LE)?;
    // 12..26: reserved, timestamps, high cluster word; all zero
    entry.pwrite_with(start_cluster, 26, LE)?;
    entry.pwrite_with(size, 28, LE)?;
    Ok(())
}

enum SectorError {
    Encode,
    Flash(FlashError),
}

impl From<scroll::Error> for SectorError {
    fn from(_: scroll::Error) -> Self {
        SectorError::Encode
    }
}

impl From<BlockError> for SectorError {
    fn from(_: BlockError) -> Self {
        SectorError::Encode
    }
}

impl From<FlashError> for SectorError {
    fn from(e: FlashError) -> Self {
        SectorError::Flash(e)
    }
}

/// Answers sector reads of the emulated FAT16 disk.
///
/// Holds no state: the answer depends on the sector address and the flash
/// contents only.
pub struct Uf2VirtualVolume<T: Uf2Target> {
    _target: PhantomData<T>,
}

impl<T: Uf2Target> Default for Uf2VirtualVolume<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Uf2Target> Uf2VirtualVolume<T> {
    /// Layout derived from `T`'s constants.
    pub const LAYOUT: VolumeLayout =
        VolumeLayout::new(T::FLASH_SIZE, T::FILES, T::MEDIA_SECTORS);

    /// Creates the volume. Fails to compile if `T` does not describe a
    /// valid volume.
    pub fn new() -> Self {
        let _layout = Self::LAYOUT;
        Self {
            _target: PhantomData,
        }
    }

    /// Layout of this volume.
    pub fn layout(&self) -> VolumeLayout {
        Self::LAYOUT
    }

    /// Fill `buf` with the contents of `sector`.
    pub fn on_rd_sector(&self, flash: &mut T, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        buf.fill(0);

        let res = match Self::LAYOUT.region(sector) {
            Region::Boot => Self::boot_sector(buf),
            Region::Fat(index) => Self::fat_sector(index, buf),
            Region::RootDir(0) => Self::root_dir(buf),
            Region::RootDir(_) | Region::Unmapped => Ok(()),
            Region::File(n) => {
                let content = T::FILES[n].content.as_bytes();
                let len = min(content.len(), SECTOR_SIZE);
                buf[..len].copy_from_slice(&content[..len]);
                Ok(())
            }
            Region::Current(index) => Self::current_uf2_block(flash, index, buf),
        };

        if let Err(e) = res {
            match e {
                SectorError::Flash(e) => warn!("sector {}: flash read failed: {:?}", sector, e),
                SectorError::Encode => warn!("sector {}: does not fit", sector),
            }
            buf.fill(0);
        }
    }

    fn boot_sector(buf: &mut [u8]) -> Result<(), SectorError> {
        let layout = Self::LAYOUT;
        let mut offset = 0;

        buf.gwrite(&[0xebu8, 0x3c, 0x90][..], &mut offset)?;
        buf.gwrite(&b"UF2 UF2 "[..], &mut offset)?;
        buf.gwrite_with(SECTOR_SIZE as u16, &mut offset, LE)?;
        buf.gwrite_with(1u8, &mut offset, LE)?; // sectors per cluster
        buf.gwrite_with(RESERVED_SECTORS as u16, &mut offset, LE)?;
        buf.gwrite_with(2u8, &mut offset, LE)?; // FAT copies
        buf.gwrite_with(ROOT_DIR_ENTRIES as u16, &mut offset, LE)?;
        buf.gwrite_with(layout.media_sectors as u16, &mut offset, LE)?;
        buf.gwrite_with(MEDIA_DESCRIPTOR, &mut offset, LE)?;
        buf.gwrite_with(layout.sectors_per_fat as u16, &mut offset, LE)?;
        buf.gwrite_with(1u16, &mut offset, LE)?; // sectors per track
        buf.gwrite_with(1u16, &mut offset, LE)?; // heads

        // 28..36: hidden and large sector counts stay zero
        buf.pwrite_with(0x80u8, 36, LE)?; // drive number
        buf.pwrite_with(0x29u8, 38, LE)?; // extended boot signature
        buf.pwrite_with(VOLUME_SERIAL, 39, LE)?;
        buf.pwrite(&T::VOLUME_LABEL[..], 43)?;
        buf.pwrite(&b"FAT16   "[..], 54)?;
        buf.pwrite_with(0xaa55u16, 510, LE)?;
        Ok(())
    }

    fn fat_sector(index: u32, buf: &mut [u8]) -> Result<(), SectorError> {
        let layout = Self::LAYOUT;
        for i in 0..FAT_ENTRIES_PER_SECTOR {
            if let Some(v) = layout.fat_entry(index * FAT_ENTRIES_PER_SECTOR + i) {
                buf.pwrite_with(v, i as usize * 2, LE)?;
            }
        }
        Ok(())
    }

    fn root_dir(buf: &mut [u8]) -> Result<(), SectorError> {
        let layout = Self::LAYOUT;
        let mut entries = buf.chunks_exact_mut(DIR_ENTRY_SIZE);

        if let Some(label) = entries.next() {
            write_dir_entry(label, &T::VOLUME_LABEL, ATTR_VOLUME_ID | ATTR_ARCHIVE, 0, 0)?;
        }

        for (n, (file, entry)) in T::FILES.iter().zip(entries.by_ref()).enumerate() {
            let cluster = FIRST_CLUSTER as u16 + n as u16;
            write_dir_entry(entry, &file.name, ATTR_READ_ONLY, cluster, file.content.len() as u32)?;
        }

        if let Some(entry) = entries.next() {
            write_dir_entry(
                entry,
                &CURRENT_UF2_NAME,
                ATTR_READ_ONLY,
                layout.first_uf2_cluster() as u16,
                layout.current_uf2_size(),
            )?;
        }
        Ok(())
    }

    fn current_uf2_block(
        flash: &mut T,
        index: u32,
        buf: &mut [u8; SECTOR_SIZE],
    ) -> Result<(), SectorError> {
        let layout = Self::LAYOUT;
        let address = T::FLASH_START + index * PAYLOAD_SIZE;

        let mut block = Uf2Block::new(T::FAMILY_ID);
        block.target_addr = address;
        block.block_nr = index;
        block.nr_of_blocks = layout.uf2_sectors;

        flash.read(address, &mut block.data[..PAYLOAD_SIZE as usize])?;
        block.encode(buf)?;
        Ok(())
    }
}
