//! 96-byte header at the start of every image

use deku::prelude::*;

use crate::compressor::Compressor;
use crate::error::SqfsError;
use crate::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Must be set to 0x73717368 ("hsqs" on disk).
pub const MAGIC: u32 = 0x7371_7368;

/// Marker for an absent optional table
pub(crate) const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

const VERSION_MAJOR: u16 = 4;
const VERSION_MINOR: u16 = 0;

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct SuperBlock {
    pub magic: u32,
    /// The number of inodes stored in the archive.
    pub inode_count: u32,
    /// Last modification time of the archive. Count seconds since 00:00, Jan 1st 1970 UTC (not counting leap seconds).
    /// This is unsigned, so it expires in the year 2106 (as opposed to 2038).
    pub mod_time: u32,
    /// The size of a data block in bytes. Must be a power of two between 4096 (4k) and 1048576 (1 MiB).
    pub block_size: u32,
    /// The number of entries in the fragment table.
    pub frag_count: u32,
    /// Compressor used for data
    pub compressor: Compressor,
    /// The log2 of the block size. If the two fields do not agree, the archive is considered corrupted.
    pub block_log: u16,
    /// Bit wise OR of the flag bits
    pub flags: u16,
    /// The number of entries in the ID lookup table.
    pub id_count: u16,
    /// Major version of the format. Must be set to 4.
    pub version_major: u16,
    /// Minor version of the format. Must be set to 0.
    pub version_minor: u16,
    /// A reference to the inode of the root directory.
    pub root_inode: u64,
    /// The number of bytes used by the archive.
    /// Because SquashFS archives must be padded to a multiple of the underlying device block size, this can be less than the actual file size.
    pub bytes_used: u64,
    pub id_table: u64,
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

pub(crate) const SUPERBLOCK_SIZE: usize = 96;

impl SuperBlock {
    pub(crate) fn new(compressor: Compressor, block_size: u32, block_log: u16, mod_time: u32) -> Self {
        Self {
            magic: MAGIC,
            inode_count: 0,
            mod_time,
            block_size,
            frag_count: 0,
            compressor,
            block_log,
            flags: SuperBlockFlags::FragmentsAreNotUsed as u16
                | SuperBlockFlags::NoXattrsInArchive as u16
                | SuperBlockFlags::DataHasBeenDeduplicated as u16,
            id_count: 0,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            root_inode: 0,
            bytes_used: 0,
            id_table: NOT_SET,
            xattr_table: NOT_SET,
            inode_table: 0,
            dir_table: 0,
            frag_table: NOT_SET,
            export_table: NOT_SET,
        }
    }

    /// Sanity check a parsed superblock before trusting any of its offsets
    pub(crate) fn validate(&self) -> Result<(), SqfsError> {
        if self.magic != MAGIC
            || self.version_major != VERSION_MAJOR
            || self.version_minor != VERSION_MINOR
        {
            return Err(SqfsError::CorruptedOrInvalidSquashfs);
        }

        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
            || !self.block_size.is_power_of_two()
            || self.block_log >= 32
            || (1u32 << self.block_log) != self.block_size
        {
            return Err(SqfsError::CorruptedOrInvalidSquashfs);
        }

        if self.inode_table >= self.dir_table {
            return Err(SqfsError::CorruptedOrInvalidSquashfs);
        }

        Ok(())
    }

    /* flags */
    pub fn inodes_uncompressed(&self) -> bool {
        self.flags & SuperBlockFlags::InodesStoredUncompressed as u16 != 0
    }

    pub fn data_block_stored_uncompressed(&self) -> bool {
        self.flags & SuperBlockFlags::DataBlockStoredUncompressed as u16 != 0
    }

    pub fn fragments_stored_uncompressed(&self) -> bool {
        self.flags & SuperBlockFlags::FragmentsStoredUncompressed as u16 != 0
    }

    pub fn fragments_are_not_used(&self) -> bool {
        self.flags & SuperBlockFlags::FragmentsAreNotUsed as u16 != 0
    }

    pub fn fragments_are_always_generated(&self) -> bool {
        self.flags & SuperBlockFlags::FragmentsAreAlwaysGenerated as u16 != 0
    }

    pub fn data_has_been_deduplicated(&self) -> bool {
        self.flags & SuperBlockFlags::DataHasBeenDeduplicated as u16 != 0
    }

    pub fn nfs_export_table_exists(&self) -> bool {
        self.flags & SuperBlockFlags::NFSExportTableExists as u16 != 0
    }

    pub fn xattrs_are_stored_uncompressed(&self) -> bool {
        self.flags & SuperBlockFlags::XattrsAreStoredUncompressed as u16 != 0
    }

    pub fn no_xattrs_in_archive(&self) -> bool {
        self.flags & SuperBlockFlags::NoXattrsInArchive as u16 != 0
    }

    pub fn compressor_options_are_present(&self) -> bool {
        self.flags & SuperBlockFlags::CompressorOptionsArePresent as u16 != 0
    }
}

#[rustfmt::skip]
#[allow(dead_code)]
#[derive(Debug, Copy, Clone)]
pub(crate) enum SuperBlockFlags {
    InodesStoredUncompressed    = 0b0000_0000_0000_0001,
    DataBlockStoredUncompressed = 0b0000_0000_0000_0010,
    Unused                      = 0b0000_0000_0000_0100,
    FragmentsStoredUncompressed = 0b0000_0000_0000_1000,
    FragmentsAreNotUsed         = 0b0000_0000_0001_0000,
    FragmentsAreAlwaysGenerated = 0b0000_0000_0010_0000,
    DataHasBeenDeduplicated     = 0b0000_0000_0100_0000,
    NFSExportTableExists        = 0b0000_0000_1000_0000,
    XattrsAreStoredUncompressed = 0b0000_0001_0000_0000,
    NoXattrsInArchive           = 0b0000_0010_0000_0000,
    CompressorOptionsArePresent = 0b0000_0100_0000_0000,
}
