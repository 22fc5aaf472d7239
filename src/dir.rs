//! Directory table records

use std::borrow::Cow;

use deku::prelude::*;

use crate::inode::InodeId;
use crate::metadata::InodeRef;

/// Run header in the directory table. `count` is stored as one less than the
/// number of entries that follow; a run never exceeds 256 entries and all of
/// its entries live in the same inode metadata block.
#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirHeader {
    pub count: u32,
    /// Metadata block start of the inodes every entry in this run refers to
    pub start: u32,
    /// Base inode number entries store a signed delta against
    pub inode_num: u32,
}

impl DirHeader {
    pub(crate) const SIZE: usize = 12;
    pub(crate) const MAX_ENTRIES: usize = 256;
}

/// On-disk entry record. `name_size` is stored as `name.len() - 1`; the name
/// bytes follow the fixed fields.
#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirEntryRecord {
    /// Byte offset of the inode inside its metadata block
    pub offset: u16,
    pub inode_offset: i16,
    pub t: u16,
    pub name_size: u16,
    #[deku(skip, default = "Vec::new()")]
    pub name: Vec<u8>,
}

impl DirEntryRecord {
    pub(crate) const SIZE: usize = 8;
}

/// Directory entry yielded by the directory reader. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub(crate) inode_ref: InodeRef,
    pub inode_number: u32,
    pub entry_type: InodeId,
    pub(crate) name: Vec<u8>,
}

impl DirEntry {
    pub fn name_bytes(&self) -> &[u8] {
        &self.name
    }

    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Reference resolving to this entry's inode
    pub fn inode_ref(&self) -> InodeRef {
        self.inode_ref
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type.is_dir()
    }
}
