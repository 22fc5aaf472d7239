//! Stateful directory cursor
//!
//! Decodes directory listings on demand through the metadata codec. With dot
//! entries enabled the cursor synthesizes `.` and `..` before the real
//! entries, resolving their inode references through the dcache: a mapping
//! from inode number to inode reference that every directory inode passing
//! through [`DirReader::get_inode`] populates.

use bitflags::bitflags;
use deku::prelude::*;
use rustc_hash::FxHashMap;
use tracing::instrument;

use crate::dir::{DirEntry, DirEntryRecord, DirHeader};
use crate::error::SqfsError;
use crate::file::ReadSeek;
use crate::inode::{Inode, InodeId};
use crate::metadata::{InodeRef, MetadataReader};
use crate::superblock::SuperBlock;

bitflags! {
    /// Behavior of a [`DirReader`] for its whole lifetime
    pub struct DirReaderFlags: u32 {
        /// Synthesize `.` and `..` entries when opening directories
        const DOT_ENTRIES = 0b0000_0001;
    }
}

bitflags! {
    /// Per-`open` overrides
    pub struct DirOpenFlags: u32 {
        /// Skip the synthetic entries for this directory only
        const NO_DOT_ENTRIES = 0b0000_0001;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirState {
    None,
    Opened,
    Dot,
    DotDot,
    Entries,
}

/// Position inside a directory listing
#[derive(Debug, Clone, Copy, Default)]
struct ReaddirCursor {
    block_start: u32,
    block_offset: u16,
    /// Listing bytes not yet decoded
    remaining: u32,
    /// Entries left in the current run
    entries_left: u32,
    /// Header fields of the current run
    header_start: u32,
    base_inode: u32,
    /// The metadata cursor is positioned lazily so opening an empty
    /// directory never touches the directory table
    primed: bool,
    init_remaining: u32,
}

impl ReaddirCursor {
    fn init(block_start: u32, block_offset: u16, listing_size: u32) -> Self {
        // the stored size counts the 3 phantom bytes of "." and ".."
        let remaining = listing_size.saturating_sub(3);
        Self {
            block_start,
            block_offset,
            remaining,
            entries_left: 0,
            header_start: 0,
            base_inode: 0,
            primed: false,
            init_remaining: remaining,
        }
    }

    fn reset(&mut self) {
        self.remaining = self.init_remaining;
        self.entries_left = 0;
        self.primed = false;
    }
}

/// Cursor over the entries of one directory at a time
pub struct DirReader<'a, R: ReadSeek> {
    superblock: SuperBlock,
    meta_inode: MetadataReader<'a, R>,
    meta_dir: MetadataReader<'a, R>,
    dcache: FxHashMap<u32, InodeRef>,
    flags: DirReaderFlags,
    state: DirState,
    start_state: DirState,
    cursor: ReaddirCursor,
    cur_ref: InodeRef,
    cur_inode: u32,
    parent_ref: InodeRef,
    parent_inode: u32,
    ent_ref: Option<InodeRef>,
}

impl<'a, R: ReadSeek> DirReader<'a, R> {
    pub(crate) fn new(
        superblock: SuperBlock,
        meta_inode: MetadataReader<'a, R>,
        meta_dir: MetadataReader<'a, R>,
        flags: DirReaderFlags,
    ) -> Self {
        Self {
            superblock,
            meta_inode,
            meta_dir,
            dcache: FxHashMap::default(),
            flags,
            state: DirState::None,
            start_state: DirState::None,
            cursor: ReaddirCursor::default(),
            cur_ref: InodeRef::from_raw(0),
            cur_inode: 0,
            parent_ref: InodeRef::from_raw(0),
            parent_inode: 0,
            ent_ref: None,
        }
    }

    /// Begin iterating the directory behind `inode`
    #[instrument(skip_all)]
    pub fn open(&mut self, inode: &Inode, flags: DirOpenFlags) -> Result<(), SqfsError> {
        let geometry = inode.dir_geometry().ok_or(SqfsError::UnexpectedInode)?;
        self.cursor =
            ReaddirCursor::init(geometry.block_index, geometry.block_offset, geometry.file_size);
        self.ent_ref = None;

        if self.flags.contains(DirReaderFlags::DOT_ENTRIES)
            && !flags.contains(DirOpenFlags::NO_DOT_ENTRIES)
        {
            let inode_number = inode.inode_number();
            self.cur_ref = *self.dcache.get(&inode_number).ok_or(SqfsError::NoEntry)?;
            self.cur_inode = inode_number;

            if self.cur_ref.raw() == self.superblock.root_inode {
                // the root is its own parent
                self.parent_ref = self.cur_ref;
                self.parent_inode = inode_number;
            } else {
                self.parent_ref = *self
                    .dcache
                    .get(&geometry.parent_inode)
                    .ok_or(SqfsError::NoEntry)?;
                self.parent_inode = geometry.parent_inode;
            }

            self.state = DirState::Opened;
        } else {
            self.state = DirState::Entries;
        }

        self.start_state = self.state;
        Ok(())
    }

    /// Next entry, or `None` at the end of the directory
    pub fn read(&mut self) -> Result<Option<DirEntry>, SqfsError> {
        match self.state {
            DirState::Opened => {
                self.state = DirState::Dot;
                Ok(Some(dummy_entry(".", self.cur_ref, self.cur_inode)))
            },
            DirState::Dot => {
                self.state = DirState::DotDot;
                Ok(Some(dummy_entry("..", self.parent_ref, self.parent_inode)))
            },
            DirState::DotDot => {
                self.state = DirState::Entries;
                self.read_entry()
            },
            DirState::Entries => self.read_entry(),
            DirState::None => Err(SqfsError::Sequence),
        }
    }

    fn read_entry(&mut self) -> Result<Option<DirEntry>, SqfsError> {
        if self.cursor.remaining == 0 {
            return Ok(None);
        }

        if !self.cursor.primed {
            self.meta_dir
                .seek(u64::from(self.cursor.block_start), self.cursor.block_offset)?;
            self.cursor.primed = true;
        }

        if self.cursor.entries_left == 0 {
            if self.cursor.remaining < DirHeader::SIZE as u32 {
                return Err(SqfsError::CorruptedOrInvalidSquashfs);
            }
            let mut buf = [0u8; DirHeader::SIZE];
            self.meta_dir.read(&mut buf)?;
            let (_, header) = DirHeader::from_bytes((&buf, 0))?;
            if header.count as usize >= DirHeader::MAX_ENTRIES {
                return Err(SqfsError::CorruptedOrInvalidSquashfs);
            }
            self.cursor.entries_left = header.count + 1;
            self.cursor.header_start = header.start;
            self.cursor.base_inode = header.inode_num;
            self.cursor.remaining -= DirHeader::SIZE as u32;
        }

        let mut buf = [0u8; DirEntryRecord::SIZE];
        self.meta_dir.read(&mut buf)?;
        let (_, record) = DirEntryRecord::from_bytes((&buf, 0))?;

        let name_len = usize::from(record.name_size) + 1;
        let consumed = (DirEntryRecord::SIZE + name_len) as u32;
        if self.cursor.remaining < consumed {
            return Err(SqfsError::CorruptedOrInvalidSquashfs);
        }
        let mut name = vec![0u8; name_len];
        self.meta_dir.read(&mut name)?;

        self.cursor.remaining -= consumed;
        self.cursor.entries_left -= 1;

        let inode_ref = InodeRef::new(u64::from(self.cursor.header_start), record.offset);
        self.ent_ref = Some(inode_ref);

        Ok(Some(DirEntry {
            inode_ref,
            inode_number: (i64::from(self.cursor.base_inode) + i64::from(record.inode_offset))
                as u32,
            entry_type: InodeId::from_u16(record.t)?,
            name,
        }))
    }

    /// Reset the cursor to the state right after `open`
    pub fn rewind(&mut self) -> Result<(), SqfsError> {
        if self.state == DirState::None {
            return Err(SqfsError::Sequence);
        }
        self.cursor.reset();
        self.ent_ref = None;
        self.state = self.start_state;
        Ok(())
    }

    /// Rewind and scan for `name`. Stops early once past its sort position.
    pub fn find(&mut self, name: &str) -> Result<DirEntry, SqfsError> {
        self.rewind()?;

        loop {
            let synthetic = matches!(self.state, DirState::Opened | DirState::Dot);
            let entry = self.read()?.ok_or(SqfsError::NoEntry)?;

            match entry.name_bytes().cmp(name.as_bytes()) {
                std::cmp::Ordering::Equal => return Ok(entry),
                // listings are name-sorted, but the synthetic entries are not
                std::cmp::Ordering::Greater if !synthetic => return Err(SqfsError::NoEntry),
                _ => {},
            }
        }
    }

    /// Materialize the inode of the entry most recently returned by
    /// [`Self::read`] (for `.`/`..` the directory itself or its parent)
    pub fn get_inode(&mut self) -> Result<Inode, SqfsError> {
        let reference = match self.state {
            DirState::Dot => self.cur_ref,
            DirState::DotDot => self.parent_ref,
            DirState::Entries => self.ent_ref.ok_or(SqfsError::Sequence)?,
            _ => return Err(SqfsError::Sequence),
        };

        self.read_inode(reference)
    }

    /// Materialize the root inode and seed the dcache with it
    pub fn get_root_inode(&mut self) -> Result<Inode, SqfsError> {
        self.read_inode(InodeRef::from_raw(self.superblock.root_inode))
    }

    fn read_inode(&mut self, reference: InodeRef) -> Result<Inode, SqfsError> {
        self.meta_inode.seek(reference.block_start(), reference.offset())?;
        let inode = Inode::read_meta(
            &mut self.meta_inode,
            self.superblock.block_size,
            self.superblock.block_log,
        )?;

        if inode.is_dir() {
            self.dcache.insert(inode.inode_number(), reference);
        }

        Ok(inode)
    }
}

impl<R: ReadSeek> Clone for DirReader<'_, R> {
    /// Deep copy yielding an independently advanceable cursor
    fn clone(&self) -> Self {
        Self {
            superblock: self.superblock,
            meta_inode: self.meta_inode.clone(),
            meta_dir: self.meta_dir.clone(),
            dcache: self.dcache.clone(),
            flags: self.flags,
            state: self.state,
            start_state: self.start_state,
            cursor: self.cursor,
            cur_ref: self.cur_ref,
            cur_inode: self.cur_inode,
            parent_ref: self.parent_ref,
            parent_inode: self.parent_inode,
            ent_ref: self.ent_ref,
        }
    }
}

/// Synthetic `.` / `..` entry. The on-disk `size = len - 1` encoding is only
/// ever evaluated for these fixed non-empty names.
fn dummy_entry(name: &str, inode_ref: InodeRef, inode_number: u32) -> DirEntry {
    DirEntry {
        inode_ref,
        inode_number,
        entry_type: InodeId::BasicDirectory,
        name: name.as_bytes().to_vec(),
    }
}
