//! Inode emission and directory run grouping

use std::io::Write;

use deku::prelude::*;
use tracing::instrument;

use crate::data::DataLocation;
use crate::dir::{DirEntryRecord, DirHeader};
use crate::error::SqfsError;
use crate::inode::{
    BasicDeviceSpecialFile, BasicDirectory, BasicFile, BasicIpc, BasicSymlink, ExtendedDirectory,
    ExtendedFile, Inode, InodeHeader, InodeId, InodeInner, XATTR_NOT_SET,
};
use crate::metadata::{InodeRef, MetadataWriter};

/// One written inode, remembered until its parent directory is emitted
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub start: u32,
    pub offset: u16,
    pub inode: u32,
    pub t: InodeId,
    pub name: Vec<u8>,
}

impl Entry {
    pub fn inode_ref(&self) -> InodeRef {
        InodeRef::new(u64::from(self.start), self.offset)
    }

    fn store(
        inode: Inode,
        name: Vec<u8>,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Self, SqfsError> {
        let reference = inode_writer.current_reference();
        inode_writer.write_all(&inode.to_bytes()?)?;

        Ok(Self {
            start: reference.block_start() as u32,
            offset: reference.offset(),
            inode: inode.header.inode_number,
            t: inode.id,
            name,
        })
    }

    /// Write the inode for a directory whose listing was just emitted
    #[allow(clippy::too_many_arguments)]
    pub fn path(
        name: Vec<u8>,
        header: InodeHeader,
        parent_inode: u32,
        link_count: u32,
        file_size: u32,
        block_offset: u16,
        block_index: u32,
        xattr_index: u32,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Self, SqfsError> {
        let inode = if file_size <= u16::MAX.into() && xattr_index == XATTR_NOT_SET {
            Inode::new(
                InodeId::BasicDirectory,
                header,
                InodeInner::BasicDirectory(BasicDirectory {
                    block_index,
                    link_count,
                    file_size: file_size as u16,
                    block_offset,
                    parent_inode,
                }),
            )
        } else {
            Inode::new(
                InodeId::ExtendedDirectory,
                header,
                InodeInner::ExtendedDirectory(ExtendedDirectory {
                    link_count,
                    file_size,
                    block_index,
                    parent_inode,
                    index_count: 0,
                    block_offset,
                    xattr_index,
                    dir_index: vec![],
                }),
            )
        };

        Self::store(inode, name, inode_writer)
    }

    /// Write the inode for a file whose data the data writer already placed
    pub fn file(
        name: Vec<u8>,
        header: InodeHeader,
        location: &DataLocation,
        xattr_index: u32,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Self, SqfsError> {
        let fits_basic = location.file_size <= u32::MAX.into()
            && location.start_block <= u32::MAX.into()
            && location.sparse == 0
            && xattr_index == XATTR_NOT_SET;

        let inode = if fits_basic {
            Inode::new(
                InodeId::BasicFile,
                header,
                InodeInner::BasicFile(BasicFile {
                    blocks_start: location.start_block as u32,
                    frag_index: location.frag_index,
                    block_offset: location.block_offset,
                    file_size: location.file_size as u32,
                    block_sizes: location.block_sizes.clone(),
                }),
            )
        } else {
            Inode::new(
                InodeId::ExtendedFile,
                header,
                InodeInner::ExtendedFile(ExtendedFile {
                    blocks_start: location.start_block,
                    file_size: location.file_size,
                    sparse: location.sparse,
                    link_count: 1,
                    frag_index: location.frag_index,
                    block_offset: location.block_offset,
                    xattr_index,
                    block_sizes: location.block_sizes.clone(),
                }),
            )
        };

        Self::store(inode, name, inode_writer)
    }

    /// Write the inode for a symlink node
    pub fn symlink(
        name: Vec<u8>,
        header: InodeHeader,
        target: &[u8],
        inode_writer: &mut MetadataWriter,
    ) -> Result<Self, SqfsError> {
        let inode = Inode::new(
            InodeId::BasicSymlink,
            header,
            InodeInner::BasicSymlink(BasicSymlink {
                link_count: 1,
                target_size: target.len() as u32,
                target_path: target.to_vec(),
            }),
        );

        Self::store(inode, name, inode_writer)
    }

    /// Write the inode for a block or character device node
    pub fn device(
        name: Vec<u8>,
        header: InodeHeader,
        id: InodeId,
        device_number: u32,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Self, SqfsError> {
        let device = BasicDeviceSpecialFile { link_count: 1, device_number };
        let inner = match id {
            InodeId::BasicBlockDevice => InodeInner::BasicBlockDevice(device),
            InodeId::BasicCharacterDevice => InodeInner::BasicCharacterDevice(device),
            _ => return Err(SqfsError::UnexpectedInode),
        };

        Self::store(Inode::new(id, header, inner), name, inode_writer)
    }

    /// Write the inode for a fifo or socket node
    pub fn ipc(
        name: Vec<u8>,
        header: InodeHeader,
        id: InodeId,
        inode_writer: &mut MetadataWriter,
    ) -> Result<Self, SqfsError> {
        let ipc = BasicIpc { link_count: 1 };
        let inner = match id {
            InodeId::BasicNamedPipe => InodeInner::BasicNamedPipe(ipc),
            InodeId::BasicSocket => InodeInner::BasicSocket(ipc),
            _ => return Err(SqfsError::UnexpectedInode),
        };

        Self::store(Inode::new(id, header, inner), name, inode_writer)
    }

    /// Serialize name-sorted entries into directory table bytes. Consecutive
    /// entries share a run header while their inodes live in the same
    /// metadata block, the run stays under 256 entries and 32 KiB, and the
    /// inode delta fits the signed 16-bit entry field.
    #[instrument(skip_all)]
    pub(crate) fn to_dir_bytes(mut entries: Vec<Entry>) -> Result<Vec<u8>, SqfsError> {
        const MAX_RUN_BYTES: usize = 0x8000;

        entries.sort_unstable_by(|a, b| a.name.cmp(&b.name));

        let mut out = vec![];
        let mut i = 0;
        while i < entries.len() {
            let start = entries[i].start;
            let base_inode = entries[i].inode;

            let mut n = 1;
            let mut run_bytes = DirEntryRecord::SIZE + entries[i].name.len();
            while i + n < entries.len() && n < DirHeader::MAX_ENTRIES {
                let e = &entries[i + n];
                let delta = i64::from(e.inode) - i64::from(base_inode);
                let entry_bytes = DirEntryRecord::SIZE + e.name.len();
                if e.start != start
                    || i16::try_from(delta).is_err()
                    || run_bytes + entry_bytes > MAX_RUN_BYTES
                {
                    break;
                }
                run_bytes += entry_bytes;
                n += 1;
            }

            let header = DirHeader {
                count: (n - 1) as u32,
                start,
                inode_num: base_inode,
            };
            out.extend_from_slice(&header.to_bytes()?);

            for e in &entries[i..i + n] {
                let record = DirEntryRecord {
                    offset: e.offset,
                    inode_offset: (i64::from(e.inode) - i64::from(base_inode)) as i16,
                    t: e.t.basic() as u16,
                    name_size: (e.name.len() - 1) as u16,
                    name: vec![],
                };
                out.extend_from_slice(&record.to_bytes()?);
                out.extend_from_slice(&e.name);
            }

            i += n;
        }

        Ok(out)
    }
}
