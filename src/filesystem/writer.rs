//! Image writer

use std::cell::RefCell;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use deku::prelude::*;
use tracing::{info, instrument, trace};

use crate::compressor::ImageCompressor;
use crate::data::{DataFlags, DataWriter, SparseMapEntry};
use crate::entry::Entry;
use crate::error::SqfsError;
use crate::file::{pad_to, BackingFile};
use crate::filesystem::node::{FileSource, NodeHeader, NodeId, NodeKind, Tree};
use crate::id::IdTable;
use crate::inode::{InodeHeader, InodeId};
use crate::metadata::MetadataWriter;
use crate::superblock::{SuperBlock, SuperBlockFlags, SUPERBLOCK_SIZE};
use crate::table::write_table;
use crate::{DEFAULT_BLOCK_SIZE, DEFAULT_PAD_LEN, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// In-memory filesystem tree to be written out as a SquashFS image
///
/// ```rust
/// use sqfs::{ImageWriter, NodeHeader};
///
/// let header = NodeHeader { permissions: 0o755, ..NodeHeader::default() };
/// let mut fs = ImageWriter::default();
/// fs.set_current_time();
/// fs.push_dir("usr", header).unwrap();
/// fs.push_dir("usr/bin", header).unwrap();
/// fs.push_file(std::io::Cursor::new(vec![0x00, 0x01]), "usr/bin/file", header).unwrap();
/// ```
pub struct ImageWriter<'a> {
    /// The size of a data block in bytes. Must be a power of two between 4096 (4k) and 1048576 (1 MiB).
    block_size: u32,
    block_log: u16,
    /// Last modification time of the archive
    mod_time: u32,
    compressor: ImageCompressor,
    id_table: IdTable,
    tree: Tree<'a>,
    pad_len: u32,
    exportable: bool,
    device_block_size: u32,
}

impl Default for ImageWriter<'_> {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_log: block_log_of(DEFAULT_BLOCK_SIZE),
            mod_time: 0,
            compressor: ImageCompressor::default(),
            id_table: IdTable::new(),
            tree: Tree::new(NodeHeader::default()),
            pad_len: DEFAULT_PAD_LEN,
            exportable: false,
            device_block_size: 4096,
        }
    }
}

fn block_log_of(block_size: u32) -> u16 {
    block_size.trailing_zeros() as u16
}

impl<'a> ImageWriter<'a> {
    /// Set block size
    ///
    /// # Panics
    /// If invalid, must be [`MIN_BLOCK_SIZE`] `> block_size <` [`MAX_BLOCK_SIZE`]
    pub fn set_block_size(&mut self, block_size: u32) {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
            || !block_size.is_power_of_two()
        {
            panic!("invalid block_size");
        }
        self.block_size = block_size;
        self.block_log = block_log_of(block_size);
    }

    /// Set time of image as `mod_time`
    pub fn set_time(&mut self, mod_time: u32) {
        self.mod_time = mod_time;
    }

    /// Set time of image as current time
    pub fn set_current_time(&mut self) {
        self.mod_time =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32;
    }

    pub fn set_compressor(&mut self, compressor: ImageCompressor) {
        self.compressor = compressor;
    }

    /// Set root permissions as `mode`
    pub fn set_root_mode(&mut self, mode: u16) {
        self.tree.root_mut().header.permissions = mode;
    }

    pub fn set_root_uid(&mut self, uid: u32) {
        self.tree.root_mut().header.uid = uid;
    }

    pub fn set_root_gid(&mut self, gid: u32) {
        self.tree.root_mut().header.gid = gid;
    }

    /// Emit an NFS export table mapping inode numbers back to inodes
    pub fn set_exportable(&mut self, exportable: bool) {
        self.exportable = exportable;
    }

    /// Device block granularity used by [`DataFlags::ALIGN_DEVICE_BLOCK`]
    pub fn set_device_block_size(&mut self, device_block_size: u32) {
        self.device_block_size = device_block_size;
    }

    /// Set padding(zero bytes) added to the end of the image after calling [`Self::write`]
    pub fn set_kib_padding(&mut self, pad_kib: u32) {
        self.pad_len = pad_kib * 1024;
    }

    /// Set *no* padding(zero bytes) added to the end of the image after calling [`Self::write`]
    pub fn set_no_padding(&mut self) {
        self.pad_len = 0;
    }

    /// Insert `reader` as a file at `path`
    pub fn push_file<P: AsRef<Path>>(
        &mut self,
        reader: impl Read + 'a,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        self.push_file_with_flags(reader, path, header, DataFlags::empty())
    }

    /// Insert `reader` as a file at `path`, with per-file data writer flags
    pub fn push_file_with_flags<P: AsRef<Path>>(
        &mut self,
        reader: impl Read + 'a,
        path: P,
        header: NodeHeader,
        flags: DataFlags,
    ) -> Result<(), SqfsError> {
        let source = FileSource {
            reader: RefCell::new(Box::new(reader)),
            sparse: None,
            flags,
        };
        self.tree.insert(path, header, NodeKind::File { source })?;
        Ok(())
    }

    /// Insert a sparse file of `file_size` bytes whose real bytes are the
    /// runs listed in `map`; `reader` yields only those bytes. The map must
    /// be ordered, non-overlapping, and end within `file_size`.
    pub fn push_file_sparse<P: AsRef<Path>>(
        &mut self,
        reader: impl Read + 'a,
        file_size: u64,
        map: Vec<SparseMapEntry>,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        let source = FileSource {
            reader: RefCell::new(Box::new(reader)),
            sparse: Some((file_size, map)),
            flags: DataFlags::empty(),
        };
        self.tree.insert(path, header, NodeKind::File { source })?;
        Ok(())
    }

    /// Insert empty `dir` at `path`
    pub fn push_dir<P: AsRef<Path>>(
        &mut self,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        self.tree.insert(path, header, NodeKind::Dir { children: vec![] })?;
        Ok(())
    }

    /// Recursively create an empty directory and all of its missing parents
    pub fn push_dir_all<P: AsRef<Path>>(
        &mut self,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        self.tree.insert_dir_all(path, header)?;
        Ok(())
    }

    /// Insert symlink `path` -> `link`
    pub fn push_symlink<P: AsRef<Path>, T: AsRef<Path>>(
        &mut self,
        link: T,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        use std::os::unix::ffi::OsStrExt;
        let target = link.as_ref().as_os_str().as_bytes().to_vec();
        self.tree.insert(path, header, NodeKind::Symlink { target })?;
        Ok(())
    }

    /// Insert character device with `device_number` at `path`
    pub fn push_char_device<P: AsRef<Path>>(
        &mut self,
        device_number: u32,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        self.tree.insert(path, header, NodeKind::CharacterDevice { device_number })?;
        Ok(())
    }

    /// Insert block device with `device_number` at `path`
    pub fn push_block_device<P: AsRef<Path>>(
        &mut self,
        device_number: u32,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        self.tree.insert(path, header, NodeKind::BlockDevice { device_number })?;
        Ok(())
    }

    /// Insert named pipe at `path`
    pub fn push_fifo<P: AsRef<Path>>(
        &mut self,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        self.tree.insert(path, header, NodeKind::NamedPipe)?;
        Ok(())
    }

    /// Insert socket at `path`
    pub fn push_socket<P: AsRef<Path>>(
        &mut self,
        path: P,
        header: NodeHeader,
    ) -> Result<(), SqfsError> {
        self.tree.insert(path, header, NodeKind::Socket)?;
        Ok(())
    }

    /// Generate and write the resulting squashfs image to `w`
    ///
    /// # Returns
    /// (written populated [`SuperBlock`], total amount of bytes written including padding)
    #[instrument(skip_all)]
    pub fn write<W: BackingFile>(&mut self, w: &mut W) -> Result<(SuperBlock, u64), SqfsError> {
        w.rewind()?;
        // Empty Squashfs Superblock
        w.write_all(&[0x00; SUPERBLOCK_SIZE])?;

        let mut superblock =
            SuperBlock::new(self.compressor.id(), self.block_size, self.block_log, self.mod_time);

        let (inode_count, order) = self.tree.assign_inode_numbers();

        // uid/gid values become table indices before any inode is emitted
        let mut id_indices = Vec::with_capacity(self.tree.len());
        for node in &self.tree.nodes {
            let uid = self.id_table.index_of(node.header.uid)?;
            let gid = self.id_table.index_of(node.header.gid)?;
            id_indices.push((uid, gid));
        }

        info!("Writing Data");
        let mut data_writer = DataWriter::new(
            self.compressor,
            self.block_size,
            self.device_block_size,
            SUPERBLOCK_SIZE as u64,
        );
        for &id in &order {
            let location = {
                let node = self.tree.node(id);
                let NodeKind::File { source } = &node.kind else {
                    continue;
                };
                let mut reader = source.reader.borrow_mut();
                match &source.sparse {
                    None => data_writer.write_file(w, reader.as_mut(), source.flags)?,
                    Some((file_size, map)) => data_writer.write_file_sparse(
                        w,
                        reader.as_mut(),
                        *file_size,
                        map,
                        source.flags,
                    )?,
                }
            };
            self.tree.nodes[id].location = Some(location);
        }

        info!("Writing Data Fragments");
        data_writer.finalize(w)?;

        info!("Writing Inodes and Dirs");
        let mut inode_writer = MetadataWriter::new(self.compressor, self.block_size);
        let mut dir_writer = MetadataWriter::new(self.compressor, self.block_size);
        let mut export = vec![0u64; inode_count as usize];
        let root = self.write_inode_dir(
            0,
            0,
            &mut inode_writer,
            &mut dir_writer,
            &id_indices,
            &mut export,
        )?;

        superblock.root_inode = root.inode_ref().raw();
        superblock.inode_count = inode_count;

        info!("Writing Inode Table");
        superblock.inode_table = w.stream_position()?;
        inode_writer.finalize(w)?;

        info!("Writing Dir Table");
        superblock.dir_table = w.stream_position()?;
        dir_writer.finalize(w)?;

        info!("Writing Frag Lookup Table");
        data_writer.write_fragment_table(w, &mut superblock)?;
        if data_writer.has_fragments() {
            superblock.flags &= !(SuperBlockFlags::FragmentsAreNotUsed as u16);
            superblock.flags |= SuperBlockFlags::FragmentsAreAlwaysGenerated as u16;
        }

        if self.exportable {
            info!("Writing Export Table");
            let mut bytes = Vec::with_capacity(export.len() * 8);
            for reference in &export {
                bytes.extend_from_slice(&reference.to_le_bytes());
            }
            superblock.export_table = write_table(w, &bytes, self.compressor, self.block_size)?;
            superblock.flags |= SuperBlockFlags::NFSExportTableExists as u16;
        }

        info!("Writing Id Lookup Table");
        self.id_table.write(w, self.compressor, self.block_size, &mut superblock)?;

        info!("Finalize Superblock and End Bytes");
        let bytes_written = self.finalize(w, &mut superblock)?;

        info!("Superblock: {:#02x?}", superblock);
        Ok((superblock, bytes_written))
    }

    fn finalize<W: BackingFile>(
        &self,
        w: &mut W,
        superblock: &mut SuperBlock,
    ) -> Result<u64, SqfsError> {
        superblock.bytes_used = w.stream_position()?;

        let mut pad_len = 0;
        if self.pad_len != 0 {
            info!("Writing Padding");
            pad_len = pad_to(w, superblock.bytes_used, u64::from(self.pad_len))?;
        }

        // Seek back the beginning and write the superblock
        info!("Writing Superblock");
        w.rewind()?;
        w.write_all(&superblock.to_bytes()?)?;

        Ok(superblock.bytes_used + pad_len)
    }

    /// Emit inodes and directory listings for the subtree under `node_id`.
    /// Children go first so a directory's entries already know where every
    /// child inode landed in the metadata stream.
    fn write_inode_dir(
        &self,
        node_id: NodeId,
        parent_inode: u32,
        inode_writer: &mut MetadataWriter,
        dir_writer: &mut MetadataWriter,
        id_indices: &[(u16, u16)],
        export: &mut [u64],
    ) -> Result<Entry, SqfsError> {
        let node = self.tree.node(node_id);
        let (uid, gid) = id_indices[node_id];
        let header = InodeHeader {
            permissions: node.header.permissions,
            uid,
            gid,
            mtime: node.header.mtime,
            inode_number: node.inode_number,
        };
        let name = node.name.clone();

        let entry = match &node.kind {
            NodeKind::File { .. } => {
                let Some(location) = &node.location else {
                    unreachable!()
                };
                Entry::file(name, header, location, node.xattr_index, inode_writer)?
            },
            NodeKind::Symlink { target } => Entry::symlink(name, header, target, inode_writer)?,
            NodeKind::BlockDevice { device_number } => Entry::device(
                name,
                header,
                InodeId::BasicBlockDevice,
                *device_number,
                inode_writer,
            )?,
            NodeKind::CharacterDevice { device_number } => Entry::device(
                name,
                header,
                InodeId::BasicCharacterDevice,
                *device_number,
                inode_writer,
            )?,
            NodeKind::NamedPipe => {
                Entry::ipc(name, header, InodeId::BasicNamedPipe, inode_writer)?
            },
            NodeKind::Socket => Entry::ipc(name, header, InodeId::BasicSocket, inode_writer)?,
            NodeKind::Dir { children } => {
                let mut entries = Vec::with_capacity(children.len());
                let mut subdirs = 0;
                for &child in children {
                    if matches!(self.tree.node(child).kind, NodeKind::Dir { .. }) {
                        subdirs += 1;
                    }
                    entries.push(self.write_inode_dir(
                        child,
                        node.inode_number,
                        inode_writer,
                        dir_writer,
                        id_indices,
                        export,
                    )?);
                }

                let reference = dir_writer.current_reference();
                let bytes = Entry::to_dir_bytes(entries)?;
                dir_writer.write_all(&bytes)?;
                trace!("[{:?}] listing is {:#02x?} bytes", node.name, bytes.len());

                Entry::path(
                    name,
                    header,
                    parent_inode,
                    2 + subdirs,
                    3 + bytes.len() as u32,
                    reference.offset(),
                    reference.block_start() as u32,
                    node.xattr_index,
                    inode_writer,
                )?
            },
        };

        export[(node.inode_number - 1) as usize] = entry.inode_ref().raw();
        Ok(entry)
    }
}
