//! Image reader

use std::cell::RefCell;
use std::io::{Read, SeekFrom};

use deku::prelude::*;
use tracing::instrument;

use crate::compressor::{self, CompressionOptions, Compressor};
use crate::data::{DataSize, NO_FRAGMENT};
use crate::dir_reader::{DirReader, DirReaderFlags};
use crate::error::SqfsError;
use crate::file::ReadSeek;
use crate::fragment::Fragment;
use crate::id::Id;
use crate::inode::{Inode, InodeInner};
use crate::metadata::MetadataReader;
use crate::superblock::{SuperBlock, NOT_SET, SUPERBLOCK_SIZE};
use crate::table::read_table;

/// Parsed SquashFS image, giving access to its tables, directory tree and
/// file contents
pub struct ImageReader<R: ReadSeek> {
    pub superblock: SuperBlock,
    pub compression_options: Option<CompressionOptions>,
    /// Fragments Lookup Table
    pub fragments: Vec<Fragment>,
    /// 32 bit user and group IDs
    pub ids: Vec<Id>,
    /// NFS export table: inode references indexed by inode number - 1
    pub export: Option<Vec<u64>>,
    pub(crate) file: RefCell<R>,
}

impl<R: ReadSeek> ImageReader<R> {
    /// Parse and validate the superblock and all lookup tables of `reader`
    #[instrument(skip_all)]
    pub fn from_reader(mut reader: R) -> Result<Self, SqfsError> {
        reader.rewind()?;
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        reader.read_exact(&mut buf)?;

        // reject unknown compressor ids before the codec chokes on the field
        let compressor_id = u16::from_le_bytes([buf[20], buf[21]]);
        if compressor_id > Compressor::Zstd as u16 {
            return Err(SqfsError::UnsupportedCompression(compressor_id));
        }

        let (_, superblock) = SuperBlock::from_bytes((&buf, 0))?;
        superblock.validate()?;

        let file = RefCell::new(reader);

        let compression_options = if superblock.compressor_options_are_present() {
            let mut meta = MetadataReader::new(
                &file,
                superblock.compressor,
                SUPERBLOCK_SIZE as u64,
                superblock.inode_table,
            );
            meta.seek(0, 0)?;
            let mut buf = vec![0u8; options_size(superblock.compressor)?];
            meta.read(&mut buf)?;
            Some(CompressionOptions::from_bytes_for(&buf, superblock.compressor)?)
        } else {
            None
        };

        let ids = if superblock.id_count > 0 && superblock.id_table != NOT_SET {
            let bytes = read_table(
                &file,
                superblock.compressor,
                superblock.id_table,
                usize::from(superblock.id_count) * Id::SIZE,
            )?;
            bytes
                .chunks_exact(Id::SIZE)
                .map(|chunk| Id::new(u32::from_le_bytes(chunk.try_into().unwrap())))
                .collect()
        } else {
            vec![]
        };

        let fragments = if superblock.frag_count > 0 && superblock.frag_table != NOT_SET {
            let bytes = read_table(
                &file,
                superblock.compressor,
                superblock.frag_table,
                superblock.frag_count as usize * Fragment::SIZE,
            )?;
            let mut fragments = Vec::with_capacity(superblock.frag_count as usize);
            for chunk in bytes.chunks_exact(Fragment::SIZE) {
                fragments.push(Fragment::from_bytes((chunk, 0))?.1);
            }
            fragments
        } else {
            vec![]
        };

        let export = if superblock.nfs_export_table_exists() && superblock.export_table != NOT_SET
        {
            let bytes = read_table(
                &file,
                superblock.compressor,
                superblock.export_table,
                superblock.inode_count as usize * 8,
            )?;
            Some(
                bytes
                    .chunks_exact(8)
                    .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
                    .collect(),
            )
        } else {
            None
        };

        Ok(Self {
            superblock,
            compression_options,
            fragments,
            ids,
            export,
            file,
        })
    }

    /// Fresh directory cursor over this image
    pub fn dir_reader(&self, flags: DirReaderFlags) -> DirReader<'_, R> {
        let meta_inode = MetadataReader::new(
            &self.file,
            self.superblock.compressor,
            self.superblock.inode_table,
            self.superblock.dir_table,
        );

        // the directory table ends where the next table begins
        let mut limit = self.superblock.id_table;
        if self.superblock.frag_table != NOT_SET && self.superblock.frag_table < limit {
            limit = self.superblock.frag_table;
        }
        if self.superblock.export_table != NOT_SET && self.superblock.export_table < limit {
            limit = self.superblock.export_table;
        }
        let meta_dir = MetadataReader::new(
            &self.file,
            self.superblock.compressor,
            self.superblock.dir_table,
            limit,
        );

        DirReader::new(self.superblock, meta_inode, meta_dir, flags)
    }

    /// Materialize the root directory inode
    pub fn root_inode(&self) -> Result<Inode, SqfsError> {
        self.dir_reader(DirReaderFlags::empty()).get_root_inode()
    }

    /// Resolve a uid/gid table index stored in an inode header
    pub fn id_of(&self, index: u16) -> Result<u32, SqfsError> {
        self.ids
            .get(usize::from(index))
            .map(|id| id.num)
            .ok_or(SqfsError::CorruptedOrInvalidSquashfs)
    }

    /// Streaming reader over a file inode's content
    pub fn file_reader(&self, inode: &Inode) -> Result<FileReader<'_, R>, SqfsError> {
        let (blocks_start, file_size, block_sizes, frag_index, block_offset) = match &inode.inner {
            InodeInner::BasicFile(f) => (
                u64::from(f.blocks_start),
                u64::from(f.file_size),
                f.block_sizes.clone(),
                f.frag_index,
                f.block_offset,
            ),
            InodeInner::ExtendedFile(f) => (
                f.blocks_start,
                f.file_size,
                f.block_sizes.clone(),
                f.frag_index,
                f.block_offset,
            ),
            _ => return Err(SqfsError::UnexpectedInode),
        };

        let fragment = if frag_index == NO_FRAGMENT {
            None
        } else {
            let fragment = self
                .fragments
                .get(frag_index as usize)
                .copied()
                .ok_or(SqfsError::CorruptedOrInvalidSquashfs)?;
            Some(fragment)
        };

        Ok(FileReader {
            system: self,
            pos: blocks_start,
            block_sizes,
            index: 0,
            fragment,
            fragment_offset: block_offset,
            file_size,
            produced: 0,
            buf: vec![],
            buf_pos: 0,
        })
    }

    /// Read and return all the bytes from the file
    pub fn read_file(&self, inode: &Inode) -> Result<Vec<u8>, SqfsError> {
        let mut reader = self.file_reader(inode)?;
        let mut bytes = Vec::with_capacity(reader.file_size as usize);
        reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Walks a file's block list, then its fragment tail. Sparse blocks are
/// synthesized as zeros without touching the backing file.
pub struct FileReader<'a, R: ReadSeek> {
    system: &'a ImageReader<R>,
    /// Next on-disk position in the file's block run
    pos: u64,
    block_sizes: Vec<DataSize>,
    index: usize,
    fragment: Option<Fragment>,
    fragment_offset: u32,
    file_size: u64,
    produced: u64,
    buf: Vec<u8>,
    buf_pos: usize,
}

impl<R: ReadSeek> FileReader<'_, R> {
    fn next_block(&mut self) -> Result<(), SqfsError> {
        let block_size = u64::from(self.system.superblock.block_size);
        self.buf_pos = 0;

        if self.index < self.block_sizes.len() {
            let data_size = self.block_sizes[self.index];
            let offset_in_file = self.index as u64 * block_size;
            let expected = (self.file_size - offset_in_file).min(block_size) as usize;
            self.index += 1;

            if data_size.size() == 0 {
                // sparse block
                self.buf = vec![0u8; expected];
                return Ok(());
            }

            let raw = self.read_at(self.pos, data_size.size() as usize)?;
            self.pos += u64::from(data_size.size());
            self.buf = self.decompress_block(raw, data_size.uncompressed())?;
            if self.buf.len() != expected {
                return Err(SqfsError::CorruptedOrInvalidSquashfs);
            }
            return Ok(());
        }

        if let Some(fragment) = self.fragment.take() {
            let raw = self.read_at(fragment.start, fragment.size.size() as usize)?;
            let block = self.decompress_block(raw, fragment.size.uncompressed())?;

            let tail_len = (self.file_size - self.produced) as usize;
            let start = self.fragment_offset as usize;
            let end = start
                .checked_add(tail_len)
                .ok_or(SqfsError::CorruptedOrInvalidSquashfs)?;
            if end > block.len() {
                return Err(SqfsError::CorruptedOrInvalidSquashfs);
            }
            self.buf = block[start..end].to_vec();
            return Ok(());
        }

        self.buf = vec![];
        Ok(())
    }

    fn read_at(&self, position: u64, len: usize) -> Result<Vec<u8>, SqfsError> {
        let mut raw = vec![0u8; len];
        let mut file = self.system.file.borrow_mut();
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(&mut raw)?;
        Ok(raw)
    }

    fn decompress_block(&self, raw: Vec<u8>, uncompressed: bool) -> Result<Vec<u8>, SqfsError> {
        if uncompressed {
            return Ok(raw);
        }
        let mut out = Vec::with_capacity(self.system.superblock.block_size as usize);
        compressor::decompress(&raw, &mut out, self.system.superblock.compressor)?;
        Ok(out)
    }
}

impl<R: ReadSeek> Read for FileReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.produced == self.file_size {
            return Ok(0);
        }

        if self.buf_pos == self.buf.len() {
            self.next_block()?;
            if self.buf.is_empty() {
                // metadata promised more bytes than the block run holds
                return Err(SqfsError::CorruptedOrInvalidSquashfs.into());
            }
        }

        let left = (self.file_size - self.produced) as usize;
        let n = buf.len().min(self.buf.len() - self.buf_pos).min(left);
        buf[..n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
        self.buf_pos += n;
        self.produced += n as u64;
        Ok(n)
    }
}

fn options_size(compressor: Compressor) -> Result<usize, SqfsError> {
    let size = match compressor {
        Compressor::Gzip => 8,
        Compressor::Lzo => 8,
        Compressor::Xz => 8,
        Compressor::Lz4 => 8,
        Compressor::Zstd => 4,
        _ => return Err(SqfsError::InvalidCompressionOption),
    };
    Ok(size)
}
