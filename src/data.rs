//! File Data

use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::mem;

use bitflags::bitflags;
use deku::prelude::*;
use tracing::{instrument, trace};

use crate::compressor::{self, ImageCompressor};
use crate::error::SqfsError;
use crate::file::{pad_to, BackingFile};
use crate::fragment::Fragment;

// bitflag for data size field in inode for signifying that the data is uncompressed
const DATA_STORED_UNCOMPRESSED: u32 = 1 << 24;

/// Marker for a file inode without a fragment
pub(crate) const NO_FRAGMENT: u32 = 0xffff_ffff;

/// On-disk size of a data block. Bit 24 signals that the block is stored
/// uncompressed; a size of 0 denotes a sparse (all-zero) block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DataSize(u32);

impl DataSize {
    pub fn new(size: u32, uncompressed: bool) -> Self {
        let mut value: u32 = size;
        if value > DATA_STORED_UNCOMPRESSED {
            panic!("value is too big");
        }
        if uncompressed {
            value |= DATA_STORED_UNCOMPRESSED;
        }
        Self(value)
    }

    pub fn new_compressed(size: u32) -> Self {
        Self::new(size, false)
    }

    pub fn new_uncompressed(size: u32) -> Self {
        Self::new(size, true)
    }

    pub fn uncompressed(&self) -> bool {
        self.0 & DATA_STORED_UNCOMPRESSED != 0
    }

    pub fn size(&self) -> u32 {
        self.0 & !DATA_STORED_UNCOMPRESSED
    }

    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) fn raw(&self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Per-file behavior of the data writer
    pub struct DataFlags: u32 {
        /// Store all blocks of this file uncompressed
        const DONT_COMPRESS      = 0b0000_0001;
        /// Never pack the tail end of this file into a fragment block
        const DONT_FRAGMENT      = 0b0000_0010;
        /// Align this file's data to the device block size
        const ALIGN_DEVICE_BLOCK = 0b0000_0100;
    }
}

/// One run of real bytes inside an otherwise sparse input file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseMapEntry {
    pub offset: u64,
    pub count: u64,
}

/// Where a file's payload ended up in the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DataLocation {
    pub start_block: u64,
    pub block_sizes: Vec<DataSize>,
    pub frag_index: u32,
    pub block_offset: u32,
    pub file_size: u64,
    pub sparse: u64,
    pub blocks_are_duplicate: bool,
    pub fragment_is_duplicate: bool,
}

impl DataLocation {
    pub fn has_fragment(&self) -> bool {
        self.frag_index != NO_FRAGMENT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BlockRecord {
    size: DataSize,
    // CRC-32 of the uncompressed block, never stored on disk
    chksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FragmentTail {
    chksum: u32,
    size: u32,
    frag_index: u32,
    block_offset: u32,
    /// Tail bytes kept for byte-exact duplicate matching. `None` when this
    /// file itself reuses another file's fragment.
    bytes: Option<Vec<u8>>,
}

/// A finalized file the dedup scanner can match later files against
#[derive(Debug)]
struct WrittenFile {
    start_block: u64,
    blocks: Vec<BlockRecord>,
    fragment: Option<FragmentTail>,
}

/// Per-file build state between `begin_file` and `end_file`
#[derive(Debug)]
struct FileState {
    rollback: u64,
    start_block: u64,
    blocks: Vec<BlockRecord>,
    sparse: u64,
    frag: Option<FragmentTail>,
    file_size: u64,
    blocks_are_duplicate: bool,
    fragment_is_duplicate: bool,
    dedup_done: bool,
}

pub(crate) struct DataWriter {
    compressor: ImageCompressor,
    block_size: u32,
    device_block_size: u32,
    /// End of the data region written so far, including the superblock
    pub(crate) bytes_used: u64,
    block: Vec<u8>,
    fragment: Vec<u8>,
    pub(crate) fragment_table: Vec<Fragment>,
    files: Vec<WrittenFile>,
    has_fragments: bool,
}

impl DataWriter {
    #[instrument(skip_all)]
    pub fn new(
        compressor: ImageCompressor,
        block_size: u32,
        device_block_size: u32,
        data_start: u64,
    ) -> Self {
        Self {
            compressor,
            block_size,
            device_block_size,
            bytes_used: data_start,
            block: vec![0u8; block_size as usize],
            fragment: Vec::with_capacity(block_size as usize),
            fragment_table: vec![],
            files: vec![],
            has_fragments: false,
        }
    }

    pub fn has_fragments(&self) -> bool {
        self.has_fragments
    }

    /// Stream one file's payload into the image, reading until EOF
    #[instrument(skip_all)]
    pub fn write_file<W: BackingFile>(
        &mut self,
        w: &mut W,
        reader: &mut dyn Read,
        flags: DataFlags,
    ) -> Result<DataLocation, SqfsError> {
        let mut fi = self.begin_file(w, flags)?;

        let mut block = mem::take(&mut self.block);
        let mut next = vec![0u8; self.block_size as usize];
        let result: Result<u64, SqfsError> = (|| {
            let mut len = read_full(reader, &mut block)?;
            let mut file_size = 0u64;
            while len != 0 {
                // a block is the last one when nothing follows it
                let next_len = read_full(reader, &mut next)?;
                let is_last = next_len == 0;
                file_size += len as u64;
                self.flush_data_block(w, &block[..len], is_last, &mut fi, flags)?;
                mem::swap(&mut block, &mut next);
                len = next_len;
            }
            Ok(file_size)
        })();
        self.block = block;

        fi.file_size = result?;
        self.end_file(w, fi, flags)
    }

    /// Like [`Self::write_file`], but `reader` only yields the bytes named by
    /// `map`; everything in between is zero-filled. The map must be ordered,
    /// non-overlapping and end within `file_size`.
    #[instrument(skip_all)]
    pub fn write_file_sparse<W: BackingFile>(
        &mut self,
        w: &mut W,
        reader: &mut dyn Read,
        file_size: u64,
        map: &[SparseMapEntry],
        flags: DataFlags,
    ) -> Result<DataLocation, SqfsError> {
        let mut end = 0u64;
        for entry in map {
            if entry.offset < end {
                return Err(SqfsError::UnorderedSparseMap);
            }
            end = entry
                .offset
                .checked_add(entry.count)
                .ok_or(SqfsError::OversizeSparseMap)?;
        }
        if end > file_size {
            return Err(SqfsError::OversizeSparseMap);
        }

        let mut fi = self.begin_file(w, flags)?;

        let mut block = mem::take(&mut self.block);
        let result: Result<(), SqfsError> = (|| {
            let mut map_idx = 0;
            // bytes of the current map entry already copied into earlier blocks
            let mut consumed = 0u64;
            let mut offset = 0u64;
            while offset < file_size {
                let diff = (file_size - offset).min(u64::from(self.block_size)) as usize;
                let is_last = offset + diff as u64 == file_size;
                block[..diff].fill(0);

                while map_idx < map.len() {
                    let m = map[map_idx];
                    let m_start = m.offset + consumed;
                    if m_start >= offset + diff as u64 {
                        break;
                    }
                    let start = (m_start - offset) as usize;
                    let count = ((m.count - consumed) as usize).min(diff - start);
                    reader.read_exact(&mut block[start..start + count])?;
                    consumed += count as u64;
                    if consumed == m.count {
                        map_idx += 1;
                        consumed = 0;
                    } else {
                        break;
                    }
                }

                self.flush_data_block(w, &block[..diff], is_last, &mut fi, flags)?;
                offset += diff as u64;
            }
            Ok(())
        })();
        self.block = block;
        result?;

        fi.file_size = file_size;
        self.end_file(w, fi, flags)
    }

    fn begin_file<W: BackingFile>(
        &mut self,
        w: &mut W,
        flags: DataFlags,
    ) -> Result<FileState, SqfsError> {
        let rollback = w.stream_position()?;
        if flags.contains(DataFlags::ALIGN_DEVICE_BLOCK) {
            self.align_device_block(w)?;
        }

        Ok(FileState {
            rollback,
            start_block: self.bytes_used,
            blocks: vec![],
            sparse: 0,
            frag: None,
            file_size: 0,
            blocks_are_duplicate: false,
            fragment_is_duplicate: false,
            dedup_done: false,
        })
    }

    fn end_file<W: BackingFile>(
        &mut self,
        w: &mut W,
        fi: FileState,
        flags: DataFlags,
    ) -> Result<DataLocation, SqfsError> {
        if flags.contains(DataFlags::ALIGN_DEVICE_BLOCK) {
            self.align_device_block(w)?;
        }

        let location = DataLocation {
            start_block: fi.start_block,
            block_sizes: fi.blocks.iter().map(|b| b.size).collect(),
            frag_index: fi.frag.as_ref().map_or(NO_FRAGMENT, |f| f.frag_index),
            block_offset: fi.frag.as_ref().map_or(0, |f| f.block_offset),
            file_size: fi.file_size,
            sparse: fi.sparse,
            blocks_are_duplicate: fi.blocks_are_duplicate,
            fragment_is_duplicate: fi.fragment_is_duplicate,
        };

        self.files.push(WrittenFile {
            start_block: fi.start_block,
            blocks: fi.blocks,
            fragment: fi.frag,
        });

        Ok(location)
    }

    fn align_device_block<W: Write>(&mut self, w: &mut W) -> Result<(), SqfsError> {
        if self.device_block_size == 0 {
            return Ok(());
        }
        self.bytes_used += pad_to(w, self.bytes_used, u64::from(self.device_block_size))?;
        Ok(())
    }

    fn flush_data_block<W: BackingFile>(
        &mut self,
        w: &mut W,
        data: &[u8],
        is_last: bool,
        fi: &mut FileState,
        flags: DataFlags,
    ) -> Result<(), SqfsError> {
        if is_zero_block(data) {
            fi.blocks.push(BlockRecord { size: DataSize::new_compressed(0), chksum: 0 });
            fi.sparse += data.len() as u64;
            if is_last {
                self.deduplicate(w, fi)?;
            }
            return Ok(());
        }

        let chksum = crc32(data);

        if data.len() < self.block_size as usize && !flags.contains(DataFlags::DONT_FRAGMENT) {
            // startblock will not change anymore, so match whole-file
            // duplicates before the tail goes into shared fragment staging
            self.deduplicate(w, fi)?;

            if let Some((frag_index, block_offset)) = self.find_fragment(chksum, data) {
                trace!("duplicate fragment found: {frag_index} +{block_offset}");
                fi.frag = Some(FragmentTail {
                    chksum,
                    size: data.len() as u32,
                    frag_index,
                    block_offset,
                    bytes: None,
                });
                fi.fragment_is_duplicate = true;
                return Ok(());
            }

            if self.fragment.len() + data.len() > self.block_size as usize {
                self.flush_fragments(w)?;
            }

            fi.frag = Some(FragmentTail {
                chksum,
                size: data.len() as u32,
                frag_index: self.fragment_table.len() as u32,
                block_offset: self.fragment.len() as u32,
                bytes: Some(data.to_vec()),
            });
            self.fragment.extend_from_slice(data);
        } else {
            let size = self.write_compressed(w, data, flags)?;
            fi.blocks.push(BlockRecord { size, chksum });
            if is_last {
                self.deduplicate(w, fi)?;
            }
        }

        Ok(())
    }

    fn write_compressed<W: Write>(
        &mut self,
        w: &mut W,
        data: &[u8],
        flags: DataFlags,
    ) -> Result<DataSize, SqfsError> {
        if !flags.contains(DataFlags::DONT_COMPRESS) {
            let cb = compressor::compress(data, self.compressor, self.block_size)?;
            if !cb.is_empty() && cb.len() < data.len() {
                w.write_all(&cb)?;
                self.bytes_used += cb.len() as u64;
                return Ok(DataSize::new_compressed(cb.len() as u32));
            }
        }

        w.write_all(data)?;
        self.bytes_used += data.len() as u64;
        Ok(DataSize::new_uncompressed(data.len() as u32))
    }

    /// Match the just-written block run against every previously written
    /// file. On a match the run is dropped from the image and the file is
    /// re-pointed at the earlier copy; this seek-and-truncate is the normal
    /// success path for duplicate data, not error recovery.
    fn deduplicate<W: BackingFile>(
        &mut self,
        w: &mut W,
        fi: &mut FileState,
    ) -> Result<(), SqfsError> {
        if fi.dedup_done {
            return Ok(());
        }
        fi.dedup_done = true;

        let stored: u64 = fi.blocks.iter().map(|b| u64::from(b.size.size())).sum();
        if stored == 0 {
            // sparse-only and fragment-only files leave nothing to share
            return Ok(());
        }

        let mut candidate = None;
        for g in self.files.iter().rev() {
            if g.blocks.len() < fi.blocks.len() {
                continue;
            }
            let records_match = g.blocks[..fi.blocks.len()]
                .iter()
                .zip(&fi.blocks)
                .all(|(a, b)| a.size == b.size && a.chksum == b.chksum);
            if !records_match {
                continue;
            }
            if compare_on_disk(w, g.start_block, fi.start_block, stored)? {
                candidate = Some(g.start_block);
                break;
            }
        }

        if let Some(start_block) = candidate {
            trace!("duplicate block run found at 0x{start_block:02x?}");
            fi.start_block = start_block;
            fi.blocks_are_duplicate = true;
            w.seek(SeekFrom::Start(fi.rollback))?;
            w.truncate(fi.rollback)?;
            self.bytes_used = fi.rollback;
        }

        Ok(())
    }

    fn find_fragment(&self, chksum: u32, data: &[u8]) -> Option<(u32, u32)> {
        self.files.iter().rev().find_map(|g| {
            let tail = g.fragment.as_ref()?;
            if tail.chksum != chksum || tail.size != data.len() as u32 {
                return None;
            }
            match &tail.bytes {
                Some(bytes) if bytes == data => Some((tail.frag_index, tail.block_offset)),
                _ => None,
            }
        })
    }

    /// Compress and write the fragment staging buffer, add to fragment table,
    /// clear staging
    #[instrument(skip_all)]
    pub fn flush_fragments<W: BackingFile>(&mut self, w: &mut W) -> Result<(), SqfsError> {
        if self.fragment.is_empty() {
            return Ok(());
        }

        let start = self.bytes_used;
        let staged = mem::take(&mut self.fragment);
        let size = self.write_compressed(w, &staged, DataFlags::empty())?;
        self.fragment = staged;
        self.fragment.clear();

        self.fragment_table.push(Fragment::new(start, size));
        self.has_fragments = true;
        Ok(())
    }

    /// Flush any staged fragment data. Must run before the metadata tables
    /// are written.
    pub fn finalize<W: BackingFile>(&mut self, w: &mut W) -> Result<(), SqfsError> {
        self.flush_fragments(w)
    }

    /// Persist the fragment table, or record its absence in the superblock
    pub fn write_fragment_table<W: Write + Seek>(
        &self,
        w: &mut W,
        superblock: &mut crate::superblock::SuperBlock,
    ) -> Result<(), SqfsError> {
        if self.fragment_table.is_empty() {
            superblock.frag_count = 0;
            superblock.frag_table = crate::superblock::NOT_SET;
            return Ok(());
        }

        let mut bytes = Vec::with_capacity(self.fragment_table.len() * Fragment::SIZE);
        for fragment in &self.fragment_table {
            bytes.extend_from_slice(&fragment.to_bytes()?);
        }

        superblock.frag_table = crate::table::write_table(w, &bytes, self.compressor, self.block_size)?;
        superblock.frag_count = self.fragment_table.len() as u32;
        Ok(())
    }
}

fn is_zero_block(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Fill `buf` from `reader`, short only at EOF
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize, SqfsError> {
    let mut read_len = 0;
    loop {
        match reader.read(&mut buf[read_len..]) {
            Ok(0) => break,
            Ok(n) => {
                read_len += n;
                if read_len == buf.len() {
                    break;
                }
            },
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read_len)
}

fn compare_on_disk<W: BackingFile>(
    w: &mut W,
    a_start: u64,
    b_start: u64,
    len: u64,
) -> Result<bool, SqfsError> {
    let restore = w.stream_position()?;
    let result = (|| {
        let chunk = 8192.min(len as usize);
        let mut a_buf = vec![0u8; chunk];
        let mut b_buf = vec![0u8; chunk];
        let mut done = 0u64;
        while done < len {
            let n = chunk.min((len - done) as usize);
            w.seek(SeekFrom::Start(a_start + done))?;
            w.read_exact(&mut a_buf[..n])?;
            w.seek(SeekFrom::Start(b_start + done))?;
            w.read_exact(&mut b_buf[..n])?;
            if a_buf[..n] != b_buf[..n] {
                return Ok(false);
            }
            done += n as u64;
        }
        Ok(true)
    })();
    w.seek(SeekFrom::Start(restore))?;
    result
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::compressor::Compressor;

    fn writer(block_size: u32) -> DataWriter {
        DataWriter::new(
            ImageCompressor::new(Compressor::None, None).unwrap(),
            block_size,
            0,
            0,
        )
    }

    #[test]
    fn test_data_size_bits() {
        let compressed = DataSize::new_compressed(100);
        assert!(!compressed.uncompressed());
        assert_eq!(compressed.size(), 100);

        let raw = DataSize::new_uncompressed(100);
        assert!(raw.uncompressed());
        assert_eq!(raw.size(), 100);

        let sparse = DataSize::new_compressed(0);
        assert_eq!(sparse.size(), 0);
    }

    #[test]
    fn test_sparse_blocks_take_no_space() {
        let mut dw = writer(128);
        let mut out = Cursor::new(vec![]);
        let zeros = vec![0u8; 128 * 3];

        let loc = dw.write_file(&mut out, &mut Cursor::new(zeros), DataFlags::empty()).unwrap();
        assert_eq!(loc.block_sizes.len(), 3);
        assert!(loc.block_sizes.iter().all(|b| b.size() == 0));
        assert_eq!(loc.sparse, 128 * 3);
        assert_eq!(loc.file_size, 128 * 3);
        assert!(!loc.has_fragment());
        assert!(out.get_ref().is_empty());
    }

    #[test]
    fn test_whole_file_dedup_rolls_back() {
        let mut dw = writer(128);
        let mut out = Cursor::new(vec![]);
        let payload = vec![0x5a_u8; 128 * 2];

        let first = dw
            .write_file(&mut out, &mut Cursor::new(payload.clone()), DataFlags::empty())
            .unwrap();
        let after_first = out.get_ref().len();
        assert!(!first.blocks_are_duplicate);

        let second = dw
            .write_file(&mut out, &mut Cursor::new(payload), DataFlags::empty())
            .unwrap();
        assert!(second.blocks_are_duplicate);
        assert_eq!(second.start_block, first.start_block);
        assert_eq!(second.block_sizes, first.block_sizes);
        // the duplicate's bytes were truncated away again
        assert_eq!(out.get_ref().len(), after_first);
    }

    #[test]
    fn test_shared_fragment_binding() {
        let mut dw = writer(128);
        let mut out = Cursor::new(vec![]);

        let x = dw
            .write_file(&mut out, &mut Cursor::new(b"hello".to_vec()), DataFlags::empty())
            .unwrap();
        let y = dw
            .write_file(&mut out, &mut Cursor::new(b"hello".to_vec()), DataFlags::empty())
            .unwrap();

        assert_eq!(x.frag_index, 0);
        assert_eq!(x.block_offset, 0);
        assert!(!x.fragment_is_duplicate);
        assert_eq!(y.frag_index, 0);
        assert_eq!(y.block_offset, 0);
        assert!(y.fragment_is_duplicate);

        dw.finalize(&mut out).unwrap();
        assert_eq!(dw.fragment_table.len(), 1);
    }

    #[test]
    fn test_fragment_staging_flushes_when_full() {
        let mut dw = writer(128);
        let mut out = Cursor::new(vec![]);

        dw.write_file(&mut out, &mut Cursor::new(vec![1u8; 100]), DataFlags::empty()).unwrap();
        // does not fit next to the first tail, forces a fragment block flush
        let second = dw
            .write_file(&mut out, &mut Cursor::new(vec![2u8; 100]), DataFlags::empty())
            .unwrap();

        assert_eq!(dw.fragment_table.len(), 1);
        assert_eq!(second.frag_index, 1);
        assert_eq!(second.block_offset, 0);
    }

    #[test]
    fn test_dont_fragment_stores_short_block() {
        let mut dw = writer(128);
        let mut out = Cursor::new(vec![]);

        let loc = dw
            .write_file(&mut out, &mut Cursor::new(vec![3u8; 5]), DataFlags::DONT_FRAGMENT)
            .unwrap();
        assert!(!loc.has_fragment());
        assert_eq!(loc.block_sizes.len(), 1);
        assert_eq!(out.get_ref().len(), 5);
    }

    #[test]
    fn test_sparse_map_validation() {
        let mut dw = writer(128);
        let mut out = Cursor::new(vec![]);
        let mut empty = Cursor::new(vec![]);

        let overlapping = [
            SparseMapEntry { offset: 10, count: 5 },
            SparseMapEntry { offset: 12, count: 5 },
        ];
        assert!(matches!(
            dw.write_file_sparse(&mut out, &mut empty, 64, &overlapping, DataFlags::empty()),
            Err(SqfsError::UnorderedSparseMap)
        ));

        let unordered = [
            SparseMapEntry { offset: 3, count: 2 },
            SparseMapEntry { offset: 0, count: 2 },
        ];
        assert!(matches!(
            dw.write_file_sparse(&mut out, &mut empty, 64, &unordered, DataFlags::empty()),
            Err(SqfsError::UnorderedSparseMap)
        ));

        let oversize = [SparseMapEntry { offset: 60, count: 10 }];
        assert!(matches!(
            dw.write_file_sparse(&mut out, &mut empty, 64, &oversize, DataFlags::empty()),
            Err(SqfsError::OversizeSparseMap)
        ));
    }

    #[test]
    fn test_sparse_map_zero_fill() {
        let mut dw = writer(16);
        let mut out = Cursor::new(vec![]);

        // 40 byte file, real bytes at [4..8) and [18..21)
        let map = [
            SparseMapEntry { offset: 4, count: 4 },
            SparseMapEntry { offset: 18, count: 3 },
        ];
        let mut input = Cursor::new(vec![0xaa, 0xbb, 0xcc, 0xdd, 0x11, 0x22, 0x33]);
        let loc = dw
            .write_file_sparse(&mut out, &mut input, 40, &map, DataFlags::DONT_FRAGMENT)
            .unwrap();

        assert_eq!(loc.block_sizes.len(), 3);
        // last block holds no real bytes and is recorded sparse
        assert_eq!(loc.block_sizes[2].size(), 0);
        assert_eq!(loc.sparse, 8);

        let image = out.get_ref();
        let mut expect_first = vec![0u8; 16];
        expect_first[4..8].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        let mut expect_second = vec![0u8; 16];
        expect_second[2..5].copy_from_slice(&[0x11, 0x22, 0x33]);
        assert_eq!(&image[..16], &expect_first[..]);
        assert_eq!(&image[16..32], &expect_second[..]);
    }
}
