//! Compressed metadata block streams
//!
//! Inodes and directory listings are stored as chains of independently
//! compressed 8 KiB blocks. Each block is prefixed by a 16-bit little-endian
//! length with the high bit signalling an uncompressed payload. References
//! into the stream address the *file offset at which a block begins*, so the
//! payload of a block starts 2 bytes after the offset a reference names.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Seek, SeekFrom, Write};

use tracing::{instrument, trace};

use crate::compressor::{self, Compressor, ImageCompressor};
use crate::error::SqfsError;
use crate::file::ReadSeek;

pub const METADATA_MAXSIZE: usize = 0x2000;

const METADATA_UNCOMPRESSED: u16 = 1 << 15;

/// Check is_compressed bit within raw `len`
pub fn is_compressed(len: u16) -> bool {
    len & METADATA_UNCOMPRESSED == 0
}

/// Get actual length of `data` following `len` from unedited `len`
pub fn len(len: u16) -> u16 {
    len & !(METADATA_UNCOMPRESSED)
}

pub fn set_if_uncompressed(len: u16) -> u16 {
    len | METADATA_UNCOMPRESSED
}

/// 64-bit address of a byte inside a metadata stream: the upper 48 bits are
/// the offset of the containing block (relative to the stream start), the
/// lower 16 bits the byte offset inside the uncompressed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeRef(u64);

impl InodeRef {
    pub fn new(block_start: u64, offset: u16) -> Self {
        Self((block_start << 16) | u64::from(offset))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn block_start(self) -> u64 {
        self.0 >> 16
    }

    pub fn offset(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

pub(crate) struct MetadataWriter {
    compressor: ImageCompressor,
    block_size: u32,
    /// Offset from the beginning of the metadata block last written
    pub(crate) metadata_start: u32,
    // All current bytes that are uncompressed
    pub(crate) uncompressed_bytes: VecDeque<u8>,
    // All current bytes that are compressed or uncompressed
    pub(crate) final_bytes: Vec<(bool, Vec<u8>)>,
}

impl MetadataWriter {
    #[instrument(skip_all)]
    pub fn new(compressor: ImageCompressor, block_size: u32) -> Self {
        Self {
            compressor,
            block_size,
            metadata_start: 0,
            uncompressed_bytes: VecDeque::new(),
            final_bytes: vec![],
        }
    }

    /// Reference to the next byte appended: `(block_start, offset)` of the
    /// staging buffer's write position
    pub fn current_reference(&self) -> InodeRef {
        InodeRef::new(
            u64::from(self.metadata_start),
            self.uncompressed_bytes.len() as u16,
        )
    }

    #[instrument(skip_all)]
    fn add_block(&mut self) -> io::Result<()> {
        // uncompressed data that will create the metablock
        let uncompressed_len = self.uncompressed_bytes.len().min(METADATA_MAXSIZE);
        if uncompressed_len == 0 {
            // nothing to add
            return Ok(());
        }

        if self.uncompressed_bytes.as_slices().0.len() < uncompressed_len {
            self.uncompressed_bytes.make_contiguous();
        }
        let uncompressed = &self.uncompressed_bytes.as_slices().0[0..uncompressed_len];

        trace!("time to compress");
        let compressed = compressor::compress(uncompressed, self.compressor, self.block_size)
            .map_err(io::Error::from)?;

        // Remove the data consumed, if the compressed data is not smaller, use the uncompressed
        let (compressed, metadata) = if compressed.len() >= uncompressed_len {
            let uncompressed = self.uncompressed_bytes.drain(0..uncompressed_len).collect();
            (false, uncompressed)
        } else {
            self.uncompressed_bytes.drain(0..uncompressed_len);
            (true, compressed)
        };

        // Metadata len + bytes + last metadata_start
        self.metadata_start += 2 + metadata.len() as u32;
        trace!("new metadata start: {:#02x?}", self.metadata_start);
        self.final_bytes.push((compressed, metadata));

        Ok(())
    }

    /// Flush the partial block and write out all blocks. Returns the absolute
    /// file offset each block started at, for table location arrays.
    #[instrument(skip_all)]
    pub fn finalize<W: Write + Seek>(&mut self, out: &mut W) -> Result<Vec<u64>, SqfsError> {
        // add any remaining data
        while !self.uncompressed_bytes.is_empty() {
            self.add_block()?;
        }

        // write all the metadata blocks
        let mut locations = Vec::with_capacity(self.final_bytes.len());
        for (compressed, bytes) in &self.final_bytes {
            trace!("len: {:02x?}", bytes.len());
            locations.push(out.stream_position()?);
            // if uncompressed, set the highest bit of len
            let len = bytes.len() as u16 | if *compressed { 0 } else { METADATA_UNCOMPRESSED };
            out.write_all(&len.to_le_bytes())?;
            out.write_all(bytes)?;
        }

        Ok(locations)
    }
}

impl Write for MetadataWriter {
    #[instrument(skip_all)]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // add all of buf into uncompressed
        self.uncompressed_bytes.write_all(buf)?;

        // if there is too much uncompressed data, create a new metadata block
        while self.uncompressed_bytes.len() >= METADATA_MAXSIZE {
            self.add_block()?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

const NO_BLOCK: u64 = u64::MAX;

/// Cursor into a metadata stream. Caches the most recently decompressed
/// block; sequential reads cross into the following block on demand.
pub(crate) struct MetadataReader<'a, R: ReadSeek> {
    file: &'a RefCell<R>,
    compressor: Compressor,
    /// Absolute file offset the stream (and all block references) are
    /// relative to
    start: u64,
    /// Absolute file offset this stream must not read at or beyond
    limit: u64,
    block_start: u64,
    next_block: u64,
    data: Vec<u8>,
    pos: usize,
}

impl<'a, R: ReadSeek> MetadataReader<'a, R> {
    pub fn new(file: &'a RefCell<R>, compressor: Compressor, start: u64, limit: u64) -> Self {
        Self {
            file,
            compressor,
            start,
            limit,
            block_start: NO_BLOCK,
            next_block: 0,
            data: vec![],
            pos: 0,
        }
    }

    /// Position the cursor at `offset` bytes into the block starting at
    /// `block_start` (relative to the stream start)
    pub fn seek(&mut self, block_start: u64, offset: u16) -> Result<(), SqfsError> {
        if block_start != self.block_start {
            self.fetch(block_start)?;
        }
        if usize::from(offset) >= self.data.len() {
            return Err(SqfsError::CorruptedOrInvalidSquashfs);
        }
        self.pos = usize::from(offset);
        Ok(())
    }

    #[instrument(skip_all)]
    fn fetch(&mut self, block_start: u64) -> Result<(), SqfsError> {
        let position = self.start.checked_add(block_start).ok_or(SqfsError::MetadataOutOfBounds)?;
        if position.checked_add(2).map_or(true, |end| end > self.limit) {
            return Err(SqfsError::MetadataOutOfBounds);
        }

        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(position))?;

        let mut header = [0u8; 2];
        file.read_exact(&mut header)?;
        let header = u16::from_le_bytes(header);

        let on_disk_len = usize::from(len(header));
        trace!("len: 0x{on_disk_len:02x?}");
        if on_disk_len == 0 || on_disk_len > METADATA_MAXSIZE {
            return Err(SqfsError::CorruptedOrInvalidSquashfs);
        }
        if position + 2 + on_disk_len as u64 > self.limit {
            return Err(SqfsError::MetadataOutOfBounds);
        }

        let mut buf = vec![0u8; on_disk_len];
        file.read_exact(&mut buf)?;
        drop(file);

        self.data = if is_compressed(header) {
            let mut out = Vec::with_capacity(METADATA_MAXSIZE);
            compressor::decompress(&buf, &mut out, self.compressor)?;
            if out.len() > METADATA_MAXSIZE {
                return Err(SqfsError::CorruptedOrInvalidSquashfs);
            }
            out
        } else {
            buf
        };

        self.block_start = block_start;
        self.next_block = block_start + 2 + on_disk_len as u64;
        self.pos = 0;
        Ok(())
    }

    /// Copy exactly `buf.len()` bytes from the cursor, crossing block
    /// boundaries as needed
    pub fn read(&mut self, mut buf: &mut [u8]) -> Result<(), SqfsError> {
        while !buf.is_empty() {
            if self.block_start == NO_BLOCK || self.pos == self.data.len() {
                let next = if self.block_start == NO_BLOCK { 0 } else { self.next_block };
                self.fetch(next)?;
            }
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

impl<R: ReadSeek> Clone for MetadataReader<'_, R> {
    fn clone(&self) -> Self {
        Self {
            file: self.file,
            compressor: self.compressor,
            start: self.start,
            limit: self.limit,
            block_start: self.block_start,
            next_block: self.next_block,
            data: self.data.clone(),
            pos: self.pos,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn none() -> ImageCompressor {
        ImageCompressor::new(Compressor::None, None).unwrap()
    }

    #[test]
    fn test_inode_ref_packing() {
        let r = InodeRef::new(0x1234, 0x0042);
        assert_eq!(r.raw(), 0x1234_0042);
        assert_eq!(r.block_start(), 0x1234);
        assert_eq!(r.offset(), 0x42);
    }

    #[test]
    fn test_writer_splits_blocks() {
        let mut mw = MetadataWriter::new(none(), 0x2000);
        mw.write_all(&[0xff; METADATA_MAXSIZE - 3]).unwrap();
        assert_eq!(mw.metadata_start, 0);
        assert!(mw.final_bytes.is_empty());

        // crossing 8 KiB closes the first block
        mw.write_all(&[0x11; 6]).unwrap();
        assert_eq!(mw.metadata_start, 2 + METADATA_MAXSIZE as u32);
        assert_eq!(mw.final_bytes.len(), 1);
        assert_eq!(mw.uncompressed_bytes.len(), 3);
        assert_eq!(mw.current_reference().offset(), 3);
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut mw = MetadataWriter::new(none(), 0x2000);
        let payload: Vec<u8> = (0..METADATA_MAXSIZE * 2 + 100).map(|i| i as u8).collect();
        mw.write_all(&payload).unwrap();

        let mut out = Cursor::new(vec![]);
        let locations = mw.finalize(&mut out).unwrap();
        assert_eq!(locations.len(), 3);
        assert_eq!(locations[0], 0);
        // uncompressed blocks carry a 2 byte header each
        assert_eq!(locations[1], 2 + METADATA_MAXSIZE as u64);

        let file = RefCell::new(out);
        let mut reader = MetadataReader::new(&file, Compressor::None, 0, u64::MAX);
        reader.seek(0, 0).unwrap();
        let mut back = vec![0u8; payload.len()];
        reader.read(&mut back).unwrap();
        assert_eq!(back, payload);

        // seek into the middle of the second block
        reader.seek(locations[1], 100).unwrap();
        let mut tail = vec![0u8; 16];
        reader.read(&mut tail).unwrap();
        assert_eq!(tail, payload[METADATA_MAXSIZE + 100..METADATA_MAXSIZE + 116]);
    }

    #[test]
    fn test_reader_respects_limit() {
        let mut mw = MetadataWriter::new(none(), 0x2000);
        mw.write_all(&[0xaa; 32]).unwrap();
        let mut out = Cursor::new(vec![]);
        mw.finalize(&mut out).unwrap();

        let file = RefCell::new(out);
        let mut reader = MetadataReader::new(&file, Compressor::None, 0, 1);
        assert!(matches!(
            reader.seek(0, 0),
            Err(SqfsError::MetadataOutOfBounds)
        ));
    }
}
