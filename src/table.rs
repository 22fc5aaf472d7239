//! Lookup table persistence
//!
//! The id, fragment and export tables share one on-disk scheme: the payload
//! is chopped into metadata blocks written at the current position, followed
//! by a plain array of `u64` offsets naming where each block starts. The
//! superblock records the offset of that second array.

use std::cell::RefCell;
use std::io::{Seek, SeekFrom, Write};

use tracing::instrument;

use crate::compressor::{Compressor, ImageCompressor};
use crate::error::SqfsError;
use crate::file::ReadSeek;
use crate::metadata::{MetadataReader, MetadataWriter, METADATA_MAXSIZE};

/// Write `bytes` as a metadata block run plus location array, returning the
/// offset of the location array
#[instrument(skip_all)]
pub(crate) fn write_table<W: Write + Seek>(
    w: &mut W,
    bytes: &[u8],
    compressor: ImageCompressor,
    block_size: u32,
) -> Result<u64, SqfsError> {
    let mut meta = MetadataWriter::new(compressor, block_size);
    meta.write_all(bytes)?;
    let locations = meta.finalize(w)?;

    let table_start = w.stream_position()?;
    for location in &locations {
        w.write_all(&location.to_le_bytes())?;
    }

    Ok(table_start)
}

/// Read back a table of `table_size` bytes whose location array lives at
/// `location`
#[instrument(skip_all)]
pub(crate) fn read_table<R: ReadSeek>(
    file: &RefCell<R>,
    compressor: Compressor,
    location: u64,
    table_size: usize,
) -> Result<Vec<u8>, SqfsError> {
    let block_count = (table_size + METADATA_MAXSIZE - 1) / METADATA_MAXSIZE;

    let mut locations = Vec::with_capacity(block_count);
    {
        let mut f = file.borrow_mut();
        f.seek(SeekFrom::Start(location))?;
        let mut buf = [0u8; 8];
        for _ in 0..block_count {
            f.read_exact(&mut buf)?;
            locations.push(u64::from_le_bytes(buf));
        }
    }

    // block references in the location array are absolute, the blocks
    // themselves always live before the array
    let mut meta = MetadataReader::new(file, compressor, 0, location);
    let mut data = vec![0u8; table_size];
    let mut filled = 0;
    for start in locations {
        let diff = METADATA_MAXSIZE.min(table_size - filled);
        meta.seek(start, 0)?;
        meta.read(&mut data[filled..filled + diff])?;
        filled += diff;
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_table_round_trip() {
        let compressor = ImageCompressor::new(Compressor::None, None).unwrap();
        let payload: Vec<u8> = (0..METADATA_MAXSIZE * 2 + 77).map(|i| (i % 251) as u8).collect();

        let mut out = Cursor::new(vec![]);
        let start = write_table(&mut out, &payload, compressor, 0x2000).unwrap();

        // three blocks, three location entries
        assert_eq!(out.get_ref().len() as u64, start + 3 * 8);

        let file = RefCell::new(out);
        let back = read_table(&file, Compressor::None, start, payload.len()).unwrap();
        assert_eq!(back, payload);
    }
}
