//! Backing file traits and padding helpers

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};

use crate::error::SqfsError;

/// Pseudo-trait for `Read + Seek`
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Backing file an image is built into.
///
/// The writer needs to read back previously written blocks to confirm
/// duplicate candidates, and to drop a just-written block run when a
/// duplicate is confirmed.
pub trait BackingFile: Read + Write + Seek {
    /// Cut the file off at `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl BackingFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl BackingFile for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

impl<T: BackingFile + ?Sized> BackingFile for &mut T {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate(len)
    }
}

/// Write zeros until `position` is rounded up to a multiple of `align`.
/// Returns the amount of padding written.
pub(crate) fn pad_to<W: Write>(w: &mut W, position: u64, align: u64) -> Result<u64, SqfsError> {
    let diff = position % align;
    if diff == 0 {
        return Ok(0);
    }

    let mut left = align - diff;
    let zeros = [0u8; 1024];
    let total = left;
    while left != 0 {
        let n = left.min(zeros.len() as u64);
        w.write_all(&zeros[..n as usize])?;
        left -= n;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_to() {
        let mut out = Cursor::new(vec![]);
        out.write_all(&[0xff; 3]).unwrap();
        let padded = pad_to(&mut out, 3, 8).unwrap();
        assert_eq!(padded, 5);
        assert_eq!(out.get_ref().len(), 8);

        let padded = pad_to(&mut out, 8, 8).unwrap();
        assert_eq!(padded, 0);
        assert_eq!(out.get_ref().len(), 8);
    }

    #[test]
    fn test_cursor_truncate() {
        let mut out = Cursor::new(vec![0u8; 16]);
        out.truncate(4).unwrap();
        assert_eq!(out.get_ref().len(), 4);
    }
}
