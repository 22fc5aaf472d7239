//! Types of supported compression algorithms

#[cfg(any(feature = "gzip", feature = "xz"))]
use std::io::Read;
#[cfg(any(feature = "gzip", feature = "xz"))]
use std::io::Cursor;

use deku::prelude::*;
#[cfg(feature = "gzip")]
use flate2::read::{ZlibDecoder, ZlibEncoder};
#[cfg(feature = "gzip")]
use flate2::Compression;
use tracing::instrument;
#[cfg(feature = "xz")]
use xz2::read::{XzDecoder, XzEncoder};
#[cfg(feature = "xz")]
use xz2::stream::{Check, Filters, LzmaOptions, Stream};

use crate::error::SqfsError;

/// Compressor id as stored in the superblock
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo =  3,
    #[default]
    Xz =   4,
    Lz4 =  5,
    Zstd = 6,
}

/// Compressor configuration used while building an image
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ImageCompressor {
    pub(crate) id: Compressor,
    pub(crate) options: Option<CompressionOptions>,
}

impl ImageCompressor {
    pub fn new(id: Compressor, options: Option<CompressionOptions>) -> Result<Self, SqfsError> {
        let valid = match id {
            Compressor::None | Compressor::Lzma => options.is_none(),
            Compressor::Gzip => {
                options.is_none() || matches!(options, Some(CompressionOptions::Gzip(_)))
            },
            Compressor::Lzo => {
                options.is_none() || matches!(options, Some(CompressionOptions::Lzo(_)))
            },
            Compressor::Xz => {
                options.is_none() || matches!(options, Some(CompressionOptions::Xz(_)))
            },
            Compressor::Lz4 => {
                options.is_none() || matches!(options, Some(CompressionOptions::Lz4(_)))
            },
            Compressor::Zstd => {
                options.is_none() || matches!(options, Some(CompressionOptions::Zstd(_)))
            },
        };

        if valid {
            Ok(Self { id, options })
        } else {
            Err(SqfsError::InvalidCompressionOption)
        }
    }

    pub fn id(&self) -> Compressor {
        self.id
    }
}

/// Compressor options stored in the image right after the superblock
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionOptions {
    Gzip(Gzip),
    Lzo(Lzo),
    Xz(Xz),
    Lz4(Lz4),
    Zstd(Zstd),
}

impl CompressionOptions {
    /// Parse the options payload for `compressor` from an uncompressed
    /// options metadata block
    pub(crate) fn from_bytes_for(
        bytes: &[u8],
        compressor: Compressor,
    ) -> Result<Self, SqfsError> {
        let options = match compressor {
            Compressor::Gzip => Self::Gzip(Gzip::from_bytes((bytes, 0))?.1),
            Compressor::Lzo => Self::Lzo(Lzo::from_bytes((bytes, 0))?.1),
            Compressor::Xz => Self::Xz(Xz::from_bytes((bytes, 0))?.1),
            Compressor::Lz4 => Self::Lz4(Lz4::from_bytes((bytes, 0))?.1),
            Compressor::Zstd => Self::Zstd(Zstd::from_bytes((bytes, 0))?.1),
            _ => return Err(SqfsError::InvalidCompressionOption),
        };
        Ok(options)
    }
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Gzip {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Lzo {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Xz {
    pub dictionary_size: u32,
    pub filters: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Lz4 {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "little")]
pub struct Zstd {
    pub compression_level: u32,
}

/// Using the current compressor from the superblock, decompress bytes
#[instrument(skip_all)]
pub(crate) fn decompress(
    bytes: &[u8],
    out: &mut Vec<u8>,
    compressor: Compressor,
) -> Result<(), SqfsError> {
    match compressor {
        // blocks in a no-op compressed image are stored verbatim
        Compressor::None => out.extend_from_slice(bytes),
        #[cfg(feature = "gzip")]
        Compressor::Gzip => {
            let mut decoder = ZlibDecoder::new(bytes);
            decoder.read_to_end(out)?;
        },
        #[cfg(feature = "xz")]
        Compressor::Xz => {
            let mut decoder = XzDecoder::new(bytes);
            decoder.read_to_end(out)?;
        },
        #[cfg(feature = "lzo")]
        Compressor::Lzo => {
            out.resize(out.capacity(), 0);
            let (out_size, error) = rust_lzo::LZOContext::decompress_to_slice(bytes, out);
            let out_size = out_size.len();
            out.truncate(out_size);
            if error != rust_lzo::LZOError::OK {
                return Err(SqfsError::CorruptedOrInvalidSquashfs);
            }
        },
        #[cfg(feature = "zstd")]
        Compressor::Zstd => {
            let mut decoder = zstd::bulk::Decompressor::new()?;
            decoder.decompress_to_buffer(bytes, out)?;
        },
        _ => return Err(SqfsError::UnsupportedCompression(compressor as u16)),
    }
    Ok(())
}

/// Compress `bytes` into a new buffer. Callers treat an output at least as
/// large as the input as the signal to store the data uncompressed.
#[instrument(skip_all)]
pub(crate) fn compress(
    bytes: &[u8],
    fc: ImageCompressor,
    block_size: u32,
) -> Result<Vec<u8>, SqfsError> {
    match (fc.id, fc.options) {
        // identity transform, the caller always falls back to storing raw
        (Compressor::None, None) => Ok(bytes.to_vec()),
        #[cfg(feature = "xz")]
        (Compressor::Xz, option @ (Some(CompressionOptions::Xz(_)) | None)) => {
            let dict_size = match option {
                None => block_size,
                Some(CompressionOptions::Xz(option)) => option.dictionary_size,
                Some(_) => unreachable!(),
            };
            let mut opts = LzmaOptions::new_preset(6)?;
            opts.dict_size(dict_size);

            let mut filters = Filters::new();
            filters.lzma2(&opts);

            let stream = Stream::new_stream_encoder(&filters, Check::Crc32)?;
            let mut encoder = XzEncoder::new_stream(Cursor::new(bytes), stream);
            let mut buf = vec![];
            encoder.read_to_end(&mut buf)?;
            Ok(buf)
        },
        #[cfg(feature = "gzip")]
        (Compressor::Gzip, option @ (Some(CompressionOptions::Gzip(_)) | None)) => {
            let compression_level = match option {
                None => Compression::best(),
                Some(CompressionOptions::Gzip(option)) => {
                    Compression::new(option.compression_level)
                },
                Some(_) => unreachable!(),
            };

            let mut encoder = ZlibEncoder::new(Cursor::new(bytes), compression_level);
            let mut buf = vec![];
            encoder.read_to_end(&mut buf)?;
            Ok(buf)
        },
        #[cfg(feature = "lzo")]
        (Compressor::Lzo, _) => {
            let mut lzo = rust_lzo::LZOContext::new();
            let mut buf = vec![0; rust_lzo::worst_compress(bytes.len())];
            let error = lzo.compress(bytes, &mut buf);
            if error != rust_lzo::LZOError::OK {
                return Err(SqfsError::CorruptedOrInvalidSquashfs);
            }
            Ok(buf)
        },
        #[cfg(feature = "zstd")]
        (Compressor::Zstd, option @ (Some(CompressionOptions::Zstd(_)) | None)) => {
            let compression_level = match option {
                None => 3,
                Some(CompressionOptions::Zstd(option)) => option.compression_level,
                Some(_) => unreachable!(),
            };
            let mut encoder = zstd::bulk::Compressor::new(compression_level as i32)?;
            Ok(encoder.compress(bytes)?)
        },
        _ => Err(SqfsError::UnsupportedCompression(fc.id as u16)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_identity() {
        let fc = ImageCompressor::new(Compressor::None, None).unwrap();
        let bytes = [0x5a_u8; 64];
        let cb = compress(&bytes, fc, 0x2000).unwrap();
        assert_eq!(cb, bytes);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_gzip_round_trip() {
        let fc = ImageCompressor::new(Compressor::Gzip, None).unwrap();
        let bytes = vec![0x5a_u8; 4096];
        let cb = compress(&bytes, fc, 0x2000).unwrap();
        assert!(cb.len() < bytes.len());

        let mut out = Vec::with_capacity(bytes.len());
        decompress(&cb, &mut out, Compressor::Gzip).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_rejects_mismatched_options() {
        let opts = CompressionOptions::Zstd(Zstd { compression_level: 3 });
        assert!(matches!(
            ImageCompressor::new(Compressor::Gzip, Some(opts)),
            Err(SqfsError::InvalidCompressionOption)
        ));
    }
}
