//! Errors

use std::{io, string};

use thiserror::Error;

/// Errors generated from library
#[derive(Error, Debug)]
pub enum SqfsError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] string::FromUtf8Error),

    #[error("string error: {0:?}")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("unsupported compressor id: {0}")]
    UnsupportedCompression(u16),

    #[error("unsupported inode type: {0}")]
    UnsupportedInode(u16),

    #[error("inode was unexpected in this position")]
    UnexpectedInode,

    #[cfg(feature = "xz")]
    #[error("xz stream error: {0}")]
    XzStream(#[from] xz2::stream::Error),

    #[error("corrupted or invalid squashfs image")]
    CorruptedOrInvalidSquashfs,

    #[error("metadata read out of bounds")]
    MetadataOutOfBounds,

    #[error("invalid squashfs compression options")]
    InvalidCompressionOption,

    #[error("reader state machine used out of sequence")]
    Sequence,

    #[error("no such directory entry")]
    NoEntry,

    #[error("sparse file map is unordered or self overlapping")]
    UnorderedSparseMap,

    #[error("sparse file map spans beyond file size")]
    OversizeSparseMap,

    #[error("invalid file path in the squashfs image")]
    InvalidFilePath,

    #[error("file duplicated in squashfs image")]
    DuplicatedFileName,

    #[error("file not found")]
    FileNotFound,

    #[error("too many unique uid/gid values")]
    IdTableFull,
}

impl From<SqfsError> for io::Error {
    fn from(value: SqfsError) -> Self {
        use SqfsError::*;
        match value {
            StdIo(io) => io,
            Deku(e) => Self::new(io::ErrorKind::InvalidData, e),
            StringUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            StrUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            e @ (UnsupportedCompression(_) | UnsupportedInode(_)) => {
                Self::new(io::ErrorKind::Unsupported, e)
            },
            #[cfg(feature = "xz")]
            e @ XzStream(_) => Self::new(io::ErrorKind::Other, e),
            e @ (NoEntry | FileNotFound) => Self::new(io::ErrorKind::NotFound, e),
            e @ (UnorderedSparseMap | OversizeSparseMap) => {
                Self::new(io::ErrorKind::InvalidInput, e)
            },
            e @ (CorruptedOrInvalidSquashfs
            | MetadataOutOfBounds
            | InvalidCompressionOption
            | Sequence
            | UnexpectedInode
            | InvalidFilePath
            | DuplicatedFileName
            | IdTableFull) => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}
