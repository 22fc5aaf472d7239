#![doc = include_str!("../README.md")]

pub mod compressor;
mod data;
mod dir;
mod dir_reader;
mod entry;
pub mod error;
mod file;
pub mod filesystem;
mod fragment;
mod id;
mod inode;
mod metadata;
mod superblock;
mod table;

pub use crate::compressor::{CompressionOptions, Compressor, ImageCompressor};
pub use crate::data::{DataFlags, DataSize, SparseMapEntry};
pub use crate::dir::DirEntry;
pub use crate::dir_reader::{DirOpenFlags, DirReader, DirReaderFlags};
pub use crate::error::SqfsError;
pub use crate::file::{BackingFile, ReadSeek};
pub use crate::filesystem::{FileReader, ImageReader, ImageWriter, NodeHeader};
pub use crate::fragment::Fragment;
pub use crate::id::Id;
pub use crate::inode::{
    BasicDeviceSpecialFile, BasicDirectory, BasicFile, BasicIpc, BasicSymlink, DirectoryIndex,
    ExtendedDeviceSpecialFile, ExtendedDirectory, ExtendedFile, ExtendedIpc, ExtendedSymlink,
    Inode, InodeHeader, InodeId, InodeInner, XATTR_NOT_SET,
};
pub use crate::metadata::InodeRef;
pub use crate::superblock::{SuperBlock, MAGIC};

/// Default data block size
pub const DEFAULT_BLOCK_SIZE: u32 = 0x20000;

/// Log2 of [`DEFAULT_BLOCK_SIZE`]
pub const DEFAULT_BLOCK_LOG: u16 = 0x11;

/// Smallest valid data block size
pub const MIN_BLOCK_SIZE: u32 = 0x1000;

/// Largest valid data block size
pub const MAX_BLOCK_SIZE: u32 = 0x10_0000;

/// Default padding granularity applied to the end of a finished image
pub const DEFAULT_PAD_LEN: u32 = 4096;
