//! Index Node for files, directories and special files

use deku::prelude::*;

use crate::data::{DataSize, NO_FRAGMENT};
use crate::error::SqfsError;
use crate::file::ReadSeek;
use crate::metadata::MetadataReader;

/// No xattrs attached to this inode
pub const XATTR_NOT_SET: u32 = 0xffff_ffff;

/// Inode type tag as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[rustfmt::skip]
pub enum InodeId {
    BasicDirectory           = 1,
    BasicFile                = 2,
    BasicSymlink             = 3,
    BasicBlockDevice         = 4,
    BasicCharacterDevice     = 5,
    BasicNamedPipe           = 6,
    BasicSocket              = 7,
    ExtendedDirectory        = 8,
    ExtendedFile             = 9,
    ExtendedSymlink          = 10,
    ExtendedBlockDevice      = 11,
    ExtendedCharacterDevice  = 12,
    ExtendedNamedPipe        = 13,
    ExtendedSocket           = 14,
}

impl InodeId {
    pub(crate) fn from_u16(t: u16) -> Result<Self, SqfsError> {
        let id = match t {
            1 => Self::BasicDirectory,
            2 => Self::BasicFile,
            3 => Self::BasicSymlink,
            4 => Self::BasicBlockDevice,
            5 => Self::BasicCharacterDevice,
            6 => Self::BasicNamedPipe,
            7 => Self::BasicSocket,
            8 => Self::ExtendedDirectory,
            9 => Self::ExtendedFile,
            10 => Self::ExtendedSymlink,
            11 => Self::ExtendedBlockDevice,
            12 => Self::ExtendedCharacterDevice,
            13 => Self::ExtendedNamedPipe,
            14 => Self::ExtendedSocket,
            _ => return Err(SqfsError::UnsupportedInode(t)),
        };
        Ok(id)
    }

    pub fn is_dir(self) -> bool {
        matches!(self, Self::BasicDirectory | Self::ExtendedDirectory)
    }

    pub fn is_file(self) -> bool {
        matches!(self, Self::BasicFile | Self::ExtendedFile)
    }

    /// Basic type code, as used by directory entries even for extended inodes
    pub(crate) fn basic(self) -> Self {
        match self {
            Self::ExtendedDirectory => Self::BasicDirectory,
            Self::ExtendedFile => Self::BasicFile,
            Self::ExtendedSymlink => Self::BasicSymlink,
            Self::ExtendedBlockDevice => Self::BasicBlockDevice,
            Self::ExtendedCharacterDevice => Self::BasicCharacterDevice,
            Self::ExtendedNamedPipe => Self::BasicNamedPipe,
            Self::ExtendedSocket => Self::BasicSocket,
            basic => basic,
        }
    }
}

/// Fields shared by all inode types, directly after the 16-bit type tag
#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct InodeHeader {
    pub permissions: u16,
    /// Index into the id table
    pub uid: u16,
    /// Index into the id table
    pub gid: u16,
    pub mtime: u32,
    pub inode_number: u32,
}

pub(crate) const INODE_HEADER_SIZE: usize = 14;

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicDirectory {
    pub block_index: u32,
    pub link_count: u32,
    /// Listing length + 3, counting the implied "." and ".." entries
    pub file_size: u16,
    pub block_offset: u16,
    pub parent_inode: u32,
}

impl BasicDirectory {
    pub(crate) const SIZE: usize = 16;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedDirectory {
    pub link_count: u32,
    pub file_size: u32,
    pub block_index: u32,
    pub parent_inode: u32,
    pub index_count: u16,
    pub block_offset: u16,
    pub xattr_index: u32,
    #[deku(skip, default = "Vec::new()")]
    pub dir_index: Vec<DirectoryIndex>,
}

impl ExtendedDirectory {
    pub(crate) const SIZE: usize = 24;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct DirectoryIndex {
    pub index: u32,
    pub start: u32,
    /// Stored as `name.len() - 1`
    pub name_size: u32,
    #[deku(skip, default = "Vec::new()")]
    pub name: Vec<u8>,
}

impl DirectoryIndex {
    pub(crate) const SIZE: usize = 12;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicFile {
    pub blocks_start: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub file_size: u32,
    #[deku(skip, default = "Vec::new()")]
    pub block_sizes: Vec<DataSize>,
}

impl BasicFile {
    pub(crate) const SIZE: usize = 16;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedFile {
    pub blocks_start: u64,
    pub file_size: u64,
    pub sparse: u64,
    pub link_count: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub xattr_index: u32,
    #[deku(skip, default = "Vec::new()")]
    pub block_sizes: Vec<DataSize>,
}

impl ExtendedFile {
    pub(crate) const SIZE: usize = 40;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicSymlink {
    pub link_count: u32,
    pub target_size: u32,
    #[deku(skip, default = "Vec::new()")]
    pub target_path: Vec<u8>,
}

impl BasicSymlink {
    pub(crate) const SIZE: usize = 8;

    pub fn target(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.target_path)
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedSymlink {
    pub link_count: u32,
    pub target_size: u32,
    #[deku(skip, default = "Vec::new()")]
    pub target_path: Vec<u8>,
    /// Stored after the target bytes on disk
    #[deku(skip, default = "0")]
    pub xattr_index: u32,
}

impl ExtendedSymlink {
    pub(crate) const SIZE: usize = 8;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicDeviceSpecialFile {
    pub link_count: u32,
    /// Packed major/minor: `(major << 8) | (minor & 0xff) | ((minor & !0xff) << 12)`
    pub device_number: u32,
}

impl BasicDeviceSpecialFile {
    pub(crate) const SIZE: usize = 8;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
    pub xattr_index: u32,
}

impl ExtendedDeviceSpecialFile {
    pub(crate) const SIZE: usize = 12;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct BasicIpc {
    pub link_count: u32,
}

impl BasicIpc {
    pub(crate) const SIZE: usize = 4;
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ExtendedIpc {
    pub link_count: u32,
    pub xattr_index: u32,
}

impl ExtendedIpc {
    pub(crate) const SIZE: usize = 8;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub id: InodeId,
    pub header: InodeHeader,
    pub inner: InodeInner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeInner {
    BasicDirectory(BasicDirectory),
    BasicFile(BasicFile),
    BasicSymlink(BasicSymlink),
    BasicBlockDevice(BasicDeviceSpecialFile),
    BasicCharacterDevice(BasicDeviceSpecialFile),
    BasicNamedPipe(BasicIpc),
    BasicSocket(BasicIpc),
    ExtendedDirectory(ExtendedDirectory),
    ExtendedFile(ExtendedFile),
    ExtendedSymlink(ExtendedSymlink),
    ExtendedBlockDevice(ExtendedDeviceSpecialFile),
    ExtendedCharacterDevice(ExtendedDeviceSpecialFile),
    ExtendedNamedPipe(ExtendedIpc),
    ExtendedSocket(ExtendedIpc),
}

/// Directory payload location, common to both directory inode variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirGeometry {
    pub block_index: u32,
    pub block_offset: u16,
    pub file_size: u32,
    pub parent_inode: u32,
}

impl Inode {
    pub fn new(id: InodeId, header: InodeHeader, inner: InodeInner) -> Self {
        Self { id, header, inner }
    }

    pub fn inode_number(&self) -> u32 {
        self.header.inode_number
    }

    pub fn is_dir(&self) -> bool {
        self.id.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.id.is_file()
    }

    /// Payload size in bytes: file length, symlink target length, or the
    /// directory listing length
    pub fn file_size(&self) -> u64 {
        match &self.inner {
            InodeInner::BasicDirectory(d) => u64::from(d.file_size),
            InodeInner::ExtendedDirectory(d) => u64::from(d.file_size),
            InodeInner::BasicFile(f) => u64::from(f.file_size),
            InodeInner::ExtendedFile(f) => f.file_size,
            InodeInner::BasicSymlink(s) => u64::from(s.target_size),
            InodeInner::ExtendedSymlink(s) => u64::from(s.target_size),
            _ => 0,
        }
    }

    pub(crate) fn dir_geometry(&self) -> Option<DirGeometry> {
        match &self.inner {
            InodeInner::BasicDirectory(d) => Some(DirGeometry {
                block_index: d.block_index,
                block_offset: d.block_offset,
                file_size: u32::from(d.file_size),
                parent_inode: d.parent_inode,
            }),
            InodeInner::ExtendedDirectory(d) => Some(DirGeometry {
                block_index: d.block_index,
                block_offset: d.block_offset,
                file_size: d.file_size,
                parent_inode: d.parent_inode,
            }),
            _ => None,
        }
    }

    /// Decode one inode at the current cursor of the inode metadata stream
    pub(crate) fn read_meta<R: ReadSeek>(
        meta: &mut MetadataReader<'_, R>,
        block_size: u32,
        block_log: u16,
    ) -> Result<Self, SqfsError> {
        let mut tag = [0u8; 2];
        meta.read(&mut tag)?;
        let id = InodeId::from_u16(u16::from_le_bytes(tag))?;

        let mut buf = [0u8; INODE_HEADER_SIZE];
        meta.read(&mut buf)?;
        let (_, header) = InodeHeader::from_bytes((&buf, 0))?;

        let inner = match id {
            InodeId::BasicDirectory => {
                let mut buf = [0u8; BasicDirectory::SIZE];
                meta.read(&mut buf)?;
                InodeInner::BasicDirectory(BasicDirectory::from_bytes((&buf, 0))?.1)
            },
            InodeId::ExtendedDirectory => {
                let mut buf = [0u8; ExtendedDirectory::SIZE];
                meta.read(&mut buf)?;
                let mut dir = ExtendedDirectory::from_bytes((&buf, 0))?.1;
                for _ in 0..dir.index_count {
                    let mut buf = [0u8; DirectoryIndex::SIZE];
                    meta.read(&mut buf)?;
                    let mut index = DirectoryIndex::from_bytes((&buf, 0))?.1;
                    let mut name = vec![0u8; index.name_size as usize + 1];
                    meta.read(&mut name)?;
                    index.name = name;
                    dir.dir_index.push(index);
                }
                InodeInner::ExtendedDirectory(dir)
            },
            InodeId::BasicFile => {
                let mut buf = [0u8; BasicFile::SIZE];
                meta.read(&mut buf)?;
                let mut file = BasicFile::from_bytes((&buf, 0))?.1;
                let count =
                    block_count(block_size, block_log, file.frag_index, u64::from(file.file_size));
                file.block_sizes = read_block_sizes(meta, count)?;
                InodeInner::BasicFile(file)
            },
            InodeId::ExtendedFile => {
                let mut buf = [0u8; ExtendedFile::SIZE];
                meta.read(&mut buf)?;
                let mut file = ExtendedFile::from_bytes((&buf, 0))?.1;
                let count = block_count(block_size, block_log, file.frag_index, file.file_size);
                file.block_sizes = read_block_sizes(meta, count)?;
                InodeInner::ExtendedFile(file)
            },
            InodeId::BasicSymlink => {
                let mut buf = [0u8; BasicSymlink::SIZE];
                meta.read(&mut buf)?;
                let mut symlink = BasicSymlink::from_bytes((&buf, 0))?.1;
                let mut target = vec![0u8; symlink.target_size as usize];
                meta.read(&mut target)?;
                symlink.target_path = target;
                InodeInner::BasicSymlink(symlink)
            },
            InodeId::ExtendedSymlink => {
                let mut buf = [0u8; ExtendedSymlink::SIZE];
                meta.read(&mut buf)?;
                let mut symlink = ExtendedSymlink::from_bytes((&buf, 0))?.1;
                let mut target = vec![0u8; symlink.target_size as usize];
                meta.read(&mut target)?;
                symlink.target_path = target;
                let mut xattr = [0u8; 4];
                meta.read(&mut xattr)?;
                symlink.xattr_index = u32::from_le_bytes(xattr);
                InodeInner::ExtendedSymlink(symlink)
            },
            InodeId::BasicBlockDevice | InodeId::BasicCharacterDevice => {
                let mut buf = [0u8; BasicDeviceSpecialFile::SIZE];
                meta.read(&mut buf)?;
                let device = BasicDeviceSpecialFile::from_bytes((&buf, 0))?.1;
                if id == InodeId::BasicBlockDevice {
                    InodeInner::BasicBlockDevice(device)
                } else {
                    InodeInner::BasicCharacterDevice(device)
                }
            },
            InodeId::ExtendedBlockDevice | InodeId::ExtendedCharacterDevice => {
                let mut buf = [0u8; ExtendedDeviceSpecialFile::SIZE];
                meta.read(&mut buf)?;
                let device = ExtendedDeviceSpecialFile::from_bytes((&buf, 0))?.1;
                if id == InodeId::ExtendedBlockDevice {
                    InodeInner::ExtendedBlockDevice(device)
                } else {
                    InodeInner::ExtendedCharacterDevice(device)
                }
            },
            InodeId::BasicNamedPipe | InodeId::BasicSocket => {
                let mut buf = [0u8; BasicIpc::SIZE];
                meta.read(&mut buf)?;
                let ipc = BasicIpc::from_bytes((&buf, 0))?.1;
                if id == InodeId::BasicNamedPipe {
                    InodeInner::BasicNamedPipe(ipc)
                } else {
                    InodeInner::BasicSocket(ipc)
                }
            },
            InodeId::ExtendedNamedPipe | InodeId::ExtendedSocket => {
                let mut buf = [0u8; ExtendedIpc::SIZE];
                meta.read(&mut buf)?;
                let ipc = ExtendedIpc::from_bytes((&buf, 0))?.1;
                if id == InodeId::ExtendedNamedPipe {
                    InodeInner::ExtendedNamedPipe(ipc)
                } else {
                    InodeInner::ExtendedSocket(ipc)
                }
            },
        };

        Ok(Self { id, header, inner })
    }

    /// Serialize, including the variable tails the fixed-layout codec skips
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, SqfsError> {
        let mut v = vec![];
        v.extend_from_slice(&(self.id as u16).to_le_bytes());
        v.extend_from_slice(&self.header.to_bytes()?);

        match &self.inner {
            InodeInner::BasicDirectory(d) => v.extend_from_slice(&d.to_bytes()?),
            InodeInner::ExtendedDirectory(d) => {
                v.extend_from_slice(&d.to_bytes()?);
                for index in &d.dir_index {
                    v.extend_from_slice(&index.to_bytes()?);
                    v.extend_from_slice(&index.name);
                }
            },
            InodeInner::BasicFile(f) => {
                v.extend_from_slice(&f.to_bytes()?);
                for size in &f.block_sizes {
                    v.extend_from_slice(&size.raw().to_le_bytes());
                }
            },
            InodeInner::ExtendedFile(f) => {
                v.extend_from_slice(&f.to_bytes()?);
                for size in &f.block_sizes {
                    v.extend_from_slice(&size.raw().to_le_bytes());
                }
            },
            InodeInner::BasicSymlink(s) => {
                v.extend_from_slice(&s.to_bytes()?);
                v.extend_from_slice(&s.target_path);
            },
            InodeInner::ExtendedSymlink(s) => {
                v.extend_from_slice(&s.to_bytes()?);
                v.extend_from_slice(&s.target_path);
                v.extend_from_slice(&s.xattr_index.to_le_bytes());
            },
            InodeInner::BasicBlockDevice(d) | InodeInner::BasicCharacterDevice(d) => {
                v.extend_from_slice(&d.to_bytes()?)
            },
            InodeInner::ExtendedBlockDevice(d) | InodeInner::ExtendedCharacterDevice(d) => {
                v.extend_from_slice(&d.to_bytes()?)
            },
            InodeInner::BasicNamedPipe(i) | InodeInner::BasicSocket(i) => {
                v.extend_from_slice(&i.to_bytes()?)
            },
            InodeInner::ExtendedNamedPipe(i) | InodeInner::ExtendedSocket(i) => {
                v.extend_from_slice(&i.to_bytes()?)
            },
        }

        Ok(v)
    }
}

pub(crate) fn block_count(block_size: u32, block_log: u16, fragment: u32, file_size: u64) -> u64 {
    if fragment == NO_FRAGMENT {
        (file_size + u64::from(block_size) - 1) >> block_log
    } else {
        file_size >> block_log
    }
}

fn read_block_sizes<R: ReadSeek>(
    meta: &mut MetadataReader<'_, R>,
    count: u64,
) -> Result<Vec<DataSize>, SqfsError> {
    let mut sizes = Vec::new();
    for _ in 0..count {
        let mut buf = [0u8; 4];
        meta.read(&mut buf)?;
        sizes.push(DataSize::from_raw(u32::from_le_bytes(buf)));
    }
    Ok(sizes)
}
