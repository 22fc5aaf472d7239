use std::io::Cursor;

use sqfs::{
    Compressor, DirOpenFlags, DirReader, DirReaderFlags, ImageCompressor, ImageReader,
    ImageWriter, Inode, NodeHeader, SuperBlock,
};

pub fn header() -> NodeHeader {
    NodeHeader {
        permissions: 0o755,
        uid: 1000,
        gid: 1000,
        mtime: 0x634f_5237,
    }
}

/// Writer configured for deterministic store-raw images
pub fn writer() -> ImageWriter<'static> {
    let mut fs = ImageWriter::default();
    fs.set_compressor(ImageCompressor::new(Compressor::None, None).unwrap());
    fs.set_no_padding();
    fs
}

pub fn write_image(fs: &mut ImageWriter) -> (SuperBlock, ImageReader<Cursor<Vec<u8>>>) {
    let mut image = Cursor::new(vec![]);
    let (superblock, _) = fs.write(&mut image).unwrap();
    (superblock, ImageReader::from_reader(image).unwrap())
}

/// Inode of `name` inside the directory behind `dir_inode`
pub fn lookup<R: sqfs::ReadSeek>(
    dir: &mut DirReader<'_, R>,
    dir_inode: &Inode,
    name: &str,
) -> Inode {
    dir.open(dir_inode, DirOpenFlags::empty()).unwrap();
    dir.find(name).unwrap();
    dir.get_inode().unwrap()
}

/// All entry names of the directory behind `inode`, in read order
pub fn names<R: sqfs::ReadSeek>(
    image: &ImageReader<R>,
    inode: &Inode,
    flags: DirReaderFlags,
    open_flags: DirOpenFlags,
) -> Vec<String> {
    let mut dir = image.dir_reader(flags);
    if flags.contains(DirReaderFlags::DOT_ENTRIES) {
        // seed the dcache so the synthetic entries can resolve
        let root = dir.get_root_inode().unwrap();
        if root.inode_number() != inode.inode_number() {
            panic!("dot-entry listings of non-root dirs need a primed dcache");
        }
    }
    dir.open(inode, open_flags).unwrap();

    let mut names = vec![];
    while let Some(entry) = dir.read().unwrap() {
        names.push(entry.name().into_owned());
    }
    names
}
