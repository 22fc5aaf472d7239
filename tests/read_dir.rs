mod common;

use std::io::Cursor;

use common::{header, names, write_image, writer};
use sqfs::{DirOpenFlags, DirReaderFlags, InodeId, SqfsError};
use test_log::test;

fn three_children() -> sqfs::ImageWriter<'static> {
    let mut fs = writer();
    fs.push_file(Cursor::new(b"A".to_vec()), "a", header()).unwrap();
    fs.push_dir("b", header()).unwrap();
    fs.push_symlink("a", "c", header()).unwrap();
    fs
}

#[test]
fn test_cursor_with_dot_entries() {
    let mut fs = three_children();
    let (_, image) = write_image(&mut fs);
    let root = image.root_inode().unwrap();

    let listed = names(&image, &root, DirReaderFlags::DOT_ENTRIES, DirOpenFlags::empty());
    assert_eq!(listed, [".", "..", "a", "b", "c"]);

    // per-open override drops the synthetic entries
    let listed = names(
        &image,
        &root,
        DirReaderFlags::DOT_ENTRIES,
        DirOpenFlags::NO_DOT_ENTRIES,
    );
    assert_eq!(listed, ["a", "b", "c"]);
}

#[test]
fn test_cursor_without_dot_entries() {
    let mut fs = three_children();
    let (_, image) = write_image(&mut fs);
    let root = image.root_inode().unwrap();

    let listed = names(&image, &root, DirReaderFlags::empty(), DirOpenFlags::empty());
    assert_eq!(listed, ["a", "b", "c"]);
}

#[test]
fn test_entry_types_match_inodes() {
    let mut fs = three_children();
    let (_, image) = write_image(&mut fs);

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    dir.open(&root, DirOpenFlags::empty()).unwrap();

    let mut seen = vec![];
    while let Some(entry) = dir.read().unwrap() {
        let inode = dir.get_inode().unwrap();
        assert_eq!(inode.id, entry.entry_type);
        assert_eq!(inode.inode_number(), entry.inode_number);
        seen.push(entry.entry_type);
    }
    assert_eq!(
        seen,
        [InodeId::BasicFile, InodeId::BasicDirectory, InodeId::BasicSymlink]
    );
}

#[test]
fn test_rewind_repeats_sequence() {
    let mut fs = three_children();
    let (_, image) = write_image(&mut fs);

    let mut dir = image.dir_reader(DirReaderFlags::DOT_ENTRIES);
    let root = dir.get_root_inode().unwrap();
    dir.open(&root, DirOpenFlags::empty()).unwrap();

    let mut first = vec![];
    while let Some(entry) = dir.read().unwrap() {
        first.push(entry.name().into_owned());
    }

    dir.rewind().unwrap();
    let mut second = vec![];
    while let Some(entry) = dir.read().unwrap() {
        second.push(entry.name().into_owned());
    }

    assert_eq!(first, second);
    assert_eq!(first, [".", "..", "a", "b", "c"]);
}

#[test]
fn test_find_agrees_with_scan() {
    let mut fs = three_children();
    let (_, image) = write_image(&mut fs);

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    dir.open(&root, DirOpenFlags::empty()).unwrap();

    // sequential scan to "b"
    let scanned = loop {
        let entry = dir.read().unwrap().expect("directory ended early");
        if entry.name_bytes() == b"b" {
            break dir.get_inode().unwrap();
        }
    };

    let found_entry = dir.find("b").unwrap();
    let found = dir.get_inode().unwrap();
    assert_eq!(found_entry.inode_number, scanned.inode_number());
    assert_eq!(found, scanned);

    assert!(matches!(dir.find("nope"), Err(SqfsError::NoEntry)));
    // cursor is still usable after an exhausted search
    dir.rewind().unwrap();
    assert!(dir.read().unwrap().is_some());
}

#[test]
fn test_dot_dot_resolves_parent() {
    let mut fs = writer();
    fs.push_dir("sub", header()).unwrap();
    fs.push_file(Cursor::new(b"x".to_vec()), "sub/f", header()).unwrap();
    let (_, image) = write_image(&mut fs);

    let mut dir = image.dir_reader(DirReaderFlags::DOT_ENTRIES);
    let root = dir.get_root_inode().unwrap();

    dir.open(&root, DirOpenFlags::empty()).unwrap();
    let dot = dir.read().unwrap().unwrap();
    assert_eq!(dot.name_bytes(), b".");
    assert_eq!(dir.get_inode().unwrap().inode_number(), root.inode_number());
    let dotdot = dir.read().unwrap().unwrap();
    assert_eq!(dotdot.name_bytes(), b"..");
    // the root is its own parent
    assert_eq!(dir.get_inode().unwrap().inode_number(), root.inode_number());

    // descend into `sub`; get_inode cached its reference for ".." resolution
    dir.find("sub").unwrap();
    let sub = dir.get_inode().unwrap();
    dir.open(&sub, DirOpenFlags::empty()).unwrap();

    dir.read().unwrap().unwrap();
    assert_eq!(dir.get_inode().unwrap().inode_number(), sub.inode_number());
    dir.read().unwrap().unwrap();
    assert_eq!(dir.get_inode().unwrap().inode_number(), root.inode_number());

    let f = dir.read().unwrap().unwrap();
    assert_eq!(f.name_bytes(), b"f");
}

#[test]
fn test_dcache_miss_is_no_entry() {
    let mut fs = writer();
    fs.push_dir("sub", header()).unwrap();
    let (_, image) = write_image(&mut fs);

    // resolve `sub` through one cursor
    let mut first = image.dir_reader(DirReaderFlags::DOT_ENTRIES);
    let root = first.get_root_inode().unwrap();
    first.open(&root, DirOpenFlags::empty()).unwrap();
    first.find("sub").unwrap();
    let sub = first.get_inode().unwrap();

    // a fresh cursor never saw `sub`, so its dot entries cannot resolve
    let mut second = image.dir_reader(DirReaderFlags::DOT_ENTRIES);
    second.get_root_inode().unwrap();
    assert!(matches!(
        second.open(&sub, DirOpenFlags::empty()),
        Err(SqfsError::NoEntry)
    ));

    // without the synthetic entries the open is fine
    second.open(&sub, DirOpenFlags::NO_DOT_ENTRIES).unwrap();
    assert!(second.read().unwrap().is_none());
}

#[test]
fn test_read_before_open_is_sequence_error() {
    let mut fs = three_children();
    let (_, image) = write_image(&mut fs);

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    assert!(matches!(dir.read(), Err(SqfsError::Sequence)));
    assert!(matches!(dir.rewind(), Err(SqfsError::Sequence)));
    assert!(matches!(dir.get_inode(), Err(SqfsError::Sequence)));
}

#[test]
fn test_cloned_cursor_is_independent() {
    let mut fs = three_children();
    let (_, image) = write_image(&mut fs);

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    dir.open(&root, DirOpenFlags::empty()).unwrap();
    assert_eq!(dir.read().unwrap().unwrap().name_bytes(), b"a");

    let mut cloned = dir.clone();
    // advancing the original does not move the clone
    assert_eq!(dir.read().unwrap().unwrap().name_bytes(), b"b");
    assert_eq!(cloned.read().unwrap().unwrap().name_bytes(), b"b");
    assert_eq!(dir.read().unwrap().unwrap().name_bytes(), b"c");
    assert_eq!(cloned.read().unwrap().unwrap().name_bytes(), b"c");
}

#[test]
fn test_open_non_dir_fails() {
    let mut fs = three_children();
    let (_, image) = write_image(&mut fs);

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    dir.open(&root, DirOpenFlags::empty()).unwrap();
    dir.find("a").unwrap();
    let file = dir.get_inode().unwrap();

    assert!(matches!(
        dir.open(&file, DirOpenFlags::empty()),
        Err(SqfsError::UnexpectedInode)
    ));
}
