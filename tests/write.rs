mod common;

use std::io::Cursor;

use common::{header, lookup, write_image, writer};
use sqfs::{DirReaderFlags, InodeInner, SparseMapEntry, SqfsError, DEFAULT_BLOCK_SIZE, MAGIC};
use test_log::test;

const NOT_SET: u64 = 0xffff_ffff_ffff_ffff;

#[test]
fn test_empty_root() {
    let mut fs = writer();
    let (superblock, image) = write_image(&mut fs);

    assert_eq!(superblock.magic, MAGIC);
    assert_eq!(superblock.inode_count, 1);
    assert_eq!(superblock.frag_table, NOT_SET);
    assert_eq!(superblock.frag_count, 0);
    assert!(superblock.bytes_used < 200);
    assert!(superblock.fragments_are_not_used());

    let root = image.root_inode().unwrap();
    assert!(root.is_dir());
    assert_eq!(root.inode_number(), 1);
    // a listing of only the implied dot entries
    assert_eq!(root.file_size(), 3);
}

#[test]
fn test_whole_file_dedup_shares_startblock() {
    let mut fs = writer();
    let payload = vec![0x5a_u8; 0x10_0000];
    fs.push_file(Cursor::new(payload.clone()), "a", header()).unwrap();
    fs.push_file(Cursor::new(payload), "b", header()).unwrap();

    let (superblock, image) = write_image(&mut fs);

    // only one copy of the data region: 8 stored blocks of the first file
    assert_eq!(superblock.inode_table, 96 + 0x10_0000);
    assert!(superblock.data_has_been_deduplicated());

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    let a = lookup(&mut dir, &root, "a");
    let b = lookup(&mut dir, &root, "b");

    let (InodeInner::BasicFile(a), InodeInner::BasicFile(b)) = (&a.inner, &b.inner) else {
        panic!("expected basic file inodes");
    };
    assert_eq!(a.blocks_start, 96);
    assert_eq!(b.blocks_start, a.blocks_start);
    assert_eq!(b.block_sizes, a.block_sizes);
    assert_eq!(b.block_sizes.len(), (0x10_0000 / DEFAULT_BLOCK_SIZE) as usize);
}

#[test]
fn test_sparse_file_emits_no_data() {
    let mut fs = writer();
    let zeros = vec![0u8; (DEFAULT_BLOCK_SIZE * 3) as usize];
    fs.push_file(Cursor::new(zeros.clone()), "zeros", header()).unwrap();

    let (superblock, image) = write_image(&mut fs);

    // no data bytes at all for this file
    assert_eq!(superblock.inode_table, 96);

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    let inode = lookup(&mut dir, &root, "zeros");

    let InodeInner::ExtendedFile(file) = &inode.inner else {
        panic!("sparse files need the extended inode");
    };
    assert_eq!(file.sparse, u64::from(DEFAULT_BLOCK_SIZE) * 3);
    assert_eq!(file.block_sizes.len(), 3);
    assert!(file.block_sizes.iter().all(|b| b.size() == 0));

    assert_eq!(image.read_file(&inode).unwrap(), zeros);
}

#[test]
fn test_identical_tails_share_a_fragment() {
    let mut fs = writer();
    fs.push_file(Cursor::new(b"hello".to_vec()), "x", header()).unwrap();
    fs.push_file(Cursor::new(b"hello".to_vec()), "y", header()).unwrap();

    let (superblock, image) = write_image(&mut fs);

    assert_eq!(superblock.frag_count, 1);
    assert_eq!(image.fragments.len(), 1);
    assert!(superblock.fragments_are_always_generated());

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    for name in ["x", "y"] {
        let inode = lookup(&mut dir, &root, name);
        let InodeInner::BasicFile(file) = &inode.inner else {
            panic!("expected a basic file inode");
        };
        assert_eq!(file.frag_index, 0);
        assert_eq!(file.block_offset, 0);
        assert!(file.block_sizes.is_empty());
        assert_eq!(image.read_file(&inode).unwrap(), b"hello");
    }
}

#[test]
fn test_sparse_map_rejections() {
    let overlapping = vec![
        SparseMapEntry { offset: 10, count: 5 },
        SparseMapEntry { offset: 12, count: 5 },
    ];
    let mut fs = writer();
    fs.push_file_sparse(Cursor::new(vec![]), 64, overlapping, "bad", header()).unwrap();
    let mut image = Cursor::new(vec![]);
    assert!(matches!(
        fs.write(&mut image),
        Err(SqfsError::UnorderedSparseMap)
    ));

    let unordered = vec![
        SparseMapEntry { offset: 3, count: 2 },
        SparseMapEntry { offset: 0, count: 2 },
    ];
    let mut fs = writer();
    fs.push_file_sparse(Cursor::new(vec![]), 64, unordered, "bad", header()).unwrap();
    let mut image = Cursor::new(vec![]);
    assert!(matches!(
        fs.write(&mut image),
        Err(SqfsError::UnorderedSparseMap)
    ));

    let oversize = vec![SparseMapEntry { offset: 60, count: 10 }];
    let mut fs = writer();
    fs.push_file_sparse(Cursor::new(vec![]), 64, oversize, "bad", header()).unwrap();
    let mut image = Cursor::new(vec![]);
    assert!(matches!(
        fs.write(&mut image),
        Err(SqfsError::OversizeSparseMap)
    ));
}

#[test]
fn test_sparse_map_round_trip() {
    let mut fs = writer();
    let map = vec![
        SparseMapEntry { offset: 100, count: 4 },
        SparseMapEntry { offset: 0x2_0000, count: 2 },
    ];
    let real = vec![0xaa, 0xbb, 0xcc, 0xdd, 0x11, 0x22];
    fs.push_file_sparse(Cursor::new(real), 0x2_0000 + 50, map, "holes", header()).unwrap();

    let (_, image) = write_image(&mut fs);
    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    let inode = lookup(&mut dir, &root, "holes");

    let mut expected = vec![0u8; 0x2_0000 + 50];
    expected[100..104].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
    expected[0x2_0000..0x2_0000 + 2].copy_from_slice(&[0x11, 0x22]);
    assert_eq!(image.read_file(&inode).unwrap(), expected);
}

#[test]
fn test_export_table() {
    let mut fs = writer();
    fs.set_exportable(true);
    fs.push_dir("d", header()).unwrap();
    fs.push_file(Cursor::new(b"abc".to_vec()), "d/f", header()).unwrap();

    let (superblock, image) = write_image(&mut fs);

    assert!(superblock.nfs_export_table_exists());
    assert_ne!(superblock.export_table, NOT_SET);

    let export = image.export.as_ref().unwrap();
    assert_eq!(export.len(), 3);
    // the root is inode 1, and its exported reference is the superblock's
    assert_eq!(export[0], superblock.root_inode);
}

#[test]
fn test_unknown_compressor_rejected() {
    let mut fs = writer();
    let mut image = Cursor::new(vec![]);
    fs.write(&mut image).unwrap();

    // compressor id lives at offset 20 of the superblock
    image.get_mut()[20] = 0xab;
    assert!(matches!(
        sqfs::ImageReader::from_reader(image),
        Err(SqfsError::UnsupportedCompression(0xab))
    ));
}

#[test]
fn test_bytes_used_matches_image_len() {
    let mut fs = writer();
    fs.push_file(Cursor::new(vec![7u8; 1000]), "f", header()).unwrap();

    let mut image = Cursor::new(vec![]);
    let (superblock, written) = fs.write(&mut image).unwrap();
    assert_eq!(superblock.bytes_used, image.get_ref().len() as u64);
    assert_eq!(written, image.get_ref().len() as u64);
}

#[test]
fn test_padding_rounds_up_image() {
    let mut fs = writer();
    fs.set_kib_padding(4);
    fs.push_file(Cursor::new(vec![7u8; 1000]), "f", header()).unwrap();

    let mut image = Cursor::new(vec![]);
    let (superblock, written) = fs.write(&mut image).unwrap();
    assert_eq!(written % 4096, 0);
    assert_eq!(written, image.get_ref().len() as u64);
    assert!(superblock.bytes_used <= written);
}

#[test]
fn test_metadata_preserved() {
    let mut fs = writer();
    fs.set_time(0x1111_2222);
    fs.push_file(Cursor::new(b"data".to_vec()), "f", header()).unwrap();

    let (superblock, image) = write_image(&mut fs);
    assert_eq!(superblock.mod_time, 0x1111_2222);

    let mut dir = image.dir_reader(DirReaderFlags::empty());
    let root = dir.get_root_inode().unwrap();
    let inode = lookup(&mut dir, &root, "f");
    assert_eq!(inode.header.permissions, 0o755);
    assert_eq!(inode.header.mtime, 0x634f_5237);
    assert_eq!(image.id_of(inode.header.uid).unwrap(), 1000);
    assert_eq!(image.id_of(inode.header.gid).unwrap(), 1000);
}
