#![forbid(unsafe_code)]
//! End-to-end build scenarios, each image read back with the reader
//! pipeline and checked against what went in.

use sqsh_harness::{default_config, dir_spec, random_bytes, Workbench, TEST_BLOCK_SIZE};
use sqsh_pack::parse_pack_file;
use sqsh_reader::InodeData;
use sqsh_types::{FLAG_EXPORTABLE, FLAG_NO_XATTRS, S_IFDIR};

/// An image built from nothing but `dir / 0755 0 0`.
#[test]
fn empty_root_image() {
    let mut bench = Workbench::new();
    let pack_root = bench.dir().to_path_buf();
    parse_pack_file("dir / 0755 0 0\n", &pack_root, &mut bench.tree).unwrap();
    let (image, summary) = bench.build().unwrap();

    let superblock = image.superblock();
    assert_eq!(superblock.inode_count, 1);
    assert_eq!(superblock.fragment_count, 0);
    assert_ne!(superblock.flags & FLAG_NO_XATTRS, 0);
    assert_eq!(image.ids(), &[0]);

    let root = image.root().unwrap();
    assert_eq!(root.inode_number, 1);
    assert_eq!(root.mode, S_IFDIR | 0o755);
    assert!(image.read_directory(&root).unwrap().is_empty());
    assert_eq!(summary.stats.blocks_written, 0);
}

/// A ten-byte file lands in a fragment, not a data block.
#[test]
fn single_small_file() {
    let mut bench = Workbench::new();
    bench.add_file("/a", b"helloworld").unwrap();
    let (image, summary) = bench.build().unwrap();

    assert_eq!(image.superblock().fragment_count, 1);
    assert_eq!(summary.stats.blocks_written, 1, "one fragment block");

    let inode = image.lookup("/a").unwrap().expect("/a exists");
    let InodeData::File {
        frag_index,
        frag_offset,
        size,
        ref block_sizes,
        ..
    } = inode.data
    else {
        panic!("expected a file inode");
    };
    assert_eq!((frag_index, frag_offset, size), (0, 0, 10));
    assert!(block_sizes.is_empty());
    assert_eq!(image.read_file(&inode).unwrap(), b"helloworld");
}

/// A file of exactly one block size: one data block, no fragment.
#[test]
fn exact_block_file() {
    let content = random_bytes(TEST_BLOCK_SIZE as usize, 0x5333);
    let mut bench = Workbench::new();
    bench.add_file("/b", &content).unwrap();
    let (image, _) = bench.build().unwrap();

    assert_eq!(image.superblock().fragment_count, 0);
    let inode = image.lookup("/b").unwrap().expect("/b exists");
    let InodeData::File {
        size,
        ref block_sizes,
        frag_index,
        ..
    } = inode.data
    else {
        panic!("expected a file inode");
    };
    assert_eq!(size, u64::from(TEST_BLOCK_SIZE));
    assert_eq!(block_sizes.len(), 1);
    assert_eq!(frag_index, sqsh_types::FRAGMENT_ABSENT);
    assert_eq!(image.read_file(&inode).unwrap(), content);
}

/// Two identical files share their data blocks and their tail.
#[test]
fn two_identical_files() {
    let content = random_bytes(200_000, 0x5344);
    let mut bench = Workbench::new();
    bench.add_file("/x", &content).unwrap();
    bench.add_file("/y", &content).unwrap();
    let (image, summary) = bench.build().unwrap();

    let x = image.lookup("/x").unwrap().expect("/x");
    let y = image.lookup("/y").unwrap().expect("/y");
    let InodeData::File {
        start_block: x_start,
        frag_index: x_frag,
        frag_offset: x_frag_off,
        ..
    } = x.data
    else {
        panic!("expected a file");
    };
    let InodeData::File {
        start_block: y_start,
        frag_index: y_frag,
        frag_offset: y_frag_off,
        ..
    } = y.data
    else {
        panic!("expected a file");
    };

    assert_eq!(x_start, y_start, "full blocks shared");
    assert_eq!((x_frag, x_frag_off), (y_frag, y_frag_off), "tail shared");
    assert_eq!(summary.stats.blocks_deduped, 1);
    assert_eq!(summary.stats.tails_deduped, 1);
    // One data block plus one fragment block on disk.
    assert_eq!(summary.stats.blocks_written, 2);

    assert_eq!(image.read_file(&x).unwrap(), content);
    assert_eq!(image.read_file(&y).unwrap(), content);
}

/// A 1 MiB file whose middle block is all zeroes: the zero block is marked
/// sparse, stored nowhere, and reconstructed on read.
#[test]
fn sparse_file() {
    let bs = TEST_BLOCK_SIZE as usize;
    let mut content = random_bytes(8 * bs, 0x5355);
    content[4 * bs..5 * bs].fill(0);

    let mut bench = Workbench::new();
    bench.add_file("/sparse", &content).unwrap();
    let (image, summary) = bench.build().unwrap();

    assert_eq!(summary.stats.sparse_blocks, 1);
    let inode = image.lookup("/sparse").unwrap().expect("/sparse");
    let InodeData::File { ref block_sizes, .. } = inode.data else {
        panic!("expected a file");
    };
    assert_eq!(block_sizes.len(), 8);
    assert_eq!(block_sizes[4], 0, "middle block is sparse");
    for (i, &size) in block_sizes.iter().enumerate() {
        if i != 4 {
            assert_ne!(size, 0, "block {i} is data");
        }
    }
    assert_eq!(image.read_file(&inode).unwrap(), content);
}

/// 300 children force the listing across multiple directory headers.
#[test]
fn large_directory() {
    let mut bench = Workbench::new();
    bench.add_node("/d", dir_spec(0o755, 0, 0)).unwrap();
    for i in 0..300 {
        bench
            .add_file(&format!("/d/entry{i:04}"), format!("#{i}").as_bytes())
            .unwrap();
    }
    let (image, _) = bench.build().unwrap();

    let d = image.lookup("/d").unwrap().expect("/d");
    let entries = image.read_directory(&d).unwrap();
    assert_eq!(entries.len(), 300);

    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted, "entries enumerate in sorted order");

    // Every entry's reference resolves to an inode with the recorded number.
    for entry in &entries {
        let inode = image.inode_at(entry.inode_ref).unwrap();
        assert_eq!(inode.inode_number, entry.inode_number);
    }
}

/// The export table maps every inode number to the inode that claims it.
#[test]
fn exportable_image() {
    let mut bench = Workbench::new();
    bench.add_file("/f1", b"one").unwrap();
    bench.add_file("/f2", b"two").unwrap();
    let mut config = default_config();
    config.exportable = true;
    let (image, _) = bench.build_with(config).unwrap();

    assert_ne!(image.superblock().flags & FLAG_EXPORTABLE, 0);
    let refs = image.export_refs().unwrap().expect("export table present");
    assert_eq!(refs.len(), image.superblock().inode_count as usize);
    for (i, reference) in refs.iter().enumerate() {
        let inode = image.inode_at(*reference).unwrap();
        assert_eq!(inode.inode_number as usize, i + 1);
    }
}
