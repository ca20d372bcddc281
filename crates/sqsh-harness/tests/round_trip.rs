#![forbid(unsafe_code)]
//! Whole-image properties: round-trip fidelity, determinism across runs
//! and worker counts, codec coverage, and generated-tree round trips.

use proptest::prelude::*;
use sqsh_harness::{config_with, default_config, dir_spec, random_bytes, Workbench};
use sqsh_reader::InodeData;
use sqsh_tree::{NodeData, NodeSpec};
use sqsh_types::{
    pack_devno, CompressorId, FLAG_COMPRESSOR_OPTIONS, S_IFBLK, S_IFCHR, S_IFIFO, S_IFLNK,
    S_IFREG, S_IFSOCK,
};

fn special_spec(permissions: u16, uid: u32, gid: u32, mtime: u32, data: NodeData) -> NodeSpec {
    NodeSpec {
        permissions,
        uid,
        gid,
        mtime,
        xattrs: Vec::new(),
        data,
    }
}

/// Build a tree exercising every node type, then verify the reader sees
/// identical names, modes, ids, timestamps, targets, device numbers and
/// contents.
#[test]
fn mixed_tree_round_trip() {
    let mut bench = Workbench::new();
    bench.add_node("/dev", dir_spec(0o755, 0, 0)).unwrap();
    bench.add_node("/etc", dir_spec(0o750, 0, 42)).unwrap();
    bench
        .add_file_with(
            "/etc/passwd",
            b"root:x:0:0:root:/root:/bin/sh\n",
            0o600,
            0,
            0,
            vec![("security.selinux".to_owned(), b"etc_t".to_vec())],
        )
        .unwrap();
    bench
        .add_file_with("/data.bin", &random_bytes(300_000, 1), 0o644, 1000, 100, Vec::new())
        .unwrap();
    bench
        .add_node(
            "/dev/console",
            special_spec(
                0o600,
                0,
                5,
                777,
                NodeData::CharDev {
                    devno: pack_devno(5, 1),
                },
            ),
        )
        .unwrap();
    bench
        .add_node(
            "/dev/sda",
            special_spec(
                0o660,
                0,
                6,
                0,
                NodeData::BlockDev {
                    devno: pack_devno(8, 0),
                },
            ),
        )
        .unwrap();
    bench
        .add_node(
            "/init",
            special_spec(
                0o777,
                0,
                0,
                0,
                NodeData::Symlink {
                    target: "/sbin/init".to_owned(),
                },
            ),
        )
        .unwrap();
    bench
        .add_node("/run/queue", special_spec(0o600, 1, 1, 0, NodeData::Fifo))
        .unwrap();
    bench
        .add_node("/run/ctl", special_spec(0o600, 1, 1, 0, NodeData::Socket))
        .unwrap();

    let (image, _) = bench.build().unwrap();
    let nodes = image.walk().unwrap();
    assert_eq!(nodes.len(), image.superblock().inode_count as usize);

    let passwd = &nodes["/etc/passwd"];
    assert_eq!(passwd.mode, S_IFREG | 0o600);
    assert_eq!(
        image.read_file(passwd).unwrap(),
        b"root:x:0:0:root:/root:/bin/sh\n"
    );
    assert_eq!(
        image.read_xattrs(passwd).unwrap(),
        vec![("security.selinux".to_owned(), b"etc_t".to_vec())]
    );

    let data = &nodes["/data.bin"];
    assert_eq!((data.uid, data.gid), (1000, 100));
    assert_eq!(image.read_file(data).unwrap(), random_bytes(300_000, 1));

    let console = &nodes["/dev/console"];
    assert_eq!(console.mode, S_IFCHR | 0o600);
    assert_eq!(console.mtime, 777);
    assert_eq!(console.gid, 5);
    let InodeData::Dev { devno } = console.data else {
        panic!("expected a device inode");
    };
    assert_eq!(devno, pack_devno(5, 1));

    let sda = &nodes["/dev/sda"];
    assert_eq!(sda.mode, S_IFBLK | 0o660);

    let init = &nodes["/init"];
    assert_eq!(init.mode, S_IFLNK | 0o777);
    let InodeData::Symlink { ref target } = init.data else {
        panic!("expected a symlink inode");
    };
    assert_eq!(target, "/sbin/init");

    assert_eq!(nodes["/run/queue"].mode, S_IFIFO | 0o600);
    assert_eq!(nodes["/run/ctl"].mode, S_IFSOCK | 0o600);

    let etc = &nodes["/etc"];
    assert_eq!(etc.gid, 42);
    assert_eq!(etc.nlink, 3, "dir links itself, parent and one child");
}

/// Identical input, fixed settings: the image is byte-for-byte identical
/// across runs and across worker counts.
#[test]
fn deterministic_output() {
    let mut bench = Workbench::new();
    bench.add_node("/d", dir_spec(0o755, 0, 0)).unwrap();
    bench.add_file("/d/big", &random_bytes(500_000, 2)).unwrap();
    bench.add_file("/d/small", b"tail only").unwrap();
    bench
        .add_node(
            "/d/link",
            special_spec(
                0o777,
                0,
                0,
                0,
                NodeData::Symlink {
                    target: "big".to_owned(),
                },
            ),
        )
        .unwrap();

    let (first, _) = bench.build_to_path(&default_config(), "one.sqsh").unwrap();
    let (second, _) = bench.build_to_path(&default_config(), "two.sqsh").unwrap();
    let mut wide = default_config();
    wide.num_jobs = 1;
    wide.backlog = 3;
    let (third, _) = bench.build_to_path(&wide, "three.sqsh").unwrap();

    let one = std::fs::read(first).unwrap();
    let two = std::fs::read(second).unwrap();
    let three = std::fs::read(third).unwrap();
    assert_eq!(one, two, "same settings, same bytes");
    assert_eq!(one, three, "worker count must not affect the image");
}

/// Every supported codec round-trips the same tree.
#[test]
fn all_codecs_round_trip() {
    for id in [
        CompressorId::Gzip,
        CompressorId::Lzma,
        CompressorId::Xz,
        CompressorId::Zstd,
    ] {
        let mut bench = Workbench::new();
        let content = random_bytes(250_000, 3);
        bench.add_file("/payload", &content).unwrap();
        let (image, _) = bench
            .build_with(config_with(id, sqsh_harness::TEST_BLOCK_SIZE))
            .unwrap();
        assert_eq!(image.superblock().compression_id, id, "{id}");
        let inode = image.lookup("/payload").unwrap().expect("payload");
        assert_eq!(image.read_file(&inode).unwrap(), content, "{id}");
    }
}

/// Non-default codec parameters serialize an options block the reader
/// validates on open.
#[test]
fn compressor_options_block_round_trips() {
    let mut bench = Workbench::new();
    bench.add_file("/f", b"options test").unwrap();
    let mut config = config_with(CompressorId::Gzip, sqsh_harness::TEST_BLOCK_SIZE);
    config.compressor.apply_extra("level=1").unwrap();
    let (image, _) = bench.build_with(config).unwrap();

    assert_ne!(image.superblock().flags & FLAG_COMPRESSOR_OPTIONS, 0);
    let inode = image.lookup("/f").unwrap().expect("/f");
    assert_eq!(image.read_file(&inode).unwrap(), b"options test");
}

/// The root reference recorded in the super block points at the root
/// inode's bytes (the meta-cursor consistency property, observed from
/// outside).
#[test]
fn root_reference_is_consistent() {
    let mut bench = Workbench::new();
    bench.add_file("/a", b"x").unwrap();
    bench.add_file("/b", b"y").unwrap();
    let (image, _) = bench.build().unwrap();

    let root = image.root().unwrap();
    assert!(root.is_dir());
    assert_eq!(root.inode_number, image.superblock().inode_count);
    let entries = image.read_directory(&root).unwrap();
    assert_eq!(entries.len(), 2);
}

/// Identical xattr sets on different nodes share one descriptor.
#[test]
fn shared_xattr_sets_round_trip() {
    let label = vec![("security.selinux".to_owned(), b"bin_t".to_vec())];
    let mut bench = Workbench::new();
    bench
        .add_file_with("/bin1", b"a", 0o755, 0, 0, label.clone())
        .unwrap();
    bench
        .add_file_with("/bin2", b"b", 0o755, 0, 0, label.clone())
        .unwrap();
    let (image, _) = bench.build().unwrap();

    let one = image.lookup("/bin1").unwrap().expect("/bin1");
    let two = image.lookup("/bin2").unwrap().expect("/bin2");
    assert_eq!(one.xattr_index, two.xattr_index);
    assert_eq!(image.read_xattrs(&one).unwrap(), label);
    assert_eq!(image.read_xattrs(&two).unwrap(), label);
}

// ── Generated trees ─────────────────────────────────────────────────────────

fn file_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.-]{0,24}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any small generated set of files round-trips: names, sizes and
    /// contents survive the build.
    #[test]
    fn generated_files_round_trip(
        files in proptest::collection::btree_map(
            file_name(),
            proptest::collection::vec(any::<u8>(), 0..4096),
            1..12,
        )
    ) {
        let mut bench = Workbench::new();
        for (name, content) in &files {
            bench.add_file(&format!("/{name}"), content).unwrap();
        }
        let (image, _) = bench.build().unwrap();

        prop_assert_eq!(
            image.superblock().inode_count as usize,
            files.len() + 1
        );
        for (name, content) in &files {
            let inode = image.lookup(&format!("/{name}")).unwrap()
                .expect("file present");
            let back = image.read_file(&inode).unwrap();
            prop_assert_eq!(&back, content);
        }

        let root = image.root().unwrap();
        let entries = image.read_directory(&root).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        let expected: Vec<&str> = files.keys().map(String::as_str).collect();
        prop_assert_eq!(names, expected);
    }
}
