//! Inode serialization.
//!
//! Inodes are written depth-first, children before parents, the root last.
//! Each record starts with a common 16-byte base followed by a
//! kind-specific tail. The narrow variant is used unless a field exceeds
//! its range or the node carries extended attributes; the promotion is
//! decided per record at serialization time.

use crate::dir::write_directory;
use sqsh_error::{Result, SqshError};
use sqsh_meta::MetaWriter;
use sqsh_tree::{DirListing, FileData, IdTable, NodeData, NodeId, Tree};
use sqsh_types::{
    push_u16, push_u32, push_u64, FRAGMENT_ABSENT, INODE_BDEV, INODE_CDEV, INODE_DIR,
    INODE_EXT_OFFSET, INODE_FIFO, INODE_FILE, INODE_SLINK, INODE_SOCKET, XATTR_ABSENT,
};
use sqsh_xattr::XattrWriter;
use std::io::Write;
use tracing::trace;

/// The `.`/`..` allowance added to a directory inode's stored listing size.
const DIR_SIZE_BIAS: u32 = 3;

/// Assign inode numbers in serialization order, starting at 1. The root,
/// serialized last, receives the highest number. Returns the inode count.
pub fn assign_inode_numbers(tree: &mut Tree) -> u32 {
    let order = tree.serialization_order();
    for (i, id) in order.iter().enumerate() {
        tree.node_mut(*id).inode_number = i as u32 + 1;
    }
    order.len() as u32
}

/// Serialize one node's inode record; for directories this also emits the
/// directory listing first. Captures the inode meta cursor as the node's
/// `inode_ref`.
pub fn write_inode<W1: Write, W2: Write>(
    tree: &mut Tree,
    node_id: NodeId,
    block_size: u32,
    ids: &mut IdTable,
    xattrs: &mut XattrWriter,
    im: &mut MetaWriter<W1>,
    dm: &mut MetaWriter<W2>,
) -> Result<()> {
    if tree.node(node_id).is_dir() {
        write_directory(tree, node_id, dm)?;
    }

    let xattr_index = {
        let pairs = std::mem::take(&mut tree.node_mut(node_id).xattrs);
        let index = xattrs.intern(&pairs)?;
        let node = tree.node_mut(node_id);
        node.xattrs = pairs;
        node.xattr_index = index;
        index
    };

    let (uid_idx, gid_idx) = {
        let node = tree.node(node_id);
        (ids.index_of(node.uid)?, ids.index_of(node.gid)?)
    };

    let nlink = tree.hard_link_count(node_id);
    let parent_number = tree
        .node(node_id)
        .parent
        .map_or(1, |p| tree.node(p).inode_number);

    let reference = im.cursor();
    tree.node_mut(node_id).inode_ref = reference;

    let node = tree.node(node_id);
    let basic_kind = node.basic_inode_kind()?;
    let tail = serialize_tail(
        node_id,
        tree,
        block_size,
        basic_kind,
        nlink,
        parent_number,
        xattr_index,
    )?;

    let mut record = Vec::with_capacity(16 + tail.body.len());
    push_u16(&mut record, tail.kind);
    push_u16(&mut record, node.mode);
    push_u16(&mut record, uid_idx);
    push_u16(&mut record, gid_idx);
    push_u32(&mut record, node.mtime);
    push_u32(&mut record, node.inode_number);
    record.extend_from_slice(&tail.body);
    im.append(&record)?;

    trace!(
        target: "sqsh::writer",
        event = "inode_written",
        path = %tree.path_of(node_id),
        number = node.inode_number,
        kind = tail.kind,
        reference = %reference
    );
    Ok(())
}

struct InodeTail {
    kind: u16,
    body: Vec<u8>,
}

fn serialize_tail(
    node_id: NodeId,
    tree: &Tree,
    block_size: u32,
    basic_kind: u16,
    nlink: u32,
    parent_number: u32,
    xattr_index: Option<u32>,
) -> Result<InodeTail> {
    let node = tree.node(node_id);
    let has_xattr = xattr_index.is_some();
    let xattr_field = xattr_index.unwrap_or(XATTR_ABSENT);

    match &node.data {
        NodeData::Dir { listing, .. } => {
            let stored_size = listing.size + DIR_SIZE_BIAS;
            let extended = has_xattr || stored_size > u32::from(u16::MAX);
            if extended {
                Ok(InodeTail {
                    kind: INODE_DIR + INODE_EXT_OFFSET,
                    body: extended_dir_body(listing, stored_size, nlink, parent_number, xattr_field),
                })
            } else {
                let mut body = Vec::with_capacity(16);
                push_u32(&mut body, listing.start_block);
                push_u32(&mut body, nlink);
                push_u16(&mut body, stored_size as u16);
                push_u16(&mut body, listing.block_offset);
                push_u32(&mut body, parent_number);
                Ok(InodeTail {
                    kind: INODE_DIR,
                    body,
                })
            }
        }
        NodeData::File(file) => serialize_file_tail(file, block_size, has_xattr, xattr_field, nlink),
        NodeData::Symlink { target } => {
            let mut body = Vec::with_capacity(8 + target.len());
            push_u32(&mut body, nlink);
            push_u32(
                &mut body,
                u32::try_from(target.len()).map_err(|_| SqshError::Overflow {
                    field: "symlink_target_size",
                })?,
            );
            body.extend_from_slice(target.as_bytes());
            if has_xattr {
                push_u32(&mut body, xattr_field);
                Ok(InodeTail {
                    kind: INODE_SLINK + INODE_EXT_OFFSET,
                    body,
                })
            } else {
                Ok(InodeTail {
                    kind: INODE_SLINK,
                    body,
                })
            }
        }
        NodeData::BlockDev { devno } | NodeData::CharDev { devno } => {
            let kind = if matches!(node.data, NodeData::BlockDev { .. }) {
                INODE_BDEV
            } else {
                INODE_CDEV
            };
            let mut body = Vec::with_capacity(12);
            push_u32(&mut body, nlink);
            push_u32(&mut body, *devno);
            if has_xattr {
                push_u32(&mut body, xattr_field);
                Ok(InodeTail {
                    kind: kind + INODE_EXT_OFFSET,
                    body,
                })
            } else {
                Ok(InodeTail { kind, body })
            }
        }
        NodeData::Fifo | NodeData::Socket => {
            let kind = if basic_kind == INODE_FIFO {
                INODE_FIFO
            } else {
                INODE_SOCKET
            };
            let mut body = Vec::with_capacity(8);
            push_u32(&mut body, nlink);
            if has_xattr {
                push_u32(&mut body, xattr_field);
                Ok(InodeTail {
                    kind: kind + INODE_EXT_OFFSET,
                    body,
                })
            } else {
                Ok(InodeTail { kind, body })
            }
        }
    }
}

fn extended_dir_body(
    listing: &DirListing,
    stored_size: u32,
    nlink: u32,
    parent_number: u32,
    xattr_field: u32,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(24);
    push_u32(&mut body, nlink);
    push_u32(&mut body, stored_size);
    push_u32(&mut body, listing.start_block);
    push_u32(&mut body, parent_number);
    push_u16(&mut body, 0); // index entries (none written)
    push_u16(&mut body, listing.block_offset);
    push_u32(&mut body, xattr_field);
    body
}

fn serialize_file_tail(
    file: &FileData,
    block_size: u32,
    has_xattr: bool,
    xattr_field: u32,
    nlink: u32,
) -> Result<InodeTail> {
    let (frag_index, frag_offset) = match file.fragment {
        Some(frag) => (frag.index, frag.offset),
        None => (FRAGMENT_ABSENT, 0),
    };

    let extended = has_xattr
        || nlink > 1
        || file.size > u64::from(u32::MAX)
        || file.start_block > u64::from(u32::MAX);

    if extended {
        let sparse_bytes = file
            .block_sizes
            .iter()
            .filter(|&&size| size == 0)
            .count() as u64
            * u64::from(block_size);
        let mut body = Vec::with_capacity(40 + file.block_sizes.len() * 4);
        push_u64(&mut body, file.start_block);
        push_u64(&mut body, file.size);
        push_u64(&mut body, sparse_bytes);
        push_u32(&mut body, nlink);
        push_u32(&mut body, frag_index);
        push_u32(&mut body, frag_offset);
        push_u32(&mut body, xattr_field);
        for &size in &file.block_sizes {
            push_u32(&mut body, size);
        }
        Ok(InodeTail {
            kind: INODE_FILE + INODE_EXT_OFFSET,
            body,
        })
    } else {
        let mut body = Vec::with_capacity(16 + file.block_sizes.len() * 4);
        push_u32(&mut body, file.start_block as u32);
        push_u32(&mut body, frag_index);
        push_u32(&mut body, frag_offset);
        push_u32(&mut body, file.size as u32);
        for &size in &file.block_sizes {
            push_u32(&mut body, size);
        }
        Ok(InodeTail {
            kind: INODE_FILE,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqsh_compress::{create_compressor, CompressorConfig};
    use sqsh_tree::{Defaults, FragmentRef, NodeSpec};
    use sqsh_types::{BlockSize, CompressorId, INODE_EXT_FILE};
    use std::sync::Arc;

    const BLOCK_SIZE: u32 = 131_072;

    fn meta_writer() -> MetaWriter<Vec<u8>> {
        let cfg = CompressorConfig::new(CompressorId::Gzip, BlockSize::new(BLOCK_SIZE).unwrap());
        MetaWriter::new(Vec::new(), Arc::from(create_compressor(&cfg).unwrap()))
    }

    fn file_spec(size: u64) -> NodeSpec {
        NodeSpec {
            permissions: 0o644,
            uid: 0,
            gid: 0,
            mtime: 0,
            xattrs: Vec::new(),
            data: NodeData::File(FileData {
                size,
                ..FileData::default()
            }),
        }
    }

    fn write_all(tree: &mut Tree) -> (IdTable, XattrWriter) {
        let mut ids = IdTable::new();
        let mut xattrs = XattrWriter::new();
        let mut im = meta_writer();
        let mut dm = meta_writer();
        assign_inode_numbers(tree);
        for id in tree.serialization_order() {
            write_inode(tree, id, BLOCK_SIZE, &mut ids, &mut xattrs, &mut im, &mut dm).unwrap();
        }
        (ids, xattrs)
    }

    #[test]
    fn numbering_is_post_order_from_one() {
        let mut tree = Tree::new(Defaults::default());
        tree.insert("/d/inner", file_spec(0)).unwrap();
        tree.insert("/top", file_spec(0)).unwrap();
        let count = assign_inode_numbers(&mut tree);
        assert_eq!(count, 4);
        assert_eq!(tree.node(tree.root()).inode_number, count);
        let inner = tree.lookup("/d/inner").unwrap();
        let d = tree.lookup("/d").unwrap();
        assert!(tree.node(inner).inode_number < tree.node(d).inode_number);
    }

    #[test]
    fn lone_root_is_inode_one() {
        let mut tree = Tree::new(Defaults::default());
        assert_eq!(assign_inode_numbers(&mut tree), 1);
        assert_eq!(tree.node(tree.root()).inode_number, 1);
    }

    #[test]
    fn inode_refs_are_strictly_increasing() {
        let mut tree = Tree::new(Defaults::default());
        for name in ["a", "b", "c"] {
            tree.insert(&format!("/{name}"), file_spec(0)).unwrap();
        }
        write_all(&mut tree);

        let order = tree.serialization_order();
        let refs: Vec<u64> = order.iter().map(|id| tree.node(*id).inode_ref.0).collect();
        for pair in refs.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn narrow_file_at_threshold_extended_above() {
        let narrow = serialize_file_tail(
            &FileData {
                size: u64::from(u32::MAX),
                ..FileData::default()
            },
            BLOCK_SIZE,
            false,
            XATTR_ABSENT,
            1,
        )
        .unwrap();
        assert_eq!(narrow.kind, INODE_FILE);

        let extended = serialize_file_tail(
            &FileData {
                size: u64::from(u32::MAX) + 1,
                ..FileData::default()
            },
            BLOCK_SIZE,
            false,
            XATTR_ABSENT,
            1,
        )
        .unwrap();
        assert_eq!(extended.kind, INODE_EXT_FILE);
    }

    #[test]
    fn extended_file_counts_sparse_bytes() {
        let tail = serialize_file_tail(
            &FileData {
                size: u64::from(u32::MAX) + 1,
                block_sizes: vec![100, 0, 100, 0],
                ..FileData::default()
            },
            BLOCK_SIZE,
            false,
            XATTR_ABSENT,
            1,
        )
        .unwrap();
        let sparse = sqsh_types::read_le_u64(&tail.body, 16).unwrap();
        assert_eq!(sparse, 2 * u64::from(BLOCK_SIZE));
    }

    #[test]
    fn file_without_fragment_stores_absent_index() {
        let tail = serialize_file_tail(
            &FileData {
                size: 10,
                ..FileData::default()
            },
            BLOCK_SIZE,
            false,
            XATTR_ABSENT,
            1,
        )
        .unwrap();
        assert_eq!(sqsh_types::read_le_u32(&tail.body, 4).unwrap(), FRAGMENT_ABSENT);

        let with_frag = serialize_file_tail(
            &FileData {
                size: 10,
                fragment: Some(FragmentRef {
                    index: 2,
                    offset: 40,
                    tail_len: 10,
                }),
                ..FileData::default()
            },
            BLOCK_SIZE,
            false,
            XATTR_ABSENT,
            1,
        )
        .unwrap();
        assert_eq!(sqsh_types::read_le_u32(&with_frag.body, 4).unwrap(), 2);
        assert_eq!(sqsh_types::read_le_u32(&with_frag.body, 8).unwrap(), 40);
    }

    #[test]
    fn xattrs_promote_any_kind_to_extended() {
        let mut tree = Tree::new(Defaults::default());
        let mut spec = file_spec(5);
        spec.xattrs = vec![("user.tag".to_owned(), b"v".to_vec())];
        tree.insert("/plain", file_spec(5)).unwrap();
        tree.insert("/tagged", spec).unwrap();
        let (_, xattrs) = write_all(&mut tree);
        assert_eq!(xattrs.set_count(), 1);

        let tagged = tree.lookup("/tagged").unwrap();
        assert_eq!(tree.node(tagged).xattr_index, Some(0));
        let untouched = tree.lookup("/plain").unwrap();
        assert_eq!(tree.node(untouched).xattr_index, None);
    }

    #[test]
    fn uid_gid_interned_through_id_table() {
        let mut tree = Tree::new(Defaults::default());
        let mut spec = file_spec(0);
        spec.uid = 1000;
        spec.gid = 100;
        tree.insert("/owned", spec).unwrap();
        let (ids, _) = write_all(&mut tree);
        // root's 0/0 plus 1000 and 100.
        assert_eq!(ids.ids(), &[0, 1000, 100]);
    }

    #[test]
    fn directory_size_includes_dot_bias() {
        let mut tree = Tree::new(Defaults::default());
        tree.insert("/d/f", file_spec(0)).unwrap();
        let mut ids = IdTable::new();
        let mut xattrs = XattrWriter::new();
        let mut im = meta_writer();
        let mut dm = meta_writer();
        assign_inode_numbers(&mut tree);

        let order = tree.serialization_order();
        for id in &order {
            write_inode(
                &mut tree, *id, BLOCK_SIZE, &mut ids, &mut xattrs, &mut im, &mut dm,
            )
            .unwrap();
        }

        // /d holds one entry "f": header 12 + entry 8 + name 1 = 21; the
        // inode stores 21 + 3.
        let d = tree.lookup("/d").unwrap();
        let NodeData::Dir { listing, .. } = &tree.node(d).data else {
            unreachable!();
        };
        assert_eq!(listing.size, 21);
    }
}
