//! Directory listing serialization.
//!
//! A listing is a sequence of headers, each covering a run of entries whose
//! inodes share a metadata block and whose inode numbers stay within a
//! signed 16-bit delta of the run's first entry. A run also never exceeds
//! 256 entries. Entries are delta-encoded against the header and store
//! `name_length - 1` in their size field.

use sqsh_error::{Result, SqshError};
use sqsh_meta::MetaWriter;
use sqsh_tree::{DirListing, NodeData, NodeId, Tree};
use sqsh_types::{push_i16, push_u16, push_u32, MAX_DIR_ENTRIES};
use std::io::Write;

/// Serialize one directory's listing into the directory meta stream and
/// record its location on the node.
///
/// Every child must already have its inode serialized (`inode_ref` set);
/// the post-order walk guarantees that.
pub fn write_directory<W: Write>(
    tree: &mut Tree,
    dir_id: NodeId,
    dm: &mut MetaWriter<W>,
) -> Result<()> {
    let children: Vec<NodeId> = tree.children(dir_id).to_vec();

    let cursor = dm.cursor();
    let start_block = u32::try_from(cursor.block_start()).map_err(|_| SqshError::Overflow {
        field: "directory_table_start_block",
    })?;
    let mut listing = DirListing {
        start_block,
        block_offset: cursor.offset(),
        size: 0,
    };

    let mut position = 0_usize;
    while position < children.len() {
        let run = run_length(tree, &children[position..]);
        let base = tree.node(children[position]);
        let base_number = base.inode_number;
        let base_block = base.inode_ref.block_start();

        let mut header = Vec::with_capacity(12);
        push_u32(&mut header, run as u32 - 1);
        push_u32(
            &mut header,
            u32::try_from(base_block).map_err(|_| SqshError::Overflow {
                field: "inode_table_start_block",
            })?,
        );
        push_u32(&mut header, base_number);
        dm.append(&header)?;
        listing.size += header.len() as u32;

        for &child_id in &children[position..position + run] {
            let child = tree.node(child_id);
            let delta = i64::from(child.inode_number) - i64::from(base_number);
            let mut entry = Vec::with_capacity(8 + child.name.len());
            push_u16(&mut entry, child.inode_ref.offset());
            push_i16(
                &mut entry,
                i16::try_from(delta).map_err(|_| SqshError::Overflow {
                    field: "directory_inode_delta",
                })?,
            );
            push_u16(&mut entry, child.basic_inode_kind()?);
            push_u16(&mut entry, child.name.len() as u16 - 1);
            entry.extend_from_slice(child.name.as_bytes());
            dm.append(&entry)?;
            listing.size += entry.len() as u32;
        }
        position += run;
    }

    let NodeData::Dir {
        listing: slot, ..
    } = &mut tree.node_mut(dir_id).data
    else {
        return Err(SqshError::tree("listing target is not a directory"));
    };
    *slot = listing;
    Ok(())
}

/// Length of the run starting at `children[0]`: same inode meta block,
/// signed-16-bit inode delta, at most 256 entries.
fn run_length(tree: &Tree, children: &[NodeId]) -> usize {
    let first = tree.node(children[0]);
    let block = first.inode_ref.block_start();
    let base = i64::from(first.inode_number);

    let mut count = 0;
    for &id in children.iter().take(MAX_DIR_ENTRIES) {
        let node = tree.node(id);
        if node.inode_ref.block_start() != block {
            break;
        }
        if i16::try_from(i64::from(node.inode_number) - base).is_err() {
            break;
        }
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqsh_compress::{create_compressor, CompressorConfig};
    use sqsh_tree::{Defaults, FileData, NodeSpec};
    use sqsh_types::{BlockSize, CompressorId, MetaRef, INODE_FILE};
    use std::sync::Arc;

    fn meta_writer() -> MetaWriter<Vec<u8>> {
        let cfg = CompressorConfig::new(CompressorId::Gzip, BlockSize::new(131_072).unwrap());
        MetaWriter::new(Vec::new(), Arc::from(create_compressor(&cfg).unwrap()))
    }

    fn tree_with_children(names: &[&str]) -> Tree {
        let mut tree = Tree::new(Defaults::default());
        for name in names {
            tree.insert(
                &format!("/{name}"),
                NodeSpec {
                    permissions: 0o644,
                    uid: 0,
                    gid: 0,
                    mtime: 0,
                    xattrs: Vec::new(),
                    data: NodeData::File(FileData::default()),
                },
            )
            .unwrap();
        }
        // Hand out inode numbers and refs the way the serializer would.
        let order = tree.serialization_order();
        for (i, id) in order.iter().enumerate() {
            let node = tree.node_mut(*id);
            node.inode_number = i as u32 + 1;
            node.inode_ref = MetaRef::new(0, (i * 32) as u16);
        }
        tree
    }

    #[test]
    fn small_directory_uses_one_header() {
        let mut tree = tree_with_children(&["a", "b", "c"]);
        let mut dm = meta_writer();
        let root = tree.root();
        write_directory(&mut tree, root, &mut dm).unwrap();

        let NodeData::Dir { listing, .. } = &tree.node(tree.root()).data else {
            unreachable!();
        };
        // One 12-byte header plus three entries of 8 + 1 name byte.
        assert_eq!(listing.size, 12 + 3 * 9);
        assert_eq!(listing.start_block, 0);
        assert_eq!(listing.block_offset, 0);
    }

    #[test]
    fn large_directory_splits_headers_at_256() {
        let names: Vec<String> = (0..300).map(|i| format!("f{i:04}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut tree = tree_with_children(&refs);
        let mut dm = meta_writer();
        let root = tree.root();
        write_directory(&mut tree, root, &mut dm).unwrap();

        let NodeData::Dir { listing, .. } = &tree.node(tree.root()).data else {
            unreachable!();
        };
        // 300 entries of (8 + 5) bytes plus two headers.
        assert_eq!(listing.size, 2 * 12 + 300 * 13);
    }

    #[test]
    fn run_breaks_when_inode_block_changes() {
        let mut tree = tree_with_children(&["a", "b", "c", "d"]);
        // Push the last two children's inodes into a different meta block.
        let children: Vec<NodeId> = tree.children(tree.root()).to_vec();
        for id in &children[2..] {
            tree.node_mut(*id).inode_ref = MetaRef::new(8192, 0);
        }
        let mut dm = meta_writer();
        let root = tree.root();
        write_directory(&mut tree, root, &mut dm).unwrap();

        let NodeData::Dir { listing, .. } = &tree.node(tree.root()).data else {
            unreachable!();
        };
        assert_eq!(listing.size, 2 * 12 + 4 * 9);
    }

    #[test]
    fn empty_directory_has_empty_listing() {
        let mut tree = tree_with_children(&[]);
        let mut dm = meta_writer();
        let root = tree.root();
        write_directory(&mut tree, root, &mut dm).unwrap();
        let NodeData::Dir { listing, .. } = &tree.node(tree.root()).data else {
            unreachable!();
        };
        assert_eq!(listing.size, 0);
    }

    #[test]
    fn entry_kind_is_always_the_basic_variant() {
        let tree = tree_with_children(&["x"]);
        let child = tree.children(tree.root())[0];
        assert_eq!(tree.node(child).basic_inode_kind().unwrap(), INODE_FILE);
    }
}
