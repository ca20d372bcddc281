#![forbid(unsafe_code)]
//! In-memory filesystem tree.
//!
//! The tree is an arena of typed nodes indexed by [`NodeId`]; children hold
//! their parent's index rather than an owning back-pointer, so the ownership
//! graph stays a strict DAG. Children of a directory are kept sorted by name
//! (bytewise) at insertion time and duplicate names are rejected.
//!
//! Also home to the [`IdTable`], which interns (uid, gid) values into the
//! 32-bit id table the image stores and inodes index with 16 bits.

use sqsh_error::{Result, SqshError};
use sqsh_types::{
    inode_kind_for_mode, MetaRef, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFREG, S_IFSOCK,
};
use std::collections::HashMap;
use std::path::PathBuf;

/// Index of a node within its [`Tree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a file's tail ended up inside a shared fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub index: u32,
    pub offset: u32,
    pub tail_len: u32,
}

/// Location of a directory's listing within the directory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirListing {
    pub start_block: u32,
    pub block_offset: u16,
    pub size: u32,
}

/// Payload of a regular file node, filled in by the data writer.
#[derive(Debug, Clone, Default)]
pub struct FileData {
    pub size: u64,
    /// Image offset of the file's first data block.
    pub start_block: u64,
    /// On-disk size of each full block, with the uncompressed flag bit;
    /// zero entries are sparse blocks.
    pub block_sizes: Vec<u32>,
    pub fragment: Option<FragmentRef>,
    /// Where to read the file's content from while packing.
    pub source: Option<PathBuf>,
}

/// Typed node payload.
#[derive(Debug, Clone)]
pub enum NodeData {
    Dir {
        children: Vec<NodeId>,
        listing: DirListing,
    },
    File(FileData),
    Symlink { target: String },
    BlockDev { devno: u32 },
    CharDev { devno: u32 },
    Fifo,
    Socket,
}

impl NodeData {
    /// An empty directory payload.
    #[must_use]
    pub fn empty_dir() -> Self {
        NodeData::Dir {
            children: Vec::new(),
            listing: DirListing::default(),
        }
    }

    /// The `S_IF*` type bits for this payload.
    #[must_use]
    pub fn type_bits(&self) -> u16 {
        match self {
            NodeData::Dir { .. } => S_IFDIR,
            NodeData::File(_) => S_IFREG,
            NodeData::Symlink { .. } => S_IFLNK,
            NodeData::BlockDev { .. } => S_IFBLK,
            NodeData::CharDev { .. } => S_IFCHR,
            NodeData::Fifo => S_IFIFO,
            NodeData::Socket => S_IFSOCK,
        }
    }
}

/// One tree node. `inode_number` and `inode_ref` stay zero until the
/// serializer assigns them.
#[derive(Debug, Clone)]
pub struct Node {
    /// Final path component; empty for the root.
    pub name: String,
    /// Full mode: type bits plus 12-bit permissions.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    /// Raw key-value pairs collected from the source, interned during
    /// serialization.
    pub xattrs: Vec<(String, Vec<u8>)>,
    /// Index into the image's xattr descriptor table, set at serialization.
    pub xattr_index: Option<u32>,
    pub parent: Option<NodeId>,
    pub inode_number: u32,
    pub inode_ref: MetaRef,
    pub data: NodeData,
}

impl Node {
    /// Kind constant for the basic (narrow) inode variant of this node.
    pub fn basic_inode_kind(&self) -> Result<u16> {
        inode_kind_for_mode(self.mode).map_err(SqshError::format)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.data, NodeData::Dir { .. })
    }

    pub fn as_file(&self) -> Option<&FileData> {
        match &self.data {
            NodeData::File(file) => Some(file),
            _ => None,
        }
    }
}

/// Attribute defaults applied to implicitly created directories.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only.
    pub mode: u16,
    pub mtime: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0o755,
            mtime: 0,
        }
    }
}

/// Attributes for a node being inserted.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Permission bits only; the type comes from `data`.
    pub permissions: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub xattrs: Vec<(String, Vec<u8>)>,
    pub data: NodeData,
}

/// Arena-backed filesystem tree with an implicit root directory.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    defaults: Defaults,
}

impl Tree {
    /// Create a tree holding only the root directory, built from `defaults`.
    #[must_use]
    pub fn new(defaults: Defaults) -> Self {
        let root = Node {
            name: String::new(),
            mode: S_IFDIR | (defaults.mode & 0o7777),
            uid: defaults.uid,
            gid: defaults.gid,
            mtime: defaults.mtime,
            xattrs: Vec::new(),
            xattr_index: None,
            parent: None,
            inode_number: 0,
            inode_ref: MetaRef(0),
            data: NodeData::empty_dir(),
        };
        Self {
            nodes: vec![root],
            defaults,
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false // the root always exists
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Split an absolute image path into validated components.
    fn split_path(path: &str) -> Result<Vec<&str>> {
        let Some(stripped) = path.strip_prefix('/') else {
            return Err(SqshError::tree(format!(
                "image path '{path}' is not absolute"
            )));
        };
        let mut components = Vec::new();
        for part in stripped.split('/') {
            match part {
                "" => {}
                "." | ".." => {
                    return Err(SqshError::tree(format!(
                        "image path '{path}' contains a relative component"
                    )));
                }
                _ => components.push(part),
            }
        }
        Ok(components)
    }

    /// Insert a node at an absolute path, creating missing parent
    /// directories from the tree defaults.
    ///
    /// Inserting `/` applies the spec's attributes to the root instead (the
    /// root node itself always exists).
    pub fn insert(&mut self, path: &str, spec: NodeSpec) -> Result<NodeId> {
        let components = Self::split_path(path)?;

        let Some((leaf_name, dirs)) = components.split_last() else {
            if !matches!(spec.data, NodeData::Dir { .. }) {
                return Err(SqshError::tree("the image root must be a directory"));
            }
            let root = self.root();
            let node = self.node_mut(root);
            node.mode = S_IFDIR | (spec.permissions & 0o7777);
            node.uid = spec.uid;
            node.gid = spec.gid;
            node.mtime = spec.mtime;
            node.xattrs = spec.xattrs;
            return Ok(root);
        };

        let mut parent = self.root();
        for dir in dirs {
            parent = match self.child_by_name(parent, dir) {
                Some(existing) => {
                    if !self.node(existing).is_dir() {
                        return Err(SqshError::tree(format!(
                            "'{dir}' in '{path}' exists and is not a directory"
                        )));
                    }
                    existing
                }
                None => {
                    let defaults = self.defaults;
                    self.attach(
                        parent,
                        dir,
                        NodeSpec {
                            permissions: defaults.mode,
                            uid: defaults.uid,
                            gid: defaults.gid,
                            mtime: defaults.mtime,
                            xattrs: Vec::new(),
                            data: NodeData::empty_dir(),
                        },
                    )?
                }
            };
        }

        self.attach(parent, leaf_name, spec)
    }

    /// Attach a new child under `parent`, keeping the child list sorted.
    pub fn attach(&mut self, parent: NodeId, name: &str, spec: NodeSpec) -> Result<NodeId> {
        if name.is_empty() || name.len() > 255 {
            return Err(SqshError::tree(format!(
                "entry name '{name}' must be 1..=255 bytes"
            )));
        }
        if !self.node(parent).is_dir() {
            return Err(SqshError::tree(format!(
                "cannot attach '{name}': parent is not a directory"
            )));
        }

        let id = NodeId(self.nodes.len() as u32);
        let mode = spec.data.type_bits() | (spec.permissions & 0o7777);
        let node = Node {
            name: name.to_owned(),
            mode,
            uid: spec.uid,
            gid: spec.gid,
            mtime: spec.mtime,
            xattrs: spec.xattrs,
            xattr_index: None,
            parent: Some(parent),
            inode_number: 0,
            inode_ref: MetaRef(0),
            data: spec.data,
        };

        // Insert position first, then push: a duplicate must not leave a
        // dangling arena entry behind.
        let position = {
            let NodeData::Dir { children, .. } = &self.nodes[parent.index()].data else {
                unreachable!("checked above");
            };
            match children
                .binary_search_by(|c| self.nodes[c.index()].name.as_bytes().cmp(name.as_bytes()))
            {
                Ok(_) => {
                    return Err(SqshError::tree(format!(
                        "duplicate entry '{name}' in directory"
                    )));
                }
                Err(pos) => pos,
            }
        };

        self.nodes.push(node);
        let NodeData::Dir { children, .. } = &mut self.nodes[parent.index()].data else {
            unreachable!("checked above");
        };
        children.insert(position, id);
        Ok(id)
    }

    /// Find a direct child of `parent` by name.
    #[must_use]
    pub fn child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let NodeData::Dir { children, .. } = &self.node(parent).data else {
            return None;
        };
        children
            .binary_search_by(|c| self.node(*c).name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|pos| children[pos])
    }

    /// Resolve an absolute image path.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let components = Self::split_path(path).ok()?;
        let mut current = self.root();
        for part in components {
            current = self.child_by_name(current, part)?;
        }
        Some(current)
    }

    /// Children of a directory node, in name order.
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.node(id).data {
            NodeData::Dir { children, .. } => children,
            _ => &[],
        }
    }

    /// Nodes in inode serialization order: within each directory,
    /// subdirectory subtrees first, then every direct child; the root comes
    /// last. Parents therefore always serialize after their children.
    #[must_use]
    pub fn serialization_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.len());
        self.visit_children(self.root(), &mut order);
        order.push(self.root());
        order
    }

    fn visit_children(&self, dir: NodeId, order: &mut Vec<NodeId>) {
        for &child in self.children(dir) {
            if self.node(child).is_dir() {
                self.visit_children(child, order);
            }
        }
        order.extend(self.children(dir).iter().copied());
    }

    /// Link count reported for a node: directories count themselves, their
    /// parent link and each child; everything else is 1.
    #[must_use]
    pub fn hard_link_count(&self, id: NodeId) -> u32 {
        match &self.node(id).data {
            NodeData::Dir { children, .. } => 2 + children.len() as u32,
            _ => 1,
        }
    }

    /// Files in name-sorted traversal order (the order their data is packed).
    #[must_use]
    pub fn files_in_pack_order(&self) -> Vec<NodeId> {
        let mut files = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            match &self.node(id).data {
                NodeData::Dir { children, .. } => {
                    // Reverse so the stack pops children in name order.
                    stack.extend(children.iter().rev().copied());
                }
                NodeData::File(_) => files.push(id),
                _ => {}
            }
        }
        files
    }

    /// Absolute image path of a node, for diagnostics.
    #[must_use]
    pub fn path_of(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if !node.name.is_empty() {
                parts.push(node.name.clone());
            }
            current = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }
}

// ── Id table ────────────────────────────────────────────────────────────────

/// Maximum number of distinct uid/gid values an image can hold (the super
/// block's id count is 16 bits).
pub const MAX_IDS: usize = 65535;

/// Interns uid/gid values into the image's 32-bit id table.
#[derive(Debug, Default)]
pub struct IdTable {
    ids: Vec<u32>,
    index: HashMap<u32, u16>,
}

impl IdTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the table index for `id`, interning it on first sight.
    pub fn index_of(&mut self, id: u32) -> Result<u16> {
        if let Some(&idx) = self.index.get(&id) {
            return Ok(idx);
        }
        if self.ids.len() >= MAX_IDS {
            return Err(SqshError::Overflow { field: "id_count" });
        }
        let idx = self.ids.len() as u16;
        self.ids.push(id);
        self.index.insert(id, idx);
        Ok(idx)
    }

    /// All interned ids, in first-seen order.
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
