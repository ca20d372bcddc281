#![forbid(unsafe_code)]
//! Image reader pipeline.
//!
//! The mirror of the writer: super block validation, compressor-options
//! read-back, the indirected id/fragment/export tables, inode and directory
//! parsing, file data extraction with sparse reconstruction, and the xattr
//! tables. The whole image is held in memory; SquashFS images this toolkit
//! consumes are modest and it keeps every table read a slice operation.

use sqsh_compress::{compressor_exists, create_compressor, parse_options, Compressor, CompressorConfig};
use sqsh_error::{Result, SqshError};
use sqsh_meta::MetaReader;
use sqsh_types::{
    read_le_u16, read_le_u32, read_le_u64, BlockSize, MetaRef, Superblock,
    DATA_BLOCK_UNCOMPRESSED, FLAG_COMPRESSOR_OPTIONS, FRAGMENT_ABSENT, INODE_BDEV, INODE_CDEV,
    INODE_DIR, INODE_EXT_BDEV, INODE_EXT_CDEV, INODE_EXT_DIR, INODE_EXT_FIFO, INODE_EXT_FILE,
    INODE_EXT_SLINK, INODE_EXT_SOCKET, INODE_FIFO, INODE_FILE, INODE_SLINK, INODE_SOCKET,
    META_BLOCK_SIZE, META_BLOCK_UNCOMPRESSED, SUPERBLOCK_SIZE, TABLE_ABSENT, XATTR_ABSENT,
};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

const XATTR_PREFIXES: [&str; 3] = ["user.", "trusted.", "security."];
const XATTR_PREFIX_OOL: u16 = 0x0100;
const XATTR_PREFIX_MASK: u16 = 0x00FF;

/// A fragment block's location, parsed from the fragment table.
#[derive(Debug, Clone, Copy)]
pub struct FragmentLocation {
    pub start: u64,
    pub size_field: u32,
}

/// A parsed inode.
#[derive(Debug, Clone)]
pub struct Inode {
    pub kind: u16,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub inode_number: u32,
    pub nlink: u32,
    pub xattr_index: Option<u32>,
    pub data: InodeData,
}

/// Kind-specific inode payload.
#[derive(Debug, Clone)]
pub enum InodeData {
    Dir {
        start_block: u32,
        offset: u16,
        /// Raw stored size (listing bytes + 3).
        size: u32,
        parent: u32,
    },
    File {
        start_block: u64,
        size: u64,
        frag_index: u32,
        frag_offset: u32,
        block_sizes: Vec<u32>,
    },
    Symlink {
        target: String,
    },
    Dev {
        devno: u32,
    },
    Ipc,
}

impl Inode {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.data, InodeData::Dir { .. })
    }

    /// File size for regular files, 0 otherwise.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        match &self.data {
            InodeData::File { size, .. } => *size,
            _ => 0,
        }
    }
}

/// One directory entry as stored on disk.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode_ref: MetaRef,
    pub inode_number: u32,
    /// Basic inode kind recorded in the entry.
    pub kind: u16,
}

/// An open image with its tables loaded.
#[derive(Debug)]
pub struct Image {
    data: Vec<u8>,
    superblock: Superblock,
    compressor: Box<dyn Compressor>,
    ids: Vec<u32>,
    fragments: Vec<FragmentLocation>,
}

impl Image {
    /// Open and validate an image file.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Parse an image already held in memory.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(SqshError::format("image shorter than a super block"));
        }
        let superblock = Superblock::parse(&data).map_err(SqshError::format)?;
        if superblock.bytes_used > data.len() as u64 {
            return Err(SqshError::format(
                "super block claims more bytes than the image holds",
            ));
        }

        if !compressor_exists(superblock.compression_id) {
            return Err(SqshError::UnsupportedCompressor(
                superblock.compression_id.name().to_owned(),
            ));
        }
        let block_size =
            BlockSize::new(superblock.block_size).map_err(SqshError::format)?;
        let compressor =
            create_compressor(&CompressorConfig::new(superblock.compression_id, block_size))?;

        if superblock.flags & FLAG_COMPRESSOR_OPTIONS != 0 {
            let header = read_le_u16(&data, SUPERBLOCK_SIZE).map_err(SqshError::format)?;
            if header & META_BLOCK_UNCOMPRESSED == 0 {
                return Err(SqshError::format(
                    "compressor options block must be stored uncompressed",
                ));
            }
            let len = usize::from(header & !META_BLOCK_UNCOMPRESSED);
            let payload = data
                .get(SUPERBLOCK_SIZE + 2..SUPERBLOCK_SIZE + 2 + len)
                .ok_or_else(|| SqshError::format("compressor options block truncated"))?;
            parse_options(superblock.compression_id, payload)?;
        }

        let mut image = Self {
            data,
            superblock,
            compressor,
            ids: Vec::new(),
            fragments: Vec::new(),
        };
        image.ids = image.load_id_table()?;
        image.fragments = image.load_fragment_table()?;
        debug!(
            target: "sqsh::reader",
            event = "image_opened",
            inodes = image.superblock.inode_count,
            ids = image.ids.len(),
            fragments = image.fragments.len()
        );
        Ok(image)
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    // ── Indirected tables ───────────────────────────────────────────────

    /// Read an indirected table: `count * entry_size` payload bytes packed
    /// into meta blocks whose absolute locations sit at `table_start`.
    fn read_indirected(&self, table_start: u64, total_bytes: usize) -> Result<Vec<u8>> {
        let block_count = total_bytes.div_ceil(META_BLOCK_SIZE).max(1);
        let mut payload = Vec::with_capacity(total_bytes);
        for i in 0..block_count {
            let location =
                read_le_u64(&self.data, table_start as usize + i * 8).map_err(SqshError::format)?;
            let want = (total_bytes - payload.len()).min(META_BLOCK_SIZE);
            let mut reader = MetaReader::new(
                &self.data,
                location,
                self.superblock.bytes_used,
                self.compressor.as_ref(),
            );
            let mut chunk = vec![0_u8; want];
            reader.read_exact(&mut chunk)?;
            payload.extend_from_slice(&chunk);
        }
        Ok(payload)
    }

    fn load_id_table(&self) -> Result<Vec<u32>> {
        let count = usize::from(self.superblock.id_count);
        if count == 0 {
            return Err(SqshError::format("image must contain at least one id"));
        }
        let payload = self.read_indirected(self.superblock.id_table_start, count * 4)?;
        Ok((0..count)
            .map(|i| read_le_u32(&payload, i * 4))
            .collect::<std::result::Result<_, _>>()
            .map_err(SqshError::format)?)
    }

    fn load_fragment_table(&self) -> Result<Vec<FragmentLocation>> {
        let count = self.superblock.fragment_count as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.superblock.fragment_table_start == TABLE_ABSENT {
            return Err(SqshError::format(
                "fragments present but the fragment table is absent",
            ));
        }
        let payload = self.read_indirected(self.superblock.fragment_table_start, count * 16)?;
        (0..count)
            .map(|i| {
                Ok(FragmentLocation {
                    start: read_le_u64(&payload, i * 16).map_err(SqshError::format)?,
                    size_field: read_le_u32(&payload, i * 16 + 8).map_err(SqshError::format)?,
                })
            })
            .collect()
    }

    /// The export table (inode references indexed by inode number − 1), if
    /// the image carries one.
    pub fn export_refs(&self) -> Result<Option<Vec<MetaRef>>> {
        if self.superblock.export_table_start == TABLE_ABSENT {
            return Ok(None);
        }
        let count = self.superblock.inode_count as usize;
        let payload = self.read_indirected(self.superblock.export_table_start, count * 8)?;
        let refs = (0..count)
            .map(|i| read_le_u64(&payload, i * 8).map(MetaRef))
            .collect::<std::result::Result<_, _>>()
            .map_err(SqshError::format)?;
        Ok(Some(refs))
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    fn inode_reader(&self) -> MetaReader<'_> {
        MetaReader::new(
            &self.data,
            self.superblock.inode_table_start,
            self.superblock.directory_table_start,
            self.compressor.as_ref(),
        )
    }

    /// Parse the root inode.
    pub fn root(&self) -> Result<Inode> {
        self.inode_at(self.superblock.root_inode_ref)
    }

    /// Parse the inode at a reference into the inode table.
    pub fn inode_at(&self, reference: MetaRef) -> Result<Inode> {
        let mut reader = self.inode_reader();
        reader.seek(reference)?;

        let kind = reader.read_u16()?;
        let mode = reader.read_u16()?;
        let uid_idx = reader.read_u16()?;
        let gid_idx = reader.read_u16()?;
        let mtime = reader.read_u32()?;
        let inode_number = reader.read_u32()?;

        let uid = self.resolve_id(uid_idx)?;
        let gid = self.resolve_id(gid_idx)?;

        let mut nlink = 1;
        let mut xattr = XATTR_ABSENT;
        let data = match kind {
            INODE_DIR => {
                let start_block = reader.read_u32()?;
                nlink = reader.read_u32()?;
                let size = u32::from(reader.read_u16()?);
                let offset = reader.read_u16()?;
                let parent = reader.read_u32()?;
                InodeData::Dir {
                    start_block,
                    offset,
                    size,
                    parent,
                }
            }
            INODE_EXT_DIR => {
                nlink = reader.read_u32()?;
                let size = reader.read_u32()?;
                let start_block = reader.read_u32()?;
                let parent = reader.read_u32()?;
                let index_count = reader.read_u16()?;
                let offset = reader.read_u16()?;
                xattr = reader.read_u32()?;
                if index_count != 0 {
                    return Err(SqshError::format(
                        "directory index tables are not supported",
                    ));
                }
                InodeData::Dir {
                    start_block,
                    offset,
                    size,
                    parent,
                }
            }
            INODE_FILE => {
                let start_block = u64::from(reader.read_u32()?);
                let frag_index = reader.read_u32()?;
                let frag_offset = reader.read_u32()?;
                let size = u64::from(reader.read_u32()?);
                let block_sizes =
                    self.read_block_sizes(&mut reader, size, frag_index)?;
                InodeData::File {
                    start_block,
                    size,
                    frag_index,
                    frag_offset,
                    block_sizes,
                }
            }
            INODE_EXT_FILE => {
                let start_block = reader.read_u64()?;
                let size = reader.read_u64()?;
                let _sparse = reader.read_u64()?;
                nlink = reader.read_u32()?;
                let frag_index = reader.read_u32()?;
                let frag_offset = reader.read_u32()?;
                xattr = reader.read_u32()?;
                let block_sizes =
                    self.read_block_sizes(&mut reader, size, frag_index)?;
                InodeData::File {
                    start_block,
                    size,
                    frag_index,
                    frag_offset,
                    block_sizes,
                }
            }
            INODE_SLINK | INODE_EXT_SLINK => {
                nlink = reader.read_u32()?;
                let target_size = reader.read_u32()? as usize;
                let mut target = vec![0_u8; target_size];
                reader.read_exact(&mut target)?;
                if kind == INODE_EXT_SLINK {
                    xattr = reader.read_u32()?;
                }
                InodeData::Symlink {
                    target: String::from_utf8(target)
                        .map_err(|_| SqshError::format("symlink target is not UTF-8"))?,
                }
            }
            INODE_BDEV | INODE_CDEV | INODE_EXT_BDEV | INODE_EXT_CDEV => {
                nlink = reader.read_u32()?;
                let devno = reader.read_u32()?;
                if kind == INODE_EXT_BDEV || kind == INODE_EXT_CDEV {
                    xattr = reader.read_u32()?;
                }
                InodeData::Dev { devno }
            }
            INODE_FIFO | INODE_SOCKET | INODE_EXT_FIFO | INODE_EXT_SOCKET => {
                nlink = reader.read_u32()?;
                if kind == INODE_EXT_FIFO || kind == INODE_EXT_SOCKET {
                    xattr = reader.read_u32()?;
                }
                InodeData::Ipc
            }
            other => {
                return Err(SqshError::format(format!("unknown inode kind {other}")));
            }
        };

        Ok(Inode {
            kind,
            mode,
            uid,
            gid,
            mtime,
            inode_number,
            nlink,
            xattr_index: (xattr != XATTR_ABSENT).then_some(xattr),
            data,
        })
    }

    fn resolve_id(&self, index: u16) -> Result<u32> {
        self.ids
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| SqshError::format(format!("id index {index} out of range")))
    }

    fn read_block_sizes(
        &self,
        reader: &mut MetaReader<'_>,
        size: u64,
        frag_index: u32,
    ) -> Result<Vec<u32>> {
        let block_size = u64::from(self.superblock.block_size);
        let count = if frag_index == FRAGMENT_ABSENT {
            size.div_ceil(block_size)
        } else {
            size / block_size
        };
        (0..count).map(|_| reader.read_u32()).collect()
    }

    // ── Directories ─────────────────────────────────────────────────────

    /// Read a directory inode's entry list, in stored (name-sorted) order.
    pub fn read_directory(&self, inode: &Inode) -> Result<Vec<DirEntry>> {
        let InodeData::Dir {
            start_block,
            offset,
            size,
            ..
        } = &inode.data
        else {
            return Err(SqshError::format("inode is not a directory"));
        };

        // The stored size includes a 3-byte allowance for `.` and `..`.
        let Some(mut remaining) = size.checked_sub(3) else {
            return Err(SqshError::format("directory size field below minimum"));
        };

        let mut reader = MetaReader::new(
            &self.data,
            self.superblock.directory_table_start,
            self.superblock.bytes_used,
            self.compressor.as_ref(),
        );
        reader.seek(MetaRef::new(u64::from(*start_block), *offset))?;

        let mut entries = Vec::new();
        while remaining > 0 {
            if remaining < 12 {
                return Err(SqshError::format("directory header truncated"));
            }
            let count = reader.read_u32()? + 1;
            let inode_block = reader.read_u32()?;
            let base_number = reader.read_u32()?;
            remaining -= 12;

            if count as usize > sqsh_types::MAX_DIR_ENTRIES {
                return Err(SqshError::format(
                    "directory header covers more than 256 entries",
                ));
            }

            for _ in 0..count {
                if remaining < 8 {
                    return Err(SqshError::format("directory entry truncated"));
                }
                let entry_offset = reader.read_u16()?;
                let diff = reader.read_i16()?;
                let kind = reader.read_u16()?;
                let name_len = usize::from(reader.read_u16()?) + 1;
                let mut name = vec![0_u8; name_len];
                reader.read_exact(&mut name)?;
                remaining = remaining
                    .checked_sub(8 + name_len as u32)
                    .ok_or_else(|| SqshError::format("directory entry runs past listing"))?;

                let number = i64::from(base_number) + i64::from(diff);
                entries.push(DirEntry {
                    name: String::from_utf8(name)
                        .map_err(|_| SqshError::format("entry name is not UTF-8"))?,
                    inode_ref: MetaRef::new(u64::from(inode_block), entry_offset),
                    inode_number: u32::try_from(number)
                        .map_err(|_| SqshError::format("entry inode number out of range"))?,
                    kind,
                })
            }
        }
        Ok(entries)
    }

    /// Resolve an absolute path to its inode.
    pub fn lookup(&self, path: &str) -> Result<Option<Inode>> {
        let mut current = self.root()?;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !current.is_dir() {
                return Ok(None);
            }
            let entries = self.read_directory(&current)?;
            let Some(entry) = entries.iter().find(|e| e.name == part) else {
                return Ok(None);
            };
            current = self.inode_at(entry.inode_ref)?;
        }
        Ok(Some(current))
    }

    // ── File data ───────────────────────────────────────────────────────

    /// Extract a regular file's full content, reconstructing sparse blocks
    /// as zeroes.
    pub fn read_file(&self, inode: &Inode) -> Result<Vec<u8>> {
        let InodeData::File {
            start_block,
            size,
            frag_index,
            frag_offset,
            block_sizes,
        } = &inode.data
        else {
            return Err(SqshError::format("inode is not a regular file"));
        };

        let block_size = u64::from(self.superblock.block_size);
        let mut content = Vec::with_capacity(*size as usize);
        let mut remaining = *size;
        let mut offset = *start_block;

        for &size_field in block_sizes {
            if size_field == 0 {
                let zeroes = remaining.min(block_size) as usize;
                content.resize(content.len() + zeroes, 0);
                remaining -= zeroes as u64;
                continue;
            }
            let block = self.read_data_block(offset, size_field)?;
            remaining = remaining
                .checked_sub(block.len() as u64)
                .ok_or_else(|| SqshError::format("file blocks exceed the stored size"))?;
            offset += u64::from(size_field & !DATA_BLOCK_UNCOMPRESSED);
            content.extend_from_slice(&block);
        }

        if remaining > 0 {
            if *frag_index == FRAGMENT_ABSENT {
                return Err(SqshError::format("file tail missing and no fragment"));
            }
            let location = self
                .fragments
                .get(*frag_index as usize)
                .copied()
                .ok_or_else(|| SqshError::format("fragment index out of range"))?;
            let fragment = self.read_data_block(location.start, location.size_field)?;
            let start = *frag_offset as usize;
            let end = start + remaining as usize;
            let tail = fragment
                .get(start..end)
                .ok_or_else(|| SqshError::format("tail lies outside its fragment block"))?;
            content.extend_from_slice(tail);
        }

        Ok(content)
    }

    fn read_data_block(&self, offset: u64, size_field: u32) -> Result<Vec<u8>> {
        let on_disk = (size_field & !DATA_BLOCK_UNCOMPRESSED) as usize;
        let start = usize::try_from(offset).map_err(|_| SqshError::format("offset overflow"))?;
        let raw = self
            .data
            .get(start..start + on_disk)
            .ok_or_else(|| SqshError::format("data block lies outside the image"))?;
        if size_field & DATA_BLOCK_UNCOMPRESSED != 0 {
            Ok(raw.to_vec())
        } else {
            self.compressor
                .decompress(raw, self.superblock.block_size as usize)
        }
    }

    // ── Xattrs ──────────────────────────────────────────────────────────

    /// Read the xattr set of an inode, as full `prefix.suffix` keys.
    pub fn read_xattrs(&self, inode: &Inode) -> Result<Vec<(String, Vec<u8>)>> {
        let Some(index) = inode.xattr_index else {
            return Ok(Vec::new());
        };
        if self.superblock.xattr_id_table_start == TABLE_ABSENT {
            return Err(SqshError::format(
                "inode has xattrs but the xattr table is absent",
            ));
        }

        let table_start = self.superblock.xattr_id_table_start as usize;
        let kv_start = read_le_u64(&self.data, table_start).map_err(SqshError::format)?;
        let id_count = read_le_u32(&self.data, table_start + 8).map_err(SqshError::format)?;
        if index >= id_count {
            return Err(SqshError::format(format!(
                "xattr index {index} out of range ({id_count} sets)"
            )));
        }

        // Locate the descriptor: 16 bytes each, 512 per meta block.
        let descriptors_per_block = META_BLOCK_SIZE / 16;
        let block = index as usize / descriptors_per_block;
        let within = (index as usize % descriptors_per_block) * 16;
        let location = read_le_u64(&self.data, table_start + 16 + block * 8)
            .map_err(SqshError::format)?;
        let mut desc_reader = MetaReader::new(
            &self.data,
            location,
            self.superblock.bytes_used,
            self.compressor.as_ref(),
        );
        desc_reader.seek(MetaRef::new(0, within as u16))?;
        let kv_ref = MetaRef(desc_reader.read_u64()?);
        let count = desc_reader.read_u32()?;
        let _stored_size = desc_reader.read_u32()?;

        let mut kv = MetaReader::new(
            &self.data,
            kv_start,
            self.superblock.xattr_id_table_start,
            self.compressor.as_ref(),
        );
        kv.seek(kv_ref)?;

        let mut pairs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let type_field = kv.read_u16()?;
            let name_len = usize::from(kv.read_u16()?);
            let mut suffix = vec![0_u8; name_len];
            kv.read_exact(&mut suffix)?;

            let prefix = XATTR_PREFIXES
                .get(usize::from(type_field & XATTR_PREFIX_MASK))
                .ok_or_else(|| SqshError::format("unknown xattr prefix id"))?;
            let key = format!(
                "{prefix}{}",
                String::from_utf8(suffix)
                    .map_err(|_| SqshError::format("xattr key is not UTF-8"))?
            );

            let value_len = kv.read_u32()? as usize;
            let value = if type_field & XATTR_PREFIX_OOL != 0 {
                if value_len != 8 {
                    return Err(SqshError::format(
                        "out-of-line xattr value entry must be 8 bytes",
                    ));
                }
                let reference = MetaRef(kv.read_u64()?);
                let resume = kv.tell();
                kv.seek(reference)?;
                let real_len = kv.read_u32()? as usize;
                let mut value = vec![0_u8; real_len];
                kv.read_exact(&mut value)?;
                kv.seek(resume)?;
                value
            } else {
                let mut value = vec![0_u8; value_len];
                kv.read_exact(&mut value)?;
                value
            };
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    // ── Whole-tree verification helpers ─────────────────────────────────

    /// Walk the whole tree, returning path → inode for every node.
    /// Detects reference cycles by capping the walk at the inode count.
    pub fn walk(&self) -> Result<HashMap<String, Inode>> {
        let mut seen = HashMap::new();
        let root = self.root()?;
        let mut queue = vec![(String::from("/"), root)];
        while let Some((path, inode)) = queue.pop() {
            if seen.len() > self.superblock.inode_count as usize {
                return Err(SqshError::format("tree walk exceeds the inode count"));
            }
            if inode.is_dir() {
                for entry in self.read_directory(&inode)? {
                    let child_path = if path == "/" {
                        format!("/{}", entry.name)
                    } else {
                        format!("{path}/{}", entry.name)
                    };
                    queue.push((child_path, self.inode_at(entry.inode_ref)?));
                }
            }
            seen.insert(path, inode);
        }
        Ok(seen)
    }
}
