#![forbid(unsafe_code)]
//! On-disk constants and shared primitive types for SquashFS images.
//!
//! Everything in a SquashFS image is little-endian. This crate holds the
//! format constants, validated newtypes (`BlockSize`, `MetaRef`), the 96-byte
//! super block, and the byte-level read/write helpers the writer and reader
//! pipelines share.

use std::fmt;
use thiserror::Error;

/// Magic number at offset 0 of every image (`"hsqs"` read as LE u32).
pub const SQFS_MAGIC: u32 = 0x7371_7368;

/// Format version produced and accepted by this toolkit.
pub const SQFS_VERSION_MAJOR: u16 = 4;
pub const SQFS_VERSION_MINOR: u16 = 0;

/// Size of the super block in bytes.
pub const SUPERBLOCK_SIZE: usize = 96;

/// Uncompressed payload capacity of a metadata block.
pub const META_BLOCK_SIZE: usize = 8192;

/// Top bit of a meta block's 16-bit framing header: payload is uncompressed.
pub const META_BLOCK_UNCOMPRESSED: u16 = 0x8000;

/// Bit set in an on-disk data/fragment block size when the block is stored
/// uncompressed. A size of zero marks a sparse data block.
pub const DATA_BLOCK_UNCOMPRESSED: u32 = 1 << 24;

/// Maximum number of entries a single directory header may cover.
pub const MAX_DIR_ENTRIES: usize = 256;

/// Table offset value meaning "this table is not present".
pub const TABLE_ABSENT: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Xattr index stored in extended inodes that carry no attributes.
pub const XATTR_ABSENT: u32 = 0xFFFF_FFFF;

/// Fragment index stored in file inodes whose tail is not in a fragment.
pub const FRAGMENT_ABSENT: u32 = 0xFFFF_FFFF;

/// Default data block size (128 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 131_072;

/// Default device block size the image is padded to.
pub const DEFAULT_DEV_BLOCK_SIZE: u32 = 4096;

// ── Super block flags ───────────────────────────────────────────────────────

pub const FLAG_UNCOMPRESSED_INODES: u16 = 0x0001;
pub const FLAG_UNCOMPRESSED_DATA: u16 = 0x0002;
pub const FLAG_UNCOMPRESSED_FRAGMENTS: u16 = 0x0008;
pub const FLAG_NO_FRAGMENTS: u16 = 0x0010;
pub const FLAG_ALWAYS_FRAGMENTS: u16 = 0x0020;
pub const FLAG_DUPLICATES: u16 = 0x0040;
pub const FLAG_EXPORTABLE: u16 = 0x0080;
pub const FLAG_UNCOMPRESSED_XATTRS: u16 = 0x0100;
pub const FLAG_NO_XATTRS: u16 = 0x0200;
pub const FLAG_COMPRESSOR_OPTIONS: u16 = 0x0400;
pub const FLAG_UNCOMPRESSED_IDS: u16 = 0x0800;

// ── Inode kinds ─────────────────────────────────────────────────────────────

pub const INODE_DIR: u16 = 1;
pub const INODE_FILE: u16 = 2;
pub const INODE_SLINK: u16 = 3;
pub const INODE_BDEV: u16 = 4;
pub const INODE_CDEV: u16 = 5;
pub const INODE_FIFO: u16 = 6;
pub const INODE_SOCKET: u16 = 7;
pub const INODE_EXT_DIR: u16 = 8;
pub const INODE_EXT_FILE: u16 = 9;
pub const INODE_EXT_SLINK: u16 = 10;
pub const INODE_EXT_BDEV: u16 = 11;
pub const INODE_EXT_CDEV: u16 = 12;
pub const INODE_EXT_FIFO: u16 = 13;
pub const INODE_EXT_SOCKET: u16 = 14;

/// Difference between an extended inode kind and its basic counterpart.
pub const INODE_EXT_OFFSET: u16 = 7;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

// ── Compressor identifiers ──────────────────────────────────────────────────

/// Compression algorithm id stored in the super block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CompressorId {
    Gzip = 1,
    Lzma = 2,
    Lzo = 3,
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
}

impl CompressorId {
    /// Decode an on-disk compressor id.
    pub fn from_u16(value: u16) -> Result<Self, ParseError> {
        match value {
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Lzma),
            3 => Ok(Self::Lzo),
            4 => Ok(Self::Xz),
            5 => Ok(Self::Lz4),
            6 => Ok(Self::Zstd),
            _ => Err(ParseError::InvalidField {
                field: "compression_id",
                reason: "not a known compressor",
            }),
        }
    }

    /// The name used on the command line and in diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Lzma => "lzma",
            Self::Lzo => "lzo",
            Self::Xz => "xz",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Parse a command-line compressor name.
    pub fn from_name(name: &str) -> Result<Self, ParseError> {
        match name {
            "gzip" | "zlib" => Ok(Self::Gzip),
            "lzma" => Ok(Self::Lzma),
            "lzo" => Ok(Self::Lzo),
            "xz" => Ok(Self::Xz),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            _ => Err(ParseError::InvalidField {
                field: "compressor",
                reason: "not a known compressor name",
            }),
        }
    }
}

impl fmt::Display for CompressorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Validated block size ────────────────────────────────────────────────────

/// Validated data block size (power of two in 4096..=1048576).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const MIN: u32 = 4096;
    pub const MAX: u32 = 1_048_576;

    /// Create a `BlockSize` if `value` is a power of two in [4096, 1 MiB].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 4096..=1048576",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// `log2(block_size)`, stored in the super block as `block_log`.
    #[must_use]
    pub fn log2(self) -> u16 {
        self.0.trailing_zeros() as u16
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Metadata references ─────────────────────────────────────────────────────

/// Reference into a metadata stream: the start offset of a meta block within
/// the stream (upper 48 bits, shifted by 16) plus a byte offset into the
/// uncompressed block payload (lower 16 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MetaRef(pub u64);

impl MetaRef {
    /// Pack a block start offset and an intra-block byte offset.
    #[must_use]
    pub fn new(block_start: u64, offset: u16) -> Self {
        Self((block_start << 16) | u64::from(offset))
    }

    /// Start offset of the referenced meta block within its stream.
    #[must_use]
    pub fn block_start(self) -> u64 {
        self.0 >> 16
    }

    /// Byte offset into the uncompressed block payload.
    #[must_use]
    pub fn offset(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for MetaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_start(), self.offset())
    }
}

// ── Super block ─────────────────────────────────────────────────────────────

/// The 96-byte structure at offset 0 of every image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inode_count: u32,
    pub modification_time: u32,
    pub block_size: u32,
    pub fragment_count: u32,
    pub compression_id: CompressorId,
    pub block_log: u16,
    pub flags: u16,
    pub id_count: u16,
    pub root_inode_ref: MetaRef,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_id_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub export_table_start: u64,
}

impl Superblock {
    /// A fresh super block with all table offsets marked absent.
    #[must_use]
    pub fn new(block_size: BlockSize, compression_id: CompressorId, mod_time: u32) -> Self {
        Self {
            inode_count: 0,
            modification_time: mod_time,
            block_size: block_size.get(),
            fragment_count: 0,
            compression_id,
            block_log: block_size.log2(),
            flags: 0,
            id_count: 0,
            root_inode_ref: MetaRef(0),
            bytes_used: 0,
            id_table_start: TABLE_ABSENT,
            xattr_id_table_start: TABLE_ABSENT,
            inode_table_start: TABLE_ABSENT,
            directory_table_start: TABLE_ABSENT,
            fragment_table_start: TABLE_ABSENT,
            export_table_start: TABLE_ABSENT,
        }
    }

    /// Serialize to the exact 96-byte on-disk layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut out = Vec::with_capacity(SUPERBLOCK_SIZE);
        push_u32(&mut out, SQFS_MAGIC);
        push_u32(&mut out, self.inode_count);
        push_u32(&mut out, self.modification_time);
        push_u32(&mut out, self.block_size);
        push_u32(&mut out, self.fragment_count);
        push_u16(&mut out, self.compression_id as u16);
        push_u16(&mut out, self.block_log);
        push_u16(&mut out, self.flags);
        push_u16(&mut out, self.id_count);
        push_u16(&mut out, SQFS_VERSION_MAJOR);
        push_u16(&mut out, SQFS_VERSION_MINOR);
        push_u64(&mut out, self.root_inode_ref.0);
        push_u64(&mut out, self.bytes_used);
        push_u64(&mut out, self.id_table_start);
        push_u64(&mut out, self.xattr_id_table_start);
        push_u64(&mut out, self.inode_table_start);
        push_u64(&mut out, self.directory_table_start);
        push_u64(&mut out, self.fragment_table_start);
        push_u64(&mut out, self.export_table_start);
        debug_assert_eq!(out.len(), SUPERBLOCK_SIZE);
        let mut bytes = [0_u8; SUPERBLOCK_SIZE];
        bytes.copy_from_slice(&out);
        bytes
    }

    /// Parse and validate a super block from the first 96 bytes of an image.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(data, 0)?;
        if magic != SQFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SQFS_MAGIC),
                actual: u64::from(magic),
            });
        }

        let block_size = read_le_u32(data, 12)?;
        let block_log = read_le_u16(data, 22)?;
        let validated = BlockSize::new(block_size)?;
        if validated.log2() != block_log {
            return Err(ParseError::InvalidField {
                field: "block_log",
                reason: "does not match block_size",
            });
        }

        let version_major = read_le_u16(data, 28)?;
        let version_minor = read_le_u16(data, 30)?;
        if version_major != SQFS_VERSION_MAJOR || version_minor != SQFS_VERSION_MINOR {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "only format 4.0 is supported",
            });
        }

        Ok(Self {
            inode_count: read_le_u32(data, 4)?,
            modification_time: read_le_u32(data, 8)?,
            block_size,
            fragment_count: read_le_u32(data, 16)?,
            compression_id: CompressorId::from_u16(read_le_u16(data, 20)?)?,
            block_log,
            flags: read_le_u16(data, 24)?,
            id_count: read_le_u16(data, 26)?,
            root_inode_ref: MetaRef(read_le_u64(data, 32)?),
            bytes_used: read_le_u64(data, 40)?,
            id_table_start: read_le_u64(data, 48)?,
            xattr_id_table_start: read_le_u64(data, 56)?,
            inode_table_start: read_le_u64(data, 64)?,
            directory_table_start: read_le_u64(data, 72)?,
            fragment_table_start: read_le_u64(data, 80)?,
            export_table_start: read_le_u64(data, 88)?,
        })
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Little-endian byte helpers ──────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_i16(data: &[u8], offset: usize) -> Result<i16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn push_i16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

// ── Mode helpers ────────────────────────────────────────────────────────────

/// Map a POSIX mode to the basic inode kind for its file type.
pub fn inode_kind_for_mode(mode: u16) -> Result<u16, ParseError> {
    match mode & S_IFMT {
        S_IFDIR => Ok(INODE_DIR),
        S_IFREG => Ok(INODE_FILE),
        S_IFLNK => Ok(INODE_SLINK),
        S_IFBLK => Ok(INODE_BDEV),
        S_IFCHR => Ok(INODE_CDEV),
        S_IFIFO => Ok(INODE_FIFO),
        S_IFSOCK => Ok(INODE_SOCKET),
        _ => Err(ParseError::InvalidField {
            field: "mode",
            reason: "unknown file type bits",
        }),
    }
}

/// Pack a major/minor pair into the Linux device number encoding.
#[must_use]
pub fn pack_devno(major: u32, minor: u32) -> u32 {
    ((minor & 0xfff00) << 12) | ((major & 0xfff) << 8) | (minor & 0xff)
}

/// Split a raw `st_rdev` value into its major/minor pair.
#[must_use]
pub fn unpack_rdev(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & 0xffff_ff00);
    (major as u32, minor as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(read_le_u64(&bytes, 1).is_err());
    }

    #[test]
    fn push_helpers_round_trip() {
        let mut out = Vec::new();
        push_u16(&mut out, 0xBEEF);
        push_u32(&mut out, 0xDEAD_BEEF);
        push_u64(&mut out, 0x0123_4567_89AB_CDEF);
        assert_eq!(read_le_u16(&out, 0).unwrap(), 0xBEEF);
        assert_eq!(read_le_u32(&out, 2).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&out, 6).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(131_072).is_ok());
        assert!(BlockSize::new(1_048_576).is_ok());
        assert_eq!(BlockSize::new(131_072).unwrap().log2(), 17);

        // Not a power of two
        assert!(BlockSize::new(100_000).is_err());
        // Too small
        assert!(BlockSize::new(2048).is_err());
        // Too large
        assert!(BlockSize::new(2_097_152).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn meta_ref_packing() {
        let r = MetaRef::new(0x1234, 0x0042);
        assert_eq!(r.0, 0x1234_0042);
        assert_eq!(r.block_start(), 0x1234);
        assert_eq!(r.offset(), 0x42);
        assert_eq!(r.to_string(), "4660:66");
    }

    #[test]
    fn superblock_round_trip() {
        let bs = BlockSize::new(131_072).unwrap();
        let mut sb = Superblock::new(bs, CompressorId::Zstd, 1_234_567);
        sb.inode_count = 42;
        sb.flags = FLAG_DUPLICATES | FLAG_EXPORTABLE;
        sb.id_count = 3;
        sb.root_inode_ref = MetaRef::new(96, 17);
        sb.bytes_used = 8192;
        sb.inode_table_start = 96;

        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        assert_eq!(read_le_u32(&bytes, 0).unwrap(), SQFS_MAGIC);

        let parsed = Superblock::parse(&bytes).expect("parse");
        assert_eq!(parsed, sb);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let bs = BlockSize::new(4096).unwrap();
        let mut bytes = Superblock::new(bs, CompressorId::Gzip, 0).to_bytes();
        bytes[0] = 0;
        assert!(matches!(
            Superblock::parse(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_mismatched_block_log() {
        let bs = BlockSize::new(4096).unwrap();
        let mut bytes = Superblock::new(bs, CompressorId::Gzip, 0).to_bytes();
        // Corrupt block_log (offset 22)
        bytes[22] = 13;
        assert!(Superblock::parse(&bytes).is_err());
    }

    #[test]
    fn compressor_id_names() {
        for id in [
            CompressorId::Gzip,
            CompressorId::Lzma,
            CompressorId::Lzo,
            CompressorId::Xz,
            CompressorId::Lz4,
            CompressorId::Zstd,
        ] {
            assert_eq!(CompressorId::from_name(id.name()).unwrap(), id);
            assert_eq!(CompressorId::from_u16(id as u16).unwrap(), id);
        }
        assert_eq!(
            CompressorId::from_name("zlib").unwrap(),
            CompressorId::Gzip
        );
        assert!(CompressorId::from_name("brotli").is_err());
        assert!(CompressorId::from_u16(0).is_err());
        assert!(CompressorId::from_u16(7).is_err());
    }

    #[test]
    fn inode_kind_mapping() {
        assert_eq!(inode_kind_for_mode(S_IFDIR | 0o755).unwrap(), INODE_DIR);
        assert_eq!(inode_kind_for_mode(S_IFREG | 0o644).unwrap(), INODE_FILE);
        assert_eq!(inode_kind_for_mode(S_IFLNK | 0o777).unwrap(), INODE_SLINK);
        assert_eq!(inode_kind_for_mode(S_IFSOCK).unwrap(), INODE_SOCKET);
        assert!(inode_kind_for_mode(0o644).is_err());
    }

    #[test]
    fn devno_packing() {
        // Matches the Linux huge-dev encoding.
        assert_eq!(pack_devno(5, 1), (5 << 8) | 1);
        assert_eq!(pack_devno(8, 0x12345), ((0x12300) << 12) | (8 << 8) | 0x45);
    }

    #[test]
    fn rdev_round_trip() {
        // Classic 8-bit minor layout.
        assert_eq!(unpack_rdev((5 << 8) | 1), (5, 1));
        let packed = u64::from(pack_devno(8, 0x12345));
        // pack_devno produces the same layout the kernel reports in st_rdev
        // for devices that fit 12/20 bits.
        let (major, minor) = unpack_rdev(packed);
        assert_eq!((major, minor), (8, 0x12345));
    }
}
