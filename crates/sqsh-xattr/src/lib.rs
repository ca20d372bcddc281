#![forbid(unsafe_code)]
//! Extended attribute tables.
//!
//! SquashFS stores xattrs through three levels of indirection: the key-value
//! pairs of every inode that has attributes are packed into metadata blocks,
//! a descriptor array locates each inode's run of pairs, and a raw location
//! table (pointed to by the super block) locates both.
//!
//! Key prefixes are cut off and stored as an integer: `user.` = 0,
//! `trusted.` = 1, `security.` = 2. Whole key-value *sets* are deduplicated
//! across inodes, so identical SELinux labelling costs one descriptor. A
//! value longer than 65535 bytes is written once; later occurrences store an
//! out-of-line reference to the first copy instead of repeating it.

use sqsh_compress::Compressor;
use sqsh_error::{Result, SqshError};
use sqsh_meta::MetaWriter;
use sqsh_types::{
    push_u16, push_u32, push_u64, read_le_u16, MetaRef, META_BLOCK_UNCOMPRESSED,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Key prefix enumerators.
pub const PREFIX_USER: u16 = 0;
pub const PREFIX_TRUSTED: u16 = 1;
pub const PREFIX_SECURITY: u16 = 2;

/// ORed into a key's prefix field when its value is stored out of line.
pub const PREFIX_FLAG_OOL: u16 = 0x0100;

/// Mask extracting the prefix enumerator from a key's type field.
pub const PREFIX_MASK: u16 = 0x00FF;

/// Values longer than this are stored once and referenced out-of-line by
/// later occurrences.
pub const OOL_VALUE_THRESHOLD: usize = 65535;

/// One normalized key-value pair: `(prefix enumerator, suffix, value)`.
pub type XattrPair = (u16, String, Vec<u8>);

/// Split a full key (`security.selinux`) into its prefix enumerator and
/// suffix. Unknown prefixes are rejected; use [`prefix_is_supported`] to
/// filter beforehand.
pub fn normalize_key(key: &str) -> Result<(u16, String)> {
    for (prefix, id) in [
        ("user.", PREFIX_USER),
        ("trusted.", PREFIX_TRUSTED),
        ("security.", PREFIX_SECURITY),
    ] {
        if let Some(suffix) = key.strip_prefix(prefix) {
            if suffix.is_empty() {
                return Err(SqshError::format(format!(
                    "xattr key '{key}' has an empty suffix"
                )));
            }
            if suffix.len() > usize::from(u16::MAX) {
                return Err(SqshError::Overflow {
                    field: "xattr_name_size",
                });
            }
            return Ok((id, suffix.to_owned()));
        }
    }
    Err(SqshError::format(format!(
        "xattr key '{key}' is not in a supported namespace"
    )))
}

/// Whether a full key lives in a namespace SquashFS can encode.
#[must_use]
pub fn prefix_is_supported(key: &str) -> bool {
    key.strip_prefix("user.")
        .or_else(|| key.strip_prefix("trusted."))
        .or_else(|| key.strip_prefix("security."))
        .is_some_and(|suffix| !suffix.is_empty())
}

/// Collects and deduplicates the xattr sets of all nodes, then emits the
/// three on-disk tables.
#[derive(Default)]
pub struct XattrWriter {
    sets: Vec<Vec<XattrPair>>,
    index: HashMap<Vec<XattrPair>, u32>,
}

impl XattrWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no node carried any attributes, in which case no tables
    /// are written and the super block gets `NO_XATTRS`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Number of unique sets interned so far.
    #[must_use]
    pub fn set_count(&self) -> u32 {
        self.sets.len() as u32
    }

    /// Intern one node's key-value set, returning its xattr id. An empty
    /// set yields `None`. Sets are canonicalized (sorted by prefix, suffix,
    /// value) so identical sets intern identically regardless of source
    /// order.
    pub fn intern(&mut self, pairs: &[(String, Vec<u8>)]) -> Result<Option<u32>> {
        if pairs.is_empty() {
            return Ok(None);
        }

        let mut normalized: Vec<XattrPair> = pairs
            .iter()
            .map(|(key, value)| {
                let (prefix, suffix) = normalize_key(key)?;
                if value.len() > u32::MAX as usize {
                    return Err(SqshError::Overflow {
                        field: "xattr_value_size",
                    });
                }
                Ok((prefix, suffix, value.clone()))
            })
            .collect::<Result<_>>()?;
        normalized.sort();

        if let Some(&id) = self.index.get(&normalized) {
            return Ok(Some(id));
        }
        let id = self.sets.len() as u32;
        self.sets.push(normalized.clone());
        self.index.insert(normalized, id);
        Ok(Some(id))
    }

    /// Emit the key-value stream, descriptor stream and location table.
    ///
    /// `base` is the image offset the returned bytes will be appended at.
    /// Returns the serialized tables and the `xattr_id_table_start` value
    /// for the super block.
    pub fn serialize(&self, base: u64, compressor: &Arc<dyn Compressor>) -> Result<(Vec<u8>, u64)> {
        let mut descriptors = Vec::with_capacity(self.sets.len());

        // Pass one: the key-value stream. First occurrences of large values
        // are remembered so later sets can reference them out of line.
        let mut kv_writer = MetaWriter::new(Vec::new(), Arc::clone(compressor));
        let mut value_locations: HashMap<&[u8], MetaRef> = HashMap::new();

        for set in &self.sets {
            let start = kv_writer.cursor();
            let mut size = 0_u64;

            for (prefix, suffix, value) in set {
                let previous = value_locations.get(value.as_slice()).copied();
                let out_of_line =
                    previous.is_some() && value.len() > OOL_VALUE_THRESHOLD;

                let mut entry = Vec::with_capacity(4 + suffix.len());
                let type_field = if out_of_line {
                    prefix | PREFIX_FLAG_OOL
                } else {
                    *prefix
                };
                push_u16(&mut entry, type_field);
                push_u16(&mut entry, suffix.len() as u16);
                entry.extend_from_slice(suffix.as_bytes());
                kv_writer.append(&entry)?;
                size += entry.len() as u64;

                let mut value_entry = Vec::with_capacity(4 + value.len().min(12));
                if let Some(reference) = previous.filter(|_| out_of_line) {
                    push_u32(&mut value_entry, 8);
                    push_u64(&mut value_entry, reference.0);
                } else {
                    if previous.is_none() {
                        value_locations.insert(value.as_slice(), kv_writer.cursor());
                    }
                    push_u32(&mut value_entry, value.len() as u32);
                    value_entry.extend_from_slice(value);
                }
                kv_writer.append(&value_entry)?;
                size += value_entry.len() as u64;
            }

            descriptors.push((start, set.len() as u32, size));
        }
        let kv_bytes = kv_writer.finish()?;

        // Pass two: the descriptor stream.
        let mut desc_writer = MetaWriter::new(Vec::new(), Arc::clone(compressor));
        for (reference, count, size) in &descriptors {
            let mut record = Vec::with_capacity(16);
            push_u64(&mut record, reference.0);
            push_u32(&mut record, *count);
            push_u32(
                &mut record,
                u32::try_from(*size).map_err(|_| SqshError::Overflow {
                    field: "xattr_set_size",
                })?,
            );
            desc_writer.append(&record)?;
        }
        let desc_bytes = desc_writer.finish()?;

        // Location table: kv stream start, descriptor count, then the
        // absolute offsets of the descriptor meta blocks.
        let desc_base = base + kv_bytes.len() as u64;
        let starts = framed_block_starts(&desc_bytes, desc_base);
        let mut out = kv_bytes;
        out.extend_from_slice(&desc_bytes);

        let table_start = base + out.len() as u64;
        let mut table = Vec::with_capacity(16 + starts.len() * 8);
        push_u64(&mut table, base);
        push_u32(&mut table, self.set_count());
        push_u32(&mut table, 0);
        for start in starts {
            push_u64(&mut table, start);
        }
        out.extend_from_slice(&table);

        debug!(
            target: "sqsh::xattr",
            event = "tables_written",
            sets = self.sets.len(),
            kv_bytes = desc_base - base,
            table_start = table_start
        );
        Ok((out, table_start))
    }
}

/// Absolute start offsets of each framed meta block in `stream`, given the
/// absolute offset the stream begins at.
fn framed_block_starts(stream: &[u8], base: u64) -> Vec<u64> {
    let mut starts = Vec::new();
    let mut pos = 0_usize;
    while pos + 2 <= stream.len() {
        starts.push(base + pos as u64);
        let Ok(header) = read_le_u16(stream, pos) else {
            break;
        };
        pos += 2 + usize::from(header & !META_BLOCK_UNCOMPRESSED);
    }
    starts
}
