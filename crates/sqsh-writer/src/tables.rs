//! Indirected table emission.
//!
//! The fragment, export and id tables share one layout: the raw entry array
//! is packed into metadata blocks, and an uncompressed array of absolute
//! block locations follows. The super block points at the location array.

use sqsh_block::{FragmentEntry, ImageFile};
use sqsh_compress::Compressor;
use sqsh_error::Result;
use sqsh_meta::MetaWriter;
use sqsh_types::{push_u32, push_u64, read_le_u16, META_BLOCK_UNCOMPRESSED};
use std::sync::Arc;

/// Pack `payload` into meta blocks, append them to the image and append the
/// block-location array. Returns the offset of the location array, which is
/// what the super block stores.
pub fn write_indirected_table(
    image: &mut ImageFile,
    compressor: &Arc<dyn Compressor>,
    payload: &[u8],
) -> Result<u64> {
    let mut writer = MetaWriter::new(Vec::new(), Arc::clone(compressor));
    writer.append(payload)?;
    let stream = writer.finish()?;

    let base = image.position();
    let mut locations = Vec::new();
    let mut pos = 0_usize;
    while pos + 2 <= stream.len() {
        push_u64(&mut locations, base + pos as u64);
        let header = read_le_u16(&stream, pos).map_err(sqsh_error::SqshError::format)?;
        pos += 2 + usize::from(header & !META_BLOCK_UNCOMPRESSED);
    }

    image.append(&stream)?;
    let table_start = image.position();
    image.append(&locations)?;
    Ok(table_start)
}

/// Serialize the fragment table entries (start, size, unused padding).
#[must_use]
pub fn fragment_table_payload(entries: &[FragmentEntry]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(entries.len() * 16);
    for entry in entries {
        push_u64(&mut payload, entry.start);
        push_u32(&mut payload, entry.size_field);
        push_u32(&mut payload, 0);
    }
    payload
}

/// Serialize the id table entries.
#[must_use]
pub fn id_table_payload(ids: &[u32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ids.len() * 4);
    for &id in ids {
        push_u32(&mut payload, id);
    }
    payload
}

/// Serialize the export table: one inode reference per inode number,
/// starting at number 1.
#[must_use]
pub fn export_table_payload(refs: &[u64]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(refs.len() * 8);
    for &reference in refs {
        push_u64(&mut payload, reference);
    }
    payload
}
