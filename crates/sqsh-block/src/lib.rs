#![forbid(unsafe_code)]
//! Data-area production: image output file, parallel block compression and
//! fragment packing.
//!
//! The [`DataWriter`] is the only entry point most callers need. It drives
//! the [`BlockProcessor`] (bounded-concurrency compression with strictly
//! in-order emission), the [`FragmentPacker`] (tail packing), the dedup
//! index, and records block locations back onto the owning tree nodes.

mod data;
mod fragment;
mod image;
mod processor;

pub use data::{DataOutput, DataWriter, PackStats};
pub use fragment::{FragmentEntry, FragmentPacker};
pub use image::ImageFile;
pub use processor::{is_zero_block, BlockProcessor, BlockTag, CompletedBlock};
