#![forbid(unsafe_code)]
//! Inode and directory serialization plus image assembly.
//!
//! [`build_image`] is the whole-pipeline entry point: it takes a finalized
//! tree, packs the data area, serializes the metadata streams and writes
//! every auxiliary table the super block points at.

mod assembler;
mod dir;
mod inode;
mod tables;

pub use assembler::{
    build_image, BuildConfig, BuildSummary, ContentProvider, FsContentProvider,
};
pub use dir::write_directory;
pub use inode::{assign_inode_numbers, write_inode};
pub use tables::{
    export_table_payload, fragment_table_payload, id_table_payload, write_indirected_table,
};
