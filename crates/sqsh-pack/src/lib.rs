#![forbid(unsafe_code)]
//! Source ingestion: pack files and host directory trees.
//!
//! The pack-file format is the `gen_init_cpio` description grammar:
//! newline-separated entries (`file`, `dir`, `nod`, `slink`, `pipe`,
//! `sock`), `#` comment lines, quoted paths with backslash escapes. A
//! `file` entry without an explicit input location reads the image path
//! relative to the pack root.

mod packfile;
mod scan;

pub use packfile::{parse_defaults, parse_pack_file};
pub use scan::{scan_directory, ScanFlags};
