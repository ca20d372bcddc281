#![forbid(unsafe_code)]
//! Build-and-read-back test harness.
//!
//! Helpers for staging source trees in a temp directory, building real
//! images through the writer pipeline and comparing what the reader sees
//! against what went in. The actual scenarios live in `tests/`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sqsh_compress::CompressorConfig;
use sqsh_error::Result;
use sqsh_reader::Image;
use sqsh_tree::{Defaults, FileData, NodeData, NodeSpec, Tree};
use sqsh_types::{BlockSize, CompressorId};
use sqsh_writer::{build_image, BuildConfig, BuildSummary, FsContentProvider};
use std::path::{Path, PathBuf};

/// Data block size used by the harness unless a scenario says otherwise.
/// Small enough that multi-block files stay cheap to generate.
pub const TEST_BLOCK_SIZE: u32 = 131_072;

/// A staging area holding source files and the built image.
pub struct Workbench {
    dir: tempfile::TempDir,
    pub tree: Tree,
    counter: u32,
}

impl Workbench {
    pub fn new() -> Self {
        Self::with_defaults(Defaults::default())
    }

    pub fn with_defaults(defaults: Defaults) -> Self {
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
            tree: Tree::new(defaults),
            counter: 0,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Stage `content` in the temp dir and insert a file node for it.
    pub fn add_file(&mut self, image_path: &str, content: &[u8]) -> Result<()> {
        self.add_file_with(image_path, content, 0o644, 0, 0, Vec::new())
    }

    /// `add_file` with explicit attributes and xattrs.
    pub fn add_file_with(
        &mut self,
        image_path: &str,
        content: &[u8],
        permissions: u16,
        uid: u32,
        gid: u32,
        xattrs: Vec<(String, Vec<u8>)>,
    ) -> Result<()> {
        self.counter += 1;
        let source = self.dir.path().join(format!("input-{:04}", self.counter));
        std::fs::write(&source, content)?;
        self.tree.insert(
            image_path,
            NodeSpec {
                permissions,
                uid,
                gid,
                mtime: 0,
                xattrs,
                data: NodeData::File(FileData {
                    size: content.len() as u64,
                    source: Some(source),
                    ..FileData::default()
                }),
            },
        )?;
        Ok(())
    }

    pub fn add_node(&mut self, image_path: &str, spec: NodeSpec) -> Result<()> {
        self.tree.insert(image_path, spec)?;
        Ok(())
    }

    /// Build the image with default settings and open it back up.
    pub fn build(&mut self) -> Result<(Image, BuildSummary)> {
        self.build_with(default_config())
    }

    /// Build with a custom configuration and open the result.
    pub fn build_with(&mut self, config: BuildConfig) -> Result<(Image, BuildSummary)> {
        let (path, summary) = self.build_to_path(&config, "image.sqsh")?;
        Ok((Image::open(&path)?, summary))
    }

    /// Build to a named file inside the workbench, returning its path.
    pub fn build_to_path(
        &mut self,
        config: &BuildConfig,
        name: &str,
    ) -> Result<(PathBuf, BuildSummary)> {
        let output = self.dir.path().join(name);
        let summary = build_image(&mut self.tree, config, &output, &mut FsContentProvider)?;
        Ok((output, summary))
    }
}

impl Default for Workbench {
    fn default() -> Self {
        Self::new()
    }
}

/// The harness default build configuration: deterministic (mtime 0, one
/// fixed job count) and zstd-compressed.
#[must_use]
pub fn default_config() -> BuildConfig {
    config_with(CompressorId::Zstd, TEST_BLOCK_SIZE)
}

#[must_use]
pub fn config_with(id: CompressorId, block_size: u32) -> BuildConfig {
    let compressor =
        CompressorConfig::new(id, BlockSize::new(block_size).expect("valid block size"));
    let mut config = BuildConfig::new(compressor);
    config.num_jobs = 4;
    config.backlog = 40;
    config.overwrite = true;
    config
}

/// Deterministic pseudo-random content: seeded, so identical across runs.
#[must_use]
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0_u8; len];
    rng.fill(&mut data[..]);
    data
}

/// A directory node spec with the given permissions.
#[must_use]
pub fn dir_spec(permissions: u16, uid: u32, gid: u32) -> NodeSpec {
    NodeSpec {
        permissions,
        uid,
        gid,
        mtime: 0,
        xattrs: Vec::new(),
        data: NodeData::empty_dir(),
    }
}
