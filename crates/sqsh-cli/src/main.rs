#![forbid(unsafe_code)]
//! `mksqsh` — build a SquashFS image from a directory tree or a
//! `gen_init_cpio` style pack file.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sqsh_compress::CompressorConfig;
use sqsh_pack::{parse_defaults, parse_pack_file, scan_directory, ScanFlags};
use sqsh_tree::{Defaults, Tree};
use sqsh_types::{BlockSize, CompressorId, DEFAULT_BLOCK_SIZE, DEFAULT_DEV_BLOCK_SIZE};
use sqsh_writer::{build_image, BuildConfig, FsContentProvider};
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "mksqsh",
    about = "Pack a directory or pack-file description into a SquashFS image",
    version
)]
struct Cli {
    /// Output image file.
    output: PathBuf,

    /// Use a `gen_init_cpio` style description file. Input paths are
    /// relative to --pack-dir if given, otherwise to the description
    /// file's directory.
    #[arg(short = 'F', long)]
    pack_file: Option<PathBuf>,

    /// Pack the contents of this directory; with --pack-file, the root
    /// input paths are resolved against instead.
    #[arg(short = 'D', long)]
    pack_dir: Option<PathBuf>,

    /// Compressor to use (gzip, lzma, lzo, xz, lz4, zstd).
    #[arg(short = 'c', long, default_value = "gzip")]
    compressor: String,

    /// Comma separated list of extra compressor options (key=value).
    #[arg(short = 'X', long)]
    comp_extra: Option<String>,

    /// Data block size in bytes (power of two, 4 KiB to 1 MiB).
    #[arg(short = 'b', long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Device block size to pad the image to.
    #[arg(short = 'B', long, default_value_t = DEFAULT_DEV_BLOCK_SIZE)]
    dev_block_size: u32,

    /// Number of compressor jobs.
    #[arg(short = 'j', long)]
    num_jobs: Option<usize>,

    /// Maximum number of blocks in flight before the packer waits for the
    /// compressors to catch up. Defaults to ten times the job count.
    #[arg(short = 'Q', long)]
    queue_backlog: Option<usize>,

    /// Comma separated default attributes for implicitly created
    /// directories (uid=, gid=, mode=, mtime=).
    #[arg(short = 'd', long)]
    defaults: Option<String>,

    /// With --pack-dir, keep the timestamps of the input files.
    #[arg(short = 'k', long)]
    keep_time: bool,

    /// With --pack-dir, read and pack extended attributes.
    #[arg(short = 'x', long)]
    keep_xattr: bool,

    /// With --pack-dir, stay on one file system.
    #[arg(short = 'o', long)]
    one_file_system: bool,

    /// Generate an export table for NFS support.
    #[arg(short = 'e', long)]
    exportable: bool,

    /// Overwrite the output file if it exists.
    #[arg(short = 'f', long)]
    force: bool,

    /// Do not print progress reports.
    #[arg(short = 'q', long)]
    quiet: bool,
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.pack_file.is_none() && cli.pack_dir.is_none() {
        bail!("no input: pass --pack-file and/or --pack-dir");
    }

    let defaults = match &cli.defaults {
        Some(spec) => parse_defaults(spec).context("parsing --defaults")?,
        None => Defaults::default(),
    };

    let id = CompressorId::from_name(&cli.compressor)
        .map_err(|_| anyhow::anyhow!("unsupported compressor '{}'", cli.compressor))?;
    let block_size = BlockSize::new(cli.block_size)
        .map_err(|err| anyhow::anyhow!("invalid --block-size: {err}"))?;
    let mut compressor = CompressorConfig::new(id, block_size);
    if let Some(extra) = &cli.comp_extra {
        compressor
            .apply_extra(extra)
            .context("parsing --comp-extra")?;
    }

    let mut tree = Tree::new(defaults);
    if let Some(pack_file) = &cli.pack_file {
        let content = std::fs::read_to_string(pack_file)
            .with_context(|| format!("reading {}", pack_file.display()))?;
        let pack_root = match &cli.pack_dir {
            Some(dir) => dir.clone(),
            None => pack_file
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        parse_pack_file(&content, &pack_root, &mut tree)
            .with_context(|| format!("parsing {}", pack_file.display()))?;
    } else if let Some(pack_dir) = &cli.pack_dir {
        scan_directory(
            pack_dir,
            &mut tree,
            &defaults,
            ScanFlags {
                keep_time: cli.keep_time,
                keep_xattr: cli.keep_xattr,
                one_file_system: cli.one_file_system,
            },
        )
        .with_context(|| format!("scanning {}", pack_dir.display()))?;
    }

    let mut config = BuildConfig::new(compressor);
    config.dev_block_size = cli.dev_block_size;
    config.exportable = cli.exportable;
    config.overwrite = cli.force;
    config.mod_time = defaults.mtime;
    if let Some(jobs) = cli.num_jobs {
        config.num_jobs = jobs.max(1);
        config.backlog = config.num_jobs * 10;
    }
    if let Some(backlog) = cli.queue_backlog {
        config.backlog = backlog.max(1);
    }

    let summary = build_image(&mut tree, &config, &cli.output, &mut FsContentProvider)
        .with_context(|| format!("writing {}", cli.output.display()))?;

    if !cli.quiet {
        let stats = summary.stats;
        eprintln!(
            "{}: {} inodes, {} data blocks ({} deduplicated, {} sparse), \
             {} fragment blocks, {} bytes",
            cli.output.display(),
            summary.superblock.inode_count,
            stats.blocks_written,
            stats.blocks_deduped,
            stats.sparse_blocks,
            summary.superblock.fragment_count,
            summary.superblock.bytes_used
        );
    }
    Ok(())
}
