//! Image assembly.
//!
//! Drives the global order of an image build: super block slot, compressor
//! options, data area, inode table, directory table (spooled through a temp
//! file while inodes stream out), fragment/export/id/xattr tables, final
//! padding, and the super block rewrite at offset zero.

use crate::inode::{assign_inode_numbers, write_inode};
use crate::tables::{
    export_table_payload, fragment_table_payload, id_table_payload, write_indirected_table,
};
use sqsh_block::{DataWriter, ImageFile, PackStats};
use sqsh_compress::{create_compressor, Compressor, CompressorConfig};
use sqsh_error::{Result, SqshError};
use sqsh_meta::MetaWriter;
use sqsh_tree::{IdTable, NodeData, NodeId, Tree};
use sqsh_types::{
    Superblock, DEFAULT_DEV_BLOCK_SIZE, FLAG_COMPRESSOR_OPTIONS, FLAG_DUPLICATES,
    FLAG_EXPORTABLE, FLAG_NO_XATTRS, META_BLOCK_UNCOMPRESSED, TABLE_ABSENT,
};
use sqsh_xattr::XattrWriter;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything the pipeline needs to know to build one image.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub compressor: CompressorConfig,
    pub dev_block_size: u32,
    pub num_jobs: usize,
    pub backlog: usize,
    pub exportable: bool,
    pub mod_time: u32,
    pub overwrite: bool,
}

impl BuildConfig {
    /// Defaults matching the command line: one job per CPU, a backlog of
    /// ten blocks per job, 4 KiB device blocks.
    #[must_use]
    pub fn new(compressor: CompressorConfig) -> Self {
        let num_jobs = std::thread::available_parallelism().map_or(1, usize::from);
        Self {
            compressor,
            dev_block_size: DEFAULT_DEV_BLOCK_SIZE,
            num_jobs,
            backlog: num_jobs * 10,
            exportable: false,
            mod_time: 0,
            overwrite: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.dev_block_size < 1024 {
            return Err(SqshError::ConfigInvalid(
                "device block size must be at least 1024".to_owned(),
            ));
        }
        if self.num_jobs == 0 || self.backlog == 0 {
            return Err(SqshError::ConfigInvalid(
                "job count and backlog must both be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Supplies regular-file content while the data area is packed.
pub trait ContentProvider {
    fn open(&mut self, tree: &Tree, node: NodeId) -> Result<Box<dyn Read>>;
}

/// Reads file content from the host paths recorded on the nodes.
#[derive(Debug, Default)]
pub struct FsContentProvider;

impl ContentProvider for FsContentProvider {
    fn open(&mut self, tree: &Tree, node: NodeId) -> Result<Box<dyn Read>> {
        let NodeData::File(file) = &tree.node(node).data else {
            return Err(SqshError::tree("content requested for a non-file node"));
        };
        match &file.source {
            Some(path) => Ok(Box::new(std::fs::File::open(path)?)),
            None if file.size == 0 => Ok(Box::new(std::io::empty())),
            None => Err(SqshError::tree(format!(
                "{} has no input location",
                tree.path_of(node)
            ))),
        }
    }
}

/// What a finished build reports back.
#[derive(Debug)]
pub struct BuildSummary {
    pub superblock: Superblock,
    pub stats: PackStats,
}

/// Build a complete image from a finalized tree.
pub fn build_image(
    tree: &mut Tree,
    config: &BuildConfig,
    output: &Path,
    provider: &mut dyn ContentProvider,
) -> Result<BuildSummary> {
    config.validate()?;
    let block_size = config.compressor.block_size;
    let compressor: Arc<dyn Compressor> = Arc::from(create_compressor(&config.compressor)?);

    let mut image = ImageFile::create(output, config.overwrite)?;
    let mut superblock = Superblock::new(block_size, config.compressor.id, config.mod_time);
    superblock.flags = FLAG_DUPLICATES;
    image.append(&superblock.to_bytes())?;

    if let Some(options) = compressor.options() {
        superblock.flags |= FLAG_COMPRESSOR_OPTIONS;
        let header = options.len() as u16 | META_BLOCK_UNCOMPRESSED;
        image.append(&header.to_le_bytes())?;
        image.append(&options)?;
    }

    // Data area: all file blocks and fragments, in pack order.
    let mut data_writer = DataWriter::new(
        image,
        Arc::clone(&compressor),
        block_size,
        config.num_jobs,
        config.backlog,
    )?;
    for node in tree.files_in_pack_order() {
        let mut reader = provider.open(tree, node)?;
        data_writer.pack_file(tree, node, &mut reader)?;
    }
    let output_data = data_writer.finish(tree)?;
    let mut image = output_data.image;
    let fragments = output_data.fragments;
    let stats = output_data.stats;

    // Metadata: inodes stream straight into the image; directory listings
    // spool through an unlinked temp file because they are produced while
    // inodes are still being written, but must land after the inode table.
    let inode_count = assign_inode_numbers(tree);
    let mut ids = IdTable::new();
    let mut xattrs = XattrWriter::new();

    let inode_table_start = image.position();
    let mut inode_writer = MetaWriter::new(image, Arc::clone(&compressor));
    let mut dir_writer = MetaWriter::new(tempfile::tempfile()?, Arc::clone(&compressor));

    for id in tree.serialization_order() {
        write_inode(
            tree,
            id,
            block_size.get(),
            &mut ids,
            &mut xattrs,
            &mut inode_writer,
            &mut dir_writer,
        )?;
    }

    let mut image = inode_writer.finish()?;
    let directory_table_start = image.position();
    let mut dir_spool = dir_writer.finish()?;
    dir_spool.seek(SeekFrom::Start(0))?;
    std::io::copy(&mut dir_spool, &mut image)?;
    drop(dir_spool);

    superblock.inode_count = inode_count;
    superblock.root_inode_ref = tree.node(tree.root()).inode_ref;
    superblock.inode_table_start = inode_table_start;
    superblock.directory_table_start = directory_table_start;

    superblock.fragment_count = fragments.len() as u32;
    superblock.fragment_table_start = if fragments.is_empty() {
        TABLE_ABSENT
    } else {
        write_indirected_table(&mut image, &compressor, &fragment_table_payload(&fragments))?
    };

    if config.exportable {
        superblock.flags |= FLAG_EXPORTABLE;
        let mut refs = vec![0_u64; inode_count as usize];
        for id in tree.serialization_order() {
            let node = tree.node(id);
            refs[node.inode_number as usize - 1] = node.inode_ref.0;
        }
        superblock.export_table_start =
            write_indirected_table(&mut image, &compressor, &export_table_payload(&refs))?;
    }

    superblock.id_count = ids.len() as u16;
    superblock.id_table_start =
        write_indirected_table(&mut image, &compressor, &id_table_payload(ids.ids()))?;

    if xattrs.is_empty() {
        superblock.flags |= FLAG_NO_XATTRS;
    } else {
        let (bytes, table_start) = xattrs.serialize(image.position(), &compressor)?;
        image.append(&bytes)?;
        superblock.xattr_id_table_start = table_start;
    }

    superblock.bytes_used = image.position();
    image.pad_to_multiple(config.dev_block_size)?;
    image.overwrite_start(&superblock.to_bytes())?;
    image.sync()?;

    info!(
        target: "sqsh::writer",
        event = "image_complete",
        path = %output.display(),
        inodes = inode_count,
        bytes_used = superblock.bytes_used,
        fragments = superblock.fragment_count
    );
    Ok(BuildSummary { superblock, stats })
}
