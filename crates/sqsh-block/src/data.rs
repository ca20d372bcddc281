//! Per-file data packing: the serial writer side of the pipeline.
//!
//! `DataWriter` owns the image file, the dedup index and the fragment
//! packer, submits file blocks to the parallel processor, and applies every
//! completed block in emission order: compute the content hash, write the
//! bytes, record the location on the owning node, and — when a file's block
//! run completes — drop the run again if an identical one already exists
//! earlier in the data area.
//!
//! The dedup index and the image offset are touched only here, on the
//! submitting thread.

use crate::fragment::{FragmentEntry, FragmentPacker, FullFragmentBlock};
use crate::image::ImageFile;
use crate::processor::{is_zero_block, BlockProcessor, BlockTag, CompletedBlock};
use sqsh_compress::Compressor;
use sqsh_error::{Result, SqshError};
use sqsh_tree::{NodeData, NodeId, Tree};
use sqsh_types::{BlockSize, DATA_BLOCK_UNCOMPRESSED};
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

/// Counters the pipeline exposes for progress reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackStats {
    pub files_packed: u64,
    pub blocks_written: u64,
    pub blocks_deduped: u64,
    pub sparse_blocks: u64,
    pub fragment_blocks: u64,
    pub tails_packed: u64,
    pub tails_deduped: u64,
    pub bytes_written: u64,
}

/// Everything the assembler needs once the data area is complete.
pub struct DataOutput {
    pub image: ImageFile,
    pub fragments: Vec<FragmentEntry>,
    pub stats: PackStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    crc: u32,
    size_field: u32,
}

struct EmittedBlock {
    key: BlockKey,
    offset: u64,
    /// Whether this block inserted its key into the dedup index (first
    /// occurrence); removal on truncation must drop the index entry too.
    owns_index: bool,
}

#[derive(Default)]
struct FileRun {
    /// Position in the emitted-block list of the file's first block.
    emitted_start: Option<usize>,
    has_sparse: bool,
}

pub struct DataWriter {
    processor: BlockProcessor,
    packer: FragmentPacker,
    image: ImageFile,
    block_size: usize,
    dedup: HashMap<BlockKey, u64>,
    emitted: Vec<EmittedBlock>,
    fragments: Vec<FragmentEntry>,
    runs: HashMap<NodeId, FileRun>,
    stats: PackStats,
}

impl DataWriter {
    pub fn new(
        image: ImageFile,
        compressor: Arc<dyn Compressor>,
        block_size: BlockSize,
        num_jobs: usize,
        backlog: usize,
    ) -> Result<Self> {
        Ok(Self {
            processor: BlockProcessor::new(num_jobs, backlog, compressor)?,
            packer: FragmentPacker::new(block_size.get()),
            image,
            block_size: block_size.get() as usize,
            dedup: HashMap::new(),
            emitted: Vec::new(),
            fragments: Vec::new(),
            runs: HashMap::new(),
            stats: PackStats::default(),
        })
    }

    #[must_use]
    pub fn stats(&self) -> PackStats {
        self.stats
    }

    /// Pack one regular file's content. `source` must yield exactly the
    /// size recorded on the node.
    pub fn pack_file<R: Read>(
        &mut self,
        tree: &mut Tree,
        node: NodeId,
        source: &mut R,
    ) -> Result<()> {
        let size = match &tree.node(node).data {
            NodeData::File(file) => file.size,
            _ => {
                return Err(SqshError::tree(format!(
                    "{} is not a regular file",
                    tree.path_of(node)
                )));
            }
        };

        let block_size = self.block_size as u64;
        let full_blocks = size / block_size;
        let tail_len = (size % block_size) as usize;

        for index in 0..full_blocks {
            let mut block = vec![0_u8; self.block_size];
            read_exact_or_truncated(source, &mut block, tree.path_of(node))?;

            if is_zero_block(&block) {
                self.record_sparse_block(tree, node, index as u32);
                continue;
            }

            let tag = BlockTag::File {
                node,
                index: index as u32,
                last: index + 1 == full_blocks,
            };
            let ready = self.processor.submit(tag, block)?;
            self.apply_all(tree, ready)?;
        }

        if tail_len > 0 {
            let mut tail = vec![0_u8; tail_len];
            read_exact_or_truncated(source, &mut tail, tree.path_of(node))?;
            self.pack_tail(tree, node, &tail)?;
        }

        self.stats.files_packed += 1;
        debug!(
            target: "sqsh::data",
            event = "file_packed",
            path = %tree.path_of(node),
            size = size,
            blocks = full_blocks,
            tail = tail_len
        );
        Ok(())
    }

    /// Flush the partial fragment block, drain the processor and hand the
    /// image back for table writing.
    pub fn finish(mut self, tree: &mut Tree) -> Result<DataOutput> {
        if let Some(block) = self.packer.flush() {
            self.submit_fragment(tree, block)?;
        }
        let remaining = self.processor.finish()?;
        self.apply_all(tree, remaining)?;

        let expected = self.packer.block_count() as usize;
        if self.fragments.len() != expected {
            return Err(SqshError::format(format!(
                "{} fragment blocks packed but {} table entries emitted",
                expected,
                self.fragments.len()
            )));
        }

        info!(
            target: "sqsh::data",
            event = "data_area_complete",
            files = self.stats.files_packed,
            blocks = self.stats.blocks_written,
            deduped = self.stats.blocks_deduped,
            bytes = self.stats.bytes_written
        );
        Ok(DataOutput {
            image: self.image,
            fragments: self.fragments,
            stats: self.stats,
        })
    }

    fn record_sparse_block(&mut self, tree: &mut Tree, node: NodeId, index: u32) {
        self.runs.entry(node).or_default().has_sparse = true;
        set_block_size(tree, node, index, 0);
        self.stats.sparse_blocks += 1;
    }

    fn pack_tail(&mut self, tree: &mut Tree, node: NodeId, tail: &[u8]) -> Result<()> {
        let crc = crc32c::crc32c(tail);
        let reference = match self.packer.find_tail(crc, tail.len()) {
            Some(existing) => {
                self.stats.tails_deduped += 1;
                existing
            }
            None => {
                let (reference, full) = self.packer.add_tail(crc, tail);
                if let Some(block) = full {
                    self.submit_fragment(tree, block)?;
                }
                self.stats.tails_packed += 1;
                reference
            }
        };

        let NodeData::File(file) = &mut tree.node_mut(node).data else {
            return Err(SqshError::tree("tail owner is not a regular file"));
        };
        file.fragment = Some(reference);
        Ok(())
    }

    fn submit_fragment(&mut self, tree: &mut Tree, block: FullFragmentBlock) -> Result<()> {
        let tag = BlockTag::Fragment { index: block.index };
        let ready = self.processor.submit(tag, block.data)?;
        self.apply_all(tree, ready)
    }

    fn apply_all(&mut self, tree: &mut Tree, blocks: Vec<CompletedBlock>) -> Result<()> {
        for block in blocks {
            self.apply(tree, block)?;
        }
        Ok(())
    }

    /// The writer step of the pipeline: hash, dedup, write, record.
    fn apply(&mut self, tree: &mut Tree, block: CompletedBlock) -> Result<()> {
        let key = BlockKey {
            crc: crc32c::crc32c(&block.data),
            size_field: block.size_field,
        };

        match block.tag {
            BlockTag::File { node, index, last } => {
                let offset = self.image.append(&block.data)?;
                self.stats.blocks_written += 1;
                self.stats.bytes_written += block.data.len() as u64;

                let run = self.runs.entry(node).or_default();
                let first_of_run = run.emitted_start.is_none();
                if first_of_run {
                    run.emitted_start = Some(self.emitted.len());
                }

                let owns_index = !self.dedup.contains_key(&key);
                if owns_index {
                    self.dedup.insert(key, offset);
                }
                self.emitted.push(EmittedBlock {
                    key,
                    offset,
                    owns_index,
                });

                {
                    let NodeData::File(file) = &mut tree.node_mut(node).data else {
                        return Err(SqshError::tree("block owner is not a regular file"));
                    };
                    if first_of_run {
                        file.start_block = offset;
                    }
                }
                set_block_size(tree, node, index, block.size_field);

                if last {
                    self.complete_run(tree, node)?;
                }
            }
            BlockTag::Fragment { index } => {
                let entry = if let Some(&existing) = self.dedup.get(&key) {
                    self.stats.blocks_deduped += 1;
                    FragmentEntry {
                        start: existing,
                        size_field: block.size_field,
                    }
                } else {
                    let offset = self.image.append(&block.data)?;
                    self.stats.blocks_written += 1;
                    self.stats.bytes_written += block.data.len() as u64;
                    self.dedup.insert(key, offset);
                    self.emitted.push(EmittedBlock {
                        key,
                        offset,
                        owns_index: true,
                    });
                    FragmentEntry {
                        start: offset,
                        size_field: block.size_field,
                    }
                };

                let slot = index as usize;
                if self.fragments.len() <= slot {
                    self.fragments
                        .resize(slot + 1, FragmentEntry::default());
                }
                self.fragments[slot] = entry;
                self.stats.fragment_blocks += 1;
            }
        }
        Ok(())
    }

    /// A file's final full block just landed: if an identical block run
    /// exists earlier in the data area, cut this one off the image tail and
    /// point the file at the earlier copy.
    fn complete_run(&mut self, tree: &mut Tree, node: NodeId) -> Result<()> {
        let run = self.runs.entry(node).or_default();
        if run.has_sparse {
            return Ok(());
        }
        let Some(start) = run.emitted_start else {
            return Ok(());
        };

        let run_len = self.emitted.len() - start;
        if run_len == 0 || start < run_len {
            return Ok(());
        }

        let matched = {
            let (earlier, run_blocks) = self.emitted.split_at(start);
            earlier
                .windows(run_len)
                .position(|window| {
                    window
                        .iter()
                        .zip(run_blocks)
                        .all(|(a, b)| a.key == b.key)
                })
        };
        let Some(found) = matched else {
            return Ok(());
        };

        let new_start = self.emitted[found].offset;
        let truncate_at = self.emitted[start].offset;
        self.image.truncate_to(truncate_at)?;
        for dropped in self.emitted.drain(start..) {
            if dropped.owns_index {
                self.dedup.remove(&dropped.key);
            }
            self.stats.blocks_written -= 1;
            self.stats.blocks_deduped += 1;
            self.stats.bytes_written -=
                u64::from(dropped.key.size_field & !DATA_BLOCK_UNCOMPRESSED);
        }

        let NodeData::File(file) = &mut tree.node_mut(node).data else {
            return Err(SqshError::tree("dedup target is not a regular file"));
        };
        file.start_block = new_start;
        debug!(
            target: "sqsh::data",
            event = "run_deduped",
            path = %tree.path_of(node),
            blocks = run_len,
            start = new_start
        );
        Ok(())
    }
}

fn set_block_size(tree: &mut Tree, node: NodeId, index: u32, size_field: u32) {
    let NodeData::File(file) = &mut tree.node_mut(node).data else {
        return;
    };
    let slot = index as usize;
    if file.block_sizes.len() <= slot {
        file.block_sizes.resize(slot + 1, 0);
    }
    file.block_sizes[slot] = size_field;
}

fn read_exact_or_truncated<R: Read>(source: &mut R, buf: &mut [u8], path: String) -> Result<()> {
    source.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            SqshError::format(format!("{path}: input shrank while packing"))
        } else {
            SqshError::Io(err)
        }
    })
}
