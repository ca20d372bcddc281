//! Parallel block compression with strictly ordered emission.
//!
//! A fixed pool of worker threads shares two queues under one mutex: `todo`
//! (FIFO, by submission sequence) and `done` (keyed by sequence number). The
//! submitting thread doubles as the drain: every [`BlockProcessor::submit`]
//! first collects whatever prefix of `done` is contiguous with the next
//! expected sequence number, so completed blocks come back in exactly the
//! order they went in, no matter how the workers finish.
//!
//! The submitter parks on the `done` condition variable while
//! `|todo| + |done|` is at the backlog limit; workers park on the `todo`
//! condition variable while idle. An error in any worker poisons the
//! processor: the first caller to observe it receives the original error,
//! later callers get `Cancelled`.

use sqsh_compress::Compressor;
use sqsh_error::{Result, SqshError};
use sqsh_tree::NodeId;
use sqsh_types::DATA_BLOCK_UNCOMPRESSED;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// What a submitted block belongs to; carried through compression untouched
/// and handed back with the completed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// A full data block of a regular file.
    File {
        node: NodeId,
        /// Index within the file's block-sizes array.
        index: u32,
        /// This is the file's final full block; emission of it completes
        /// the file's block run.
        last: bool,
    },
    /// A packed fragment block.
    Fragment { index: u32 },
}

/// A block that has been through a worker, in emission order.
#[derive(Debug)]
pub struct CompletedBlock {
    pub seq: u64,
    pub tag: BlockTag,
    /// Bytes to place in the data area (compressed, or the original input
    /// when compression did not shrink it).
    pub data: Vec<u8>,
    /// On-disk size field: length, with the uncompressed flag bit when the
    /// original bytes are stored.
    pub size_field: u32,
}

struct Job {
    seq: u64,
    tag: BlockTag,
    data: Vec<u8>,
}

enum Poison {
    Clear,
    /// An error occurred and has not been reported yet.
    Armed(SqshError),
    /// The original error was handed to a caller; the queues stay dead.
    Tripped,
}

struct State {
    todo: VecDeque<Job>,
    done: BTreeMap<u64, CompletedBlock>,
    next_emit: u64,
    shutdown: bool,
    poison: Poison,
}

impl State {
    fn broken(&self) -> bool {
        !matches!(self.poison, Poison::Clear)
    }

    fn take_error(&mut self) -> SqshError {
        match std::mem::replace(&mut self.poison, Poison::Tripped) {
            Poison::Armed(err) => err,
            _ => SqshError::Cancelled,
        }
    }
}

struct Shared {
    state: Mutex<State>,
    todo_cv: Condvar,
    done_cv: Condvar,
    backlog: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded-concurrency compress engine. See the module docs for the model.
pub struct BlockProcessor {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    next_seq: u64,
}

impl BlockProcessor {
    /// Spawn `num_jobs` compression workers sharing `compressor`, with a
    /// submission backlog of `backlog` blocks.
    pub fn new(
        num_jobs: usize,
        backlog: usize,
        compressor: Arc<dyn Compressor>,
    ) -> Result<Self> {
        if num_jobs == 0 || backlog == 0 {
            return Err(SqshError::ConfigInvalid(
                "job count and backlog must both be at least 1".to_owned(),
            ));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                todo: VecDeque::new(),
                done: BTreeMap::new(),
                next_emit: 0,
                shutdown: false,
                poison: Poison::Clear,
            }),
            todo_cv: Condvar::new(),
            done_cv: Condvar::new(),
            backlog,
        });

        let workers = (0..num_jobs)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let compressor = Arc::clone(&compressor);
                std::thread::Builder::new()
                    .name(format!("sqsh-block-{worker}"))
                    .spawn(move || worker_loop(&shared, compressor.as_ref()))
                    .map_err(SqshError::Io)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            target: "sqsh::block",
            event = "pool_start",
            jobs = num_jobs,
            backlog = backlog
        );
        Ok(Self {
            shared,
            workers,
            next_seq: 0,
        })
    }

    /// Queue one block for compression.
    ///
    /// Blocks while the backlog is full. Returns every completed block that
    /// became contiguous with the emission sequence, oldest first.
    pub fn submit(&mut self, tag: BlockTag, data: Vec<u8>) -> Result<Vec<CompletedBlock>> {
        let mut ready = Vec::new();
        let mut state = self.shared.lock();
        loop {
            if state.broken() {
                return Err(state.take_error());
            }
            drain_contiguous(&mut state, &mut ready);
            if state.todo.len() + state.done.len() < self.shared.backlog {
                break;
            }
            state = self
                .shared
                .done_cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        trace!(target: "sqsh::block", event = "submit", seq = seq, len = data.len());
        state.todo.push_back(Job { seq, tag, data });
        drop(state);
        self.shared.todo_cv.notify_one();
        Ok(ready)
    }

    /// Signal end of input, join every worker and drain the remaining
    /// blocks in order.
    pub fn finish(&mut self) -> Result<Vec<CompletedBlock>> {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
        }
        self.shared.todo_cv.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                let mut state = self.shared.lock();
                if !state.broken() {
                    state.poison = Poison::Armed(SqshError::Compression(
                        "compression worker panicked".to_owned(),
                    ));
                }
            }
        }

        let mut state = self.shared.lock();
        if state.broken() {
            return Err(state.take_error());
        }

        let mut ready = Vec::new();
        drain_contiguous(&mut state, &mut ready);
        if !state.done.is_empty() || !state.todo.is_empty() {
            return Err(SqshError::format(
                "block processor finished with an emission gap",
            ));
        }
        debug!(target: "sqsh::block", event = "pool_finish", emitted = state.next_emit);
        Ok(ready)
    }
}

impl Drop for BlockProcessor {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.todo.clear();
        }
        self.shared.todo_cv.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn drain_contiguous(state: &mut State, ready: &mut Vec<CompletedBlock>) {
    while let Some(block) = state.done.remove(&state.next_emit) {
        state.next_emit += 1;
        ready.push(block);
    }
}

fn worker_loop(shared: &Shared, compressor: &dyn Compressor) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.broken() {
                    return;
                }
                if let Some(job) = state.todo.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = shared
                    .todo_cv
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let outcome = compressor.compress(&job.data);
        let mut state = shared.lock();
        match outcome {
            Ok(result) => {
                let (data, size_field) = match result {
                    Some(packed) => {
                        let len = packed.len() as u32;
                        (packed, len)
                    }
                    None => {
                        let len = job.data.len() as u32;
                        (job.data, len | DATA_BLOCK_UNCOMPRESSED)
                    }
                };
                state.done.insert(
                    job.seq,
                    CompletedBlock {
                        seq: job.seq,
                        tag: job.tag,
                        data,
                        size_field,
                    },
                );
                drop(state);
                shared.done_cv.notify_all();
            }
            Err(err) => {
                if !state.broken() {
                    state.poison = Poison::Armed(err);
                }
                drop(state);
                // Wake everyone so the error propagates.
                shared.done_cv.notify_all();
                shared.todo_cv.notify_all();
                return;
            }
        }
    }
}

/// Cheap sparse check done by the submitter before a block enters the queue.
#[must_use]
pub fn is_zero_block(data: &[u8]) -> bool {
    data.iter().all(|&byte| byte == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqsh_compress::{create_compressor, CompressorConfig};
    use sqsh_types::{BlockSize, CompressorId};

    fn compressor() -> Arc<dyn Compressor> {
        let cfg = CompressorConfig::new(CompressorId::Gzip, BlockSize::new(131_072).unwrap());
        Arc::from(create_compressor(&cfg).expect("gzip"))
    }

    fn tag(index: u32) -> BlockTag {
        BlockTag::File {
            node: NodeId(1),
            index,
            last: false,
        }
    }

    fn compressible_block(seed: u8) -> Vec<u8> {
        let mut data = vec![0_u8; 4096];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = seed.wrapping_add((i / 64) as u8);
        }
        data
    }

    #[test]
    fn emission_order_matches_submission_order() {
        let mut processor = BlockProcessor::new(4, 8, compressor()).unwrap();
        let mut emitted = Vec::new();
        for i in 0..50_u32 {
            let ready = processor
                .submit(tag(i), compressible_block(i as u8))
                .unwrap();
            emitted.extend(ready);
        }
        emitted.extend(processor.finish().unwrap());

        assert_eq!(emitted.len(), 50);
        for (expected, block) in emitted.iter().enumerate() {
            assert_eq!(block.seq, expected as u64);
            let BlockTag::File { index, .. } = block.tag else {
                panic!("unexpected tag");
            };
            assert_eq!(u64::from(index), block.seq);
        }
    }

    #[test]
    fn compressed_blocks_round_trip_and_flag_raw_ones() {
        let cmp = compressor();
        let mut processor = BlockProcessor::new(2, 4, Arc::clone(&cmp)).unwrap();

        let shrinkable = compressible_block(1);
        let dense: Vec<u8> = (0..=255).collect();
        let mut emitted = processor.submit(tag(0), shrinkable.clone()).unwrap();
        emitted.extend(processor.submit(tag(1), dense.clone()).unwrap());
        emitted.extend(processor.finish().unwrap());
        assert_eq!(emitted.len(), 2);

        let packed = &emitted[0];
        assert_eq!(packed.size_field & DATA_BLOCK_UNCOMPRESSED, 0);
        assert_eq!(packed.size_field as usize, packed.data.len());
        let restored = cmp.decompress(&packed.data, shrinkable.len()).unwrap();
        assert_eq!(restored, shrinkable);

        let raw = &emitted[1];
        assert_ne!(raw.size_field & DATA_BLOCK_UNCOMPRESSED, 0);
        assert_eq!(raw.data, dense);
    }

    #[test]
    fn backlog_never_overfills() {
        // One worker and a tiny backlog: the submitter must park and drain
        // rather than let the queues grow.
        let mut processor = BlockProcessor::new(1, 2, compressor()).unwrap();
        let mut total = 0_usize;
        for i in 0..32_u32 {
            total += processor
                .submit(tag(i), compressible_block(i as u8))
                .unwrap()
                .len();
            let state = processor.shared.lock();
            assert!(state.todo.len() + state.done.len() <= 2);
        }
        total += processor.finish().unwrap().len();
        assert_eq!(total, 32);
    }

    #[test]
    fn finish_on_empty_input_is_clean() {
        let mut processor = BlockProcessor::new(3, 5, compressor()).unwrap();
        assert!(processor.finish().unwrap().is_empty());
    }

    #[test]
    fn error_poisons_submit_and_finish() {
        #[derive(Debug)]
        struct FailingCompressor;
        impl Compressor for FailingCompressor {
            fn id(&self) -> CompressorId {
                CompressorId::Gzip
            }
            fn compress(&self, _data: &[u8]) -> sqsh_error::Result<Option<Vec<u8>>> {
                Err(SqshError::Compression("backend exploded".to_owned()))
            }
            fn decompress(&self, _data: &[u8], _max: usize) -> sqsh_error::Result<Vec<u8>> {
                unreachable!("not used")
            }
            fn options(&self) -> Option<Vec<u8>> {
                None
            }
        }

        let mut processor = BlockProcessor::new(2, 4, Arc::new(FailingCompressor)).unwrap();
        // The first submit queues fine; the failure surfaces on a later call.
        let mut saw_original = false;
        let mut saw_cancelled = false;
        for i in 0..16_u32 {
            match processor.submit(tag(i), vec![0xAB; 512]) {
                Ok(_) => {}
                Err(SqshError::Compression(msg)) => {
                    assert!(msg.contains("backend exploded"));
                    saw_original = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        match processor.finish() {
            Err(SqshError::Compression(_)) => saw_original = true,
            Err(SqshError::Cancelled) => saw_cancelled = true,
            other => panic!("expected a poisoned finish, got {other:?}"),
        }
        assert!(saw_original || saw_cancelled);
        assert!(saw_original, "the original error must surface exactly once");
    }

    #[test]
    fn zero_block_detection() {
        assert!(is_zero_block(&[]));
        assert!(is_zero_block(&[0; 1024]));
        let mut data = vec![0_u8; 1024];
        data[1023] = 1;
        assert!(!is_zero_block(&data));
    }
}
