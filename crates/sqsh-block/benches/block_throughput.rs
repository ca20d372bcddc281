#![forbid(unsafe_code)]
//! Block processor throughput microbenchmarks.
//!
//! Measures the submit-compress-drain path end to end for one and many
//! workers, with compressible and incompressible payloads.

use criterion::{criterion_group, criterion_main, Criterion};
use sqsh_block::{BlockProcessor, BlockTag};
use sqsh_compress::{create_compressor, Compressor, CompressorConfig};
use sqsh_tree::NodeId;
use sqsh_types::{BlockSize, CompressorId};
use std::sync::Arc;

const BLOCK: usize = 131_072;

fn compressor() -> Arc<dyn Compressor> {
    let cfg = CompressorConfig::new(CompressorId::Zstd, BlockSize::new(BLOCK as u32).unwrap());
    Arc::from(create_compressor(&cfg).expect("zstd"))
}

fn payload(compressible: bool) -> Vec<u8> {
    let mut data = vec![0_u8; BLOCK];
    let mut state = 0x9E37_79B9_u64;
    for (i, byte) in data.iter_mut().enumerate() {
        if compressible {
            *byte = (i / 512) as u8;
        } else {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *byte = (state >> 32) as u8;
        }
    }
    data
}

fn bench_submit_drain(c: &mut Criterion) {
    for jobs in [1_usize, 4] {
        for (label, compressible) in [("text", true), ("dense", false)] {
            let name = format!("block_processor_{jobs}j_{label}");
            let data = payload(compressible);
            c.bench_function(&name, |b| {
                b.iter(|| {
                    let mut processor =
                        BlockProcessor::new(jobs, jobs * 10, compressor()).expect("pool");
                    let mut emitted = 0_usize;
                    for i in 0..16_u32 {
                        let tag = BlockTag::File {
                            node: NodeId(1),
                            index: i,
                            last: false,
                        };
                        emitted += processor.submit(tag, data.clone()).expect("submit").len();
                    }
                    emitted += processor.finish().expect("finish").len();
                    assert_eq!(emitted, 16);
                });
            });
        }
    }
}

criterion_group!(benches, bench_submit_drain);
criterion_main!(benches);
