//! Benchmark the compaction pass against a pool with a realistic mix of
//! live fast/slow nodes (§4.1 "compaction", §5 "benchmarked workloads").

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use monad_core::mpt::chunk::ChunkType;
use monad_core::mpt::engine::{StateMachine, UpdateAux, UpdateList};
use monad_core::mpt::pool::{open_file_pool, OpenFlags, OpenMode};
use std::sync::Arc;
use tempfile::tempdir;

fn build_pool_with_history(key_count: u64, versions: u64) -> Arc<UpdateAux<monad_core::mpt::device::FileDevice>> {
    let dir = tempdir().expect("tempdir");
    let sources = vec![
        (ChunkType::Conventional, dir.path().join("cnv"), 64),
        (ChunkType::Sequential, dir.path().join("seq"), 64),
    ];
    let pool = open_file_pool(&sources, OpenMode::CreateIfNeeded, 16, OpenFlags::default()).expect("open pool");
    let aux = Arc::new(UpdateAux::new(Arc::new(pool), StateMachine::default(), 32));

    let mut root = None;
    for v in 0..versions {
        let mut updates = UpdateList::new();
        for k in 0..key_count {
            let key = (k * versions + v).to_be_bytes().to_vec();
            updates.put(key, vec![v as u8; 32]);
        }
        root = Some(aux.upsert(root, updates, v).expect("upsert"));
    }
    let _ = root;
    aux
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("compaction");

    group.bench_function("compact_pass/small", |b| {
        let aux = build_pool_with_history(64, 8);
        b.iter(|| {
            let frontier_offsets: Vec<_> = (0..8)
                .filter_map(|v| aux.root_at(black_box(v)).ok())
                .collect();
            black_box(aux.compact_pass(&frontier_offsets).expect("compact"));
        })
    });

    group.bench_function("upsert/sequential_versions", |b| {
        b.iter(|| {
            black_box(build_pool_with_history(black_box(32), black_box(4)));
        })
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
