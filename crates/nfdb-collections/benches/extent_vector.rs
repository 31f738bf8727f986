// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use nfdb_collections::AtomicExtentVector;
use rayon::prelude::*;

const OPS: u64 = 100_000;

fn push_back_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("extent_vector");
    group.throughput(Throughput::Elements(OPS));
    group.bench_function("push_back_single", |b| {
        b.iter_batched(
            AtomicExtentVector::new,
            |vector| {
                for i in 0..OPS {
                    vector.push_back(i);
                }
                vector
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn push_back_parallel(c: &mut Criterion) {
    let pool = rayon::ThreadPoolBuilder::new().num_threads(16).build().unwrap();
    let mut group = c.benchmark_group("extent_vector");
    group.throughput(Throughput::Elements(OPS));
    group.bench_function("push_back_16_threads", |b| {
        b.iter_batched(
            AtomicExtentVector::new,
            |vector| {
                pool.install(|| {
                    (0..OPS).into_par_iter().for_each(|i| {
                        vector.push_back(i);
                    });
                });
                vector
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, push_back_single, push_back_parallel);
criterion_main!(benches);
