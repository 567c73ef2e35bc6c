// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use streaming_config::Parameters;
use streaming_core::{
    test_metrics, AggregateKind, Context, PagePool, WatermarkProcessor,
};

const UPDATES: u64 = 10_000;

fn watermark_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("watermark_processor");
    group.throughput(Throughput::Elements(UPDATES));
    group.bench_function("single_origin_in_order", |b| {
        b.iter_batched(
            || WatermarkProcessor::new(&[0], 1024),
            |processor| {
                for sequence in 1..=UPDATES {
                    processor
                        .update(sequence * 10, sequence, 0)
                        .expect("update should succeed");
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.bench_function("four_origins_round_robin", |b| {
        b.iter_batched(
            || WatermarkProcessor::new(&[0, 1, 2, 3], 1024),
            |processor| {
                for sequence in 1..=UPDATES / 4 {
                    for origin in 0..4 {
                        processor
                            .update(sequence * 10, sequence, origin)
                            .expect("update should succeed");
                    }
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn paged_upserts(c: &mut Criterion) {
    let parameters = Parameters {
        page_entries: 512,
        page_limit: 4096,
        ..Default::default()
    };
    let context = Context::new(parameters, test_metrics());
    let pool = PagePool::new(&context);
    let aggregate = AggregateKind::Sum;

    let mut group = c.benchmark_group("paged_hash_map");
    group.throughput(Throughput::Elements(UPDATES));
    group.bench_function("upsert_1k_keys", |b| {
        b.iter_batched(
            streaming_core::PagedHashMap::default,
            |mut map| {
                for i in 0..UPDATES {
                    map.upsert(&pool, i % 1000, aggregate.lift(1), &aggregate)
                        .expect("pool is large enough");
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, watermark_updates, paged_upserts);
criterion_main!(benches);
