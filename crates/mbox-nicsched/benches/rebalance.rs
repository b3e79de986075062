//! RSS++ rebalance latency, mirroring the teacher's `scheduler_hotpath`
//! benchmark shape.
//!
//! Run with: cargo bench --package mbox-nicsched

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mbox_nicsched::{NicSchedulerConfig, NicScheduler, NullListener};

fn bench_rsspp_tick(c: &mut Criterion) {
    let cfg = NicSchedulerConfig::default();
    let mut sched = NicScheduler::new(cfg, 256, 16);
    let raw_load: Vec<f64> = (0..16).map(|i| 0.3 + 0.05 * (i as f64 % 5.0)).collect();
    let bucket_load: HashMap<usize, f64> = (0..256usize).map(|b| (b, 0.002)).collect();

    c.bench_function("rsspp_tick_16_cores_256_buckets", |bencher| {
        bencher.iter(|| {
            sched.tick_once(black_box(&raw_load), black_box(&bucket_load), &mut NullListener);
        });
    });
}

criterion_group!(benches, bench_rsspp_tick);
criterion_main!(benches);
