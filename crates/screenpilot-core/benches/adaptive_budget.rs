//! Benchmarks for adaptive wait budgets.
//!
//! Performance budgets:
//! - compute_budget over a full 200-sample history: **< 20us**
//! - tracker record + budget lookup under one lock: **< 30us**

use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use screenpilot_core::config::StatsConfig;
use screenpilot_core::stats::{
    BudgetPolicy, SampleOutcome, StatsTracker, TimingSample, compute_budget,
};

fn history(len: usize) -> Vec<TimingSample> {
    (0..len)
        .map(|i| {
            let outcome = if i % 17 == 0 {
                SampleOutcome::Timeout
            } else {
                SampleOutcome::Success
            };
            TimingSample::new(Duration::from_millis(200 + (i as u64 * 37) % 900), outcome)
        })
        .collect()
}

fn bench_compute_budget(c: &mut Criterion) {
    let mut group = c.benchmark_group("adaptive_budget/compute");
    let policy = BudgetPolicy::default();
    let nominal = Duration::from_secs(5);

    for &len in &[10usize, 50, 200] {
        let samples = history(len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("samples", len), &samples, |b, samples| {
            b.iter(|| compute_budget(std::hint::black_box(samples), nominal, &policy));
        });
    }
    group.finish();
}

fn bench_tracker_roundtrip(c: &mut Criterion) {
    let tracker = StatsTracker::in_memory(&StatsConfig::default(), BudgetPolicy::default());
    for sample in history(200) {
        tracker.record_timing("nav.MAP->WAR", sample.duration(), sample.outcome);
    }
    let nominal = Duration::from_secs(5);

    c.bench_function("adaptive_budget/record_then_lookup", |b| {
        b.iter(|| {
            tracker.record_timing("nav.MAP->WAR", Duration::from_millis(420), SampleOutcome::Success);
            std::hint::black_box(tracker.effective_budget("nav.MAP->WAR", nominal))
        });
    });
}

criterion_group!(benches, bench_compute_budget, bench_tracker_roundtrip);
criterion_main!(benches);
