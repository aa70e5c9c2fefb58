//! Merge and preview benchmarks over growing stop lists.
//!
//! Run with:
//!   cargo bench --bench merge_bench

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use stopboard::models::{AppConfig, City, ExportSettings, ImportOptions, MergeStrategy, StopConfig};
use stopboard::services::{
    MergeEngine, SchemaValidator, create_export, merge_stops, preview_with_strategy,
};

const SIZES: [usize; 3] = [10, 100, 1_000];

fn stops(prefix: &str, count: usize) -> Vec<StopConfig> {
    (0..count)
        .map(|i| StopConfig {
            id: format!("{prefix}-{i}"),
            name: format!("Stop {i}"),
            city: if i % 2 == 0 { City::A } else { City::B },
            stop_id: format!("{i:06}"),
            walking_time_minutes: (i % 15) as u32,
            visible: i % 7 != 0,
            position: i,
        })
        .collect()
}

/// Half of `incoming` overlaps `existing` by id.
fn overlapping(count: usize) -> (Vec<StopConfig>, Vec<StopConfig>) {
    let existing = stops("s", count);
    let mut incoming = stops("s", count / 2);
    incoming.extend(stops("n", count - count / 2));
    (existing, incoming)
}

fn bench_merge_stops(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_stops");
    for size in SIZES {
        let (existing, incoming) = overlapping(size);
        for strategy in [MergeStrategy::Merge, MergeStrategy::Replace] {
            group.bench_with_input(
                BenchmarkId::new(format!("{strategy:?}"), size),
                &size,
                |b, _| b.iter(|| merge_stops(black_box(&existing), black_box(&incoming), strategy)),
            );
        }
    }
    group.finish();
}

fn bench_merge_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_engine_apply");
    let options = ImportOptions {
        import_only_visible: true,
        preserve_stop_positions: false,
        ..ImportOptions::default()
    };
    for size in SIZES {
        let (existing, incoming) = overlapping(size);
        let existing = AppConfig {
            stops: existing,
            ..AppConfig::default()
        };
        let incoming = AppConfig {
            stops: incoming,
            ..AppConfig::default()
        };
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| MergeEngine::apply(black_box(&existing), black_box(&incoming), &options))
        });
    }
    group.finish();
}

fn bench_preview(c: &mut Criterion) {
    let mut group = c.benchmark_group("preview");
    for size in SIZES {
        let (existing, incoming) = overlapping(size);
        let current = AppConfig {
            stops: existing,
            ..AppConfig::default()
        };
        let doc = create_export(
            &AppConfig {
                stops: incoming,
                ..AppConfig::default()
            },
            "bench",
            ExportSettings::default(),
        );
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| preview_with_strategy(black_box(&doc), &current, MergeStrategy::Merge))
        });
    }
    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");
    let validator = SchemaValidator::default();
    for size in SIZES {
        let export = create_export(
            &AppConfig {
                stops: stops("s", size),
                ..AppConfig::default()
            },
            "bench",
            ExportSettings::default(),
        );
        let doc = serde_json::to_value(&export).unwrap_or_default();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| validator.validate(black_box(&doc)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_merge_stops,
    bench_merge_engine,
    bench_preview,
    bench_validate,
);

criterion_main!(benches);
