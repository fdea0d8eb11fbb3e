//! Micro-benchmarks for core causalprof operations.
//!
//! Unit marking runs on the profiled program's own threads, so its cost is
//! overhead added to every unit. The rest runs on the profiling loop or in
//! the report tool.

#![allow(missing_docs)]

use causalprof::emit::Emitter;
use causalprof::experiment::Scheduler;
use causalprof::posix::SignalActuator;
use causalprof::report::{parse_records, RegressionResult};
use causalprof::timer::monotonic_nanos;
use causalprof::{DelayCoordinator, ExperimentRecord, Location, ProgressAccumulator};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

/// Called twice per unit of progress.
fn bench_monotonic_time(c: &mut Criterion) {
    c.bench_function("monotonic_nanos", |b| b.iter(monotonic_nanos));
}

/// Begin and end of one unit against the signal actuator's thread counter.
fn bench_unit(c: &mut Criterion) {
    let coordinator = Arc::new(DelayCoordinator::new(Arc::new(SignalActuator)));
    let progress = ProgressAccumulator::new(coordinator);

    c.bench_function("unit_begin_end", |b| {
        b.iter(|| {
            let token = progress.begin_unit();
            progress.end_unit(black_box(token));
        })
    });

    c.bench_function("unit_guard", |b| {
        b.iter(|| drop(black_box(progress.unit())))
    });
}

/// One scheduling decision per experiment.
fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_next_level");

    for sites in [1usize, 100, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(sites), &sites, |b, &sites| {
            let scheduler = Scheduler::new(Some(7));
            let mut pc = 0usize;
            b.iter(|| {
                pc = pc % sites + 1;
                black_box(scheduler.next_level(black_box(pc * 16)))
            })
        });
    }

    group.finish();
}

fn records(n: usize) -> Vec<ExperimentRecord> {
    (0..n)
        .map(|i| ExperimentRecord {
            pc: 0x4000 + (i as u64 % 32) * 16,
            percent: (i % 21) as i32 * 5,
            nanos_per_unit: 1000 + i as i64,
        })
        .collect()
}

fn bench_emit(c: &mut Criterion) {
    let resolver = Arc::new(|_: usize| {
        Some(Location {
            function: "work::step".to_string(),
            file: "src/work.rs".to_string(),
            line: 17,
        })
    });
    let record = records(1)[0];

    c.bench_function("emit_record", |b| {
        let mut emitter = Emitter::new(Vec::with_capacity(1 << 20), resolver.clone());
        b.iter(|| emitter.emit(black_box(&record)))
    });
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_records");

    for size in [21, 210, 2100] {
        let mut emitter = Emitter::new(Vec::new(), Arc::new(|_: usize| None::<Location>));
        for record in records(size) {
            emitter.emit(&record).unwrap();
        }
        let input = emitter.into_inner();

        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| parse_records(black_box(input.as_slice())))
        });
    }

    group.finish();
}

/// One fit per site when a report is built.
fn bench_linear_regression(c: &mut Criterion) {
    let mut group = c.benchmark_group("linear_regression");

    for size in [5, 10, 21, 50, 100] {
        // ns/op grows linearly with the slowdown percent
        let points: Vec<(f64, f64)> = (0..size)
            .map(|i| {
                let x = f64::from(i) * 5.0;
                (x, 1000.0 + x * 3.0 + f64::from(i % 3))
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &points, |b, points| {
            b.iter(|| RegressionResult::fit(black_box(points)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_monotonic_time,
    bench_unit,
    bench_scheduler,
    bench_emit,
    bench_parse,
    bench_linear_regression,
);

criterion_main!(benches);
