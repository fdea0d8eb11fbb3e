//! End-to-end tests of a profiling session driven by a scripted sample
//! source.
//!
//! Run with: cargo test --test session_lifecycle

mod common;

use causalprof::report::{parse_records, Report};
use causalprof::{ProfilerConfig, Session, StartError};
use common::{wait_until, BrokenSink, ScriptedSource, SharedBuf, SimulatedActuator};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PC: usize = 0x5555_0000_1234;

fn fast_config() -> ProfilerConfig {
    ProfilerConfig {
        measurement_window: Duration::from_millis(3),
        cooldown: Duration::ZERO,
        seed: Some(42),
        ..ProfilerConfig::default()
    }
}

fn session(config: ProfilerConfig) -> Arc<Session> {
    Arc::new(Session::with_config(
        config,
        Arc::new(ScriptedSource::repeating(PC)),
        Arc::new(SimulatedActuator::default()),
    ))
}

/// Completes a unit of progress every ~100µs until dropped.
struct Worker {
    done: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn spawn(session: &Arc<Session>) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let done = Arc::clone(&done);
            let session = Arc::clone(session);
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    let _unit = session.progress().unit();
                    thread::sleep(Duration::from_micros(100));
                }
            })
        };
        Self {
            done,
            handle: Some(handle),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn every_level_is_recorded_once_per_site() {
    let session = session(fast_config());
    let _worker = Worker::spawn(&session);
    let sink = SharedBuf::default();

    session.start(sink.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(10), || sink.records() >= 21));
    // The site is exhausted; no further experiments run.
    thread::sleep(Duration::from_millis(30));
    session.stop();

    let records = parse_records(sink.contents().as_bytes()).unwrap();
    assert_eq!(records.len(), 21);
    assert!(records.iter().all(|r| r.pc == PC as u64));
    assert!(records.iter().all(|r| r.nanos_per_unit > 0));

    let percents: BTreeSet<i32> = records.iter().map(|r| r.percent).collect();
    let expected: BTreeSet<i32> = (0..=100).step_by(5).collect();
    assert_eq!(percents, expected);

    let report = Report::from_records(records);
    assert_eq!(report.sites.len(), 1);
    assert_eq!(report.sites[0].points.len(), 21);
    assert!(report.sites[0].baseline_nanos().is_some());
}

#[test]
fn records_carry_the_four_line_layout() {
    let session = session(fast_config());
    let _worker = Worker::spawn(&session);
    let sink = SharedBuf::default();

    session.start(sink.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(10), || sink.records() >= 1));
    session.stop();

    let contents = sink.contents();
    let lines: Vec<&str> = contents.lines().take(4).collect();
    assert!(lines[0].starts_with("# "));
    assert!(lines[1].starts_with("# speedup ") && lines[1].ends_with('%'));
    assert!(lines[2].starts_with("# ") && lines[2].ends_with("ns/op"));
    assert!(lines[3].starts_with("0x"));
    assert_eq!(lines[3].split_whitespace().count(), 3);
}

#[test]
fn windows_without_progress_are_not_recorded() {
    let session = session(fast_config());
    let sink = SharedBuf::default();

    session.start(sink.clone()).unwrap();
    thread::sleep(Duration::from_millis(50));
    session.stop();

    assert_eq!(sink.records(), 0);
    // The site was still scheduled, and its levels consumed.
    assert_eq!(session.call_sites(), 1);
}

#[test]
fn second_start_is_rejected_and_sink_untouched() {
    let session = session(fast_config());
    session.start(SharedBuf::default()).unwrap();

    let second = SharedBuf::default();
    assert!(matches!(
        session.start(second.clone()),
        Err(StartError::AlreadyActive)
    ));
    assert!(session.is_active());
    session.stop();
    assert!(second.contents().is_empty());
}

#[test]
fn conflicting_profiler_leaves_session_idle() {
    let session = Session::new(
        Arc::new(ScriptedSource::busy()),
        Arc::new(SimulatedActuator::default()),
    );
    let err = session.start(SharedBuf::default()).unwrap_err();
    assert!(matches!(err, StartError::ConflictingProfiler));
    assert_eq!(err.to_string(), "cpu profiling already in use");
    assert!(!session.is_active());
}

#[test]
fn stop_is_idempotent() {
    let session = session(fast_config());
    session.stop();
    session.start(SharedBuf::default()).unwrap();
    session.stop();
    session.stop();
    assert!(!session.is_active());
}

#[test]
fn restart_schedules_from_scratch() {
    let session = session(fast_config());
    let _worker = Worker::spawn(&session);

    let first = SharedBuf::default();
    session.start(first.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(10), || first.records() >= 21));
    session.stop();

    let second = SharedBuf::default();
    session.start(second.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(10), || second.records() >= 1));
    session.stop();

    assert_eq!(first.records(), 21);
}

#[test]
fn stop_interrupts_a_long_window() {
    let config = ProfilerConfig {
        measurement_window: Duration::from_secs(30),
        cooldown: Duration::from_secs(30),
        ..ProfilerConfig::default()
    };
    let session = session(config);
    let sink = SharedBuf::default();
    session.start(sink.clone()).unwrap();
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    session.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(sink.records(), 0);
    assert!(session.coordinator().armed().is_none());
}

#[test]
fn sink_failure_keeps_session_active_until_stopped() {
    let session = session(fast_config());
    let _worker = Worker::spawn(&session);

    session.start(BrokenSink).unwrap();
    // The loop gives up after the first failed write.
    thread::sleep(Duration::from_millis(100));
    assert!(session.is_active());
    assert!(session.call_sites() >= 1);

    session.stop();
    assert!(!session.is_active());
    session.start(SharedBuf::default()).unwrap();
    session.stop();
}
