//! Smoke test of the real `SIGPROF` backend.
//!
//! Spins on CPU so the profiling timer fires, and checks that experiments
//! come out the other end. Kept to a single test: only one sampler can own
//! `SIGPROF` per process.
//!
//! Run with: cargo test --test signal_backend --release

#![cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use causalprof::posix::{SignalActuator, SignalSampler};
use causalprof::report::parse_records;
use causalprof::validate::{sigprof_disposition, SigprofDisposition};
use causalprof::{ProfilerConfig, Session, StartError};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[inline(never)]
fn spin(iterations: u64) -> u64 {
    let mut x = 1u64;
    for i in 0..iterations {
        x = std::hint::black_box(x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(i));
    }
    x
}

#[test]
fn sigprof_sessions_record_experiments() {
    let config = ProfilerConfig {
        measurement_window: Duration::from_millis(20),
        cooldown: Duration::ZERO,
        seed: Some(1),
        ..ProfilerConfig::default()
    };
    let session = Arc::new(Session::with_config(
        config,
        Arc::new(SignalSampler::new()),
        Arc::new(SignalActuator),
    ));

    let done = Arc::new(AtomicBool::new(false));
    let worker = {
        let session = Arc::clone(&session);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Relaxed) {
                let _unit = session.progress().unit();
                std::hint::black_box(spin(20_000));
            }
        })
    };

    let sink = SharedBuf::default();
    session.start(sink.clone()).unwrap();
    assert_eq!(sigprof_disposition().unwrap(), SigprofDisposition::Ours);

    // A second causal session in the same process finds profiling active.
    let rival = Session::new(Arc::new(SignalSampler::new()), Arc::new(SignalActuator));
    assert!(matches!(
        rival.start(SharedBuf::default()),
        Err(StartError::AlreadyActive)
    ));
    assert!(!rival.is_active());

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut records = Vec::new();
    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
        let contents = sink.0.lock().unwrap().clone();
        // A record may be half written; only parse complete lines.
        let complete = contents
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(&contents[..0], |end| &contents[..=end]);
        records = parse_records(complete).unwrap();
        if records.len() >= 3 {
            break;
        }
    }

    session.stop();
    done.store(true, Ordering::Relaxed);
    worker.join().unwrap();

    assert!(records.len() >= 3, "only {} records", records.len());
    assert!(records.iter().all(|r| r.pc != 0 && r.nanos_per_unit > 0));
    assert!(records.iter().all(|r| (0..=100).contains(&r.percent) && r.percent % 5 == 0));
    assert!(session.coordinator().armed().is_none());

    // Stopped sessions release the sampler for the next one.
    rival.start(SharedBuf::default()).unwrap();
    rival.stop();
}
