//! Example: Lock contention analysis.
//!
//! Simulates a server whose requests all update one mutex-protected counter.
//! Slowing the critical section should move the cost of a request far more
//! than slowing the per-request checksum, which runs in parallel.
//!
//! Run with: cargo causalprof run --example lock_contention --release

// Examples are demonstration code - allow more relaxed rules
#![allow(clippy::unwrap_used)]
#![allow(clippy::print_stdout)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Shared state protected by a mutex - this creates contention.
struct SharedCounter {
    value: Mutex<u64>,
}

impl SharedCounter {
    fn new() -> Self {
        Self {
            value: Mutex::new(0),
        }
    }

    /// Increment with lock - this is the contention point.
    #[inline(never)]
    fn increment(&self) {
        let mut guard = self.value.lock().unwrap();
        let v = *guard;
        // Busy wait to exaggerate the critical section
        for _ in 0..2_000 {
            std::hint::black_box(v + 1);
        }
        *guard = v + 1;
    }

    fn get(&self) -> u64 {
        *self.value.lock().unwrap()
    }
}

#[inline(never)]
fn checksum() -> u64 {
    let mut checksum = 0u64;
    for i in 0..20_000 {
        checksum = std::hint::black_box(checksum.wrapping_add(i));
    }
    checksum
}

/// One request: parallel work, then the shared update.
fn handle_request(counter: &SharedCounter) {
    let _unit = causalprof::unit();
    std::hint::black_box(checksum());
    counter.increment();
}

fn main() {
    // Only active if CAUSALPROF_ENABLED=1
    if let Err(e) = causalprof::init() {
        eprintln!("Failed to initialize profiler: {e}");
    }

    let num_workers = 4;
    let run_for = Duration::from_secs(30);
    println!("Lock Contention Example: {num_workers} workers for {run_for:?}");

    let running = Arc::new(AtomicBool::new(true));
    let counter = Arc::new(SharedCounter::new());
    let start = Instant::now();

    let workers: Vec<_> = (0..num_workers)
        .map(|_| {
            let running = Arc::clone(&running);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let mut iterations = 0u64;
                while running.load(Ordering::Relaxed) {
                    handle_request(&counter);
                    iterations += 1;
                }
                iterations
            })
        })
        .collect();

    thread::sleep(run_for);
    running.store(false, Ordering::Relaxed);

    for (i, worker) in workers.into_iter().enumerate() {
        println!("Worker {i} completed {} requests", worker.join().unwrap());
    }
    let elapsed = start.elapsed();
    println!(
        "Total: {} requests in {elapsed:?} ({:.0} req/sec)",
        counter.get(),
        counter.get() as f64 / elapsed.as_secs_f64()
    );

    causalprof::shutdown();
}
