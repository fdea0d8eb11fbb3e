//! Example: Multi-threaded Collatz sequence computation.
//!
//! Worker threads compute Collatz sequence lengths in chunks; each chunk is
//! one unit of progress. The writer thread that drains the results is the
//! other candidate bottleneck.
//!
//! Run with: cargo causalprof run --example collatz

// Examples are demonstration code - allow more relaxed rules
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::print_stdout)]

use std::io::{self, BufWriter, Write};
use std::num::NonZeroU64;
use std::sync::mpsc::sync_channel;
use std::thread;

use causalprof::profile;

const CHUNK: u64 = 500;

/// Computes the number of steps to reach 1 in the Collatz sequence.
fn collatz(n: NonZeroU64) -> u64 {
    let mut cur = n.get();
    let mut iters = 0;
    while cur != 1 {
        iters += 1;
        if cur % 2 == 0 {
            cur /= 2;
        } else {
            cur = (3 * cur) + 1;
        }
    }
    iters
}

/// Longest sequence in `start..start + CHUNK`.
#[profile]
fn longest_in_chunk(start: u64) -> (u64, u64) {
    (start..start + CHUNK)
        .map(|n| (n, collatz(NonZeroU64::new(n).unwrap())))
        .max_by_key(|&(_, steps)| steps)
        .unwrap()
}

fn main() -> io::Result<()> {
    if let Err(e) = causalprof::init() {
        eprintln!("Failed to initialize profiler: {e}");
    }

    let threads = 8;
    let chunks_per_thread = 2_000;
    let (snd, rcv) = sync_channel(8);

    for id in 0..threads {
        let snd = snd.clone();
        thread::Builder::new()
            .name(format!("collatz-{id}"))
            .spawn(move || {
                for chunk in 0..chunks_per_thread {
                    let start = 1 + (chunk * threads + id) * CHUNK;
                    snd.send(longest_in_chunk(start))
                        .expect("failed to send collatz result");
                }
            })?;
    }
    drop(snd);

    let mut out = BufWriter::new(io::sink());
    let mut best = (1, 0);
    while let Ok((n, steps)) = rcv.recv() {
        writeln!(out, "{n} {steps}")?;
        if steps > best.1 {
            best = (n, steps);
        }
    }
    out.flush()?;

    println!("longest sequence: {} ({} steps)", best.0, best.1);
    causalprof::shutdown();
    Ok(())
}
