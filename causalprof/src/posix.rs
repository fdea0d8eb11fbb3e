//! Linux sampling and delay injection through `SIGPROF`.
//!
//! [`SignalSampler`] drives the process-wide `ITIMER_PROF` timer and reads
//! the program counter of whichever thread the kernel interrupts.
//! [`SignalActuator`] makes that same handler sleep when the interrupted
//! thread is running the call site under experiment. Both share the state
//! in [`signal`], so they are meant to be used together.

mod signal;

pub use signal::{sigprof_disposition, SigprofDisposition};

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::delay::DelayActuator;
use crate::session::{SampleSource, SourceError};
use crate::timer::ProfTimer;

/// How often [`SignalSampler::next_sample`] checks the mailbox.
pub const POLL_INTERVAL: Duration = Duration::from_micros(250);

const SUPPORTED: bool = cfg!(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
));

/// Samples program counters with `SIGPROF`.
///
/// Only one sampler can run per process; a second `start` while one is
/// running fails with [`SourceError::InUse`]. A `SIGPROF` handler installed
/// by anything else fails it with [`SourceError::Busy`].
#[derive(Debug, Default)]
pub struct SignalSampler {
    timer: ProfTimer,
    running: AtomicBool,
}

impl SignalSampler {
    /// Creates a stopped sampler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleSource for SignalSampler {
    fn start(&self, interval: Duration) -> Result<(), SourceError> {
        if !SUPPORTED {
            return Err(SourceError::Unsupported(
                "SIGPROF sampling needs Linux on x86_64 or aarch64",
            ));
        }
        if sigprof_disposition().map_err(SourceError::Io)? == SigprofDisposition::Foreign {
            return Err(SourceError::Busy);
        }
        if signal::SAMPLING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SourceError::InUse);
        }

        let started = signal::install().and_then(|()| {
            signal::LATEST_PC.store(0, Ordering::Release);
            self.timer
                .start(interval)
                .map_err(|e| std::io::Error::other(e.to_string()))
        });
        if let Err(e) = started {
            signal::SAMPLING.store(false, Ordering::Release);
            return Err(SourceError::Io(e));
        }

        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn next_sample(&self) -> Option<usize> {
        loop {
            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            let pc = signal::LATEST_PC.swap(0, Ordering::AcqRel);
            if pc != 0 {
                return Some(pc);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.timer.stop() {
            libc_print::libc_eprintln!("[causalprof] failed to stop profiling timer: {}", e);
        }
        signal::SAMPLING.store(false, Ordering::Release);
    }

    fn flush(&self) {
        signal::LATEST_PC.store(0, Ordering::Release);
    }
}

/// Injects delays from inside the `SIGPROF` handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalActuator;

impl SignalActuator {
    /// Delay injected into all threads since the process started.
    #[must_use]
    pub fn total_injected() -> Duration {
        Duration::from_nanos(signal::TOTAL_INJECTED_NS.load(Ordering::Relaxed))
    }
}

impl DelayActuator for SignalActuator {
    fn arm(&self, pc: usize, delay_per_sample: Duration) {
        signal::arm(pc, u64::try_from(delay_per_sample.as_nanos()).unwrap_or(u64::MAX));
    }

    fn accumulated_delay(&self) -> Duration {
        // Called from begin_unit, so every thread marking progress has its
        // stack bounds known to the handler.
        signal::register_thread_stack();
        signal::thread_delay()
    }

    fn interrupt(&self) {
        signal::wake_all();
    }
}
