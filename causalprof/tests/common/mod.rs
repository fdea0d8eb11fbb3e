//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use causalprof::{DelayActuator, SampleSource, SourceError};
use std::cell::Cell;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A source that reports the same call site over and over.
///
/// Each sample takes `pause` to arrive, like a sampling timer would.
pub struct ScriptedSource {
    pc: usize,
    pause: Duration,
    busy: bool,
    running: AtomicBool,
    pub starts: AtomicUsize,
}

impl ScriptedSource {
    pub fn repeating(pc: usize) -> Self {
        Self {
            pc,
            pause: Duration::from_micros(200),
            busy: false,
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
        }
    }

    /// A source whose sampling mechanism belongs to another profiler.
    pub fn busy() -> Self {
        Self {
            busy: true,
            ..Self::repeating(0x1000)
        }
    }
}

impl SampleSource for ScriptedSource {
    fn start(&self, _interval: Duration) -> Result<(), SourceError> {
        if self.busy {
            return Err(SourceError::Busy);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn next_sample(&self) -> Option<usize> {
        thread::sleep(self.pause);
        self.running.load(Ordering::SeqCst).then_some(self.pc)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn flush(&self) {}
}

thread_local! {
    static SIMULATED_DELAY_NS: Cell<u64> = const { Cell::new(0) };
}

/// An actuator that only injects delay when a test asks it to.
///
/// [`SimulatedActuator::inject`] sleeps and charges the sleep to the calling
/// thread, which is what the signal handler does for a matching sample.
#[derive(Default)]
pub struct SimulatedActuator {
    pub armed_pc: AtomicUsize,
    pub armed_delay_ns: AtomicU64,
    pub interrupts: AtomicUsize,
}

impl SimulatedActuator {
    /// Sleeps for `delay` and charges the time actually slept.
    pub fn inject(&self, delay: Duration) {
        let started = std::time::Instant::now();
        thread::sleep(delay);
        let nanos = u64::try_from(started.elapsed().as_nanos()).unwrap();
        SIMULATED_DELAY_NS.with(|d| d.set(d.get() + nanos));
    }
}

impl DelayActuator for SimulatedActuator {
    fn arm(&self, pc: usize, delay_per_sample: Duration) {
        self.armed_pc.store(pc, Ordering::SeqCst);
        self.armed_delay_ns.store(
            u64::try_from(delay_per_sample.as_nanos()).unwrap(),
            Ordering::SeqCst,
        );
    }

    fn accumulated_delay(&self) -> Duration {
        Duration::from_nanos(SIMULATED_DELAY_NS.with(Cell::get))
    }

    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}

/// A cloneable in-memory sink.
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }

    /// Number of complete data lines written so far.
    pub fn records(&self) -> usize {
        let contents = self.contents();
        let complete = contents.rfind('\n').map_or("", |end| &contents[..=end]);
        complete
            .lines()
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .count()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A sink that rejects every write.
pub struct BrokenSink;

impl Write for BrokenSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Polls `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
