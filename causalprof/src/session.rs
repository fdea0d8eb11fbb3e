//! Profiling sessions.
//!
//! A [`Session`] ties a [`SampleSource`] and a [`DelayActuator`] together and
//! owns the background profiling loop. It can be started and stopped any
//! number of times; each start begins with a fresh experiment table.

use crossbeam::channel::{self, Sender};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ProfilerConfig;
use crate::delay::{DelayActuator, DelayCoordinator};
use crate::emit::{BacktraceResolver, Emitter, SymbolResolver};
use crate::experiment::Scheduler;
use crate::lock_util::recover_lock;
use crate::progress::ProgressAccumulator;
use crate::runner::{self, LoopContext, LoopExit};

/// Name of the background thread running experiments.
pub const LOOP_THREAD_NAME: &str = "causalprof-loop";

/// A stream of sampled program counters.
pub trait SampleSource: Send + Sync {
    /// Begins sampling every `interval` of CPU time.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Busy`] when another profiler owns the sampling
    /// mechanism, [`SourceError::InUse`] when another session is already
    /// sampling through it, or another [`SourceError`] if sampling cannot
    /// start.
    fn start(&self, interval: Duration) -> Result<(), SourceError>;

    /// Blocks until the next sample is available. Returns `None` once the
    /// source has been stopped or has nothing more to deliver.
    fn next_sample(&self) -> Option<usize>;

    /// Stops sampling and unblocks any pending `next_sample`.
    fn stop(&self);

    /// Discards samples that were taken but not yet delivered.
    fn flush(&self);
}

/// Errors reported by a [`SampleSource`].
#[derive(Debug)]
pub enum SourceError {
    /// Another sampling profiler is already active.
    Busy,
    /// Another causal profiling session owns the sampler.
    InUse,
    /// The sampling mechanism could not be set up.
    Io(io::Error),
    /// Sampling is not available on this platform.
    Unsupported(&'static str),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "sampling mechanism is owned by another profiler"),
            Self::InUse => write!(f, "sampler is already running"),
            Self::Io(e) => write!(f, "failed to start sampling: {e}"),
            Self::Unsupported(what) => write!(f, "sampling unsupported: {what}"),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Busy | Self::InUse | Self::Unsupported(_) => None,
        }
    }
}

/// Errors from [`Session::start`]. No session state changes on error.
#[derive(Debug)]
pub enum StartError {
    /// This session is already running.
    AlreadyActive,
    /// Another CPU-sampling profiler is active in the process.
    ConflictingProfiler,
    /// The sample source failed to start.
    Source(SourceError),
    /// The profiling loop thread could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "causal profiling already in use"),
            Self::ConflictingProfiler => write!(f, "cpu profiling already in use"),
            Self::Source(e) => write!(f, "{e}"),
            Self::Spawn(e) => write!(f, "failed to spawn profiling loop: {e}"),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Source(e) => Some(e),
            Self::Spawn(e) => Some(e),
            Self::AlreadyActive | Self::ConflictingProfiler => None,
        }
    }
}

impl From<SourceError> for StartError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Busy => Self::ConflictingProfiler,
            SourceError::InUse => Self::AlreadyActive,
            other => Self::Source(other),
        }
    }
}

struct Running {
    stop: Sender<()>,
    handle: JoinHandle<LoopExit>,
}

/// A causal profiling session.
pub struct Session {
    config: ProfilerConfig,
    source: Arc<dyn SampleSource>,
    coordinator: Arc<DelayCoordinator>,
    progress: Arc<ProgressAccumulator>,
    resolver: Arc<dyn SymbolResolver>,
    active: AtomicBool,
    running: Mutex<Option<Running>>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("active", &self.is_active())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates an idle session with the default configuration.
    #[must_use]
    pub fn new(source: Arc<dyn SampleSource>, actuator: Arc<dyn DelayActuator>) -> Self {
        Self::with_config(ProfilerConfig::default(), source, actuator)
    }

    /// Creates an idle session.
    #[must_use]
    pub fn with_config(
        config: ProfilerConfig,
        source: Arc<dyn SampleSource>,
        actuator: Arc<dyn DelayActuator>,
    ) -> Self {
        let coordinator = Arc::new(DelayCoordinator::new(actuator));
        let progress = Arc::new(ProgressAccumulator::new(Arc::clone(&coordinator)));
        Self {
            config,
            source,
            coordinator,
            progress,
            resolver: Arc::new(BacktraceResolver),
            active: AtomicBool::new(false),
            running: Mutex::new(None),
            scheduler: Mutex::new(None),
        }
    }

    /// Replaces the resolver used for record headers.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Starts profiling, writing experiment records to `sink`.
    ///
    /// # Errors
    ///
    /// See [`StartError`]. The session is unchanged when an error is returned.
    pub fn start<W>(&self, sink: W) -> Result<(), StartError>
    where
        W: Write + Send + 'static,
    {
        let mut running = recover_lock(self.running.lock());
        if running.is_some() {
            return Err(StartError::AlreadyActive);
        }

        self.source.start(self.config.sampling_interval)?;

        let scheduler = Arc::new(Scheduler::new(self.config.seed));
        let (stop_tx, stop_rx) = channel::bounded(1);
        let context = LoopContext {
            source: Arc::clone(&self.source),
            scheduler: Arc::clone(&scheduler),
            coordinator: Arc::clone(&self.coordinator),
            progress: Arc::clone(&self.progress),
            emitter: Emitter::new(sink, Arc::clone(&self.resolver)),
            stop: stop_rx,
            config: self.config.clone(),
        };

        let handle = match thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || runner::run_loop(context))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.source.stop();
                self.source.flush();
                return Err(StartError::Spawn(e));
            }
        };

        *recover_lock(self.scheduler.lock()) = Some(scheduler);
        *running = Some(Running {
            stop: stop_tx,
            handle,
        });
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops profiling and waits for the profiling loop to exit.
    ///
    /// Does nothing if the session is not running. An experiment still in
    /// its measurement window is discarded.
    pub fn stop(&self) {
        let mut running = recover_lock(self.running.lock());
        let Some(run) = running.take() else {
            return;
        };

        self.active.store(false, Ordering::Release);
        self.coordinator.release_all();
        let _ = run.stop.send(());
        self.source.stop();

        match run.handle.join() {
            Ok(LoopExit::SinkFailed) => {
                libc_print::libc_eprintln!("[causalprof] profiling loop had stopped on a write error");
            }
            Ok(LoopExit::Stopped | LoopExit::SourceEnded) => {}
            Err(_) => libc_print::libc_eprintln!("[causalprof] profiling loop panicked"),
        }

        // The loop may have armed one last experiment between the first
        // release and observing the stop signal.
        self.coordinator.release_all();
        self.source.flush();
    }

    /// Returns true between a successful `start` and the next `stop`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The session's progress accumulator.
    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressAccumulator> {
        &self.progress
    }

    /// The session's delay coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<DelayCoordinator> {
        &self.coordinator
    }

    /// The session's configuration.
    #[must_use]
    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Number of distinct call sites sampled by the current or last run.
    #[must_use]
    pub fn call_sites(&self) -> usize {
        recover_lock(self.scheduler.lock())
            .as_ref()
            .map_or(0, |s| s.call_sites())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Idle {
        busy: bool,
        starts: AtomicUsize,
        stopped: AtomicBool,
    }

    impl Idle {
        fn new(busy: bool) -> Self {
            Self {
                busy,
                starts: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            }
        }
    }

    impl SampleSource for Idle {
        fn start(&self, _interval: Duration) -> Result<(), SourceError> {
            if self.busy {
                return Err(SourceError::Busy);
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.stopped.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn next_sample(&self) -> Option<usize> {
            while !self.stopped.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            None
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn flush(&self) {}
    }

    struct Inert;

    impl DelayActuator for Inert {
        fn arm(&self, _pc: usize, _delay_per_sample: Duration) {}
        fn accumulated_delay(&self) -> Duration {
            Duration::ZERO
        }
        fn interrupt(&self) {}
    }

    #[test]
    fn start_twice_is_rejected() {
        let source = Arc::new(Idle::new(false));
        let session = Session::new(source.clone(), Arc::new(Inert));

        session.start(io::sink()).unwrap();
        let err = session.start(io::sink()).unwrap_err();
        assert!(matches!(err, StartError::AlreadyActive));
        assert_eq!(err.to_string(), "causal profiling already in use");
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);
        assert!(session.is_active());

        session.stop();
        assert!(!session.is_active());
    }

    #[test]
    fn busy_source_is_a_conflicting_profiler() {
        let session = Session::new(Arc::new(Idle::new(true)), Arc::new(Inert));
        let err = session.start(io::sink()).unwrap_err();
        assert!(matches!(err, StartError::ConflictingProfiler));
        assert_eq!(err.to_string(), "cpu profiling already in use");
        assert!(!session.is_active());
    }

    #[test]
    fn sampler_held_by_another_session_is_already_active() {
        let err = StartError::from(SourceError::InUse);
        assert!(matches!(err, StartError::AlreadyActive));
        assert_eq!(err.to_string(), "causal profiling already in use");
        assert!(matches!(
            StartError::from(SourceError::Busy),
            StartError::ConflictingProfiler
        ));
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let session = Session::new(Arc::new(Idle::new(false)), Arc::new(Inert));
        session.stop();
        session.stop();
        assert!(!session.is_active());
        assert_eq!(session.call_sites(), 0);
    }

    #[test]
    fn restart_after_stop() {
        let source = Arc::new(Idle::new(false));
        let session = Session::new(source.clone(), Arc::new(Inert));
        for _ in 0..3 {
            session.start(io::sink()).unwrap();
            session.stop();
        }
        assert_eq!(source.starts.load(Ordering::SeqCst), 3);
    }
}
