//! Causalprof: a causal profiler for Rust programs.
//!
//! A conventional profiler tells you where a program spends its time. A
//! causal profiler estimates what would happen to the program as a whole if
//! one piece of code got faster or slower. It does so by running
//! experiments while the program runs: it picks a call site from the CPU
//! samples, slows every thread down by a fixed fraction whenever it is
//! caught executing that site, and measures how long each unit of useful
//! work takes under that slowdown. Sites whose slowdown barely moves the
//! cost of a unit are not worth optimizing; sites where it moves a lot are.
//!
//! # Usage
//!
//! Call [`init`] at the start of `main`, [`shutdown`] at the end, and mark
//! each unit of progress:
//!
//! ```ignore
//! fn main() {
//!     causalprof::init().expect("profiler");
//!     for request in requests() {
//!         let _unit = causalprof::unit();
//!         handle(request);
//!     }
//!     causalprof::shutdown();
//! }
//! ```
//!
//! Or use the `#[profile]` attribute to make every call of a function one
//! unit:
//!
//! ```ignore
//! use causalprof::profile;
//!
//! #[profile]
//! fn handle(request: Request) {
//!     // ... do work ...
//! }
//! ```
//!
//! [`init`] does nothing unless `CAUSALPROF_ENABLED=1`, which
//! `cargo causalprof run` sets. Experiments are appended to the file named by
//! `CAUSALPROF_OUTPUT` and read back by `cargo causalprof report`.
//!
//! The engine itself ([`Session`]) is independent of how samples are taken
//! and how delays are injected; see [`SampleSource`] and [`DelayActuator`].
//! The process-wide session uses the Linux `SIGPROF` backend in [`posix`].

pub mod config;
pub mod delay;
pub mod emit;
pub mod experiment;
pub mod ffi;
pub mod json_output;
mod lock_util;
pub mod posix;
pub mod progress;
pub mod report;
mod runner;
pub mod session;
pub mod timer;
pub mod validate;

use spin::Once;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use config::{ConfigError, ProfilerConfig};
pub use delay::{DelayActuator, DelayCoordinator};
pub use emit::{ExperimentRecord, Location, SymbolResolver};
pub use progress::{ProgressAccumulator, UnitGuard, UnitToken};
pub use session::{SampleSource, Session, SourceError, StartError};

/// Re-export the profile attribute macro.
pub use causalprof_macros::profile;

use posix::{SignalActuator, SignalSampler};
use validate::EnvironmentError;

static SESSION: Once<Session> = Once::new();

/// The process-wide session, created on first use.
///
/// It samples with [`SignalSampler`], injects delays with [`SignalActuator`]
/// and is configured from the `CAUSALPROF_*` environment variables. Invalid
/// variables are reported and replaced by defaults; use [`init`] to treat
/// them as errors.
pub fn global() -> &'static Session {
    SESSION.call_once(|| {
        let config = ProfilerConfig::from_env().unwrap_or_else(|e| {
            libc_print::libc_eprintln!("[causalprof] {}; using defaults", e);
            ProfilerConfig::default()
        });
        Session::with_config(
            config,
            Arc::new(SignalSampler::new()),
            Arc::new(SignalActuator),
        )
    })
}

/// Starts profiling the process, writing experiment records to `sink`.
///
/// # Errors
///
/// See [`StartError`].
pub fn start<W>(sink: W) -> Result<(), StartError>
where
    W: Write + Send + 'static,
{
    global().start(sink)
}

/// Stops profiling. Does nothing if profiling is not running.
pub fn stop() {
    if let Some(session) = SESSION.get() {
        session.stop();
    }
}

/// Returns true while the process-wide session is profiling.
#[must_use]
pub fn is_active() -> bool {
    SESSION.get().is_some_and(Session::is_active)
}

/// Marks the start of a unit of progress on this thread.
#[must_use]
pub fn begin_unit() -> UnitToken {
    global().progress().begin_unit()
}

/// Marks the unit started with `token` as complete. Call it on the thread
/// that called [`begin_unit`].
pub fn end_unit(token: UnitToken) {
    global().progress().end_unit(token);
}

/// Starts a unit of progress that completes when the guard is dropped.
pub fn unit() -> UnitGuard<'static> {
    global().progress().unit()
}

/// Starts profiling if `CAUSALPROF_ENABLED=1`.
///
/// Call this at the start of your program's `main()`. Records go to
/// `CAUSALPROF_OUTPUT` (default `causalprof.out`).
///
/// # Errors
///
/// Returns an error if profiling was requested but could not be started.
pub fn init() -> Result<(), InitError> {
    if !ProfilerConfig::enabled_from_env() {
        return Ok(());
    }

    ProfilerConfig::from_env().map_err(InitError::Config)?;
    validate::validate_environment().map_err(InitError::Environment)?;

    let path = ProfilerConfig::output_from_env();
    start_to_path(&path)?;

    let config = global().config();
    libc_print::libc_eprintln!(
        "[causalprof] profiling started: interval {:?}, window {:?}, cooldown {:?}, output {}",
        config.sampling_interval,
        config.measurement_window,
        config.cooldown,
        path.display()
    );
    Ok(())
}

/// Creates (or truncates) `path` and starts profiling into it.
///
/// The file is left untouched if profiling is already running.
///
/// # Errors
///
/// [`InitError::Output`] if the file cannot be created, or
/// [`InitError::Start`] if the session cannot start.
pub fn start_to_path(path: &Path) -> Result<(), InitError> {
    if is_active() {
        return Err(InitError::Start(StartError::AlreadyActive));
    }
    let file = File::create(path).map_err(|error| InitError::Output {
        path: path.to_path_buf(),
        error,
    })?;
    start(file).map_err(InitError::Start)
}

/// Stops profiling and reports how many call sites were sampled and how
/// much delay was injected.
pub fn shutdown() {
    if !is_active() {
        return;
    }
    let session = global();
    session.stop();
    libc_print::libc_eprintln!(
        "[causalprof] profiling stopped: {} call sites sampled, {:?} delay injected",
        session.call_sites(),
        SignalActuator::total_injected()
    );
}

/// Errors from [`init`] and [`start_to_path`].
#[derive(Debug)]
pub enum InitError {
    /// A `CAUSALPROF_*` variable is invalid.
    Config(ConfigError),
    /// The process cannot host the profiler.
    Environment(EnvironmentError),
    /// The output file could not be created.
    Output {
        /// The path that could not be created
        path: PathBuf,
        /// The underlying error
        error: io::Error,
    },
    /// The session failed to start.
    Start(StartError),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Environment(e) => write!(f, "{e}"),
            Self::Output { path, error } => {
                write!(f, "cannot create {}: {error}", path.display())
            }
            Self::Start(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Environment(e) => Some(e),
            Self::Output { error, .. } => Some(error),
            Self::Start(e) => Some(e),
        }
    }
}
