//! The profiling loop.
//!
//! One experiment per iteration:
//! 1. Take the next sample and pick a delay level for its call site
//! 2. Reset progress, arm the delay and measure for one window
//! 3. Disarm and emit the mean cost of a unit, if any unit completed
//! 4. Cool down so that delayed threads settle before the next experiment
//!
//! The loop owns nothing the session locks, so [`crate::Session::stop`] can
//! always interrupt it.

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProfilerConfig;
use crate::delay::DelayCoordinator;
use crate::emit::{Emitter, ExperimentRecord};
use crate::experiment::{DelayLevel, Scheduler};
use crate::progress::ProgressAccumulator;
use crate::session::SampleSource;

/// Everything the loop thread needs, moved in at spawn.
pub(crate) struct LoopContext<W: Write> {
    pub(crate) source: Arc<dyn SampleSource>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) coordinator: Arc<DelayCoordinator>,
    pub(crate) progress: Arc<ProgressAccumulator>,
    pub(crate) emitter: Emitter<W>,
    pub(crate) stop: Receiver<()>,
    pub(crate) config: ProfilerConfig,
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The session was stopped.
    Stopped,
    /// The sample source ran dry.
    SourceEnded,
    /// Writing a record failed.
    SinkFailed,
}

/// Result of a single experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Recorded,
    NoProgress,
    Interrupted,
    SinkFailed,
}

/// Runs experiments until stopped, the source ends, or the sink fails.
pub(crate) fn run_loop<W: Write>(mut ctx: LoopContext<W>) -> LoopExit {
    loop {
        if stop_requested(&ctx.stop) {
            return LoopExit::Stopped;
        }

        let Some(pc) = ctx.source.next_sample() else {
            // A stopped source also ends the stream.
            return if stop_requested(&ctx.stop) {
                LoopExit::Stopped
            } else {
                LoopExit::SourceEnded
            };
        };

        let Some(level) = ctx.scheduler.next_level(pc) else {
            ctx.coordinator.disarm();
            continue;
        };

        match run_experiment(&mut ctx, pc, level) {
            Outcome::Recorded | Outcome::NoProgress => {}
            Outcome::Interrupted => return LoopExit::Stopped,
            Outcome::SinkFailed => return LoopExit::SinkFailed,
        }

        if wait_for_stop(&ctx.stop, ctx.config.cooldown) {
            return LoopExit::Stopped;
        }
    }
}

fn run_experiment<W: Write>(ctx: &mut LoopContext<W>, pc: usize, level: DelayLevel) -> Outcome {
    ctx.progress.reset();
    ctx.coordinator
        .arm(pc, level.delay_per_sample(ctx.config.sampling_interval));

    let stopped = wait_for_stop(&ctx.stop, ctx.config.measurement_window);
    ctx.coordinator.disarm();
    if stopped {
        return Outcome::Interrupted;
    }

    let Some(mean) = ctx.progress.mean_duration() else {
        if ctx.config.verbose {
            libc_print::libc_eprintln!(
                "[causalprof] dropping experiment at {:#x} ({}%): no progress",
                pc,
                level.percent()
            );
        }
        return Outcome::NoProgress;
    };

    let record = ExperimentRecord {
        pc: pc as u64,
        percent: i32::try_from(level.percent()).unwrap_or(i32::MAX),
        nanos_per_unit: i64::try_from(mean.as_nanos()).unwrap_or(i64::MAX),
    };
    match ctx.emitter.emit(&record) {
        Ok(()) => Outcome::Recorded,
        Err(e) => {
            libc_print::libc_eprintln!("[causalprof] failed to write experiment record: {}", e);
            Outcome::SinkFailed
        }
    }
}

/// Non-blocking check of the stop channel. A dropped sender counts as stop.
fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

/// Sleeps for `timeout` unless stopped first. Returns true if stopped.
fn wait_for_stop(stop: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(stop.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}
