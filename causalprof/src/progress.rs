//! Progress accounting.
//!
//! A progress unit is an application-defined piece of useful work. Workers
//! bracket each unit with [`ProgressAccumulator::begin_unit`] and
//! [`ProgressAccumulator::end_unit`]; the profiler divides the accumulated time
//! by the number of units to get the mean cost of a unit under the running
//! experiment. Injected delay charged to the worker while the unit was in
//! flight is subtracted, so the measurement reflects application progress and
//! not the profiler's own sleeps.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::delay::DelayCoordinator;
use crate::lock_util::recover_lock;
use crate::timer::monotonic_nanos;

/// Start-of-unit snapshot returned by [`ProgressAccumulator::begin_unit`].
///
/// `#[repr(C)]` so that it can be handed across the C API unchanged.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitToken {
    /// `CLOCK_MONOTONIC` at the start of the unit, in nanoseconds.
    pub start_ns: u64,
    /// The worker's accumulated injected delay at the start, in nanoseconds.
    pub start_delay_ns: u64,
}

/// Running totals for the current experiment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    /// Units completed since the last reset.
    pub units: u64,
    /// Sum of the adjusted durations of those units, in nanoseconds.
    pub elapsed_ns: u64,
}

/// Aggregates completed units across all worker threads.
#[derive(Debug)]
pub struct ProgressAccumulator {
    coordinator: Arc<DelayCoordinator>,
    totals: Mutex<Totals>,
}

impl ProgressAccumulator {
    /// Creates an accumulator reading injected delay from `coordinator`.
    #[must_use]
    pub fn new(coordinator: Arc<DelayCoordinator>) -> Self {
        Self {
            coordinator,
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Marks the start of a unit on the calling thread.
    #[must_use]
    pub fn begin_unit(&self) -> UnitToken {
        UnitToken {
            start_ns: monotonic_nanos(),
            start_delay_ns: duration_nanos(self.coordinator.accumulated_delay()),
        }
    }

    /// Records a unit started with `token` as complete.
    ///
    /// Must be called on the thread that called `begin_unit`, since the
    /// injected delay is tracked per thread.
    pub fn end_unit(&self, token: UnitToken) {
        let elapsed = monotonic_nanos().saturating_sub(token.start_ns);
        let delayed =
            duration_nanos(self.coordinator.accumulated_delay()).saturating_sub(token.start_delay_ns);
        let adjusted = elapsed.saturating_sub(delayed);

        let mut totals = recover_lock(self.totals.lock());
        totals.units += 1;
        totals.elapsed_ns = totals.elapsed_ns.saturating_add(adjusted);
    }

    /// Starts a unit that ends when the returned guard is dropped.
    #[must_use]
    pub fn unit(&self) -> UnitGuard<'_> {
        UnitGuard {
            accumulator: self,
            token: self.begin_unit(),
        }
    }

    /// Zeroes the totals. Called once per experiment before arming.
    pub fn reset(&self) {
        *recover_lock(self.totals.lock()) = Totals::default();
    }

    /// Current totals.
    #[must_use]
    pub fn snapshot(&self) -> Totals {
        *recover_lock(self.totals.lock())
    }

    /// Mean adjusted duration per unit, or `None` if no unit completed.
    #[must_use]
    pub fn mean_duration(&self) -> Option<Duration> {
        let totals = self.snapshot();
        if totals.units == 0 {
            return None;
        }
        Some(Duration::from_nanos(totals.elapsed_ns / totals.units))
    }
}

/// Ends its unit when dropped. See [`ProgressAccumulator::unit`].
#[derive(Debug)]
#[must_use = "the unit ends as soon as the guard is dropped"]
pub struct UnitGuard<'a> {
    accumulator: &'a ProgressAccumulator,
    token: UnitToken,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        self.accumulator.end_unit(self.token);
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
