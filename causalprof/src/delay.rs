//! Delay injection.
//!
//! The [`DelayActuator`] is the mechanism that actually puts threads to sleep;
//! the [`DelayCoordinator`] is the profiler's single point of control over it.
//! The profiling loop is the only caller of `arm`/`disarm`, while application
//! threads read the accumulated delay through the progress accumulator.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock_util::recover_lock;

/// Something that can slow down execution contexts at a program counter.
///
/// Implementations must tolerate `arm` being called while other threads are
/// being sampled and delayed: a new arming applies from the next sample of
/// each thread and never cuts short a sleep already in progress. Only
/// [`DelayActuator::interrupt`] ends in-progress sleeps early.
pub trait DelayActuator: Send + Sync {
    /// Charges `delay_per_sample` to every thread sampled at or beneath `pc`.
    /// A zero delay (or a zero pc) disables injection.
    fn arm(&self, pc: usize, delay_per_sample: Duration);

    /// Total delay injected into the calling thread so far. Monotonic.
    fn accumulated_delay(&self) -> Duration;

    /// Wakes every thread currently sleeping on an injected delay.
    fn interrupt(&self);
}

/// The current arming of the actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arming {
    /// Program counter being slowed down.
    pub pc: usize,
    /// Delay charged per matching sample.
    pub delay_per_sample: Duration,
}

/// Serializes arming and disarming of a [`DelayActuator`].
pub struct DelayCoordinator {
    actuator: Arc<dyn DelayActuator>,
    armed: Mutex<Option<Arming>>,
}

impl fmt::Debug for DelayCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayCoordinator")
            .field("armed", &*recover_lock(self.armed.lock()))
            .finish_non_exhaustive()
    }
}

impl DelayCoordinator {
    /// Wraps an actuator. Nothing is armed initially.
    #[must_use]
    pub fn new(actuator: Arc<dyn DelayActuator>) -> Self {
        Self {
            actuator,
            armed: Mutex::new(None),
        }
    }

    /// Arms the actuator for `pc`.
    pub fn arm(&self, pc: usize, delay_per_sample: Duration) {
        let mut armed = recover_lock(self.armed.lock());
        self.actuator.arm(pc, delay_per_sample);
        *armed = Some(Arming {
            pc,
            delay_per_sample,
        });
    }

    /// Disarms the actuator. Equivalent to arming with a zero delay.
    pub fn disarm(&self) {
        let mut armed = recover_lock(self.armed.lock());
        self.actuator.arm(0, Duration::ZERO);
        *armed = None;
    }

    /// Disarms and wakes every thread still sleeping on an injected delay.
    pub fn release_all(&self) {
        self.disarm();
        self.actuator.interrupt();
    }

    /// The active arming, if any.
    #[must_use]
    pub fn armed(&self) -> Option<Arming> {
        *recover_lock(self.armed.lock())
    }

    /// Delay injected into the calling thread so far.
    #[must_use]
    pub fn accumulated_delay(&self) -> Duration {
        self.actuator.accumulated_delay()
    }
}
