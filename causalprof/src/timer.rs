//! Clocks, sleeps and the process-wide profiling timer.
//!
//! Everything here is callable from the `SIGPROF` handler: the clock is read
//! with `clock_gettime` and sleeps use `nanosleep` directly, neither of which
//! allocates or takes a lock.

use libc::{itimerval, timespec, timeval, CLOCK_MONOTONIC};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Longest single `nanosleep` issued while injecting a delay.
///
/// Injected sleeps are cut into slices of this length so that an interrupt
/// request is observed within one slice.
pub(crate) const SLEEP_SLICE: Duration = Duration::from_millis(1);

/// Reads `CLOCK_MONOTONIC` in nanoseconds.
#[must_use]
pub fn monotonic_nanos() -> u64 {
    let mut ts = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into a valid, initialized timespec.
    unsafe {
        libc::clock_gettime(CLOCK_MONOTONIC, &raw mut ts);
    }
    #[allow(clippy::cast_sign_loss)]
    {
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
}

/// The process-wide CPU-time profiling timer (`ITIMER_PROF`).
///
/// While running, the kernel delivers `SIGPROF` to the process every
/// `interval` of consumed CPU time, normally to the thread that was running
/// when the interval expired.
#[derive(Debug, Default)]
pub(crate) struct ProfTimer;

impl ProfTimer {
    /// Arms the timer with the given sampling interval.
    ///
    /// # Errors
    ///
    /// Returns an error if `setitimer` rejects the interval.
    pub(crate) fn start(&self, interval: Duration) -> Result<(), TimerError> {
        let tv = duration_to_timeval(interval);
        set_prof_timer(&itimerval {
            it_interval: tv,
            it_value: tv,
        })
    }

    /// Disarms the timer. No further `SIGPROF` is generated after this returns,
    /// although one may already be pending.
    ///
    /// # Errors
    ///
    /// Returns an error if `setitimer` fails.
    pub(crate) fn stop(&self) -> Result<(), TimerError> {
        let zero = timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        set_prof_timer(&itimerval {
            it_interval: zero,
            it_value: zero,
        })
    }
}

fn set_prof_timer(value: &itimerval) -> Result<(), TimerError> {
    // SAFETY: setitimer is given a valid itimerval and a null old-value pointer.
    let result = unsafe { libc::setitimer(libc::ITIMER_PROF as _, value, ptr::null_mut()) };
    if result == -1 {
        return Err(TimerError::SetTimeFailed(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn duration_to_timeval(duration: Duration) -> timeval {
    timeval {
        tv_sec: duration.as_secs().cast_signed(),
        tv_usec: i64::from(duration.subsec_micros()),
    }
}

/// Converts a Duration to a libc timespec.
fn duration_to_timespec(duration: Duration) -> timespec {
    timespec {
        tv_sec: duration.as_secs().cast_signed(),
        tv_nsec: i64::from(duration.subsec_nanos()),
    }
}

/// Errors raised by the profiling timer.
#[derive(Debug)]
pub enum TimerError {
    /// `setitimer` failed.
    SetTimeFailed(std::io::Error),
}

impl std::fmt::Display for TimerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetTimeFailed(e) => write!(f, "failed to set profiling timer: {e}"),
        }
    }
}

impl std::error::Error for TimerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SetTimeFailed(e) => Some(e),
        }
    }
}

/// Sleeps for the specified duration using POSIX nanosleep.
///
/// Interrupted sleeps are resumed with the remaining time.
///
/// # Errors
///
/// Returns an error if nanosleep fails for a reason other than being interrupted.
pub(crate) fn nanosleep(duration: Duration) -> Result<(), NanosleepError> {
    let mut request = duration_to_timespec(duration);
    let mut remaining = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    loop {
        // SAFETY: nanosleep is called with valid pointers
        let result = unsafe { libc::nanosleep(&raw const request, &raw mut remaining) };

        if result == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            request = remaining;
        } else {
            return Err(NanosleepError::Failed(err));
        }
    }
}

/// Sleeps for `duration` in [`SLEEP_SLICE`] steps, returning early once
/// `epoch` no longer holds `observed`.
///
/// Returns the wall time actually slept. Safe to call from a signal handler.
pub(crate) fn sleep_until_interrupted(
    duration: Duration,
    epoch: &AtomicU64,
    observed: u64,
) -> Duration {
    let start = monotonic_nanos();
    let deadline = start.saturating_add(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX));

    loop {
        if epoch.load(Ordering::Acquire) != observed {
            break;
        }
        let now = monotonic_nanos();
        if now >= deadline {
            break;
        }
        let slice = Duration::from_nanos(deadline - now).min(SLEEP_SLICE);
        if nanosleep(slice).is_err() {
            break;
        }
    }

    Duration::from_nanos(monotonic_nanos().saturating_sub(start))
}

/// Errors that can occur during nanosleep.
#[derive(Debug)]
pub(crate) enum NanosleepError {
    /// nanosleep failed.
    Failed(std::io::Error),
}

impl std::fmt::Display for NanosleepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "nanosleep failed: {e}"),
        }
    }
}

impl std::error::Error for NanosleepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(e) => Some(e),
        }
    }
}
