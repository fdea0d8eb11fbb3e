//! Utilities for handling lock poisoning in profiling contexts.
//!
//! A worker thread that panics between `begin_unit` and `end_unit`, or while
//! the profiling loop is arming a delay, must not take the profiler down with
//! it. Poisoned locks are recovered and the data behind them is used as-is.

use std::sync::{LockResult, MutexGuard};

/// Recovers from a poisoned mutex.
///
/// # Example
///
/// ```ignore
/// use std::sync::Mutex;
///
/// let totals = Mutex::new(0_u64);
/// *recover_lock(totals.lock()) += 1;
/// ```
pub(crate) fn recover_lock<T>(result: LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    result.unwrap_or_else(|poison| {
        libc_print::libc_eprintln!("[causalprof] warning: recovering from poisoned lock");
        poison.into_inner()
    })
}
