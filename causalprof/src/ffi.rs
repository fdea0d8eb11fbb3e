//! C-compatible API.
//!
//! Lets programs written in other languages, or loaded through the `cdylib`,
//! drive the process-wide session and mark progress units.
//!
//! # Usage from C
//!
//! ```c
//! #include "causalprof.h"
//!
//! int main(void) {
//!     if (causalprof_start("causalprof.out") != 0) {
//!         return 1;
//!     }
//!     for (;;) {
//!         causalprof_unit_token unit = causalprof_unit_begin();
//!         handle_request();
//!         causalprof_unit_end(unit);
//!     }
//!     causalprof_stop();
//! }
//! ```
//!
//! # Thread Safety
//!
//! All functions are thread-safe. A token must be ended on the thread that
//! began it.

use libc::{c_char, c_int};
use std::ffi::CStr;
use std::path::Path;

use crate::progress::UnitToken;
use crate::session::StartError;
use crate::InitError;

/// Profiling started.
pub const CAUSALPROF_OK: c_int = 0;
/// Profiling is already running.
pub const CAUSALPROF_ALREADY_ACTIVE: c_int = 1;
/// Another CPU profiler owns `SIGPROF`.
pub const CAUSALPROF_CONFLICTING_PROFILER: c_int = 2;
/// Any other failure: bad path, I/O error, thread spawn failure.
pub const CAUSALPROF_ERROR: c_int = -1;

/// Starts profiling, writing experiment records to the file at `path`.
///
/// Returns one of the `CAUSALPROF_*` codes. Failures other than the two
/// specific codes are logged to stderr.
///
/// # Safety
///
/// `path` must be null or point to a valid, null-terminated string.
#[no_mangle]
#[allow(unreachable_pub)] // Exposed via C ABI
pub unsafe extern "C" fn causalprof_start(path: *const c_char) -> c_int {
    if path.is_null() {
        return CAUSALPROF_ERROR;
    }
    let Ok(path) = CStr::from_ptr(path).to_str() else {
        libc_print::libc_eprintln!("[causalprof] output path is not valid UTF-8");
        return CAUSALPROF_ERROR;
    };

    match crate::start_to_path(Path::new(path)) {
        Ok(()) => CAUSALPROF_OK,
        Err(e) => start_code(&e),
    }
}

fn start_code(err: &InitError) -> c_int {
    match err {
        InitError::Start(StartError::AlreadyActive) => CAUSALPROF_ALREADY_ACTIVE,
        InitError::Start(StartError::ConflictingProfiler) => CAUSALPROF_CONFLICTING_PROFILER,
        other => {
            libc_print::libc_eprintln!("[causalprof] {}", other);
            CAUSALPROF_ERROR
        }
    }
}

/// Stops profiling. Safe to call when profiling is not running.
#[no_mangle]
#[allow(unreachable_pub)] // Exposed via C ABI
pub extern "C" fn causalprof_stop() {
    crate::stop();
}

/// Returns 1 while profiling is running, 0 otherwise.
#[no_mangle]
#[allow(unreachable_pub)] // Exposed via C ABI
pub extern "C" fn causalprof_is_active() -> c_int {
    c_int::from(crate::is_active())
}

/// Begins a unit of progress on the calling thread.
#[no_mangle]
#[allow(unreachable_pub)] // Exposed via C ABI
pub extern "C" fn causalprof_unit_begin() -> UnitToken {
    crate::begin_unit()
}

/// Completes a unit begun with [`causalprof_unit_begin`].
#[no_mangle]
#[allow(unreachable_pub)] // Exposed via C ABI
pub extern "C" fn causalprof_unit_end(token: UnitToken) {
    crate::end_unit(token);
}
