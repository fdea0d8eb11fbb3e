//! Environment validation for causal profiling.
//!
//! Checks that the process can host the `SIGPROF` backend before a session
//! is started, so that [`crate::init`] can fail with an actionable message
//! instead of a bare error code.

use std::fmt;
use std::io;

pub use crate::posix::{sigprof_disposition, SigprofDisposition};

/// Errors that can occur during environment validation.
#[derive(Debug)]
pub enum EnvironmentError {
    /// Another handler owns `SIGPROF`, normally another sampling profiler.
    SigprofInUse,

    /// The current `SIGPROF` disposition could not be read.
    SignalQueryFailed {
        /// The underlying error
        error: io::Error,
    },

    /// The backend does not support this target.
    UnsupportedPlatform {
        /// Operating system of this build
        os: &'static str,
        /// Architecture of this build
        arch: &'static str,
    },
}

impl fmt::Display for EnvironmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SigprofInUse => write!(
                f,
                "[causalprof] FATAL: SIGPROF already has a handler.\n\n\
                 Cause: another CPU profiler (gperftools, a pprof agent, ...) is active\n\
                 in this process.\n\n\
                 Disable the other profiler, or run without CAUSALPROF_ENABLED=1."
            ),
            Self::SignalQueryFailed { error } => {
                write!(f, "[causalprof] FATAL: Could not query SIGPROF handler: {error}")
            }
            Self::UnsupportedPlatform { os, arch } => write!(
                f,
                "[causalprof] FATAL: Unsupported platform {os}/{arch}.\n\n\
                 Causal profiling needs Linux on x86_64 or aarch64."
            ),
        }
    }
}

impl std::error::Error for EnvironmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SignalQueryFailed { error } => Some(error),
            Self::SigprofInUse | Self::UnsupportedPlatform { .. } => None,
        }
    }
}

/// Validates that the environment supports causal profiling.
///
/// It checks:
/// 1. The target has a register reader for the signal handler
/// 2. No other handler owns `SIGPROF`
///
/// # Errors
///
/// Returns an [`EnvironmentError`] with a clear, actionable message if
/// any requirement is not met.
pub fn validate_environment() -> Result<(), EnvironmentError> {
    check_platform()?;

    match sigprof_disposition() {
        Ok(SigprofDisposition::Foreign) => Err(EnvironmentError::SigprofInUse),
        Ok(SigprofDisposition::Default | SigprofDisposition::Ours) => Ok(()),
        Err(error) => Err(EnvironmentError::SignalQueryFailed { error }),
    }
}

fn check_platform() -> Result<(), EnvironmentError> {
    if cfg!(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    )) {
        Ok(())
    } else {
        Err(EnvironmentError::UnsupportedPlatform {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        })
    }
}
