//! Profiler configuration.
//!
//! Defaults reproduce the classic constants: a 1 kHz sampling rate, a
//! measurement window of 500 sampling intervals and a cooldown of 1000
//! sampling intervals between experiments. `cargo causalprof run` passes its
//! flags to the profiled program through the `CAUSALPROF_*` variables read by
//! [`ProfilerConfig::from_env`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Enables profiling in [`crate::init`] when set to `1`.
pub const ENV_ENABLED: &str = "CAUSALPROF_ENABLED";
/// Path of the experiment record file written by [`crate::init`].
pub const ENV_OUTPUT: &str = "CAUSALPROF_OUTPUT";
/// Sampling interval in microseconds.
pub const ENV_INTERVAL_US: &str = "CAUSALPROF_INTERVAL_US";
/// Measurement window in milliseconds.
pub const ENV_WINDOW_MS: &str = "CAUSALPROF_WINDOW_MS";
/// Post-experiment cooldown in milliseconds.
pub const ENV_COOLDOWN_MS: &str = "CAUSALPROF_COOLDOWN_MS";
/// Seed for the experiment scheduler's permutations.
pub const ENV_SEED: &str = "CAUSALPROF_SEED";
/// Logs dropped experiments when set to `1`.
pub const ENV_VERBOSE: &str = "CAUSALPROF_VERBOSE";

/// Output path used by [`crate::init`] when `CAUSALPROF_OUTPUT` is unset.
pub const DEFAULT_OUTPUT: &str = "causalprof.out";

/// Default sampling interval (1 kHz).
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration for a profiling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// Interval between samples. Also the reference unit for delay levels:
    /// a 100% experiment delays a matching thread by one interval per sample.
    pub sampling_interval: Duration,
    /// How long each experiment measures progress.
    pub measurement_window: Duration,
    /// Pause after each experiment so delayed threads settle back to normal.
    pub cooldown: Duration,
    /// Seed for the scheduler. `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Log experiments dropped for lack of progress.
    pub verbose: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            measurement_window: DEFAULT_SAMPLING_INTERVAL * 500,
            cooldown: DEFAULT_SAMPLING_INTERVAL * 1000,
            seed: None,
            verbose: false,
        }
    }
}

impl ProfilerConfig {
    /// Reads the configuration from `CAUSALPROF_*` environment variables,
    /// falling back to [`Default`] for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set but cannot be
    /// parsed, or if an interval or window is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`ProfilerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(us) = parse_var::<u64, _>(&lookup, ENV_INTERVAL_US)? {
            config.sampling_interval = nonzero(ENV_INTERVAL_US, us, Duration::from_micros)?;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_WINDOW_MS)? {
            config.measurement_window = nonzero(ENV_WINDOW_MS, ms, Duration::from_millis)?;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_COOLDOWN_MS)? {
            config.cooldown = Duration::from_millis(ms);
        }
        config.seed = parse_var::<u64, _>(&lookup, ENV_SEED)?;
        config.verbose = lookup(ENV_VERBOSE).is_some_and(|v| v == "1");

        Ok(config)
    }

    /// Returns true when `CAUSALPROF_ENABLED=1`.
    #[must_use]
    pub fn enabled_from_env() -> bool {
        std::env::var(ENV_ENABLED).is_ok_and(|v| v == "1")
    }

    /// Output path from `CAUSALPROF_OUTPUT`, or [`DEFAULT_OUTPUT`].
    #[must_use]
    pub fn output_from_env() -> PathBuf {
        std::env::var_os(ENV_OUTPUT).map_or_else(|| PathBuf::from(DEFAULT_OUTPUT), PathBuf::from)
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn nonzero(
    var: &'static str,
    value: u64,
    to_duration: fn(u64) -> Duration,
) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        });
    }
    Ok(to_duration(value))
}

/// Errors produced while reading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable held a value that could not be used.
    Invalid {
        /// The offending variable.
        var: &'static str,
        /// Its raw value.
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}
