//! Per-call-site experiment scheduling.
//!
//! Every call site gets one baseline (0%) experiment and one experiment at
//! each slowdown level from 5% to 100% in 5% steps, each exactly once per
//! session. The slowdown levels are run in a random order, and the baseline is
//! slotted in at a random point of that order rather than always first, so
//! that slow drift over a session does not bias the comparison.

use dashmap::DashMap;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use std::time::Duration;

use crate::lock_util::recover_lock;

/// Number of non-baseline slowdown levels per call site.
pub const SLOWDOWN_LEVELS: u8 = 20;

/// Percentage added by each slowdown level.
pub const PERCENT_PER_LEVEL: u8 = 5;

/// Chance of picking the baseline on each call until it has run.
const BASELINE_PROBABILITY: f64 = 0.5;

/// A slowdown level: 0 is the baseline, 1..=20 map to 5%..=100%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DelayLevel(u8);

impl DelayLevel {
    /// The zero-delay control level.
    pub const BASELINE: Self = Self(0);

    /// Creates a level, or `None` if it is above [`SLOWDOWN_LEVELS`].
    #[must_use]
    pub fn new(level: u8) -> Option<Self> {
        (level <= SLOWDOWN_LEVELS).then_some(Self(level))
    }

    /// The raw level, 0..=20.
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Returns true for the baseline level.
    #[must_use]
    pub fn is_baseline(self) -> bool {
        self.0 == 0
    }

    /// The slowdown this level represents, in percent of the reference unit.
    #[must_use]
    pub fn percent(self) -> u32 {
        u32::from(self.0) * u32::from(PERCENT_PER_LEVEL)
    }

    /// Delay charged per matching sample, given the reference unit (the
    /// sampling interval).
    #[must_use]
    pub fn delay_per_sample(self, reference: Duration) -> Duration {
        reference * self.percent() / 100
    }
}

/// Experiment bookkeeping for one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentState {
    /// Whether the baseline experiment has been handed out.
    pub has_run_baseline: bool,
    /// Slowdown levels not yet tried, consumed from the front.
    pub remaining: Vec<u8>,
}

impl ExperimentState {
    fn new(rng: &mut SmallRng) -> Self {
        let mut remaining: Vec<u8> = (1..=SLOWDOWN_LEVELS).collect();
        remaining.shuffle(rng);
        Self {
            has_run_baseline: false,
            remaining,
        }
    }

    /// Returns true once the baseline and every slowdown level have run.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.has_run_baseline && self.remaining.is_empty()
    }

    fn select(&mut self, rng: &mut SmallRng) -> Option<DelayLevel> {
        if !self.has_run_baseline
            && (self.remaining.is_empty() || rng.gen_bool(BASELINE_PROBABILITY))
        {
            self.has_run_baseline = true;
            return Some(DelayLevel::BASELINE);
        }
        if self.remaining.is_empty() {
            return None;
        }
        Some(DelayLevel(self.remaining.remove(0)))
    }
}

/// The experiment table for one profiling session.
///
/// Sites are created lazily the first time they are sampled and are never
/// removed; a new session starts with a fresh scheduler.
pub struct Scheduler {
    sites: DashMap<usize, ExperimentState>,
    rng: Mutex<SmallRng>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("sites", &self.sites.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates an empty scheduler. A `None` seed draws one from the OS.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(SmallRng::from_entropy, SmallRng::seed_from_u64);
        Self {
            sites: DashMap::new(),
            rng: Mutex::new(rng),
        }
    }

    /// Picks the next level to test at `pc`, or `None` once the site is
    /// exhausted.
    pub fn next_level(&self, pc: usize) -> Option<DelayLevel> {
        let mut rng = recover_lock(self.rng.lock());
        let mut site = self
            .sites
            .entry(pc)
            .or_insert_with(|| ExperimentState::new(&mut rng));
        site.select(&mut rng)
    }

    /// Number of distinct call sites seen so far.
    #[must_use]
    pub fn call_sites(&self) -> usize {
        self.sites.len()
    }

    /// A copy of the state for `pc`, if it has been sampled.
    #[must_use]
    pub fn state(&self, pc: usize) -> Option<ExperimentState> {
        self.sites.get(&pc).map(|site| site.value().clone())
    }
}
