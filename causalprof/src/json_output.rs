//! JSON output format with schema versioning.
//!
//! Machine-readable form of a [`Report`], used by `cargo causalprof report
//! --format json`.
//!
//! # Schema Versioning
//!
//! The output includes a schema version so consumers can handle format
//! changes. The current schema version is 1.
//!
//! # Example Output
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "profiler": "causalprof",
//!   "profiler_version": "0.1.0",
//!   "sites": [...],
//!   "impacts": [...],
//!   "metadata": {...}
//! }
//! ```

use serde::Serialize;

use crate::report::{RegressionResult, Report, SiteReport};

/// Current schema version for the JSON output format.
///
/// Increment this when making breaking changes to the output structure.
pub const SCHEMA_VERSION: u32 = 1;

/// Complete report in JSON form.
#[derive(Debug, Clone, Serialize)]
pub struct JsonOutput {
    /// Schema version for format compatibility checking.
    pub schema_version: u32,
    /// Name of the profiler.
    pub profiler: &'static str,
    /// Version of the profiler.
    pub profiler_version: &'static str,
    /// Every site with its experiments.
    pub sites: Vec<SiteEntry>,
    /// Regression results, most sensitive site first.
    pub impacts: Vec<ImpactEntry>,
    /// Summary counts.
    pub metadata: Metadata,
}

/// Summary counts for a report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Metadata {
    /// Total number of experiment records.
    pub total_experiments: usize,
    /// Number of distinct call sites.
    pub unique_sites: usize,
    /// Number of sites with a significant, well-fitting impact.
    pub significant_impacts: usize,
}

/// One call site and its experiments.
#[derive(Debug, Clone, Serialize)]
pub struct SiteEntry {
    /// Program counter, as a hex string.
    pub pc: String,
    /// Source location, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Experiments in ascending percent order.
    pub experiments: Vec<ExperimentEntry>,
}

/// A single experiment.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExperimentEntry {
    /// Slowdown in percent of the sampling interval.
    pub percent: i32,
    /// Mean cost of a progress unit.
    pub nanos_per_unit: i64,
    /// Change relative to the site's baseline, in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_change: Option<f64>,
}

impl SiteEntry {
    /// Converts a report site.
    #[must_use]
    pub fn from_site(site: &SiteReport) -> Self {
        Self {
            pc: format!("{:#x}", site.pc),
            location: site.location.clone(),
            experiments: site
                .points
                .iter()
                .map(|p| ExperimentEntry {
                    percent: p.percent,
                    nanos_per_unit: p.nanos_per_unit,
                    relative_change: p.relative_change,
                })
                .collect(),
        }
    }
}

/// A site's impact with its statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ImpactEntry {
    /// Program counter, as a hex string.
    pub pc: String,
    /// Source location, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// ns/op added per percent of slowdown.
    pub impact: f64,
    /// Statistical analysis of the impact.
    pub statistics: StatisticsEntry,
}

/// Statistical analysis of an impact.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatisticsEntry {
    /// Coefficient of determination (R²).
    pub r_squared: f64,
    /// Standard error of the slope estimate.
    pub slope_std_error: f64,
    /// Lower bound of 95% confidence interval for slope.
    pub ci_lower: f64,
    /// Upper bound of 95% confidence interval for slope.
    pub ci_upper: f64,
    /// Number of data points used in the regression.
    pub n: usize,
    /// Whether the impact is statistically significant at 95% confidence.
    pub is_significant: bool,
    /// Whether the regression has a good fit (R² > 0.7).
    pub has_good_fit: bool,
}

impl StatisticsEntry {
    /// Creates a statistics entry from a regression result.
    #[must_use]
    pub fn from_regression(reg: &RegressionResult) -> Self {
        Self {
            r_squared: reg.r_squared,
            slope_std_error: reg.slope_std_error,
            ci_lower: reg.slope_ci_lower,
            ci_upper: reg.slope_ci_upper,
            n: reg.n,
            is_significant: reg.is_significant(),
            has_good_fit: reg.has_good_fit(),
        }
    }
}

/// Builds the JSON structure for `report`.
#[must_use]
pub fn generate_output(report: &Report) -> JsonOutput {
    let sites: Vec<SiteEntry> = report.sites.iter().map(SiteEntry::from_site).collect();

    let impacts: Vec<ImpactEntry> = report
        .ranked()
        .into_iter()
        .map(|(site, reg)| ImpactEntry {
            pc: format!("{:#x}", site.pc),
            location: site.location.clone(),
            impact: reg.slope,
            statistics: StatisticsEntry::from_regression(&reg),
        })
        .collect();

    let significant_impacts = impacts
        .iter()
        .filter(|i| i.statistics.is_significant && i.statistics.has_good_fit)
        .count();

    JsonOutput {
        schema_version: SCHEMA_VERSION,
        profiler: "causalprof",
        profiler_version: env!("CARGO_PKG_VERSION"),
        metadata: Metadata {
            total_experiments: report.total_experiments(),
            unique_sites: sites.len(),
            significant_impacts,
        },
        sites,
        impacts,
    }
}

/// Serializes `report` to a JSON string.
///
/// # Errors
///
/// Returns an error if JSON serialization fails (should not happen in practice).
pub fn to_json_string(report: &Report, pretty: bool) -> Result<String, serde_json::Error> {
    let output = generate_output(report);
    if pretty {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    }
}
