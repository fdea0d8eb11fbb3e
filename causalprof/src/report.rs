//! Reading experiment record files back.
//!
//! The reader accepts the format written by [`crate::emit::Emitter`]: blank
//! lines and lines starting with `#` are skipped, every other line must be
//! `<pc> <percent> <ns>`. A single malformed line fails the whole parse.
//!
//! [`Report`] groups records by call site, orders each site's experiments by
//! slowdown and relates them to the site's baseline (0%) experiment. It also
//! fits a line through (percent, ns/op) per site: the slope is how much a unit
//! of progress costs per percent of slowdown at that site, i.e. how sensitive
//! the program is to that code.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead};

use crate::emit::ExperimentRecord;

/// A parse failure, with the 1-based line it occurred on.
#[derive(Debug)]
pub struct ParseError {
    /// Line number, starting at 1. Zero for read errors before any line.
    pub line: usize,
    /// What went wrong.
    pub kind: ParseErrorKind,
}

/// The cause of a [`ParseError`].
#[derive(Debug)]
pub enum ParseErrorKind {
    /// A data line did not have exactly three fields.
    FieldCount(usize),
    /// The pc field was not a hex (`0x`) or decimal address.
    BadPc(String),
    /// The percent field was not an integer.
    BadPercent(String),
    /// The ns field was not an integer.
    BadNanos(String),
    /// The underlying reader failed.
    Io(io::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: ", self.line)?;
        match &self.kind {
            ParseErrorKind::FieldCount(n) => write!(f, "expected 3 fields, found {n}"),
            ParseErrorKind::BadPc(s) => write!(f, "invalid pc {s:?}"),
            ParseErrorKind::BadPercent(s) => write!(f, "invalid percent {s:?}"),
            ParseErrorKind::BadNanos(s) => write!(f, "invalid ns/op {s:?}"),
            ParseErrorKind::Io(e) => write!(f, "read failed: {e}"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ParseErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// A record together with the location comment written above it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedRecord {
    pub record: ExperimentRecord,
    /// The `function file:line` header, as written by the profiled process.
    pub location: Option<String>,
}

/// Parses every record in `input`.
///
/// # Errors
///
/// Returns a [`ParseError`] for the first malformed line or read failure.
pub fn parse_records<R: BufRead>(input: R) -> Result<Vec<ExperimentRecord>, ParseError> {
    Ok(parse_annotated(input)?
        .into_iter()
        .map(|annotated| annotated.record)
        .collect())
}

/// Parses every record in `input`, keeping location comments.
///
/// # Errors
///
/// See [`parse_records`].
pub fn parse_annotated<R: BufRead>(input: R) -> Result<Vec<AnnotatedRecord>, ParseError> {
    let mut records = Vec::new();
    let mut location: Option<String> = None;

    for (index, line) in input.lines().enumerate() {
        let number = index + 1;
        let line = line.map_err(|e| ParseError {
            line: number,
            kind: ParseErrorKind::Io(e),
        })?;
        let line = line.trim();

        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim();
            if comment.starts_with("<unknown>") {
                location = None;
            } else if !comment.starts_with("speedup ") && !comment.ends_with("ns/op") {
                location = Some(comment.to_string());
            }
            continue;
        }

        let record = parse_line(line).map_err(|kind| ParseError { line: number, kind })?;
        records.push(AnnotatedRecord {
            record,
            location: location.take(),
        });
    }

    Ok(records)
}

fn parse_line(line: &str) -> Result<ExperimentRecord, ParseErrorKind> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [pc, percent, nanos] = fields[..] else {
        return Err(ParseErrorKind::FieldCount(fields.len()));
    };

    let pc = match pc.strip_prefix("0x").or_else(|| pc.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => pc.parse(),
    }
    .map_err(|_| ParseErrorKind::BadPc(pc.to_string()))?;
    let percent = percent
        .parse()
        .map_err(|_| ParseErrorKind::BadPercent(percent.to_string()))?;
    let nanos_per_unit = nanos
        .parse()
        .map_err(|_| ParseErrorKind::BadNanos(nanos.to_string()))?;

    Ok(ExperimentRecord {
        pc,
        percent,
        nanos_per_unit,
    })
}

/// One experiment of a site, relative to the site's baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub percent: i32,
    pub nanos_per_unit: i64,
    /// `(ns − baseline_ns) / baseline_ns × 100`; `None` without a usable
    /// baseline.
    pub relative_change: Option<f64>,
}

/// All experiments recorded for one call site.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteReport {
    pub pc: u64,
    /// Human-readable location, if known.
    pub location: Option<String>,
    /// Sorted by ascending percent.
    pub points: Vec<Point>,
}

impl SiteReport {
    /// ns/op of the site's 0% experiment.
    #[must_use]
    pub fn baseline_nanos(&self) -> Option<i64> {
        self.points
            .iter()
            .find(|p| p.percent == 0)
            .map(|p| p.nanos_per_unit)
    }

    /// Least-squares fit of ns/op against percent.
    #[must_use]
    pub fn impact(&self) -> Option<RegressionResult> {
        let points: Vec<(f64, f64)> = self
            .points
            .iter()
            .map(|p| (f64::from(p.percent), p.nanos_per_unit as f64))
            .collect();
        RegressionResult::fit(&points)
    }
}

/// Experiments grouped by call site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    /// Sorted by ascending pc.
    pub sites: Vec<SiteReport>,
}

impl Report {
    /// Builds a report from bare records.
    #[must_use]
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = ExperimentRecord>,
    {
        Self::from_annotated(records.into_iter().map(|record| AnnotatedRecord {
            record,
            location: None,
        }))
    }

    /// Builds a report, taking each site's location from its first annotation.
    #[must_use]
    pub fn from_annotated<I>(records: I) -> Self
    where
        I: IntoIterator<Item = AnnotatedRecord>,
    {
        let mut grouped: BTreeMap<u64, (Option<String>, Vec<ExperimentRecord>)> = BTreeMap::new();
        for AnnotatedRecord { record, location } in records {
            let entry = grouped.entry(record.pc).or_default();
            if entry.0.is_none() {
                entry.0 = location;
            }
            entry.1.push(record);
        }

        let sites = grouped
            .into_iter()
            .map(|(pc, (location, mut records))| {
                // Stable, so the first of duplicate baselines wins.
                records.sort_by_key(|r| r.percent);
                let baseline = records
                    .iter()
                    .find(|r| r.percent == 0)
                    .map(|r| r.nanos_per_unit);
                let points = records
                    .iter()
                    .map(|r| Point {
                        percent: r.percent,
                        nanos_per_unit: r.nanos_per_unit,
                        relative_change: relative_change(baseline, r.nanos_per_unit),
                    })
                    .collect();
                SiteReport {
                    pc,
                    location,
                    points,
                }
            })
            .collect();

        Self { sites }
    }

    /// Number of records in the report.
    #[must_use]
    pub fn total_experiments(&self) -> usize {
        self.sites.iter().map(|s| s.points.len()).sum()
    }

    /// Sites with a regression fit, most sensitive first.
    #[must_use]
    pub fn ranked(&self) -> Vec<(&SiteReport, RegressionResult)> {
        let mut ranked: Vec<_> = self
            .sites
            .iter()
            .filter_map(|site| site.impact().map(|reg| (site, reg)))
            .collect();
        // NaN slopes compare as Equal and stay in place.
        ranked.sort_by(|a, b| {
            b.1.slope
                .partial_cmp(&a.1.slope)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }
}

#[allow(clippy::cast_precision_loss)]
fn relative_change(baseline: Option<i64>, nanos: i64) -> Option<f64> {
    let baseline = baseline.filter(|&b| b != 0)? as f64;
    Some((nanos as f64 - baseline) / baseline * 100.0)
}

/// Results from linear regression analysis.
///
/// Provides slope, intercept, confidence intervals, and goodness-of-fit
/// metrics, so that a reader can judge how far to trust a site's impact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionResult {
    /// Change in ns/op per percent of slowdown. The site's impact.
    pub slope: f64,
    /// Fitted ns/op at 0%.
    pub intercept: f64,
    /// Coefficient of determination (R²). Ranges from 0 to 1.
    pub r_squared: f64,
    /// Standard error of the slope estimate.
    pub slope_std_error: f64,
    /// Lower bound of 95% confidence interval for slope.
    pub slope_ci_lower: f64,
    /// Upper bound of 95% confidence interval for slope.
    pub slope_ci_upper: f64,
    /// Number of data points used in the regression.
    pub n: usize,
}

impl RegressionResult {
    /// Fits `y = intercept + slope·x` by least squares.
    ///
    /// Returns `None` with fewer than 3 points (no degrees of freedom left
    /// for a confidence interval) or when every x is the same.
    #[must_use]
    pub fn fit(points: &[(f64, f64)]) -> Option<Self> {
        let n = points.len();
        if n < 3 {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        let n_f64 = n as f64;

        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n_f64;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n_f64;

        let mut sum_sq_x = 0.0;
        let mut sum_sq_y = 0.0;
        let mut sum_cross = 0.0;
        for &(x, y) in points {
            let dx = x - mean_x;
            let dy = y - mean_y;
            sum_sq_x += dx * dx;
            sum_sq_y += dy * dy;
            sum_cross += dx * dy;
        }

        if sum_sq_x.abs() < f64::EPSILON {
            return None;
        }

        let slope = sum_cross / sum_sq_x;
        let intercept = mean_y - slope * mean_x;

        let r_squared = if sum_sq_y.abs() < f64::EPSILON {
            1.0 // flat data is perfectly explained by a flat line
        } else {
            (slope * slope * sum_sq_x / sum_sq_y).min(1.0)
        };

        let resid_sum_sq: f64 = points
            .iter()
            .map(|&(x, y)| {
                let residual = y - (intercept + slope * x);
                residual * residual
            })
            .sum();

        let df = n_f64 - 2.0;
        let s = (resid_sum_sq / df).sqrt();
        let slope_std_error = s / sum_sq_x.sqrt();

        let margin = t_critical_value_95(n - 2) * slope_std_error;

        Some(Self {
            slope,
            intercept,
            r_squared,
            slope_std_error,
            slope_ci_lower: slope - margin,
            slope_ci_upper: slope + margin,
            n,
        })
    }

    /// Returns true if the slope is statistically significant at 95%
    /// confidence, i.e. its confidence interval excludes zero.
    #[must_use]
    pub fn is_significant(&self) -> bool {
        (self.slope_ci_lower > 0.0 && self.slope_ci_upper > 0.0)
            || (self.slope_ci_lower < 0.0 && self.slope_ci_upper < 0.0)
    }

    /// Returns true if the regression fit is good (R² > 0.7).
    #[must_use]
    pub fn has_good_fit(&self) -> bool {
        self.r_squared > 0.7
    }
}

/// Two-tailed critical t-value for a 95% confidence interval.
fn t_critical_value_95(df: usize) -> f64 {
    match df {
        0 => f64::INFINITY,
        1 => 12.706,
        2 => 4.303,
        3 => 3.182,
        4 => 2.776,
        5 => 2.571,
        6 => 2.447,
        7 => 2.365,
        8 => 2.306,
        9 => 2.262,
        10 => 2.228,
        11 => 2.201,
        12 => 2.179,
        13 => 2.160,
        14 => 2.145,
        15 => 2.131,
        16 => 2.120,
        17 => 2.110,
        18 => 2.101,
        19 => 2.093,
        20 => 2.086,
        21..=25 => 2.060,
        26..=30 => 2.042,
        31..=40 => 2.021,
        41..=60 => 2.000,
        61..=120 => 1.980,
        _ => 1.960,
    }
}
