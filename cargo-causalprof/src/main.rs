//! Cargo subcommand for the causalprof causal profiler.
//!
//! This binary provides the `cargo causalprof` command for running Rust
//! programs with causal profiling enabled and reading back the results.
//!
//! # Usage
//!
//! ```bash
//! cargo causalprof run --bin myapp
//! cargo causalprof report causalprof.out --format json
//! ```

// CLI tools need to print to stdout/stderr
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod symbols;

use anyhow::{Context, Result};
use causalprof::config::{
    ENV_COOLDOWN_MS, ENV_ENABLED, ENV_INTERVAL_US, ENV_OUTPUT, ENV_SEED, ENV_VERBOSE,
    ENV_WINDOW_MS,
};
use causalprof::report::{self, RegressionResult, Report, SiteReport};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fmt::Write as _;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use symbols::DwarfResolver;

/// Cargo subcommand for causal profiling.
#[derive(Parser, Debug)]
#[command(name = "cargo")]
#[command(bin_name = "cargo")]
struct Cargo {
    #[command(subcommand)]
    command: CargoCommand,
}

/// Cargo causalprof subcommand.
#[derive(Subcommand, Debug)]
enum CargoCommand {
    /// Causal profiler for Rust programs.
    Causalprof(CausalprofArgs),
}

/// Causalprof command line arguments.
#[derive(Parser, Debug)]
#[command(version, about)]
struct CausalprofArgs {
    #[command(subcommand)]
    command: CausalprofCommand,
}

/// Causalprof subcommands.
#[derive(Subcommand, Debug)]
enum CausalprofCommand {
    /// Build and run a binary with causal profiling enabled.
    Run(RunArgs),
    /// Summarize an experiment record file.
    Report(ReportArgs),
}

/// Arguments for the run subcommand.
#[derive(Parser, Debug)]
struct RunArgs {
    /// Name of the binary to run.
    #[arg(long)]
    bin: Option<String>,

    /// Name of the example to run.
    #[arg(long)]
    example: Option<String>,

    /// Build and run in release mode.
    #[arg(long)]
    release: bool,

    /// File the profiled program writes experiment records to.
    #[arg(long, short, default_value = causalprof::config::DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Measurement window of each experiment in milliseconds.
    #[arg(long)]
    window_ms: Option<u64>,

    /// Pause between experiments in milliseconds.
    #[arg(long)]
    cooldown_ms: Option<u64>,

    /// Sampling interval in microseconds.
    #[arg(long)]
    interval_us: Option<u64>,

    /// Seed for the experiment order.
    #[arg(long)]
    seed: Option<u64>,

    /// Log experiments dropped for lack of progress.
    #[arg(long)]
    verbose: bool,

    /// Report output format.
    #[arg(long, short, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Additional arguments to pass to the binary.
    #[arg(last = true)]
    args: Vec<String>,
}

/// Arguments for the report subcommand.
#[derive(Parser, Debug)]
struct ReportArgs {
    /// Path to the experiment record file.
    input: PathBuf,

    /// Resolve addresses against this binary's debug info.
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Output format.
    #[arg(long, short, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Number of sites to show in the text summary.
    #[arg(long, default_value = "10")]
    top: usize,
}

/// Report output formats.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Text,
    Csv,
    Json,
}

fn main() -> Result<()> {
    let args = Cargo::parse();

    match args.command {
        CargoCommand::Causalprof(causalprof) => match causalprof.command {
            CausalprofCommand::Run(run_args) => run_profiler(&run_args),
            CausalprofCommand::Report(report_args) => generate_report(&report_args),
        },
    }
}

/// Builds the target, runs it under the profiler and prints the report.
fn run_profiler(args: &RunArgs) -> Result<()> {
    let binary_path = build_target(args)?;
    eprintln!("Built: {}", binary_path.display());

    eprintln!("Running with causal profiling...");
    let status = run_binary(&binary_path, args)?;
    if !status.success() {
        eprintln!("warning: {} exited with {status}", binary_path.display());
    }

    let report = load_report(&args.output, None)?;
    eprintln!("Records read from: {}", args.output.display());
    print!("{}", render(&report, args.format, 10)?);
    Ok(())
}

/// Builds the target binary with debug info and frame pointers.
///
/// Frame pointers let the signal handler see callers of the interrupted
/// function, so a slowdown applies to everything beneath a call site.
fn build_target(args: &RunArgs) -> Result<PathBuf> {
    let mut cmd = Command::new("cargo");
    cmd.arg("build");

    if args.release {
        cmd.arg("--release");
    }

    if let Some(ref bin) = args.bin {
        cmd.arg("--bin").arg(bin);
    } else if let Some(ref example) = args.example {
        cmd.arg("--example").arg(example);
    }

    let rustflags = std::env::var("RUSTFLAGS").unwrap_or_default();
    cmd.env("RUSTFLAGS", profiling_rustflags(&rustflags));

    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        anyhow::bail!("cargo build failed");
    }

    let metadata = cargo_metadata()?;
    let profile_dir = if args.release { "release" } else { "debug" };

    let binary_name = if let Some(ref bin) = args.bin {
        bin.clone()
    } else if let Some(ref example) = args.example {
        example.clone()
    } else {
        metadata
            .packages
            .first()
            .map(|p| p.name.clone())
            .context("package name not found")?
    };

    let mut binary_path = metadata.target_directory.join(profile_dir);
    if args.example.is_some() {
        binary_path = binary_path.join("examples");
    }
    binary_path = binary_path.join(&binary_name);

    if !binary_path.exists() {
        anyhow::bail!("Binary not found at: {}", binary_path.display());
    }

    Ok(binary_path)
}

fn profiling_rustflags(existing: &str) -> String {
    format!("{existing} -C debuginfo=2 -C force-frame-pointers=yes")
        .trim_start()
        .to_string()
}

#[derive(Debug, Deserialize)]
struct Metadata {
    target_directory: PathBuf,
    packages: Vec<Package>,
}

#[derive(Debug, Deserialize)]
struct Package {
    name: String,
}

fn cargo_metadata() -> Result<Metadata> {
    let output = Command::new("cargo")
        .args(["metadata", "--format-version=1", "--no-deps"])
        .output()
        .context("Failed to run cargo metadata")?;

    if !output.status.success() {
        anyhow::bail!("cargo metadata failed");
    }

    serde_json::from_slice(&output.stdout).context("Failed to parse cargo metadata")
}

/// Runs the binary with the profiler enabled through the environment.
fn run_binary(binary_path: &Path, args: &RunArgs) -> Result<std::process::ExitStatus> {
    let mut cmd = Command::new(binary_path);
    cmd.args(&args.args);

    for (var, value) in profiler_env(args) {
        cmd.env(var, value);
    }

    cmd.stdin(Stdio::inherit());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    cmd.status().context("Failed to run binary")
}

fn profiler_env(args: &RunArgs) -> Vec<(&'static str, String)> {
    let mut env = vec![
        (ENV_ENABLED, "1".to_string()),
        (ENV_OUTPUT, args.output.display().to_string()),
    ];
    if let Some(ms) = args.window_ms {
        env.push((ENV_WINDOW_MS, ms.to_string()));
    }
    if let Some(ms) = args.cooldown_ms {
        env.push((ENV_COOLDOWN_MS, ms.to_string()));
    }
    if let Some(us) = args.interval_us {
        env.push((ENV_INTERVAL_US, us.to_string()));
    }
    if let Some(seed) = args.seed {
        env.push((ENV_SEED, seed.to_string()));
    }
    if args.verbose {
        env.push((ENV_VERBOSE, "1".to_string()));
    }
    env
}

/// Reads a record file, preferring DWARF locations from `binary` when given.
fn load_report(input: &Path, binary: Option<&Path>) -> Result<Report> {
    let file = File::open(input)
        .with_context(|| format!("Failed to open input file: {}", input.display()))?;
    let records = report::parse_annotated(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", input.display()))?;
    let mut report = Report::from_annotated(records);

    if let Some(binary) = binary {
        let resolver = DwarfResolver::load(binary)?;
        for site in &mut report.sites {
            if let Some(location) = resolver.lookup(site.pc) {
                site.location = Some(location.to_string());
            }
        }
    }

    Ok(report)
}

/// Summarizes a saved record file.
fn generate_report(args: &ReportArgs) -> Result<()> {
    let report = load_report(&args.input, args.binary.as_deref())?;
    print!("{}", render(&report, args.format, args.top)?);
    Ok(())
}

fn render(report: &Report, format: Format, top: usize) -> Result<String> {
    Ok(match format {
        Format::Json => {
            let mut json = causalprof::json_output::to_json_string(report, true)?;
            json.push('\n');
            json
        }
        Format::Csv => render_csv(report),
        Format::Text => render_text(report, top),
    })
}

fn site_label(site: &SiteReport) -> String {
    site.location
        .clone()
        .unwrap_or_else(|| format!("{:#x}", site.pc))
}

fn render_csv(report: &Report) -> String {
    let mut out = String::from("pc,location,percent,ns_per_op,relative_change\n");
    for site in &report.sites {
        let location = site_label(site).replace('"', "\"\"");
        for point in &site.points {
            let relative = point
                .relative_change
                .map_or_else(String::new, |c| format!("{c:.3}"));
            let _ = writeln!(
                out,
                "{:#x},\"{}\",{},{},{}",
                site.pc, location, point.percent, point.nanos_per_unit, relative
            );
        }
    }
    out
}

fn render_text(report: &Report, top: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n=== Causal Profiling Results ===");
    let _ = writeln!(
        out,
        "{} experiments across {} call sites",
        report.total_experiments(),
        report.sites.len()
    );

    let ranked = report.ranked();
    if ranked.is_empty() {
        let _ = writeln!(out, "\n  Not enough experiments to rank any call site.");
        let _ = writeln!(
            out,
            "  Make sure the program marks progress units and runs long enough."
        );
    } else {
        let _ = writeln!(out, "\nMost sensitive call sites:");
        let _ = writeln!(out, "{:-<80}", "");
        for (i, (site, reg)) in ranked.iter().take(top).enumerate() {
            let _ = writeln!(out, "{}. {} ({})", i + 1, site_label(site), describe(reg));
        }
    }

    for site in &report.sites {
        let _ = writeln!(out, "\n{}", site_label(site));
        for point in &site.points {
            let relative = point
                .relative_change
                .map_or_else(|| "      n/a".to_string(), |c| format!("{c:>+8.3}%"));
            let _ = writeln!(
                out,
                "  {:>3}%  {:>12}ns  {}",
                point.percent, point.nanos_per_unit, relative
            );
        }
    }
    out
}

fn describe(reg: &RegressionResult) -> String {
    let verdict = if reg.is_significant() && reg.has_good_fit() {
        "significant"
    } else {
        "not significant"
    };
    format!(
        "impact: {:+.2} ns/op per %, R² {:.2}, n={}, {verdict}",
        reg.slope, reg.r_squared, reg.n
    )
}
