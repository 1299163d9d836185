use std::path::PathBuf;

use clap::{Parser, Subcommand};
use squall_run_model::{ConfigError, PatternKind, ScenarioKind};
use url::Url;

use crate::backend::DEFAULT_PROMETHEUS_URL;
use crate::flatten::DegradedPolicy;
use crate::registry;

/// Generate labeled training data by stressing a cluster and harvesting its metrics.
#[derive(Parser)]
#[command(name = "squall", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the full pipeline: simulate scenarios, collect their metrics, build datasets
    Assemble(AssembleArgs),

    /// Collect one window of metrics from the cluster as it is right now
    Collect(CollectArgs),

    /// Run a single simulation without collecting anything
    Simulate(SimulateArgs),

    /// Check that the monitoring backend is reachable
    Check(CheckArgs),

    /// Rebuild train and test datasets from previously persisted rows
    Combine(CombineArgs),
}

#[derive(clap::Args)]
pub struct AssembleArgs {
    /// The scenarios to run, in order
    #[clap(long, value_delimiter = ',', default_value = "resource,network,pod-failure,none", value_parser = parse_scenario)]
    pub scenarios: Vec<ScenarioKind>,

    /// Runs per scenario
    #[clap(long, default_value = "3", value_parser = clap::value_parser!(u32).range(1..))]
    pub iterations: u32,

    /// The temporal patterns to draw from, one picked per run
    #[clap(long, value_delimiter = ',', default_value = "random,gradual,spike", value_parser = parse_pattern)]
    pub patterns: Vec<PatternKind>,

    /// The namespace workload pods are created in. Collection is scoped to it as well.
    #[clap(long, default_value = "ml-scenarios")]
    pub namespace: String,

    /// Base URL of the Prometheus instance to collect from
    #[clap(long, default_value = DEFAULT_PROMETHEUS_URL)]
    pub prometheus_url: Url,

    /// Directory artifacts are written under
    #[clap(long, default_value = "data")]
    pub output_dir: PathBuf,

    /// Bounds on the run duration in seconds, drawn uniformly per run. Format `min-max`.
    #[clap(long, default_value = "180-300", value_parser = parse_range)]
    pub duration_range: (u64, u64),

    /// Bounds on the pod count per run. Format `min-max`.
    #[clap(long, default_value = "3-10", value_parser = parse_range)]
    pub pods_range: (u64, u64),

    /// Bounds on the cooldown between runs in seconds. Format `min-max`.
    #[clap(long, default_value = "30-60", value_parser = parse_range)]
    pub cooldown_range: (u64, u64),

    /// Range query resolution in seconds
    #[clap(long, default_value = "15", value_parser = clap::value_parser!(u64).range(1..))]
    pub step: u64,

    /// Fraction of runs held out for the test set
    #[clap(long, default_value = "0.2", value_parser = parse_fraction)]
    pub test_fraction: f64,

    /// Seed for the train/test shuffle
    #[clap(long, default_value = "42")]
    pub seed: u64,

    /// Which backend launches the stress units
    #[clap(long, default_value = "pod", value_parser = parse_workload)]
    pub workload: WorkloadKind,

    /// What to do with rows from runs where some units failed to launch
    #[clap(long = "on-degraded", default_value = "flag", value_parser = parse_degraded_policy)]
    pub on_degraded: DegradedPolicy,

    /// Persist per-run rows but skip the final train/test split
    #[clap(long, default_value = "false")]
    pub skip_combine: bool,

    /// Do not show a progress bar while runs are active.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at
    /// by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,
}

#[derive(clap::Args)]
pub struct CollectArgs {
    /// How many minutes back the collection window reaches
    #[clap(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    pub duration_mins: u64,

    /// Categories to collect. Defaults to every category.
    #[clap(long, value_delimiter = ',', value_parser = parse_category)]
    pub categories: Vec<String>,

    /// Namespaces to scope namespace-aware queries to. Empty collects cluster-wide.
    #[clap(long, value_delimiter = ',')]
    pub namespaces: Vec<String>,

    /// Base URL of the Prometheus instance to collect from
    #[clap(long, default_value = DEFAULT_PROMETHEUS_URL)]
    pub prometheus_url: Url,

    /// Range query resolution in seconds
    #[clap(long, default_value = "15", value_parser = clap::value_parser!(u64).range(1..))]
    pub step: u64,

    /// Directory artifacts are written under
    #[clap(long, default_value = "data")]
    pub output_dir: PathBuf,

    /// Label recorded on the saved snapshot, for windows where the cluster state is known
    #[clap(long, default_value = "none")]
    pub cluster_issue: String,
}

#[derive(clap::Args)]
pub struct SimulateArgs {
    /// The scenario to run
    #[clap(long, value_parser = parse_scenario)]
    pub scenario: ScenarioKind,

    /// The temporal pattern of the load
    #[clap(long, default_value = "random", value_parser = parse_pattern)]
    pub pattern: PatternKind,

    /// The number of workload pods
    #[clap(long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    pub pods: u64,

    /// How long to run, in seconds
    #[clap(long, default_value = "240", value_parser = clap::value_parser!(u64).range(1..))]
    pub duration: u64,

    /// The namespace workload pods are created in
    #[clap(long, default_value = "ml-scenarios")]
    pub namespace: String,

    /// Which backend launches the stress units
    #[clap(long, default_value = "pod", value_parser = parse_workload)]
    pub workload: WorkloadKind,

    /// Do not show a progress bar while the run is active
    #[clap(long, default_value = "false")]
    pub no_progress: bool,
}

#[derive(clap::Args)]
pub struct CheckArgs {
    /// Base URL of the Prometheus instance to check
    #[clap(long, default_value = DEFAULT_PROMETHEUS_URL)]
    pub prometheus_url: Url,
}

#[derive(clap::Args)]
pub struct CombineArgs {
    /// Directory previously written by assemble or collect
    #[clap(long, default_value = "data")]
    pub output_dir: PathBuf,

    /// Fraction of runs held out for the test set
    #[clap(long, default_value = "0.2", value_parser = parse_fraction)]
    pub test_fraction: f64,

    /// Seed for the train/test shuffle
    #[clap(long, default_value = "42")]
    pub seed: u64,
}

/// Which implementation of the workload seam to launch units with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// In-process units that burn CPU locally. For development against a cluster that must not
    /// be touched.
    Local,
    /// Stress pods created through kubectl.
    Pod,
}

fn parse_scenario(s: &str) -> anyhow::Result<ScenarioKind> {
    Ok(s.parse()?)
}

fn parse_pattern(s: &str) -> anyhow::Result<PatternKind> {
    Ok(s.parse()?)
}

fn parse_range(s: &str) -> anyhow::Result<(u64, u64)> {
    let (low, high) = s
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("Expected a range in the form min-max, got {s:?}"))?;
    let low = low.trim().parse::<u64>()?;
    let high = high.trim().parse::<u64>()?;
    if low > high {
        return Err(ConfigError::InvertedRange(low, high).into());
    }

    Ok((low, high))
}

fn parse_fraction(s: &str) -> anyhow::Result<f64> {
    let fraction = s.parse::<f64>()?;
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(ConfigError::BadTestFraction(fraction).into());
    }

    Ok(fraction)
}

fn parse_workload(s: &str) -> anyhow::Result<WorkloadKind> {
    match s.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(WorkloadKind::Local),
        "pod" => Ok(WorkloadKind::Pod),
        other => Err(anyhow::anyhow!(
            "Unknown workload {other:?}, expected local or pod"
        )),
    }
}

fn parse_degraded_policy(s: &str) -> anyhow::Result<DegradedPolicy> {
    match s.trim().to_ascii_lowercase().as_str() {
        "flag" => Ok(DegradedPolicy::Flag),
        "exclude" => Ok(DegradedPolicy::Exclude),
        other => Err(anyhow::anyhow!(
            "Unknown degraded policy {other:?}, expected flag or exclude"
        )),
    }
}

fn parse_category(s: &str) -> anyhow::Result<String> {
    let name = s.trim().to_ascii_lowercase();
    if registry::category(&name).is_none() {
        return Err(anyhow::anyhow!(
            "Unknown category {s:?}, expected one of: {}",
            registry::category_names().join(", ")
        ));
    }

    Ok(name)
}
