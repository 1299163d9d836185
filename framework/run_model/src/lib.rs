use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha3::Digest;
use squall_core::prelude::TimeWindow;
use std::fmt;
use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Errors raised while interpreting run configuration.
///
/// Everything here is fatal and surfaces before any simulation starts. A bad pattern or scenario
/// name must never make it into a running simulation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown scenario '{0}', expected one of: resource, network, pod-failure, none")]
    UnknownScenario(String),
    #[error("unknown pattern '{0}', expected one of: random, gradual, spike")]
    UnknownPattern(String),
    #[error("run duration must not be zero")]
    ZeroDuration,
    #[error("participant count must be at least one")]
    ZeroParticipants,
    #[error("apply cadence must not be zero")]
    ZeroCadence,
    #[error("invalid range {0}-{1}, the lower bound must not exceed the upper")]
    InvertedRange(u64, u64),
    #[error("at least one scenario must be selected")]
    NoScenarios,
    #[error("at least one pattern must be selected")]
    NoPatterns,
    #[error("test fraction must be greater than 0 and less than 1, got {0}")]
    BadTestFraction(f64),
}

/// The stress scenario a simulation run induces.
///
/// The scenario is the ground truth for dataset labels. A row's label always comes from the
/// scenario that produced the run and is never inferred from the collected metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// CPU and memory pressure from stress workloads.
    Resource,
    /// Latency and packet loss injected into pod networking.
    Network,
    /// Pods that crash and restart on a jittered interval.
    PodFailure,
    /// No induced stress. The run observes the untouched cluster for a baseline window.
    #[serde(rename = "none")]
    Baseline,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 4] = [
        ScenarioKind::Resource,
        ScenarioKind::Network,
        ScenarioKind::PodFailure,
        ScenarioKind::Baseline,
    ];

    /// The label written into dataset rows for this scenario.
    pub fn label(&self) -> &'static str {
        match self {
            ScenarioKind::Resource => "resource",
            ScenarioKind::Network => "network",
            ScenarioKind::PodFailure => "pod-failure",
            ScenarioKind::Baseline => "none",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ScenarioKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resource" => Ok(ScenarioKind::Resource),
            "network" => Ok(ScenarioKind::Network),
            "pod-failure" | "pod_failure" => Ok(ScenarioKind::PodFailure),
            "none" | "baseline" => Ok(ScenarioKind::Baseline),
            other => Err(ConfigError::UnknownScenario(other.to_string())),
        }
    }
}

/// The temporal shape of the load applied over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    /// Independent uniform intensity per unit per sample.
    Random,
    /// A deterministic ramp, identical for every unit, peaking at the end of the run.
    Gradual,
    /// A small subset of units at full intensity over a low constant baseline.
    Spike,
}

impl PatternKind {
    pub const ALL: [PatternKind; 3] = [
        PatternKind::Random,
        PatternKind::Gradual,
        PatternKind::Spike,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Random => "random",
            PatternKind::Gradual => "gradual",
            PatternKind::Spike => "spike",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(PatternKind::Random),
            "gradual" => Ok(PatternKind::Gradual),
            "spike" => Ok(PatternKind::Spike),
            other => Err(ConfigError::UnknownPattern(other.to_string())),
        }
    }
}

/// Generate a fresh run id.
pub fn new_run_id() -> String {
    nanoid::nanoid!()
}

/// Record of a single simulation run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationRun {
    /// The unique run id
    ///
    /// Chosen by the assembler. Unique for each run.
    pub run_id: String,
    /// The scenario that was induced during the run
    pub scenario: ScenarioKind,
    /// The temporal pattern the workload followed
    pub pattern: PatternKind,
    /// The number of workload units that were requested
    ///
    /// Zero for [ScenarioKind::Baseline] runs, which observe the cluster without load.
    pub participant_count: usize,
    /// The number of workload units that actually started
    ///
    /// If some units fail to launch then this will be less than
    /// [SimulationRun::participant_count] and the run is degraded. A run where no unit started is
    /// discarded and never recorded.
    pub units_started: usize,
    /// The duration the run was configured with, in seconds
    pub duration_seconds: u64,
    /// The time the run started
    ///
    /// This is a Unix timestamp in seconds, stamped before any unit began applying load.
    pub started_at: i64,
    /// The time the run ended
    ///
    /// This is a Unix timestamp in seconds, stamped after every unit confirmed teardown. It is
    /// set exactly once and never updated.
    pub ended_at: i64,
    /// The version of Squall that produced this record
    pub squall_version: String,
}

impl SimulationRun {
    /// True when the run started with fewer units than requested.
    ///
    /// Degraded runs still produce a feature row; whether that row reaches the dataset is a
    /// policy decision made downstream, not here.
    pub fn degraded(&self) -> bool {
        self.units_started < self.participant_count
    }

    /// The active interval of the run as a half-open window, `[started_at, ended_at)`.
    pub fn window(&self) -> TimeWindow {
        let start = Utc
            .timestamp_opt(self.started_at, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let end = Utc
            .timestamp_opt(self.ended_at, 0)
            .single()
            .unwrap_or(start);
        TimeWindow::new(start, end)
    }

    pub fn configured_duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    /// Compute a fingerprint for this run's configuration
    ///
    /// The fingerprint is intended to identify the configuration used for the run, independent of
    /// when it happened. It uses the
    ///     - Scenario label
    ///     - Pattern
    ///     - Participant count
    ///     - Configured duration
    ///     - Squall version
    ///
    /// The fingerprint is computed using [sha3::Sha3_256].
    pub fn fingerprint(&self) -> String {
        let mut hasher = sha3::Sha3_256::new();
        Digest::update(&mut hasher, self.scenario.label().as_bytes());
        Digest::update(&mut hasher, self.pattern.as_str().as_bytes());
        Digest::update(&mut hasher, self.participant_count.to_le_bytes());
        Digest::update(&mut hasher, self.duration_seconds.to_le_bytes());
        Digest::update(&mut hasher, self.squall_version.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Append the run record to a file
///
/// The record will be serialized to JSON and output as a single line followed by a newline. The
/// recommended file extension is `.jsonl`.
pub fn append_run_record(run: &SimulationRun, path: PathBuf) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    store_run_record(run, &mut file)?;
    let _ = file.write("\n".as_bytes())?;
    Ok(())
}

/// Serialize the run record to a writer
pub fn store_run_record<W: Write>(run: &SimulationRun, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer(writer, run)?;
    Ok(())
}

/// Load a run record from a reader
pub fn load_run_record<R: Read>(reader: R) -> anyhow::Result<SimulationRun> {
    let reader = std::io::BufReader::new(reader);
    let run: SimulationRun = serde_json::from_reader(reader)?;
    Ok(run)
}

/// Load run records from a file
///
/// The file should contain one JSON object per line. This is the format produced by
/// [append_run_record].
pub fn load_run_records(path: PathBuf) -> anyhow::Result<Vec<SimulationRun>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let run: SimulationRun = serde_json::from_str(&line)?;
        runs.push(run);
    }
    Ok(runs)
}
