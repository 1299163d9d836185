use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::seq::SliceRandom;
use rand::Rng;
use squall_core::prelude::StopHandle;
use squall_run_model::{append_run_record, ConfigError, PatternKind, ScenarioKind};
use squall_runner::prelude::{start, RunPlan, WorkloadBackend, WorkloadError};

use crate::backend::MonitoringBackend;
use crate::collect::{collect, DEFAULT_QUERY_STEP_SECONDS};
use crate::dataset::{
    split_rows, write_datasets, write_processed_row, write_raw_snapshot, DatasetPaths,
    RawSnapshot, SnapshotMetadata, DEFAULT_SPLIT_SEED, DEFAULT_TEST_FRACTION,
};
use crate::flatten::{flatten, DegradedPolicy, FeatureRow, FeatureSchema};
use crate::registry;

pub const DEFAULT_DURATION_RANGE: (u64, u64) = (180, 300);
pub const DEFAULT_PODS_RANGE: (u64, u64) = (3, 10);
pub const DEFAULT_COOLDOWN_RANGE: (u64, u64) = (30, 60);

const RUN_LOG_FILE: &str = "run_log.jsonl";

/// Everything one assembly needs, fully resolved.
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    pub scenarios: Vec<ScenarioKind>,
    /// Runs per scenario.
    pub iterations: u32,
    /// The patterns to draw from, one picked per run.
    pub patterns: Vec<PatternKind>,
    /// The namespace workload units run in.
    pub namespace: String,
    /// The namespaces that scope namespace-aware queries. Empty collects cluster-wide.
    pub collect_namespaces: Vec<String>,
    pub duration_range: (u64, u64),
    pub pods_range: (u64, u64),
    pub cooldown_range: (u64, u64),
    pub step_seconds: u64,
    pub test_fraction: f64,
    pub split_seed: u64,
    pub degraded_policy: DegradedPolicy,
    pub output_dir: PathBuf,
    /// Persist rows but skip the final train/test split.
    pub skip_combine: bool,
    pub progress: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            scenarios: ScenarioKind::ALL.to_vec(),
            iterations: 1,
            patterns: PatternKind::ALL.to_vec(),
            namespace: "ml-scenarios".to_string(),
            collect_namespaces: Vec::new(),
            duration_range: DEFAULT_DURATION_RANGE,
            pods_range: DEFAULT_PODS_RANGE,
            cooldown_range: DEFAULT_COOLDOWN_RANGE,
            step_seconds: DEFAULT_QUERY_STEP_SECONDS,
            test_fraction: DEFAULT_TEST_FRACTION,
            split_seed: DEFAULT_SPLIT_SEED,
            degraded_policy: DegradedPolicy::Flag,
            output_dir: PathBuf::from("data"),
            skip_combine: false,
            progress: false,
        }
    }
}

impl AssemblyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenarios.is_empty() {
            return Err(ConfigError::NoScenarios);
        }
        if self.patterns.is_empty() {
            return Err(ConfigError::NoPatterns);
        }
        for range in [self.duration_range, self.pods_range, self.cooldown_range] {
            if range.0 > range.1 {
                return Err(ConfigError::InvertedRange(range.0, range.1));
            }
        }
        if self.duration_range.0 == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        if self.pods_range.0 == 0 {
            return Err(ConfigError::ZeroParticipants);
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(ConfigError::BadTestFraction(self.test_fraction));
        }
        Ok(())
    }
}

/// Where an iteration ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationState {
    Pending,
    Running,
    Collecting,
    Labeled,
    Accumulated,
    Discarded,
}

impl IterationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationState::Pending => "pending",
            IterationState::Running => "running",
            IterationState::Collecting => "collecting",
            IterationState::Labeled => "labeled",
            IterationState::Accumulated => "accumulated",
            IterationState::Discarded => "discarded",
        }
    }
}

impl fmt::Display for IterationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One iteration's outcome, for the end-of-assembly summary.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub scenario: ScenarioKind,
    pub iteration: u32,
    /// Absent when the iteration was discarded before a run existed.
    pub run_id: Option<String>,
    pub state: IterationState,
    pub degraded: bool,
    pub unavailable_categories: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("Monitoring backend failed the connectivity pre-check")]
    Connectivity,
    #[error("Assembly produced no usable rows")]
    NoRows,
    #[error("Assembly stopped before completion")]
    Stopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
pub struct AssemblyOutcome {
    pub reports: Vec<IterationReport>,
    /// The rows accumulated for the dataset, after the degraded policy was applied.
    pub rows: Vec<FeatureRow>,
    /// Absent when combining was skipped or the assembly was interrupted.
    pub datasets: Option<DatasetPaths>,
}

/// Run every configured scenario iteration, collect and persist a row for each, and combine
/// the accumulated rows into train and test datasets.
///
/// Runs are strictly sequential so that no two workloads pollute each other's metric windows.
/// The monitoring backend is pinged before the first workload exists; an unreachable backend
/// fails the whole assembly with [AssemblyError::Connectivity] rather than producing a pile of
/// all-NaN rows.
///
/// `abort` ends the assembly early: the run in flight is stopped and persisted, then the
/// assembly returns [AssemblyError::Stopped] without combining. `combine` can build datasets
/// from the persisted rows afterwards.
pub async fn assemble(
    config: AssemblyConfig,
    backend: Arc<dyn MonitoringBackend>,
    workload: Arc<dyn WorkloadBackend>,
    abort: StopHandle,
) -> anyhow::Result<AssemblyOutcome> {
    config.validate()?;

    if !backend.ping().await {
        return Err(AssemblyError::Connectivity.into());
    }

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Create {}", config.output_dir.display()))?;

    let schema = FeatureSchema::global();
    let version = env!("CARGO_PKG_VERSION");
    let total_runs = config.scenarios.len() as u32 * config.iterations;
    log::info!(
        "Assembling training data: {} runs over {} scenario(s), schema {}",
        total_runs,
        config.scenarios.len(),
        schema.fingerprint()
    );

    let mut gate = abort.new_listener();
    let mut reports = Vec::with_capacity(total_runs as usize);
    let mut rows: Vec<FeatureRow> = Vec::new();

    for (scenario_index, &scenario) in config.scenarios.iter().enumerate() {
        for iteration in 1..=config.iterations {
            // The relay listener must exist before the stop check so that a signal can never
            // fall between the two.
            let mut relay_listener = abort.new_listener();
            if gate.should_stop() {
                return Err(AssemblyError::Stopped.into());
            }

            let (duration, pods, pattern, cooldown) = {
                let mut rng = rand::thread_rng();
                (
                    Duration::from_secs(
                        rng.gen_range(config.duration_range.0..=config.duration_range.1),
                    ),
                    rng.gen_range(config.pods_range.0..=config.pods_range.1) as usize,
                    config
                        .patterns
                        .choose(&mut rng)
                        .copied()
                        .unwrap_or(PatternKind::Random),
                    rng.gen_range(config.cooldown_range.0..=config.cooldown_range.1),
                )
            };

            log::info!(
                "Iteration {iteration}/{} of scenario {scenario}: pattern {pattern}, {pods} pods, {duration:?}",
                config.iterations
            );

            let plan = RunPlan::new(scenario, pattern, pods, duration)
                .with_namespace(config.namespace.clone())
                .with_progress(config.progress);

            let active = match start(workload.clone(), plan).await {
                Ok(active) => active,
                Err(e) => {
                    if let Some(WorkloadError::NoUnitsStarted { requested }) =
                        e.downcast_ref::<WorkloadError>()
                    {
                        log::error!(
                            "Discarding iteration {iteration} of scenario {scenario}: none of \
                             {requested} units started"
                        );
                        reports.push(IterationReport {
                            scenario,
                            iteration,
                            run_id: None,
                            state: IterationState::Discarded,
                            degraded: false,
                            unavailable_categories: Vec::new(),
                        });
                        continue;
                    }
                    return Err(e);
                }
            };

            // Relay an assembly-level abort into this run's own stop handle.
            let run_stop = active.stop_handle();
            let relay = tokio::spawn(async move {
                relay_listener.wait_for_stop().await;
                run_stop.stop();
            });

            let completed = active.wait().await;
            relay.abort();

            let record = completed.into_record(version);
            append_run_record(&record, config.output_dir.join(RUN_LOG_FILE))
                .context("Append run record")?;

            if gate.should_stop() {
                log::info!("Assembly stopped, run {} was persisted", record.run_id);
                return Err(AssemblyError::Stopped.into());
            }

            let window = completed.window();
            let collected = collect(
                backend.as_ref(),
                &window,
                registry::CATEGORIES,
                &config.collect_namespaces,
                config.step_seconds,
            )
            .await;

            let unavailable: Vec<String> = collected
                .iter()
                .filter(|(_, result)| !result.is_available())
                .map(|(name, _)| name.clone())
                .collect();
            if !unavailable.is_empty() {
                log::warn!(
                    "Run {} has partial data, unavailable: {}",
                    record.run_id,
                    unavailable.join(", ")
                );
            }

            let row = flatten(
                &record.run_id,
                scenario.label(),
                record.degraded(),
                &collected,
                &schema,
            )?;

            let snapshot = RawSnapshot {
                metadata: SnapshotMetadata {
                    run_id: record.run_id.clone(),
                    label: scenario.label().to_string(),
                    window_start: window.unix_bounds().0,
                    window_end: window.unix_bounds().1,
                    step_seconds: config.step_seconds,
                    namespaces: config.collect_namespaces.clone(),
                    schema_fingerprint: schema.fingerprint().to_string(),
                    run_fingerprint: Some(record.fingerprint()),
                    run: Some(record.clone()),
                },
                categories: collected,
            };
            write_raw_snapshot(&snapshot, &config.output_dir)?;
            write_processed_row(&row, &schema, &config.output_dir)?;

            let state = if record.degraded() && config.degraded_policy == DegradedPolicy::Exclude
            {
                log::info!(
                    "Excluding degraded run {} from the accumulated dataset",
                    record.run_id
                );
                IterationState::Labeled
            } else {
                rows.push(row);
                IterationState::Accumulated
            };

            reports.push(IterationReport {
                scenario,
                iteration,
                run_id: Some(record.run_id.clone()),
                state,
                degraded: record.degraded(),
                unavailable_categories: unavailable,
            });

            let final_iteration = scenario_index + 1 == config.scenarios.len()
                && iteration == config.iterations;
            if !final_iteration && cooldown > 0 {
                log::info!("Cooling down for {cooldown}s before the next run");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(cooldown)) => {}
                    _ = gate.wait_for_stop() => {
                        return Err(AssemblyError::Stopped.into());
                    }
                }
            }
        }
    }

    if rows.is_empty() {
        return Err(AssemblyError::NoRows.into());
    }

    let datasets = if config.skip_combine {
        None
    } else {
        let split = split_rows(rows.clone(), config.test_fraction, config.split_seed)?;
        log::info!(
            "Split {} rows into {} train and {} test",
            rows.len(),
            split.train.len(),
            split.test.len()
        );
        Some(write_datasets(&split, &schema, &config.output_dir)?)
    };

    Ok(AssemblyOutcome {
        reports,
        rows,
        datasets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AssemblyConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_selections_are_rejected() {
        let config = AssemblyConfig {
            scenarios: Vec::new(),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoScenarios));

        let config = AssemblyConfig {
            patterns: Vec::new(),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoPatterns));
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let config = AssemblyConfig {
            duration_range: (300, 180),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvertedRange(300, 180)));

        let config = AssemblyConfig {
            cooldown_range: (60, 30),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvertedRange(60, 30)));
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let config = AssemblyConfig {
            duration_range: (0, 10),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroDuration));

        let config = AssemblyConfig {
            pods_range: (0, 5),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroParticipants));
    }

    #[test]
    fn out_of_range_fractions_are_rejected() {
        for test_fraction in [1.0, 0.0, -0.2] {
            let config = AssemblyConfig {
                test_fraction,
                ..Default::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::BadTestFraction(_))
            ));
        }
    }
}
