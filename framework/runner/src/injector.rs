use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use squall_core::prelude::{DelegatedStopListener, StopHandle, TimeWindow};
use squall_run_model::{new_run_id, PatternKind, ScenarioKind, SimulationRun};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::pattern::intensity;
use crate::plan::RunPlan;
use crate::progress::start_progress;
use crate::workload::{UnitHandle, UnitSpec, WorkloadBackend, WorkloadError};

enum UnitOutcome {
    Done,
    TeardownFailed,
}

/// Start a simulation run.
///
/// The start stamp is taken before any unit is created, so no load ever precedes it. Individual
/// launch failures are tolerated and recorded; if every unit fails to launch the run fails with
/// [WorkloadError::NoUnitsStarted] and nothing is left behind.
pub async fn start(
    backend: Arc<dyn WorkloadBackend>,
    plan: RunPlan,
) -> anyhow::Result<ActiveRun> {
    plan.validate()?;
    backend.prepare(&plan.namespace).await?;

    let run_id = new_run_id();
    log::info!(
        "Starting {} run {run_id} with pattern {} for {:?} with {} units",
        plan.scenario,
        plan.pattern,
        plan.duration,
        plan.unit_count()
    );

    let started_at = Utc::now();
    let start_instant = Instant::now();
    let deadline = start_instant + plan.duration;

    let unit_count = plan.unit_count();
    let mut units = Vec::with_capacity(unit_count);
    for unit_index in 0..unit_count {
        let spec = UnitSpec {
            run_id: run_id.clone(),
            scenario: plan.scenario,
            namespace: plan.namespace.clone(),
            unit_index,
            unit_count,
            duration: plan.duration,
            initial_intensity: intensity(plan.pattern, 0.0, unit_index, unit_count),
        };
        match backend.create(&spec).await {
            Ok(handle) => units.push(handle),
            Err(e) => {
                log::error!("Failed to launch unit {unit_index} of run {run_id}: {e}");
            }
        }
    }

    let units_started = units.len();
    if unit_count > 0 && units_started == 0 {
        return Err(WorkloadError::NoUnitsStarted {
            requested: unit_count,
        }
        .into());
    }
    if units_started < unit_count {
        log::warn!(
            "Run {run_id} is degraded: only {units_started} of {unit_count} units started"
        );
    }

    let stop = StopHandle::new();

    if plan.progress {
        start_progress(plan.duration, stop.new_listener());
    }

    let mut drivers = Vec::with_capacity(units_started.max(1));
    if units.is_empty() {
        // A baseline run has no units but must still hold its window open for the full
        // duration so the collected metrics describe an interval of known length.
        drivers.push(tokio::spawn(idle_unit(deadline, stop.new_listener())));
    }
    for handle in units {
        drivers.push(tokio::spawn(drive_unit(
            backend.clone(),
            handle,
            plan.pattern,
            unit_count,
            plan.duration,
            plan.apply_cadence,
            start_instant,
            deadline,
            stop.new_listener(),
        )));
    }

    Ok(ActiveRun {
        run_id,
        scenario: plan.scenario,
        pattern: plan.pattern,
        namespace: plan.namespace,
        units_requested: unit_count,
        units_started,
        configured_duration: plan.duration,
        started_at,
        stop,
        drivers,
    })
}

/// A simulation run in flight.
pub struct ActiveRun {
    run_id: String,
    scenario: ScenarioKind,
    pattern: PatternKind,
    namespace: String,
    units_requested: usize,
    units_started: usize,
    configured_duration: Duration,
    started_at: DateTime<Utc>,
    stop: StopHandle,
    drivers: Vec<JoinHandle<UnitOutcome>>,
}

impl ActiveRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// A handle that can end this run early, for wiring up external aborts.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for the run to reach its configured end and tear down.
    ///
    /// The end stamp is taken only after every unit has confirmed teardown, so no unit outlives
    /// the reported window.
    pub async fn wait(self) -> CompletedRun {
        self.finish().await
    }

    /// End the run now. Units are torn down exactly as at a natural end.
    pub async fn stop(self) -> CompletedRun {
        log::info!("Stopping run {} early", self.run_id);
        self.stop.stop();
        self.finish().await
    }

    async fn finish(self) -> CompletedRun {
        let outcomes = futures::future::join_all(self.drivers).await;
        // Wake any remaining listeners such as the progress bar.
        self.stop.stop();

        let mut teardown_failures = 0;
        for outcome in outcomes {
            match outcome {
                Ok(UnitOutcome::Done) => {}
                Ok(UnitOutcome::TeardownFailed) => teardown_failures += 1,
                Err(e) => {
                    log::error!("Unit driver for run {} panicked: {e}", self.run_id);
                    teardown_failures += 1;
                }
            }
        }

        let ended_at = Utc::now();
        log::info!(
            "Run {} ended after {:?}",
            self.run_id,
            (ended_at - self.started_at).to_std().unwrap_or_default()
        );

        CompletedRun {
            run_id: self.run_id,
            scenario: self.scenario,
            pattern: self.pattern,
            units_requested: self.units_requested,
            units_started: self.units_started,
            configured_duration: self.configured_duration,
            started_at: self.started_at,
            ended_at,
            teardown_failures,
        }
    }
}

/// The outcome of a finished simulation run.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub run_id: String,
    pub scenario: ScenarioKind,
    pub pattern: PatternKind,
    pub units_requested: usize,
    pub units_started: usize,
    pub configured_duration: Duration,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub teardown_failures: usize,
}

impl CompletedRun {
    /// The active interval of the run, `[started_at, ended_at)`.
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.started_at, self.ended_at)
    }

    pub fn degraded(&self) -> bool {
        self.units_started < self.units_requested
    }

    pub fn into_record(&self, squall_version: &str) -> SimulationRun {
        SimulationRun {
            run_id: self.run_id.clone(),
            scenario: self.scenario,
            pattern: self.pattern,
            participant_count: self.units_requested,
            units_started: self.units_started,
            duration_seconds: self.configured_duration.as_secs(),
            started_at: self.started_at.timestamp(),
            ended_at: self.ended_at.timestamp(),
            squall_version: squall_version.to_string(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_unit(
    backend: Arc<dyn WorkloadBackend>,
    handle: UnitHandle,
    pattern: PatternKind,
    unit_count: usize,
    duration: Duration,
    cadence: Duration,
    start_instant: Instant,
    deadline: Instant,
    mut stop_listener: DelegatedStopListener,
) -> UnitOutcome {
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = stop_listener.wait_for_stop() => {
                log::debug!("Stopping unit {}", handle.unit_id);
                break;
            }
            _ = tokio::time::sleep(cadence) => {}
        }

        let elapsed = start_instant.elapsed();
        if elapsed >= duration {
            break;
        }

        let elapsed_fraction = elapsed.as_secs_f64() / duration.as_secs_f64();
        let level = intensity(pattern, elapsed_fraction, handle.unit_index, unit_count);
        match backend.apply(&handle, level).await {
            Ok(()) => {}
            Err(WorkloadError::Bail(_)) => {
                log::debug!("Unit {} bailed, leaving it until teardown", handle.unit_id);
                // The unit is done exerting load. Hold until the run ends so teardown still
                // runs exactly once, at the end.
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = stop_listener.wait_for_stop() => {}
                }
                break;
            }
            Err(e) => {
                log::warn!("Failed to apply intensity to unit {}: {e}", handle.unit_id);
            }
        }
    }

    match backend.delete(&handle).await {
        Ok(()) => UnitOutcome::Done,
        Err(e) => {
            log::error!("Failed to tear down unit {}: {e}", handle.unit_id);
            UnitOutcome::TeardownFailed
        }
    }
}

async fn idle_unit(deadline: Instant, mut stop_listener: DelegatedStopListener) -> UnitOutcome {
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {}
        _ = stop_listener.wait_for_stop() => {}
    }
    UnitOutcome::Done
}
