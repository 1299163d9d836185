use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use squall_core::prelude::UnitBailError;
use squall_run_model::ScenarioKind;

/// Everything a backend needs to bring one workload unit into existence.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub run_id: String,
    pub scenario: ScenarioKind,
    pub namespace: String,
    pub unit_index: usize,
    pub unit_count: usize,
    /// The configured run duration, used by backends whose units self-terminate as a safety net.
    pub duration: Duration,
    /// The intensity the unit should start at, sampled at elapsed fraction zero.
    pub initial_intensity: f64,
}

/// An opaque reference to a live workload unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitHandle {
    pub unit_id: String,
    pub unit_index: usize,
    pub namespace: String,
    pub scenario: ScenarioKind,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkloadError {
    #[error("failed to launch workload unit {unit_index}: {reason}")]
    Launch { unit_index: usize, reason: String },
    #[error("no workload units started out of {requested} requested")]
    NoUnitsStarted { requested: usize },
    #[error("failed to adjust workload unit {unit_id}: {reason}")]
    Apply { unit_id: String, reason: String },
    #[error("failed to tear down workload unit {unit_id}: {reason}")]
    Teardown { unit_id: String, reason: String },
    #[error("workload backend is not ready: {reason}")]
    NotReady { reason: String },
    /// The unit is gone and should not be driven any further. Crash-loop units exiting on their
    /// own report this rather than a hard failure.
    #[error("workload unit bailed")]
    Bail(#[from] UnitBailError),
}

/// The seam between the injector and whatever actually exerts the load.
///
/// The production backend creates pods through kubectl; the development backend burns CPU in
/// this process. Tests substitute scripted implementations.
#[async_trait]
pub trait WorkloadBackend: Send + Sync + 'static {
    /// One-time preparation before any unit of a run is created. The pod backend ensures the
    /// target namespace exists here.
    async fn prepare(&self, _namespace: &str) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, WorkloadError>;

    /// Bring the unit to the given intensity in `[0.0, 1.0]`. Called at the plan's cadence;
    /// implementations are free to treat small changes as a no-op.
    async fn apply(&self, handle: &UnitHandle, intensity: f64) -> Result<(), WorkloadError>;

    /// Remove the unit. Must only return once the unit is confirmed gone.
    async fn delete(&self, handle: &UnitHandle) -> Result<(), WorkloadError>;
}

/// The discrete stress level a continuous intensity maps onto, 1 to 4.
///
/// The stress pods take whole worker counts, so the continuous intensity is quantized onto the
/// four levels the scenarios were tuned with.
pub fn stress_level(intensity: f64) -> u32 {
    1 + (intensity.clamp(0.0, 1.0) * 3.0).round() as u32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkImpairment {
    pub latency_ms: u32,
    pub loss_percent: f64,
}

/// Map an intensity onto netem parameters: 50-500ms of delay and 1-15% packet loss.
pub fn network_impairment(intensity: f64) -> NetworkImpairment {
    let intensity = intensity.clamp(0.0, 1.0);
    NetworkImpairment {
        latency_ms: 50 + (intensity * 450.0).round() as u32,
        loss_percent: 1.0 + intensity * 14.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrashProfile {
    pub crash_probability: f64,
    pub crash_interval_s: u32,
}

/// Map an intensity onto a crash-loop profile: more intense units crash more often, with the
/// check interval tightening from 120s down to 30s.
pub fn crash_profile(intensity: f64) -> CrashProfile {
    let intensity = intensity.clamp(0.0, 1.0);
    CrashProfile {
        crash_probability: 0.1 + intensity * 0.4,
        crash_interval_s: (120.0 - intensity * 90.0).round() as u32,
    }
}
