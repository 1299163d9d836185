use std::time::Duration;

use squall_run_model::{ConfigError, PatternKind, ScenarioKind};

/// The default sampling cadence for unit drivers, half the usual scrape interval so that every
/// scrape sees a current intensity.
pub const DEFAULT_APPLY_CADENCE: Duration = Duration::from_secs(5);

/// Everything the injector needs to run one simulation.
///
/// A plan is plain data; it is validated when the injector starts so that a bad configuration
/// fails before any workload exists.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub scenario: ScenarioKind,
    pub pattern: PatternKind,
    /// The number of workload units to launch. Ignored for [ScenarioKind::Baseline], which
    /// always observes the cluster without load.
    pub participant_count: usize,
    pub duration: Duration,
    /// The namespace workload units are created in.
    pub namespace: String,
    /// How often each unit re-samples its intensity and applies it to the backend.
    pub apply_cadence: Duration,
    /// Show a progress bar while the run is active.
    pub progress: bool,
}

impl RunPlan {
    pub fn new(
        scenario: ScenarioKind,
        pattern: PatternKind,
        participant_count: usize,
        duration: Duration,
    ) -> Self {
        Self {
            scenario,
            pattern,
            participant_count,
            duration,
            namespace: "default".to_string(),
            apply_cadence: DEFAULT_APPLY_CADENCE,
            progress: false,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_apply_cadence(mut self, cadence: Duration) -> Self {
        self.apply_cadence = cadence;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// The number of units the injector will actually launch.
    pub fn unit_count(&self) -> usize {
        match self.scenario {
            ScenarioKind::Baseline => 0,
            _ => self.participant_count,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        if self.apply_cadence.is_zero() {
            return Err(ConfigError::ZeroCadence);
        }
        if self.scenario != ScenarioKind::Baseline && self.participant_count == 0 {
            return Err(ConfigError::ZeroParticipants);
        }
        Ok(())
    }
}
