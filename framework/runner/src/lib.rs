mod abort;
mod injector;
mod kubectl;
mod local;
mod monitor;
mod pattern;
mod plan;
mod pod;
mod progress;
mod workload;

pub mod prelude {
    pub use crate::abort::start_abort_listener;
    pub use crate::injector::{start, ActiveRun, CompletedRun};
    pub use crate::kubectl::{kubectl_path, SQ_KUBECTL_PATH_ENV};
    pub use crate::local::LocalWorkload;
    pub use crate::monitor::start_monitor;
    pub use crate::pattern::{intensity, is_spike_unit, spike_unit_count};
    pub use crate::plan::{RunPlan, DEFAULT_APPLY_CADENCE};
    pub use crate::pod::PodWorkload;
    pub use crate::progress::start_progress;
    pub use crate::workload::{
        crash_profile, network_impairment, stress_level, CrashProfile, NetworkImpairment,
        UnitHandle, UnitSpec, WorkloadBackend, WorkloadError,
    };
}
