use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::workload::{UnitHandle, UnitSpec, WorkloadBackend, WorkloadError};

/// How long one burn/rest cycle of a local unit lasts.
const DUTY_SLICE: Duration = Duration::from_millis(100);

/// Memory ballast held by a local unit at full intensity.
const MAX_BALLAST_BYTES: usize = 16 * 1024 * 1024;

struct LocalUnit {
    intensity_tx: watch::Sender<f64>,
    task: tokio::task::JoinHandle<()>,
}

/// A workload backend that exerts the load inside this process.
///
/// Each unit is a task that burns CPU on a duty cycle proportional to its intensity and holds a
/// proportional memory ballast. Useful for development without a cluster and as the backend the
/// injector tests run against. Note that the load lands on the machine running squall, not on
/// the cluster, so collected metrics will only reflect it when squall runs in-cluster.
#[derive(Default)]
pub struct LocalWorkload {
    units: Arc<Mutex<HashMap<String, LocalUnit>>>,
}

impl LocalWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of units currently live. Zero once a run has fully torn down.
    pub fn live_units(&self) -> usize {
        self.units.lock().len()
    }
}

#[async_trait]
impl WorkloadBackend for LocalWorkload {
    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, WorkloadError> {
        let unit_id = format!("local-{}-{}", spec.run_id, spec.unit_index);
        let (intensity_tx, intensity_rx) = watch::channel(spec.initial_intensity);

        let task = tokio::spawn(burn(intensity_rx));

        self.units.lock().insert(
            unit_id.clone(),
            LocalUnit { intensity_tx, task },
        );
        log::debug!("Started local workload unit {unit_id}");

        Ok(UnitHandle {
            unit_id,
            unit_index: spec.unit_index,
            namespace: spec.namespace.clone(),
            scenario: spec.scenario,
        })
    }

    async fn apply(&self, handle: &UnitHandle, intensity: f64) -> Result<(), WorkloadError> {
        let units = self.units.lock();
        let unit = units
            .get(&handle.unit_id)
            .ok_or_else(|| WorkloadError::Apply {
                unit_id: handle.unit_id.clone(),
                reason: "unit is not live".to_string(),
            })?;
        unit.intensity_tx
            .send(intensity.clamp(0.0, 1.0))
            .map_err(|e| WorkloadError::Apply {
                unit_id: handle.unit_id.clone(),
                reason: e.to_string(),
            })
    }

    async fn delete(&self, handle: &UnitHandle) -> Result<(), WorkloadError> {
        let unit = self.units.lock().remove(&handle.unit_id);
        match unit {
            Some(unit) => {
                unit.task.abort();
                // Wait for the task to actually finish so the unit cannot outlive the run.
                let _ = unit.task.await;
                log::debug!("Stopped local workload unit {}", handle.unit_id);
                Ok(())
            }
            None => Err(WorkloadError::Teardown {
                unit_id: handle.unit_id.clone(),
                reason: "unit is not live".to_string(),
            }),
        }
    }
}

async fn burn(intensity_rx: watch::Receiver<f64>) {
    let mut ballast: Vec<u8> = Vec::new();
    loop {
        let intensity = *intensity_rx.borrow();

        let target = (intensity * MAX_BALLAST_BYTES as f64) as usize;
        if target != ballast.len() {
            ballast.resize(target, 0);
        }

        // The spin must not hold an async worker thread, so it runs on the blocking pool. The
        // await between slices keeps the task abortable.
        let busy = DUTY_SLICE.mul_f64(intensity);
        if !busy.is_zero() {
            let _ = tokio::task::spawn_blocking(move || {
                let started = Instant::now();
                while started.elapsed() < busy {
                    std::hint::spin_loop();
                }
            })
            .await;
        }
        tokio::time::sleep(DUTY_SLICE - busy.min(DUTY_SLICE)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squall_run_model::ScenarioKind;

    fn spec(index: usize) -> UnitSpec {
        UnitSpec {
            run_id: "test".to_string(),
            scenario: ScenarioKind::Resource,
            namespace: "default".to_string(),
            unit_index: index,
            unit_count: 2,
            duration: Duration::from_secs(1),
            initial_intensity: 0.0,
        }
    }

    #[tokio::test]
    async fn units_live_until_deleted() {
        let backend = LocalWorkload::new();

        let first = backend.create(&spec(0)).await.unwrap();
        let second = backend.create(&spec(1)).await.unwrap();
        assert_eq!(backend.live_units(), 2);

        backend.apply(&first, 0.8).await.unwrap();

        backend.delete(&first).await.unwrap();
        backend.delete(&second).await.unwrap();
        assert_eq!(backend.live_units(), 0);
    }

    #[tokio::test]
    async fn full_intensity_units_leave_the_runtime_responsive() {
        let backend = LocalWorkload::new();

        // On the default current-thread runtime a unit spinning on the worker thread would stall
        // every await below. The burn runs off-runtime, so timers and teardown still make
        // progress.
        let first = backend.create(&spec(0)).await.unwrap();
        let second = backend.create(&spec(1)).await.unwrap();
        backend.apply(&first, 1.0).await.unwrap();
        backend.apply(&second, 1.0).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::time::sleep(DUTY_SLICE * 3).await;
            backend.delete(&first).await.unwrap();
            backend.delete(&second).await.unwrap();
        })
        .await
        .expect("deletes should not be starved by burning units");

        assert_eq!(backend.live_units(), 0);
    }

    #[tokio::test]
    async fn operations_on_dead_units_fail() {
        let backend = LocalWorkload::new();
        let handle = backend.create(&spec(0)).await.unwrap();
        backend.delete(&handle).await.unwrap();

        assert!(matches!(
            backend.apply(&handle, 0.5).await,
            Err(WorkloadError::Apply { .. })
        ));
        assert!(matches!(
            backend.delete(&handle).await,
            Err(WorkloadError::Teardown { .. })
        ));
    }
}
