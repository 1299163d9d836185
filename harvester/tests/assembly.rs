use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use squall_core::prelude::{StopHandle, TimeWindow};
use squall_harvester::assemble::{assemble, AssemblyConfig, AssemblyError, IterationState};
use squall_harvester::backend::{MetricSeries, MonitoringBackend, QueryError};
use squall_harvester::dataset::RawSnapshot;
use squall_harvester::flatten::{DegradedPolicy, FeatureSchema};
use squall_run_model::{load_run_records, PatternKind, ScenarioKind};
use squall_runner::prelude::{
    LocalWorkload, UnitHandle, UnitSpec, WorkloadBackend, WorkloadError,
};

/// A monitoring backend that answers every query with one constant series over the window, so
/// every feature of every category aggregates to exactly that constant.
struct FakeMonitoring {
    value: f64,
    reachable: bool,
    fail_substring: Option<&'static str>,
}

impl FakeMonitoring {
    fn constant(value: f64) -> Self {
        Self {
            value,
            reachable: true,
            fail_substring: None,
        }
    }

    fn unreachable() -> Self {
        Self {
            value: 0.0,
            reachable: false,
            fail_substring: None,
        }
    }

    fn failing(fragment: &'static str) -> Self {
        Self {
            value: 0.1,
            reachable: true,
            fail_substring: Some(fragment),
        }
    }
}

#[async_trait]
impl MonitoringBackend for FakeMonitoring {
    async fn range_query(
        &self,
        expr: &str,
        window: &TimeWindow,
        _step_seconds: u64,
    ) -> Result<Vec<MetricSeries>, QueryError> {
        if let Some(fragment) = self.fail_substring {
            if expr.contains(fragment) {
                return Err(QueryError::Status(500));
            }
        }

        let (start, end) = window.unix_bounds();
        Ok(vec![MetricSeries {
            labels: BTreeMap::new(),
            points: vec![(start as f64, self.value), (end as f64, self.value)],
        }])
    }

    async fn ping(&self) -> bool {
        self.reachable
    }
}

/// A workload backend that fails to launch every unit below `fail_below` and accepts the rest.
struct FlakyWorkload {
    fail_below: usize,
}

#[async_trait]
impl WorkloadBackend for FlakyWorkload {
    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, WorkloadError> {
        if spec.unit_index < self.fail_below {
            return Err(WorkloadError::Launch {
                unit_index: spec.unit_index,
                reason: "scripted launch failure".to_string(),
            });
        }

        Ok(UnitHandle {
            unit_id: format!("flaky-{}", spec.unit_index),
            unit_index: spec.unit_index,
            namespace: spec.namespace.clone(),
            scenario: spec.scenario,
        })
    }

    async fn apply(&self, _handle: &UnitHandle, _intensity: f64) -> Result<(), WorkloadError> {
        Ok(())
    }

    async fn delete(&self, _handle: &UnitHandle) -> Result<(), WorkloadError> {
        Ok(())
    }
}

fn quick_config(output_dir: &Path) -> AssemblyConfig {
    AssemblyConfig {
        scenarios: vec![ScenarioKind::Baseline],
        iterations: 2,
        patterns: vec![PatternKind::Random],
        namespace: "testing".to_string(),
        duration_range: (1, 1),
        pods_range: (2, 2),
        cooldown_range: (0, 0),
        output_dir: output_dir.to_path_buf(),
        progress: false,
        ..Default::default()
    }
}

fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread")]
async fn assembly_produces_rows_holding_the_backend_values() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = assemble(
        quick_config(dir.path()),
        Arc::new(FakeMonitoring::constant(0.1)),
        Arc::new(LocalWorkload::new()),
        StopHandle::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.rows.len(), 2);
    let schema = FeatureSchema::global();
    for row in &outcome.rows {
        assert_eq!(row.label, "none");
        assert!(!row.degraded);
        assert_eq!(row.values.len(), schema.columns().len());
        for (column, value) in schema.columns().iter().zip(&row.values) {
            assert_eq!(*value, 0.1, "{} should hold the backend value", column.column);
        }
    }

    assert_eq!(outcome.reports.len(), 2);
    assert!(outcome
        .reports
        .iter()
        .all(|report| report.state == IterationState::Accumulated));

    let records = load_run_records(dir.path().join("run_log.jsonl")).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|record| record.scenario == ScenarioKind::Baseline));

    assert_eq!(file_count(&dir.path().join("raw")), 2);
    assert_eq!(file_count(&dir.path().join("processed")), 2);

    // Raw snapshots name the run they belong to and carry its configuration fingerprint, so
    // recollections of one configuration can be found without re-deriving anything.
    for entry in std::fs::read_dir(dir.path().join("raw")).unwrap() {
        let file = std::fs::File::open(entry.unwrap().path()).unwrap();
        let snapshot: RawSnapshot = serde_json::from_reader(file).unwrap();

        let run = snapshot.metadata.run.expect("assembled snapshots embed their run");
        assert_eq!(snapshot.metadata.run_id, run.run_id);
        assert_eq!(snapshot.metadata.run_fingerprint, Some(run.fingerprint()));
        assert!(records.iter().any(|record| record.run_id == run.run_id));
    }

    let datasets = outcome.datasets.expect("datasets should be written");
    assert!(datasets.training.exists());
    assert!(datasets.testing.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_backend_stops_the_assembly_before_any_run() {
    let dir = tempfile::tempdir().unwrap();
    let error = assemble(
        quick_config(dir.path()),
        Arc::new(FakeMonitoring::unreachable()),
        Arc::new(LocalWorkload::new()),
        StopHandle::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        error.downcast_ref::<AssemblyError>(),
        Some(AssemblyError::Connectivity)
    ));
    assert!(!dir.path().join("run_log.jsonl").exists());
    assert_eq!(file_count(&dir.path().join("processed")), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failing_category_leaves_nan_only_in_its_own_columns() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.iterations = 1;

    let outcome = assemble(
        config,
        Arc::new(FakeMonitoring::failing("etcd_")),
        Arc::new(LocalWorkload::new()),
        StopHandle::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.rows.len(), 1);
    let schema = FeatureSchema::global();
    for (column, value) in schema.columns().iter().zip(&outcome.rows[0].values) {
        if column.category == "etcd" {
            assert!(value.is_nan(), "{} should be NaN", column.column);
        } else {
            assert_eq!(*value, 0.1, "{} should hold data", column.column);
        }
    }

    assert_eq!(
        outcome.reports[0].unavailable_categories,
        vec!["etcd".to_string()]
    );
    assert_eq!(outcome.reports[0].state, IterationState::Accumulated);
}

#[tokio::test(flavor = "multi_thread")]
async fn iterations_with_no_units_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.scenarios = vec![ScenarioKind::Resource];
    config.iterations = 1;

    let error = assemble(
        config,
        Arc::new(FakeMonitoring::constant(0.1)),
        Arc::new(FlakyWorkload {
            fail_below: usize::MAX,
        }),
        StopHandle::new(),
    )
    .await
    .unwrap_err();

    // The only iteration was discarded, so the assembly ends with nothing to combine.
    assert!(matches!(
        error.downcast_ref::<AssemblyError>(),
        Some(AssemblyError::NoRows)
    ));
    assert!(!dir.path().join("run_log.jsonl").exists());
    assert_eq!(file_count(&dir.path().join("processed")), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_runs_are_flagged_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.scenarios = vec![ScenarioKind::Resource];
    config.iterations = 1;

    let outcome = assemble(
        config,
        Arc::new(FakeMonitoring::constant(0.1)),
        Arc::new(FlakyWorkload { fail_below: 1 }),
        StopHandle::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.rows.len(), 1);
    assert!(outcome.rows[0].degraded);
    assert_eq!(outcome.rows[0].label, "resource");
    assert_eq!(outcome.reports[0].state, IterationState::Accumulated);
    assert!(outcome.reports[0].degraded);
}

#[tokio::test(flavor = "multi_thread")]
async fn excluded_degraded_runs_are_persisted_but_not_accumulated() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.scenarios = vec![ScenarioKind::Resource];
    config.iterations = 1;
    config.degraded_policy = DegradedPolicy::Exclude;

    let error = assemble(
        config,
        Arc::new(FakeMonitoring::constant(0.1)),
        Arc::new(FlakyWorkload { fail_below: 1 }),
        StopHandle::new(),
    )
    .await
    .unwrap_err();

    // The only run was degraded and excluded, leaving nothing to combine. Its artifacts are
    // still on disk.
    assert!(matches!(
        error.downcast_ref::<AssemblyError>(),
        Some(AssemblyError::NoRows)
    ));
    assert_eq!(file_count(&dir.path().join("processed")), 1);
    assert_eq!(file_count(&dir.path().join("raw")), 1);
    assert_eq!(
        load_run_records(dir.path().join("run_log.jsonl"))
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn an_abort_ends_the_assembly_after_persisting_the_active_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.iterations = 5;

    let abort = StopHandle::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.stop();
    });

    let error = assemble(
        config,
        Arc::new(FakeMonitoring::constant(0.1)),
        Arc::new(LocalWorkload::new()),
        abort,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        error.downcast_ref::<AssemblyError>(),
        Some(AssemblyError::Stopped)
    ));

    // The abort landed inside the first one second run, which still got stopped and recorded.
    let records = load_run_records(dir.path().join("run_log.jsonl")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(file_count(&dir.path().join("processed")), 0);
    assert!(
        dir.path().join("datasets").metadata().is_err(),
        "an interrupted assembly must not combine"
    );
}
