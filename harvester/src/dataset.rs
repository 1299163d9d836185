use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use squall_run_model::{ConfigError, SimulationRun};
use walkdir::WalkDir;

use crate::collect::CategoryResult;
use crate::flatten::{
    FeatureRow, FeatureSchema, DEGRADED_COLUMN, LABEL_COLUMN, RUN_ID_COLUMN,
};

pub const DEFAULT_TEST_FRACTION: f64 = 0.2;
pub const DEFAULT_SPLIT_SEED: u64 = 42;

const RAW_DIR: &str = "raw";
const PROCESSED_DIR: &str = "processed";
const DATASETS_DIR: &str = "datasets";

fn stamp() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Everything collected for one run, exactly as it came back from the backend.
///
/// Written next to the processed row so that a schema change or a flattening bug does not
/// orphan the underlying data.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub metadata: SnapshotMetadata,
    pub categories: BTreeMap<String, CategoryResult>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// The id of the run this window belongs to. Standalone collections mint their own.
    pub run_id: String,
    pub label: String,
    pub window_start: i64,
    pub window_end: i64,
    pub step_seconds: u64,
    pub namespaces: Vec<String>,
    pub schema_fingerprint: String,
    /// Fingerprint of the run configuration that produced this window, so recollections of
    /// the same configuration can be found across assemblies. Absent without a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_fingerprint: Option<String>,
    /// Absent for standalone collections that observe the cluster without a simulation run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<SimulationRun>,
}

/// Write a raw snapshot under `<output_dir>/raw/`.
pub fn write_raw_snapshot(snapshot: &RawSnapshot, output_dir: &Path) -> anyhow::Result<PathBuf> {
    let dir = output_dir.join(RAW_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("Create {}", dir.display()))?;

    // The run id keeps same-second artifacts for the same label apart under create_new.
    let path = dir.join(format!(
        "metrics_{}_{}_{}.json",
        stamp(),
        snapshot.metadata.label,
        snapshot.metadata.run_id
    ));
    let file = File::create_new(&path).with_context(|| format!("Create {}", path.display()))?;
    serde_json::to_writer_pretty(file, snapshot)
        .with_context(|| format!("Write {}", path.display()))?;

    Ok(path)
}

/// Build a frame with one line per row, metadata columns first, features in schema order.
pub(crate) fn rows_frame(schema: &FeatureSchema, rows: &[FeatureRow]) -> anyhow::Result<DataFrame> {
    for row in rows {
        anyhow::ensure!(
            row.values.len() == schema.columns().len(),
            "Row {} carries {} values for a schema of {}",
            row.run_id,
            row.values.len(),
            schema.columns().len()
        );
    }

    let mut columns = vec![
        Column::new(
            RUN_ID_COLUMN.into(),
            rows.iter().map(|row| row.run_id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            LABEL_COLUMN.into(),
            rows.iter().map(|row| row.label.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            DEGRADED_COLUMN.into(),
            rows.iter().map(|row| row.degraded).collect::<Vec<_>>(),
        ),
    ];
    for (index, column) in schema.columns().iter().enumerate() {
        columns.push(Column::new(
            column.column.as_str().into(),
            rows.iter().map(|row| row.values[index]).collect::<Vec<_>>(),
        ));
    }

    Ok(DataFrame::new(columns)?)
}

/// Write one row as a single line CSV under `<output_dir>/processed/`.
pub fn write_processed_row(
    row: &FeatureRow,
    schema: &FeatureSchema,
    output_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let dir = output_dir.join(PROCESSED_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("Create {}", dir.display()))?;

    let path = dir.join(format!(
        "processed_metrics_{}_{}_{}.csv",
        stamp(),
        row.label,
        row.run_id
    ));
    let mut frame = rows_frame(schema, std::slice::from_ref(row))?;

    let file = File::create_new(&path).with_context(|| format!("Create {}", path.display()))?;
    CsvWriter::new(file)
        .include_header(true)
        .finish(&mut frame)
        .with_context(|| format!("Write {}", path.display()))?;

    Ok(path)
}

#[derive(Debug)]
pub struct SplitDatasets {
    pub train: Vec<FeatureRow>,
    pub test: Vec<FeatureRow>,
}

/// Split rows into train and test sets at the run level, stratified by label.
///
/// All rows of a run land on the same side, so a model can never be tested on a run it has
/// already seen. Within each label the test runs are chosen uniformly by a seeded shuffle, and
/// the per-label test counts are balanced so the overall fraction lands as close to
/// `test_fraction` as whole runs allow. The same rows, fraction and seed always produce the
/// same split.
pub fn split_rows(
    rows: Vec<FeatureRow>,
    test_fraction: f64,
    seed: u64,
) -> Result<SplitDatasets, ConfigError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(ConfigError::BadTestFraction(test_fraction));
    }

    // Distinct runs per label. BTreeMap keeps label order stable for the RNG.
    let mut seen = HashSet::new();
    let mut strata: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in &rows {
        if seen.insert(row.run_id.clone()) {
            strata
                .entry(row.label.clone())
                .or_default()
                .push(row.run_id.clone());
        }
    }

    let total: usize = strata.values().map(|ids| ids.len()).sum();
    let target = (total as f64 * test_fraction).round() as usize;

    // Largest remainder allocation of the target across strata. Each stratum takes the floor
    // of its exact share, the leftovers go to the largest fractional parts.
    let mut entries: Vec<(Vec<String>, usize, f64)> = strata
        .into_values()
        .map(|ids| {
            let exact = ids.len() as f64 * test_fraction;
            let base = exact.floor() as usize;
            (ids, base, exact - exact.floor())
        })
        .collect();

    let allocated: usize = entries.iter().map(|(_, base, _)| *base).sum();
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|a, b| entries[*b].2.total_cmp(&entries[*a].2));
    for index in order.into_iter().take(target.saturating_sub(allocated)) {
        entries[index].1 += 1;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut test_ids = HashSet::new();
    for (mut ids, take, _) in entries {
        ids.shuffle(&mut rng);
        test_ids.extend(ids.into_iter().take(take));
    }

    let (test, train) = rows
        .into_iter()
        .partition(|row| test_ids.contains(&row.run_id));

    Ok(SplitDatasets { train, test })
}

#[derive(Debug, Clone)]
pub struct DatasetPaths {
    pub training: PathBuf,
    pub testing: PathBuf,
}

/// Write the train and test sets as a timestamped pair under `<output_dir>/datasets/`.
pub fn write_datasets(
    split: &SplitDatasets,
    schema: &FeatureSchema,
    output_dir: &Path,
) -> anyhow::Result<DatasetPaths> {
    let dir = output_dir.join(DATASETS_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("Create {}", dir.display()))?;

    let stamp = stamp();
    let paths = DatasetPaths {
        training: dir.join(format!("training_data_{stamp}.csv")),
        testing: dir.join(format!("testing_data_{stamp}.csv")),
    };

    write_rows(&split.train, schema, &paths.training)?;
    write_rows(&split.test, schema, &paths.testing)?;

    Ok(paths)
}

fn write_rows(rows: &[FeatureRow], schema: &FeatureSchema, path: &Path) -> anyhow::Result<()> {
    let mut frame = rows_frame(schema, rows)?;
    let file = File::create_new(path).with_context(|| format!("Create {}", path.display()))?;
    CsvWriter::new(file)
        .include_header(true)
        .finish(&mut frame)
        .with_context(|| format!("Write {}", path.display()))?;

    Ok(())
}

/// Load every processed row found under `<output_dir>/processed/`.
///
/// Files whose header does not match the current schema, or that fail to parse, are skipped
/// with a warning rather than poisoning the whole combine. A missing directory is just an
/// empty dataset.
pub fn load_processed_rows(
    output_dir: &Path,
    schema: &FeatureSchema,
) -> anyhow::Result<Vec<FeatureRow>> {
    let dir = output_dir.join(PROCESSED_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut rows = Vec::new();
    for entry in WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("processed_metrics_") || !name.ends_with(".csv") {
            continue;
        }

        match read_rows(entry.path(), schema) {
            Ok(mut file_rows) => rows.append(&mut file_rows),
            Err(e) => log::warn!("Skipping {}: {e:#}", entry.path().display()),
        }
    }

    Ok(rows)
}

fn read_rows(path: &Path, schema: &FeatureSchema) -> anyhow::Result<Vec<FeatureRow>> {
    // Compare the header line before handing the file to the CSV reader, so that artifacts
    // written under a different schema version are rejected by name rather than misread.
    let mut header = String::new();
    BufReader::new(File::open(path).with_context(|| format!("Open {}", path.display()))?)
        .read_line(&mut header)
        .with_context(|| format!("Read {}", path.display()))?;
    let found: Vec<String> = header.trim_end().split(',').map(str::to_string).collect();
    anyhow::ensure!(
        found == schema.column_names(),
        "Header does not match the current feature schema"
    );

    let frame = CsvReadOptions::default()
        .with_schema(Some(Arc::new(processed_schema(schema))))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
        .with_context(|| format!("Read {}", path.display()))?;

    let run_ids = frame.column(RUN_ID_COLUMN)?.str()?;
    let labels = frame.column(LABEL_COLUMN)?.str()?;
    let degraded = frame.column(DEGRADED_COLUMN)?.bool()?;
    let mut feature_columns = Vec::with_capacity(schema.columns().len());
    for column in schema.columns() {
        feature_columns.push(frame.column(&column.column)?.f64()?);
    }

    let mut rows = Vec::with_capacity(frame.height());
    for index in 0..frame.height() {
        rows.push(FeatureRow {
            run_id: run_ids.get(index).unwrap_or_default().to_string(),
            label: labels.get(index).unwrap_or_default().to_string(),
            degraded: degraded.get(index).unwrap_or_default(),
            values: feature_columns
                .iter()
                .map(|values| values.get(index).unwrap_or(f64::NAN))
                .collect(),
        });
    }

    Ok(rows)
}

/// The explicit dtypes of a processed artifact. Inference would read a first row full of `NaN`
/// markers as strings.
fn processed_schema(schema: &FeatureSchema) -> Schema {
    let mut fields: Vec<(PlSmallStr, DataType)> = vec![
        (RUN_ID_COLUMN.into(), DataType::String),
        (LABEL_COLUMN.into(), DataType::String),
        (DEGRADED_COLUMN.into(), DataType::Boolean),
    ];
    fields.extend(
        schema
            .columns()
            .iter()
            .map(|column| (column.column.as_str().into(), DataType::Float64)),
    );

    Schema::from_iter(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(run_id: &str, label: &str, value: f64) -> FeatureRow {
        let schema = FeatureSchema::global();
        FeatureRow {
            run_id: run_id.to_string(),
            label: label.to_string(),
            degraded: false,
            values: vec![value; schema.columns().len()],
        }
    }

    fn run_ids(rows: &[FeatureRow]) -> HashSet<String> {
        rows.iter().map(|row| row.run_id.clone()).collect()
    }

    fn file_names(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn split_never_divides_a_run() {
        // Two rows per run, as a run recollected under two labels never happens but two
        // windows of one run could.
        let mut rows = Vec::new();
        for index in 0..10 {
            rows.push(row(&format!("run-{index}"), "resource", 1.0));
            rows.push(row(&format!("run-{index}"), "resource", 2.0));
        }

        let split = split_rows(rows, 0.2, 42).unwrap();

        let train = run_ids(&split.train);
        let test = run_ids(&split.test);
        assert!(train.is_disjoint(&test));
        assert_eq!(split.test.len() % 2, 0, "runs must move as a whole");
    }

    #[test]
    fn split_is_deterministic() {
        let rows: Vec<_> = (0..30)
            .map(|index| {
                let label = ["resource", "network", "none"][index % 3];
                row(&format!("run-{index}"), label, index as f64)
            })
            .collect();

        let first = split_rows(rows.clone(), 0.2, 42).unwrap();
        let second = split_rows(rows, 0.2, 42).unwrap();

        assert_eq!(run_ids(&first.test), run_ids(&second.test));
        assert_eq!(first.train.len(), second.train.len());
    }

    #[test]
    fn split_hits_the_requested_fraction() {
        let rows: Vec<_> = (0..40)
            .map(|index| {
                let label = ["resource", "network", "pod-failure", "none"][index % 4];
                row(&format!("run-{index}"), label, 0.0)
            })
            .collect();

        let split = split_rows(rows, 0.2, 42).unwrap();

        assert_eq!(split.test.len(), 8);
        assert_eq!(split.train.len(), 32);
    }

    #[test]
    fn split_stratifies_by_label() {
        let rows: Vec<_> = (0..20)
            .map(|index| {
                let label = if index < 10 { "resource" } else { "network" };
                row(&format!("run-{index}"), label, 0.0)
            })
            .collect();

        let split = split_rows(rows, 0.2, 42).unwrap();

        let resource = split
            .test
            .iter()
            .filter(|row| row.label == "resource")
            .count();
        let network = split.test.iter().filter(|row| row.label == "network").count();
        assert_eq!(resource, 2);
        assert_eq!(network, 2);
    }

    #[test]
    fn bad_fractions_are_rejected() {
        // The bounds themselves are out: 0.0 would silently produce an empty test set and
        // 1.0 an empty training set.
        for fraction in [1.0, -0.1, 0.0, f64::NAN] {
            assert!(matches!(
                split_rows(vec![row("a", "none", 0.0)], fraction, 42),
                Err(ConfigError::BadTestFraction(_))
            ));
        }
    }

    #[test]
    fn no_rows_is_an_empty_split() {
        let split = split_rows(Vec::new(), 0.2, 42).unwrap();
        assert!(split.train.is_empty());
        assert!(split.test.is_empty());
    }

    #[test]
    fn processed_rows_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let schema = FeatureSchema::global();

        let mut written = row("run-1", "resource", 0.25);
        written.degraded = true;
        written.values[3] = f64::NAN;
        write_processed_row(&written, &schema, dir.path()).unwrap();

        let loaded = load_processed_rows(dir.path(), &schema).unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run_id, "run-1");
        assert_eq!(loaded[0].label, "resource");
        assert!(loaded[0].degraded);
        assert!(loaded[0].values[3].is_nan());
        assert_eq!(loaded[0].values[0], 0.25);
        assert_eq!(loaded[0].values.len(), written.values.len());
    }

    #[test]
    fn same_second_artifacts_for_one_label_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let schema = FeatureSchema::global();

        // Written back to back, so both stamps almost certainly share the second. The run id
        // in the name is what keeps create_new from failing.
        write_processed_row(&row("run-1", "none", 0.1), &schema, dir.path()).unwrap();
        write_processed_row(&row("run-2", "none", 0.2), &schema, dir.path()).unwrap();

        for run_id in ["run-1", "run-2"] {
            let snapshot = RawSnapshot {
                metadata: SnapshotMetadata {
                    run_id: run_id.to_string(),
                    label: "none".to_string(),
                    window_start: 0,
                    window_end: 60,
                    step_seconds: 15,
                    namespaces: Vec::new(),
                    schema_fingerprint: schema.fingerprint().to_string(),
                    run_fingerprint: None,
                    run: None,
                },
                categories: BTreeMap::new(),
            };
            write_raw_snapshot(&snapshot, dir.path()).unwrap();
        }

        let loaded = load_processed_rows(dir.path(), &schema).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(file_names(&dir.path().join(RAW_DIR)).len(), 2);
    }

    #[test]
    fn missing_directory_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_processed_rows(dir.path(), &FeatureSchema::global()).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn foreign_headers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let processed = dir.path().join(PROCESSED_DIR);
        std::fs::create_dir_all(&processed).unwrap();
        std::fs::write(
            processed.join("processed_metrics_20240101_000000_old.csv"),
            "run_id,label,old_feature\nx,none,1.0\n",
        )
        .unwrap();

        let schema = FeatureSchema::global();
        write_processed_row(&row("run-2", "none", 0.5), &schema, dir.path()).unwrap();

        let loaded = load_processed_rows(dir.path(), &schema).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run_id, "run-2");
    }

    #[test]
    fn datasets_are_written_as_a_pair() {
        let dir = tempfile::tempdir().unwrap();
        let schema = FeatureSchema::global();
        let split = SplitDatasets {
            train: vec![row("run-1", "resource", 1.0), row("run-2", "none", 2.0)],
            test: vec![row("run-3", "network", 3.0)],
        };

        let paths = write_datasets(&split, &schema, dir.path()).unwrap();

        assert!(paths.training.exists());
        assert!(paths.testing.exists());
        let header = std::fs::read_to_string(&paths.training).unwrap();
        assert!(header.starts_with("run_id,cluster_issue_type,degraded,"));
        assert!(
            !header.contains("run-3"),
            "test runs must not appear in the training set"
        );
    }
}
