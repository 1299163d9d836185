use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::analyze::aggregate_value;
use crate::collect::CategoryResult;
use crate::registry::{self, Aggregate};

pub const RUN_ID_COLUMN: &str = "run_id";
pub const LABEL_COLUMN: &str = "cluster_issue_type";
pub const DEGRADED_COLUMN: &str = "degraded";

/// What to do with rows from degraded runs when assembling datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DegradedPolicy {
    /// Keep the rows, relying on the `degraded` column to mark them.
    Flag,
    /// Drop the rows from the accumulated dataset. Their artifacts are still written.
    Exclude,
}

impl DegradedPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradedPolicy::Flag => "flag",
            DegradedPolicy::Exclude => "exclude",
        }
    }
}

impl fmt::Display for DegradedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One feature column of the global schema.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureColumn {
    pub category: &'static str,
    pub metric: &'static str,
    pub aggregate: Aggregate,
    /// The column name as written to artifacts, `<metric>_<aggregate>`.
    pub column: String,
}

/// The fixed feature layout shared by every row ever produced.
///
/// Built from the category table, so every row has a value position for every metric of every
/// category whether or not that category was collectable for the run in question.
#[derive(Debug, Clone)]
pub struct FeatureSchema {
    version: &'static str,
    fingerprint: String,
    columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn global() -> Self {
        let columns = registry::CATEGORIES
            .iter()
            .flat_map(|category| {
                category.metrics.iter().map(|metric| FeatureColumn {
                    category: category.name,
                    metric: metric.name,
                    aggregate: metric.aggregate,
                    column: format!("{}_{}", metric.name, metric.aggregate),
                })
            })
            .collect();

        Self {
            version: registry::SCHEMA_VERSION,
            fingerprint: registry::schema_fingerprint(),
            columns,
        }
    }

    pub fn version(&self) -> &'static str {
        self.version
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn columns(&self) -> &[FeatureColumn] {
        &self.columns
    }

    /// Every column name in artifact order, metadata columns first.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = vec![
            RUN_ID_COLUMN.to_string(),
            LABEL_COLUMN.to_string(),
            DEGRADED_COLUMN.to_string(),
        ];
        names.extend(self.columns.iter().map(|column| column.column.clone()));
        names
    }
}

/// One flattened training row.
///
/// `values` is ordered exactly as [FeatureSchema::columns]; positions whose category was
/// unavailable, or whose metric matched nothing, hold `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub run_id: String,
    pub label: String,
    pub degraded: bool,
    pub values: Vec<f64>,
}

/// Flatten one collection result into a row of the global schema.
///
/// The label comes in from the caller and is written through verbatim. Nothing here inspects
/// the collected values to decide it.
pub fn flatten(
    run_id: &str,
    label: &str,
    degraded: bool,
    collected: &BTreeMap<String, CategoryResult>,
    schema: &FeatureSchema,
) -> anyhow::Result<FeatureRow> {
    let mut values = Vec::with_capacity(schema.columns().len());
    for column in schema.columns() {
        let series = match collected.get(column.category) {
            Some(CategoryResult::Available { metrics }) => metrics.get(column.metric),
            Some(CategoryResult::Unavailable { .. }) | None => None,
        };

        let value = match series {
            Some(series) => aggregate_value(series, column.aggregate)?,
            None => None,
        };

        values.push(value.unwrap_or(f64::NAN));
    }

    Ok(FeatureRow {
        run_id: run_id.to_string(),
        label: label.to_string(),
        degraded,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MetricSeries;

    /// A collection result where every metric of every category carries one series holding
    /// `value` at two timestamps.
    pub(crate) fn constant_collected(value: f64) -> BTreeMap<String, CategoryResult> {
        registry::CATEGORIES
            .iter()
            .map(|category| {
                let metrics = category
                    .metrics
                    .iter()
                    .map(|metric| {
                        let series = MetricSeries {
                            labels: BTreeMap::new(),
                            points: vec![(1.0, value), (2.0, value)],
                        };
                        (metric.name.to_string(), vec![series])
                    })
                    .collect();
                (category.name.to_string(), CategoryResult::Available { metrics })
            })
            .collect()
    }

    #[test]
    fn schema_covers_every_metric_once() {
        let schema = FeatureSchema::global();

        let metric_count: usize = registry::CATEGORIES
            .iter()
            .map(|category| category.metrics.len())
            .sum();
        assert_eq!(schema.columns().len(), metric_count);
        assert_eq!(schema.column_names().len(), metric_count + 3);
        assert_eq!(schema.fingerprint().len(), 64);
    }

    #[test]
    fn column_names_start_with_metadata() {
        let names = FeatureSchema::global().column_names();
        assert_eq!(names[0], RUN_ID_COLUMN);
        assert_eq!(names[1], LABEL_COLUMN);
        assert_eq!(names[2], DEGRADED_COLUMN);
    }

    #[test]
    fn full_collection_fills_every_position() {
        let schema = FeatureSchema::global();
        let row = flatten("run-1", "resource", false, &constant_collected(0.7), &schema).unwrap();

        assert_eq!(row.values.len(), schema.columns().len());
        assert!(row.values.iter().all(|value| *value == 0.7));
        assert_eq!(row.label, "resource");
        assert!(!row.degraded);
    }

    #[test]
    fn unavailable_category_becomes_nan_without_changing_shape() {
        let schema = FeatureSchema::global();
        let mut collected = constant_collected(0.7);
        collected.insert(
            "etcd".to_string(),
            CategoryResult::Unavailable {
                reason: "etcd_has_leader: Query returned HTTP status 500".to_string(),
            },
        );

        let row = flatten("run-2", "network", true, &collected, &schema).unwrap();

        assert_eq!(row.values.len(), schema.columns().len());
        for (column, value) in schema.columns().iter().zip(&row.values) {
            if column.category == "etcd" {
                assert!(value.is_nan(), "{} should be NaN", column.column);
            } else {
                assert_eq!(*value, 0.7, "{} should hold data", column.column);
            }
        }
    }

    #[test]
    fn missing_category_is_treated_like_unavailable() {
        let schema = FeatureSchema::global();
        let mut collected = constant_collected(1.0);
        collected.remove("pod");

        let row = flatten("run-3", "none", false, &collected, &schema).unwrap();

        for (column, value) in schema.columns().iter().zip(&row.values) {
            assert_eq!(value.is_nan(), column.category == "pod");
        }
    }

    #[test]
    fn label_is_written_through_verbatim() {
        let schema = FeatureSchema::global();
        let row = flatten("run-4", "pod-failure", false, &constant_collected(0.0), &schema).unwrap();
        assert_eq!(row.label, "pod-failure");
    }
}
