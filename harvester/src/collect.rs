use std::collections::BTreeMap;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use squall_core::prelude::TimeWindow;

use crate::backend::{MetricSeries, MonitoringBackend};
use crate::registry::{render_expr, CategorySpec};

/// Default resolution for range queries, matching the usual Prometheus scrape interval.
pub const DEFAULT_QUERY_STEP_SECONDS: u64 = 15;

/// What came back for one category.
///
/// A category is only [CategoryResult::Unavailable] when a query failed outright. Queries that
/// succeed but match nothing still leave the category available, with empty series lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryResult {
    Available {
        /// Series per metric name, in no particular order.
        metrics: BTreeMap<String, Vec<MetricSeries>>,
    },
    Unavailable {
        reason: String,
    },
}

impl CategoryResult {
    pub fn is_available(&self) -> bool {
        matches!(self, CategoryResult::Available { .. })
    }
}

/// Query every metric of every requested category over `window`.
///
/// Categories are queried concurrently and fail independently. The returned map always carries
/// one entry per requested category, so a failure shows up as data rather than as a missing
/// key.
pub async fn collect(
    backend: &dyn MonitoringBackend,
    window: &TimeWindow,
    categories: &[CategorySpec],
    namespaces: &[String],
    step_seconds: u64,
) -> BTreeMap<String, CategoryResult> {
    let results = join_all(categories.iter().map(|category| async move {
        let result = collect_category(backend, window, category, namespaces, step_seconds).await;
        (category.name.to_string(), result)
    }))
    .await;

    results.into_iter().collect()
}

async fn collect_category(
    backend: &dyn MonitoringBackend,
    window: &TimeWindow,
    category: &CategorySpec,
    namespaces: &[String],
    step_seconds: u64,
) -> CategoryResult {
    let mut metrics = BTreeMap::new();
    for metric in category.metrics {
        let expr = render_expr(metric.expr, namespaces);
        log::debug!("Querying {}/{}", category.name, metric.name);

        match backend.range_query(&expr, window, step_seconds).await {
            Ok(series) => {
                metrics.insert(metric.name.to_string(), series);
            }
            Err(e) => {
                log::warn!(
                    "Category {} unavailable, {} failed: {e}",
                    category.name,
                    metric.name
                );
                return CategoryResult::Unavailable {
                    reason: format!("{}: {e}", metric.name),
                };
            }
        }
    }

    CategoryResult::Available { metrics }
}
