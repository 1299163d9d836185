use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use squall_core::prelude::TimeWindow;
use url::Url;

/// Where the in-cluster Prometheus is usually reachable.
pub const DEFAULT_PROMETHEUS_URL: &str =
    "http://prometheus-server.monitoring.svc.cluster.local:9090";

/// Upper bound on a single range query, connect time included.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before the single retry of a failed query.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on the connectivity pre-check.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// One time series returned by a range query: its label set and its samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub labels: BTreeMap<String, String>,
    /// `(unix_timestamp, value)` pairs, in query step order.
    pub points: Vec<(f64, f64)>,
}

/// Why a single query failed.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The request never produced a response, timeouts included.
    #[error("Query transport failed: {0}")]
    Transport(String),

    /// The backend answered with a non-success HTTP status.
    #[error("Query returned HTTP status {0}")]
    Status(u16),

    /// The backend answered but reported the query itself as failed.
    #[error("Query rejected: {0}")]
    Rejected(String),

    /// The response body could not be understood.
    #[error("Query response not understood: {0}")]
    Decode(String),
}

impl QueryError {
    /// Transport failures and server errors are worth one retry, a rejected or malformed
    /// response is not going to improve.
    fn is_transient(&self) -> bool {
        matches!(self, QueryError::Transport(_) | QueryError::Status(_))
    }
}

/// A source of time series data for the collector.
///
/// The production implementation is [PrometheusBackend]; tests substitute their own.
#[async_trait::async_trait]
pub trait MonitoringBackend: Send + Sync + 'static {
    /// Evaluate `expr` over `window` at `step_seconds` resolution.
    async fn range_query(
        &self,
        expr: &str,
        window: &TimeWindow,
        step_seconds: u64,
    ) -> Result<Vec<MetricSeries>, QueryError>;

    /// Check that the backend is reachable at all. Never fails, just answers no.
    async fn ping(&self) -> bool;
}

/// Client for the Prometheus HTTP API.
pub struct PrometheusBackend {
    base: Url,
    client: reqwest::Client,
}

impl PrometheusBackend {
    pub fn new(base: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .context("Build query client")?;

        Ok(Self { base, client })
    }

    async fn range_query_once(
        &self,
        expr: &str,
        window: &TimeWindow,
        step_seconds: u64,
    ) -> Result<Vec<MetricSeries>, QueryError> {
        let endpoint = self
            .base
            .join("api/v1/query_range")
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let (start, end) = window.unix_bounds();
        let params = [
            ("query", expr.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("step", format!("{step_seconds}s")),
        ];

        let response = self
            .client
            .get(endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status(status.as_u16()));
        }

        let body = response
            .json::<RangeQueryResponse>()
            .await
            .map_err(|e| QueryError::Decode(e.to_string()))?;

        if body.status != "success" {
            return Err(QueryError::Rejected(
                body.error.unwrap_or(body.status),
            ));
        }

        series_from_response(body.data.result)
    }
}

#[async_trait::async_trait]
impl MonitoringBackend for PrometheusBackend {
    async fn range_query(
        &self,
        expr: &str,
        window: &TimeWindow,
        step_seconds: u64,
    ) -> Result<Vec<MetricSeries>, QueryError> {
        match self.range_query_once(expr, window, step_seconds).await {
            Err(e) if e.is_transient() => {
                log::debug!("Retrying query after: {e}");
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.range_query_once(expr, window, step_seconds).await
            }
            other => other,
        }
    }

    async fn ping(&self) -> bool {
        let endpoint = match self.base.join("api/v1/status/config") {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::error!("Monitoring URL cannot be extended to the status endpoint: {e}");
                return false;
            }
        };

        match self
            .client
            .get(endpoint)
            .timeout(PING_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                log::warn!(
                    "Monitoring backend answered the ping with status {}",
                    response.status()
                );
                false
            }
            Err(e) => {
                log::warn!("Monitoring backend unreachable: {e}");
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RangeQueryResponse {
    status: String,
    #[serde(default)]
    data: ResponseData,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseData {
    #[serde(default)]
    result: Vec<ResponseSeries>,
}

#[derive(Debug, Deserialize)]
struct ResponseSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// `[timestamp, "value"]` pairs. Prometheus renders the value as a string so that `NaN`
    /// and `+Inf` survive JSON.
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn series_from_response(result: Vec<ResponseSeries>) -> Result<Vec<MetricSeries>, QueryError> {
    result
        .into_iter()
        .map(|series| {
            let points = series
                .values
                .into_iter()
                .map(|(timestamp, value)| {
                    value
                        .parse::<f64>()
                        .map(|value| (timestamp, value))
                        .map_err(|e| {
                            QueryError::Decode(format!("Sample value {value:?}: {e}"))
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok(MetricSeries {
                labels: series.metric,
                points,
            })
        })
        .collect()
}
