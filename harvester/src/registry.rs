use std::fmt;

use serde::{Deserialize, Serialize};
use sha3::Digest;

/// Version of the metric category table.
///
/// Bump this whenever a category, metric, query body or declared aggregate changes so that
/// artifacts produced under different tables can be told apart.
pub const SCHEMA_VERSION: &str = "1";

/// How a metric's time series is reduced to a single feature value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    /// Average over every sample of every series. The default for rates and ratios.
    Mean,
    /// The highest sample seen. Used where the peak matters more than the average, such as
    /// memory and queue saturation.
    Max,
    /// The mean of the values at the latest timestamp. Used for counters that only make sense
    /// as a final state, such as restart counts.
    Last,
}

impl Aggregate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregate::Mean => "mean",
            Aggregate::Max => "max",
            Aggregate::Last => "last",
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One metric of a category: a name, the query that retrieves it and the declared reduction.
///
/// The query body may contain a `{ns}` token in label-matcher position which is replaced with a
/// namespace filter by [render_expr].
#[derive(Debug, Clone, Copy)]
pub struct MetricQuery {
    pub name: &'static str,
    pub expr: &'static str,
    pub aggregate: Aggregate,
}

/// A named group of metrics that are queried together.
#[derive(Debug, Clone, Copy)]
pub struct CategorySpec {
    pub name: &'static str,
    pub metrics: &'static [MetricQuery],
}

/// The full category table, in the fixed order that defines the global feature schema.
///
/// Adding a category or metric means adding an entry here; nothing else branches on category
/// identity.
pub const CATEGORIES: &[CategorySpec] = &[
    CategorySpec {
        name: "container_runtime",
        metrics: &[
            MetricQuery {
                name: "container_runtime_cpu_usage",
                expr: "sum by (namespace, pod, container) (rate(container_cpu_usage_seconds_total{{ns}}[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "container_runtime_memory_usage",
                expr: "sum by (namespace, pod, container) (container_memory_working_set_bytes{{ns}})",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "container_runtime_memory_failures",
                expr: "sum by (namespace, pod, container, scope, type) (rate(container_memory_failures_total{{ns}}[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "container_runtime_processes",
                expr: "sum by (namespace, pod, container) (container_processes{{ns}})",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "container_runtime_threads",
                expr: "sum by (namespace, pod, container) (container_threads{{ns}})",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "container_runtime_io_reads",
                expr: "sum by (namespace, pod, container) (rate(container_fs_reads_bytes_total{{ns}}[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "container_runtime_io_writes",
                expr: "sum by (namespace, pod, container) (rate(container_fs_writes_bytes_total{{ns}}[5m]))",
                aggregate: Aggregate::Mean,
            },
        ],
    },
    CategorySpec {
        name: "service",
        metrics: &[
            MetricQuery {
                name: "service_request_duration",
                expr: "histogram_quantile(0.95, sum(rate(istio_request_duration_milliseconds_bucket{{ns}}[5m])) by (destination_service, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "service_success_rate",
                expr: r#"sum(rate(istio_requests_total{{ns}, response_code=~"2.."}[5m])) by (destination_service) / sum(rate(istio_requests_total{{ns}}[5m])) by (destination_service)"#,
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "endpoint_response_time",
                expr: "histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{{ns}}[5m])) by (service, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "endpoint_availability",
                expr: "sum by (namespace, service, endpoint) (up{{ns}})",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "service_error_rate",
                expr: r#"sum(rate(http_requests_total{{ns}, code=~"5.."}[5m])) by (service) / sum(rate(http_requests_total{{ns}}[5m])) by (service)"#,
                aggregate: Aggregate::Mean,
            },
        ],
    },
    CategorySpec {
        name: "apiserver",
        metrics: &[
            MetricQuery {
                name: "apiserver_request_latency",
                expr: "histogram_quantile(0.95, sum(rate(apiserver_request_duration_seconds_bucket[5m])) by (verb, resource, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "apiserver_request_rate",
                expr: "sum(rate(apiserver_request_total[5m])) by (verb, resource, code)",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "apiserver_error_rate",
                expr: r#"sum(rate(apiserver_request_total{code=~"5.."}[5m])) / sum(rate(apiserver_request_total[5m]))"#,
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "apiserver_request_terminations",
                expr: "sum(rate(apiserver_request_terminations_total[5m])) by (component, verb)",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "apiserver_client_cert_expiry",
                expr: "apiserver_client_certificate_expiration_seconds_count",
                aggregate: Aggregate::Last,
            },
            MetricQuery {
                name: "webhook_latency",
                expr: "histogram_quantile(0.95, sum(rate(apiserver_admission_webhook_admission_duration_seconds_bucket[5m])) by (name, le))",
                aggregate: Aggregate::Max,
            },
        ],
    },
    CategorySpec {
        name: "etcd",
        metrics: &[
            MetricQuery {
                name: "etcd_has_leader",
                expr: "etcd_server_has_leader",
                aggregate: Aggregate::Last,
            },
            MetricQuery {
                name: "etcd_leader_changes",
                expr: "sum(rate(etcd_server_leader_changes_seen_total[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "etcd_proposal_failures",
                expr: "sum(rate(etcd_server_proposals_failed_total[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "etcd_request_latency",
                expr: "histogram_quantile(0.95, sum(rate(etcd_request_duration_seconds_bucket[5m])) by (operation, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "etcd_disk_latency",
                expr: "histogram_quantile(0.95, sum(rate(etcd_disk_backend_commit_duration_seconds_bucket[5m])) by (le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "etcd_compaction_duration",
                expr: "histogram_quantile(0.95, sum(rate(etcd_debugging_mvcc_db_compaction_duration_seconds_bucket[5m])) by (le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "etcd_network_latency",
                expr: "histogram_quantile(0.95, sum(rate(etcd_network_peer_round_trip_time_seconds_bucket[5m])) by (To, le))",
                aggregate: Aggregate::Max,
            },
        ],
    },
    CategorySpec {
        name: "loadbalancer",
        metrics: &[
            MetricQuery {
                name: "lb_request_rate",
                expr: "sum(rate(nginx_ingress_controller_requests[5m])) by (ingress, service)",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "lb_response_time",
                expr: "histogram_quantile(0.95, sum(rate(nginx_ingress_controller_request_duration_seconds_bucket[5m])) by (ingress, service, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "lb_error_rate",
                expr: r#"sum(rate(nginx_ingress_controller_requests{status=~"5.."}[5m])) by (ingress, service) / sum(rate(nginx_ingress_controller_requests[5m])) by (ingress, service)"#,
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "lb_connections",
                expr: "sum(nginx_ingress_controller_nginx_process_connections) by (state)",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "lb_ssl_handshake_failures",
                expr: "sum(rate(nginx_ingress_controller_ssl_expire_time_seconds[5m]))",
                aggregate: Aggregate::Mean,
            },
        ],
    },
    CategorySpec {
        name: "ingress",
        metrics: &[
            MetricQuery {
                name: "ingress_success_rate",
                expr: r#"sum(rate(nginx_ingress_controller_requests{status=~"2.."}[5m])) / sum(rate(nginx_ingress_controller_requests[5m]))"#,
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "ingress_latency",
                expr: "histogram_quantile(0.95, sum(rate(nginx_ingress_controller_request_duration_seconds_bucket[5m])) by (ingress, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "ingress_request_rate",
                expr: "sum(rate(nginx_ingress_controller_requests[5m])) by (ingress, path)",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "ingress_upstream_latency",
                expr: "histogram_quantile(0.95, sum(rate(nginx_ingress_controller_response_duration_seconds_bucket[5m])) by (ingress, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "ingress_socket_errors",
                expr: "sum(rate(nginx_ingress_controller_request_size_bucket[5m])) by (ingress)",
                aggregate: Aggregate::Mean,
            },
        ],
    },
    CategorySpec {
        name: "crd",
        metrics: &[
            MetricQuery {
                name: "crd_instance_count",
                expr: "sum(kube_customresource_total) by (namespace, group, version, resource)",
                aggregate: Aggregate::Last,
            },
            MetricQuery {
                name: "crd_controller_reconcile_time",
                expr: "histogram_quantile(0.95, sum(rate(controller_runtime_reconcile_time_seconds_bucket[5m])) by (controller, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "crd_controller_queue_depth",
                expr: "sum(workqueue_depth) by (name)",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "crd_controller_work_duration",
                expr: "histogram_quantile(0.95, sum(rate(workqueue_work_duration_seconds_bucket[5m])) by (name, le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "crd_controller_retries",
                expr: "sum(rate(workqueue_retries_total[5m])) by (name)",
                aggregate: Aggregate::Mean,
            },
        ],
    },
    CategorySpec {
        name: "scheduling",
        metrics: &[
            MetricQuery {
                name: "scheduling_attempts",
                expr: "sum(rate(scheduler_schedule_attempts_total[5m])) by (result)",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "scheduling_latency",
                expr: "histogram_quantile(0.95, sum(rate(scheduler_scheduling_algorithm_duration_seconds_bucket[5m])) by (le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "scheduling_e2e_latency",
                expr: "histogram_quantile(0.95, sum(rate(scheduler_e2e_scheduling_duration_seconds_bucket[5m])) by (le))",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "pending_pods",
                expr: r#"sum(kube_pod_status_phase{phase="Pending"}) by (namespace)"#,
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "pod_preemptions",
                expr: "rate(scheduler_pod_preemption_victims[5m])",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "scheduling_errors",
                expr: r#"sum(rate(scheduler_schedule_attempts_total{result="error"}[5m]))"#,
                aggregate: Aggregate::Mean,
            },
        ],
    },
    CategorySpec {
        name: "resource_quota",
        metrics: &[
            MetricQuery {
                name: "quota_cpu_usage",
                expr: r#"sum(kube_resourcequota{{ns}, resource="requests.cpu", type="used"}) by (namespace, resource, quota_name) / sum(kube_resourcequota{{ns}, resource="requests.cpu", type="hard"}) by (namespace, resource, quota_name)"#,
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "quota_memory_usage",
                expr: r#"sum(kube_resourcequota{{ns}, resource="requests.memory", type="used"}) by (namespace, resource, quota_name) / sum(kube_resourcequota{{ns}, resource="requests.memory", type="hard"}) by (namespace, resource, quota_name)"#,
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "quota_pods_usage",
                expr: r#"sum(kube_resourcequota{{ns}, resource="pods", type="used"}) by (namespace, resource, quota_name) / sum(kube_resourcequota{{ns}, resource="pods", type="hard"}) by (namespace, resource, quota_name)"#,
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "quota_cpu_hard",
                expr: r#"sum(kube_resourcequota{{ns}, resource="requests.cpu", type="hard"}) by (namespace, quota_name)"#,
                aggregate: Aggregate::Last,
            },
            MetricQuery {
                name: "quota_memory_hard",
                expr: r#"sum(kube_resourcequota{{ns}, resource="requests.memory", type="hard"}) by (namespace, quota_name)"#,
                aggregate: Aggregate::Last,
            },
            MetricQuery {
                name: "quota_cpu_used",
                expr: r#"sum(kube_resourcequota{{ns}, resource="requests.cpu", type="used"}) by (namespace, quota_name)"#,
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "quota_memory_used",
                expr: r#"sum(kube_resourcequota{{ns}, resource="requests.memory", type="used"}) by (namespace, quota_name)"#,
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "limit_range_defaults",
                expr: "sum(kube_limitrange{{ns}}) by (namespace, resource, type, constraint)",
                aggregate: Aggregate::Last,
            },
        ],
    },
    CategorySpec {
        name: "node",
        metrics: &[
            MetricQuery {
                name: "node_cpu_usage",
                expr: r#"sum by (node) (rate(node_cpu_seconds_total{mode!="idle"}[5m]))"#,
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "node_memory_usage",
                expr: "sum by (node) (node_memory_MemTotal_bytes - node_memory_MemAvailable_bytes)",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "node_memory_total",
                expr: "sum by (node) (node_memory_MemTotal_bytes)",
                aggregate: Aggregate::Last,
            },
            MetricQuery {
                name: "node_disk_usage",
                expr: "sum by (node) (node_filesystem_size_bytes - node_filesystem_free_bytes)",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "node_disk_total",
                expr: "sum by (node) (node_filesystem_size_bytes)",
                aggregate: Aggregate::Last,
            },
            MetricQuery {
                name: "node_network_receive_bytes",
                expr: "sum by (node) (rate(node_network_receive_bytes_total[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "node_network_transmit_bytes",
                expr: "sum by (node) (rate(node_network_transmit_bytes_total[5m]))",
                aggregate: Aggregate::Mean,
            },
        ],
    },
    CategorySpec {
        name: "pod",
        metrics: &[
            MetricQuery {
                name: "pod_cpu_usage",
                expr: "sum by (pod, namespace) (rate(container_cpu_usage_seconds_total{{ns}}[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "pod_memory_usage",
                expr: "sum by (pod, namespace) (container_memory_usage_bytes{{ns}})",
                aggregate: Aggregate::Max,
            },
            MetricQuery {
                name: "pod_network_receive",
                expr: "sum by (pod, namespace) (rate(container_network_receive_bytes_total{{ns}}[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "pod_network_transmit",
                expr: "sum by (pod, namespace) (rate(container_network_transmit_bytes_total{{ns}}[5m]))",
                aggregate: Aggregate::Mean,
            },
            MetricQuery {
                name: "pod_restarts",
                expr: "sum by (pod, namespace) (kube_pod_container_status_restarts_total{{ns}})",
                aggregate: Aggregate::Last,
            },
        ],
    },
];

/// Look up a category by name.
pub fn category(name: &str) -> Option<&'static CategorySpec> {
    CATEGORIES.iter().find(|category| category.name == name)
}

/// Category names in schema order.
pub fn category_names() -> Vec<&'static str> {
    CATEGORIES.iter().map(|category| category.name).collect()
}

/// Substitute the `{ns}` token with a namespace filter.
///
/// With no namespaces the token is removed, leaving the matcher as it would be written by hand:
/// `metric{}` or `metric{other="x"}`.
pub fn render_expr(expr: &str, namespaces: &[String]) -> String {
    if namespaces.is_empty() {
        return expr.replace("{ns}, ", "").replace("{ns}", "");
    }
    let filter = format!(r#"namespace=~"{}""#, namespaces.join("|"));
    expr.replace("{ns}", &filter)
}

/// Compute a fingerprint for the category table
///
/// The fingerprint covers the version, every category and metric name, every query body and
/// every declared aggregate, in table order. Two artifacts with the same fingerprint were
/// produced by byte-identical tables. Computed with [sha3::Sha3_256], like run fingerprints.
pub fn schema_fingerprint() -> String {
    let mut hasher = sha3::Sha3_256::new();
    Digest::update(&mut hasher, SCHEMA_VERSION.as_bytes());
    for category in CATEGORIES {
        Digest::update(&mut hasher, category.name.as_bytes());
        for metric in category.metrics {
            Digest::update(&mut hasher, metric.name.as_bytes());
            Digest::update(&mut hasher, metric.expr.as_bytes());
            Digest::update(&mut hasher, metric.aggregate.as_str().as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn category_order_is_fixed() {
        assert_eq!(
            category_names(),
            vec![
                "container_runtime",
                "service",
                "apiserver",
                "etcd",
                "loadbalancer",
                "ingress",
                "crd",
                "scheduling",
                "resource_quota",
                "node",
                "pod",
            ]
        );
    }

    #[test]
    fn metric_names_are_globally_unique() {
        let mut seen = HashSet::new();
        for category in CATEGORIES {
            for metric in category.metrics {
                assert!(
                    seen.insert(metric.name),
                    "duplicate metric name: {}",
                    metric.name
                );
            }
        }
    }

    #[test]
    fn lookup_finds_known_categories_only() {
        assert!(category("etcd").is_some());
        assert!(category("node").is_some());
        assert!(category("not_a_category").is_none());
    }

    #[test]
    fn render_substitutes_the_namespace_filter() {
        let rendered = render_expr(
            "sum by (pod) (container_processes{{ns}})",
            &["default".to_string(), "kube-system".to_string()],
        );
        assert_eq!(
            rendered,
            r#"sum by (pod) (container_processes{namespace=~"default|kube-system"})"#
        );
    }

    #[test]
    fn render_with_extra_matchers_keeps_them() {
        let rendered = render_expr(
            r#"sum(kube_resourcequota{{ns}, type="used"})"#,
            &["default".to_string()],
        );
        assert_eq!(
            rendered,
            r#"sum(kube_resourcequota{namespace=~"default", type="used"})"#
        );
    }

    #[test]
    fn render_without_namespaces_drops_the_filter() {
        assert_eq!(
            render_expr("sum(container_processes{{ns}})", &[]),
            "sum(container_processes{})"
        );
        assert_eq!(
            render_expr(r#"sum(kube_resourcequota{{ns}, type="used"})"#, &[]),
            r#"sum(kube_resourcequota{type="used"})"#
        );
    }

    #[test]
    fn every_expr_renders_without_leftover_tokens() {
        let namespaces = vec!["default".to_string()];
        for category in CATEGORIES {
            for metric in category.metrics {
                let rendered = render_expr(metric.expr, &namespaces);
                assert!(
                    !rendered.contains("{ns}"),
                    "unrendered token in {}",
                    metric.name
                );
            }
        }
    }

    #[test]
    fn fingerprint_is_stable() {
        let first = schema_fingerprint();
        assert_eq!(first.len(), 64);
        assert_eq!(first, schema_fingerprint());
    }
}
