use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use squall_core::prelude::UnitBailError;
use squall_run_model::ScenarioKind;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::kubectl::kubectl_path;
use crate::workload::{
    crash_profile, network_impairment, stress_level, UnitHandle, UnitSpec, WorkloadBackend,
    WorkloadError,
};

struct PodUnit {
    pod_name: String,
    level: u32,
    generation: u32,
    duration: Duration,
}

/// A workload backend that exerts load through pods managed with kubectl.
///
/// Each unit is one pod rendered from the scenario's manifest. Intensity is quantized onto the
/// four discrete stress levels; a unit's pod is only replaced when its level changes, so the
/// gradual pattern causes a handful of replacements per run rather than one per sample.
pub struct PodWorkload {
    kubectl: PathBuf,
    units: Mutex<HashMap<String, PodUnit>>,
}

impl PodWorkload {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            kubectl: kubectl_path()?,
            units: Mutex::new(HashMap::new()),
        })
    }

    async fn kubectl_apply(&self, manifest: &serde_json::Value) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(manifest)?;

        let mut child = Command::new(&self.kubectl)
            .args(["apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(yaml.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            anyhow::bail!(
                "kubectl apply failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn kubectl_delete_pod(&self, namespace: &str, pod_name: &str) -> anyhow::Result<()> {
        let output = Command::new(&self.kubectl)
            .args([
                "delete",
                "pod",
                pod_name,
                "-n",
                namespace,
                "--ignore-not-found",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "kubectl delete failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// The pod's phase, or None if the pod does not exist.
    async fn pod_phase(&self, namespace: &str, pod_name: &str) -> anyhow::Result<Option<String>> {
        let output = Command::new(&self.kubectl)
            .args([
                "get",
                "pod",
                pod_name,
                "-n",
                namespace,
                "-o",
                "jsonpath={.status.phase}",
            ])
            .output()
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }

    fn render_manifest(
        &self,
        spec_scenario: ScenarioKind,
        pod_name: &str,
        namespace: &str,
        level: u32,
        duration: Duration,
    ) -> serde_json::Value {
        // A representative intensity for the level, used by the scenarios whose parameters are
        // continuous.
        let intensity = (level.saturating_sub(1)) as f64 / 3.0;
        match spec_scenario {
            ScenarioKind::Resource => {
                stress_pod_manifest(pod_name, namespace, level, duration.as_secs())
            }
            ScenarioKind::Network => {
                network_pod_manifest(pod_name, namespace, intensity, duration.as_secs())
            }
            ScenarioKind::PodFailure => crash_pod_manifest(pod_name, namespace, intensity),
            ScenarioKind::Baseline => json!(null),
        }
    }
}

#[async_trait]
impl WorkloadBackend for PodWorkload {
    async fn prepare(&self, namespace: &str) -> Result<(), WorkloadError> {
        let found = Command::new(&self.kubectl)
            .args(["get", "namespace", namespace])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);
        if found {
            return Ok(());
        }

        log::info!("Namespace {namespace} not found, creating it");
        let output = Command::new(&self.kubectl)
            .args(["create", "namespace", namespace])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| WorkloadError::NotReady {
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(WorkloadError::NotReady {
                reason: format!(
                    "could not create namespace {namespace}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, WorkloadError> {
        let unit_id = unit_name(spec);
        let pod_name = format!("{unit_id}-0");
        let level = stress_level(spec.initial_intensity);

        let manifest =
            self.render_manifest(spec.scenario, &pod_name, &spec.namespace, level, spec.duration);
        self.kubectl_apply(&manifest)
            .await
            .map_err(|e| WorkloadError::Launch {
                unit_index: spec.unit_index,
                reason: e.to_string(),
            })?;

        log::info!(
            "Created {} pod {pod_name} in namespace {} at level {level}",
            spec.scenario,
            spec.namespace
        );
        self.units.lock().insert(
            unit_id.clone(),
            PodUnit {
                pod_name,
                level,
                generation: 0,
                duration: spec.duration,
            },
        );

        Ok(UnitHandle {
            unit_id,
            unit_index: spec.unit_index,
            namespace: spec.namespace.clone(),
            scenario: spec.scenario,
        })
    }

    async fn apply(&self, handle: &UnitHandle, intensity: f64) -> Result<(), WorkloadError> {
        let level = stress_level(intensity);
        let (pod_name, current_level, generation, duration) = {
            let units = self.units.lock();
            let unit = units
                .get(&handle.unit_id)
                .ok_or_else(|| WorkloadError::Apply {
                    unit_id: handle.unit_id.clone(),
                    reason: "unit is not live".to_string(),
                })?;
            (
                unit.pod_name.clone(),
                unit.level,
                unit.generation,
                unit.duration,
            )
        };

        if level == current_level {
            // Nothing to change, but notice units whose pod has finished or vanished so the
            // driver stops hammering a dead pod.
            match self.pod_phase(&handle.namespace, &pod_name).await {
                Ok(Some(phase)) if phase == "Succeeded" || phase == "Failed" => {
                    return Err(WorkloadError::Bail(UnitBailError::default()));
                }
                Ok(None) => return Err(WorkloadError::Bail(UnitBailError::default())),
                _ => return Ok(()),
            }
        }

        let next_name = format!("{}-{}", handle.unit_id, generation + 1);
        let manifest =
            self.render_manifest(handle.scenario, &next_name, &handle.namespace, level, duration);
        self.kubectl_apply(&manifest)
            .await
            .map_err(|e| WorkloadError::Apply {
                unit_id: handle.unit_id.clone(),
                reason: e.to_string(),
            })?;
        if let Err(e) = self.kubectl_delete_pod(&handle.namespace, &pod_name).await {
            log::warn!("Failed to remove replaced pod {pod_name}: {e}");
        }

        log::debug!(
            "Replaced pod {pod_name} with {next_name} at level {level} (was {current_level})"
        );
        if let Some(unit) = self.units.lock().get_mut(&handle.unit_id) {
            unit.pod_name = next_name;
            unit.level = level;
            unit.generation = generation + 1;
        }
        Ok(())
    }

    async fn delete(&self, handle: &UnitHandle) -> Result<(), WorkloadError> {
        let unit = self.units.lock().remove(&handle.unit_id);
        let unit = unit.ok_or_else(|| WorkloadError::Teardown {
            unit_id: handle.unit_id.clone(),
            reason: "unit is not live".to_string(),
        })?;

        self.kubectl_delete_pod(&handle.namespace, &unit.pod_name)
            .await
            .map_err(|e| WorkloadError::Teardown {
                unit_id: handle.unit_id.clone(),
                reason: e.to_string(),
            })?;
        log::info!("Deleted pod {} in namespace {}", unit.pod_name, handle.namespace);
        Ok(())
    }
}

fn unit_name(spec: &UnitSpec) -> String {
    let prefix = match spec.scenario {
        ScenarioKind::Resource => "stress-test",
        ScenarioKind::Network => "network-chaos",
        ScenarioKind::PodFailure => "unstable-pod",
        ScenarioKind::Baseline => "baseline",
    };
    format!(
        "{prefix}-{}-{}",
        sanitize_name(&spec.run_id),
        spec.unit_index
    )
}

/// Restrict a string to the DNS-1123 label characters pod names allow.
fn sanitize_name(raw: &str) -> String {
    raw.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

fn stress_pod_manifest(
    pod_name: &str,
    namespace: &str,
    level: u32,
    timeout_s: u64,
) -> serde_json::Value {
    // Keep vm-bytes lower than the limit to avoid OOM kills.
    let vm_bytes = (level * 64).max(64);
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "namespace": namespace,
            "labels": {
                "app": "stress-test",
                "scenario": "resource-exhaustion",
                "metric-collection": "enabled"
            },
            "annotations": {
                "prometheus.io/scrape": "true",
                "prometheus.io/port": "8080"
            }
        },
        "spec": {
            "containers": [{
                "name": "stress",
                "image": "polinux/stress",
                "command": ["stress"],
                "args": [
                    "--cpu", level.to_string(),
                    "--vm", level.to_string(),
                    "--vm-bytes", format!("{vm_bytes}M"),
                    "--timeout", timeout_s.to_string()
                ],
                "resources": {
                    "requests": {
                        "cpu": format!("{}m", (level * 100).max(100)),
                        "memory": format!("{}Mi", (level * 128).max(128))
                    },
                    "limits": {
                        "cpu": format!("{}m", (level * 200).max(200)),
                        "memory": format!("{}Mi", (level * 256).max(256))
                    }
                }
            }],
            "restartPolicy": "Never"
        }
    })
}

fn network_pod_manifest(
    pod_name: &str,
    namespace: &str,
    intensity: f64,
    duration_s: u64,
) -> serde_json::Value {
    let impairment = network_impairment(intensity);
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "namespace": namespace,
            "labels": {
                "app": "network-chaos",
                "scenario": "network-issues",
                "metric-collection": "enabled"
            },
            "annotations": {
                "prometheus.io/scrape": "true",
                "prometheus.io/port": "8080"
            }
        },
        "spec": {
            "containers": [{
                "name": "network-chaos",
                "image": "nicolaka/netshoot",
                "command": ["sh", "-c"],
                "args": [format!(
                    "tc qdisc add dev eth0 root netem delay {}ms loss {:.1}% && sleep {duration_s} && tc qdisc del dev eth0 root",
                    impairment.latency_ms, impairment.loss_percent
                )],
                "securityContext": {
                    "capabilities": {
                        "add": ["NET_ADMIN"]
                    }
                },
                "resources": {
                    "requests": {
                        "cpu": "100m",
                        "memory": "128Mi"
                    },
                    "limits": {
                        "cpu": "200m",
                        "memory": "256Mi"
                    }
                }
            }],
            "restartPolicy": "Never"
        }
    })
}

fn crash_pod_manifest(pod_name: &str, namespace: &str, intensity: f64) -> serde_json::Value {
    let profile = crash_profile(intensity);
    let script = format!(
        "while true; do if awk -v p={:.2} 'BEGIN {{ srand(); exit (rand() < p) ? 0 : 1 }}'; then echo 'Simulating crash'; exit 1; fi; echo 'Running normally'; sleep {}; done",
        profile.crash_probability, profile.crash_interval_s
    );
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "namespace": namespace,
            "labels": {
                "app": "unstable-pod",
                "scenario": "pod-failures",
                "metric-collection": "enabled"
            },
            "annotations": {
                "prometheus.io/scrape": "true",
                "prometheus.io/port": "8080"
            }
        },
        "spec": {
            "containers": [{
                "name": "unstable",
                "image": "alpine",
                "command": ["sh", "-c"],
                "args": [script],
                "resources": {
                    "requests": {
                        "cpu": "50m",
                        "memory": "64Mi"
                    },
                    "limits": {
                        "cpu": "100m",
                        "memory": "128Mi"
                    }
                }
            }],
            "restartPolicy": "OnFailure"
        }
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn stress_manifest_scales_with_level() {
        let manifest = stress_pod_manifest("stress-test-abc-0", "squall", 4, 300);

        assert_eq!(manifest["metadata"]["name"], "stress-test-abc-0");
        assert_eq!(manifest["metadata"]["namespace"], "squall");
        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["image"], "polinux/stress");
        let args: Vec<&str> = container["args"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            args,
            vec!["--cpu", "4", "--vm", "4", "--vm-bytes", "256M", "--timeout", "300"]
        );
        assert_eq!(container["resources"]["limits"]["memory"], "1024Mi");
    }

    #[test]
    fn network_manifest_embeds_the_netem_command() {
        let manifest = network_pod_manifest("network-chaos-abc-1", "default", 1.0, 120);

        let args = manifest["spec"]["containers"][0]["args"][0]
            .as_str()
            .unwrap();
        assert!(args.contains("delay 500ms"));
        assert!(args.contains("loss 15.0%"));
        assert!(args.contains("sleep 120"));
        assert_eq!(
            manifest["spec"]["containers"][0]["securityContext"]["capabilities"]["add"][0],
            "NET_ADMIN"
        );
    }

    #[test]
    fn crash_manifest_restarts_on_failure() {
        let manifest = crash_pod_manifest("unstable-pod-abc-2", "default", 0.0);

        assert_eq!(manifest["spec"]["restartPolicy"], "OnFailure");
        let script = manifest["spec"]["containers"][0]["args"][0]
            .as_str()
            .unwrap();
        assert!(script.contains("p=0.10"));
        assert!(script.contains("sleep 120"));
    }

    #[test]
    fn manifests_serialize_to_yaml() {
        let manifest = stress_pod_manifest("stress-test-abc-0", "default", 1, 60);
        let yaml = serde_yaml::to_string(&manifest).unwrap();
        assert!(yaml.contains("kind: Pod"));
        assert!(yaml.contains("image: polinux/stress"));
    }

    #[test]
    fn names_are_dns_safe() {
        assert_eq!(sanitize_name("V1_aB-9x"), "v1-ab-9x");
        assert_eq!(sanitize_name("--padded--"), "padded");
    }
}
