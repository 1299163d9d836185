use std::env;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;

/// Environment variable to override the path to the kubectl binary used to manage workload pods.
pub const SQ_KUBECTL_PATH_ENV: &str = "SQ_KUBECTL_PATH";

/// Get the path to the kubectl binary.
///
/// If the [`SQ_KUBECTL_PATH_ENV`] environment variable is set, its value is used as the path to
/// the kubectl binary. If it is not set, the default value "kubectl" is used, which assumes that
/// the binary is available in the system's PATH.
pub fn kubectl_path() -> anyhow::Result<PathBuf> {
    match env::var(SQ_KUBECTL_PATH_ENV).ok().as_deref() {
        Some("") => {
            bail!("'{SQ_KUBECTL_PATH_ENV}' set to empty string");
        }
        Some("kubectl") | None => {
            which::which("kubectl").with_context(|| {
                format!(
                    "kubectl binary not found in PATH. Please install kubectl or set '{SQ_KUBECTL_PATH_ENV}' to the correct path."
                )
            })
        }
        Some(path) => {
            let kubectl_path = PathBuf::from(path);
            if !kubectl_path.exists() {
                bail!(
                    "Path to kubectl binary overwritten with '{SQ_KUBECTL_PATH_ENV}={path}' but that path doesn't exist",
                    path = kubectl_path.display()
                );
            }
            Ok(kubectl_path)
        }
    }
}
