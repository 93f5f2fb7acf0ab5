//! Chart installation via the `helm` binary

use crate::fabric::Error;
use async_trait::async_trait;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

/// Installs or upgrades packaged deployment units
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Installs the release, or upgrades it in place if it already exists
    async fn upgrade(
        &self,
        release: &str,
        chart: &str,
        namespace: &str,
        values: &Value,
    ) -> Result<(), Error>;
}

/// Shared chart-install client backed by the `helm` binary.
///
/// Constructed once at process start and passed into every component.
#[derive(Clone)]
pub struct Helm {
    charts: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl Helm {
    pub fn new(charts: PathBuf, kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            charts,
            kubeconfig,
            context,
        }
    }
}

#[async_trait]
impl ChartInstaller for Helm {
    async fn upgrade(
        &self,
        release: &str,
        chart: &str,
        namespace: &str,
        values: &Value,
    ) -> Result<(), Error> {
        // Render the value map to a file helm can consume.
        let mut values_file = tempfile::NamedTempFile::new()?;
        serde_yaml::to_writer(&mut values_file, values)?;
        values_file.flush()?;

        let chart_path = self.charts.join(chart);
        let mut command = Command::new("helm");
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.context {
            command.arg("--kube-context").arg(context);
        }
        let output = command
            .arg("upgrade")
            .arg("--install")
            .arg(release)
            .arg(&chart_path)
            .arg("-n")
            .arg(namespace)
            .arg("-f")
            .arg(values_file.path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Transport(format!("failed to run helm: {e}")))?;
        if !output.status.success() {
            return Err(Error::ChartInstall {
                release: release.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        info!(release, chart, "installed chart");
        Ok(())
    }
}

/// Merges `overlay` into `base`: present keys override, missing keys pass
/// through untouched, nested maps merge recursively.
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay.clone();
            }
        }
    }
}
