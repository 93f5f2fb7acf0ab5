//! Idempotent provisioning of TLS material as cluster secrets.
//!
//! Secrets are rendered client-side (`--dry-run=client -o yaml`) and piped
//! through `apply`, so re-running a deployment updates material in place
//! instead of failing on an existing secret.

use crate::fabric::{exec::Kubectl, Error};
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

/// Creates or updates secrets holding TLS material
#[async_trait]
pub trait SecretProvisioner: Send + Sync {
    /// Creates or updates a TLS secret from certificate and key files
    async fn ensure_tls(
        &self,
        namespace: &str,
        name: &str,
        cert: &Path,
        key: &Path,
    ) -> Result<(), Error>;

    /// Creates or updates an opaque secret from named files
    async fn ensure_files(
        &self,
        namespace: &str,
        name: &str,
        files: &[(&str, &Path)],
    ) -> Result<(), Error>;
}

impl Kubectl {
    /// Applies a rendered manifest
    async fn apply(&self, namespace: &str, manifest: &[u8]) -> Result<(), Error> {
        let output = self
            .run_with_stdin(&["apply", "-n", namespace, "-f", "-"], manifest)
            .await?;
        if !output.status.success() {
            return Err(Error::Transport(format!(
                "apply failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Renders a secret client-side and applies it
    async fn ensure_secret(&self, namespace: &str, args: &[&str], name: &str) -> Result<(), Error> {
        let mut render = vec!["create", "secret"];
        render.extend_from_slice(args);
        render.extend_from_slice(&["-n", namespace, "--dry-run=client", "-o", "yaml"]);
        let rendered = self.run(&render).await?;
        if !rendered.status.success() {
            return Err(Error::Transport(format!(
                "secret render failed: {}",
                String::from_utf8_lossy(&rendered.stderr).trim()
            )));
        }
        self.apply(namespace, &rendered.stdout).await?;
        info!(secret = name, "provisioned secret");
        Ok(())
    }
}

#[async_trait]
impl SecretProvisioner for Kubectl {
    async fn ensure_tls(
        &self,
        namespace: &str,
        name: &str,
        cert: &Path,
        key: &Path,
    ) -> Result<(), Error> {
        let cert = format!("--cert={}", cert.display());
        let key = format!("--key={}", key.display());
        self.ensure_secret(namespace, &["tls", name, cert.as_str(), key.as_str()], name)
            .await
    }

    async fn ensure_files(
        &self,
        namespace: &str,
        name: &str,
        files: &[(&str, &Path)],
    ) -> Result<(), Error> {
        let from_files: Vec<String> = files
            .iter()
            .map(|(key, path)| format!("--from-file={}={}", key, path.display()))
            .collect();
        let mut args = vec!["generic", name];
        args.extend(from_files.iter().map(|f| f.as_str()));
        self.ensure_secret(namespace, &args, name).await
    }
}
