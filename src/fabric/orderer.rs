//! `deploy orderer` subcommand

use crate::fabric::{
    helm::{merge_values, ChartInstaller},
    orderer_selector,
    secrets::SecretProvisioner,
    watch::{require_ready, WaitSpec, Watcher},
    Config, Error,
};
use serde_json::json;
use tracing::info;

/// Secret holding the ordering service's TLS certificate and key
const TLS_SECRET: &str = "orderer-tls";

/// Secret holding the ordering service's TLS root certificate
const CA_SECRET: &str = "orderer-ca";

/// Installs the ordering service and waits for it to come up
pub async fn deploy(
    secrets: &impl SecretProvisioner,
    helm: &impl ChartInstaller,
    watcher: &impl Watcher,
    config: &Config,
) -> Result<(), Error> {
    // Provision TLS material from the crypto-material tree
    let tls = config.orderer_tls_dir();
    secrets
        .ensure_tls(
            &config.namespace,
            TLS_SECRET,
            &tls.join("server.crt"),
            &tls.join("server.key"),
        )
        .await?;
    let ca = tls.join("ca.crt");
    secrets
        .ensure_files(&config.namespace, CA_SECRET, &[("ca.crt", ca.as_path())])
        .await?;

    // Install the orderer chart
    let mut values = json!({"domain": config.domain.as_str()});
    merge_values(&mut values, &config.values.orderer);
    helm.upgrade("orderer", "orderer", &config.namespace, &values)
        .await?;

    // Wait for the orderer pod to report ready
    require_ready(
        watcher,
        WaitSpec::new(
            &config.namespace,
            &orderer_selector(&config.domain),
            config.ready_timeout(),
            config.warn_interval(),
        ),
        "orderer pod",
    )
    .await?;
    info!(domain = config.orderer.domain.as_str(), "ordering service deployed");
    Ok(())
}
