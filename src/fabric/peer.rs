//! `deploy peer` subcommand

use crate::fabric::{
    cli_selector,
    helm::{merge_values, ChartInstaller},
    peer_release, peer_selector,
    secrets::SecretProvisioner,
    watch::{require_ready, WaitSpec, Watcher},
    Config, Error,
};
use serde_json::json;
use tracing::info;

/// Installs one peer (and its colocated shell pod) for an organization
pub async fn deploy(
    secrets: &impl SecretProvisioner,
    helm: &impl ChartInstaller,
    watcher: &impl Watcher,
    config: &Config,
    org_name: &str,
    peer: &str,
) -> Result<(), Error> {
    let org = config.org(org_name)?;
    let org_domain = config.org_domain(org);
    let release = peer_release(org_name, peer);

    // Provision TLS material from the crypto-material tree
    let tls = config.peer_tls_dir(org, peer);
    secrets
        .ensure_tls(
            &config.namespace,
            &format!("{release}-tls"),
            &tls.join("server.crt"),
            &tls.join("server.key"),
        )
        .await?;
    let ca = tls.join("ca.crt");
    secrets
        .ensure_files(
            &config.namespace,
            &format!("{release}-ca"),
            &[("ca.crt", ca.as_path())],
        )
        .await?;

    // Install the peer chart
    let mut values = json!({
        "domain": config.domain.as_str(),
        "ca": {"enabled": true},
        "config": {
            "mspID": org.msp_id.as_str(),
            "domain": org_domain.as_str(),
            "hostname": peer,
        },
        "orderer": {"domain": config.orderer.domain.as_str()},
    });
    merge_values(&mut values, &config.values.peer);
    helm.upgrade(&release, "peer", &config.namespace, &values)
        .await?;

    // Wait for the peer pod, then for its shell pod
    require_ready(
        watcher,
        WaitSpec::new(
            &config.namespace,
            &peer_selector(org_name, peer),
            config.ready_timeout(),
            config.warn_interval(),
        ),
        &format!("peer pod {org_name}/{peer}"),
    )
    .await?;
    require_ready(
        watcher,
        WaitSpec::new(
            &config.namespace,
            &cli_selector(org_name, peer),
            config.ready_timeout(),
            config.warn_interval(),
        ),
        &format!("shell pod {org_name}/{peer}"),
    )
    .await?;
    info!(org = org_name, peer, "peer deployed");
    Ok(())
}
