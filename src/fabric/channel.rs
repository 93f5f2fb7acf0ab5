//! `deploy channel` subcommand

use crate::fabric::{
    cli_selector,
    exec::Executor,
    peer_selector, transfer,
    watch::{require_ready, WaitSpec, Watcher},
    Config, Error,
};
use tracing::info;

/// Creates a channel and joins every configured peer to it.
///
/// Whether the channel exists is probed per run by fetching its genesis
/// block; the create step runs only when the probe fails. Joining is
/// attempted regardless because the remote side tolerates rejoining.
pub async fn deploy(
    exec: &impl Executor,
    watcher: &impl Watcher,
    config: &Config,
    channel: &str,
) -> Result<(), Error> {
    if channel.is_empty() {
        return Err(Error::InvalidArguments(vec![
            "channel name must not be empty".to_string(),
        ]));
    }
    let pairs = config.org_peers();
    for (org_name, peer) in pairs.pairs() {
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
        let cli = require_ready(
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

        // Ship the channel transaction artifact
        let tx = config.artifacts.join(format!("{channel}.tx"));
        transfer::copy_all(
            exec,
            &cli,
            &[(tx, format!("/tmp/{channel}.tx"))],
            transfer::DEFAULT_CONCURRENCY,
        )
        .await?;

        // Probe whether the genesis block is already fetchable
        let fetch = fetch_command(config, channel);
        let probe = exec.exec_shell(&cli, &fetch).await?;
        if probe.failed {
            let create = create_command(config, channel);
            let result = exec.exec_shell(&cli, &create).await?;
            if result.failed {
                return Err(Error::RemoteCommand {
                    command: create,
                    stderr: result.stderr,
                });
            }
            info!(channel, org = org_name, "created channel");
        } else {
            info!(channel, org = org_name, "channel already exists, skipping create");
        }

        // Join is idempotent remotely; a rejoin rejection is tolerated
        let join = join_command(channel);
        let result = exec.exec_shell(&cli, &join).await?;
        if result.failed && !result.stderr.contains("already exists") {
            return Err(Error::RemoteCommand {
                command: join,
                stderr: result.stderr,
            });
        }
        info!(channel, org = org_name, peer, "joined channel");
    }
    Ok(())
}

fn fetch_command(config: &Config, channel: &str) -> String {
    format!(
        "peer channel fetch oldest /tmp/{channel}.block --channelID {channel} -o {} --tls --cafile $ORDERER_CA",
        config.orderer_address()
    )
}

fn create_command(config: &Config, channel: &str) -> String {
    format!(
        "peer channel create --channelID {channel} -f /tmp/{channel}.tx --outputBlock /tmp/{channel}.block -o {} --tls --cafile $ORDERER_CA",
        config.orderer_address()
    )
}

fn join_command(channel: &str) -> String {
    format!("peer channel join -b /tmp/{channel}.block")
}
