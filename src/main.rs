//! Fabric Deployer CLI

use clap::{Arg, ArgAction, Command};
use fabric::{
    chaincode::{ChaincodeSpec, Rollout},
    exec::Kubectl,
    helm::Helm,
    watch::KubeWatcher,
    Config, Error, StderrHook,
};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;

mod fabric;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Entrypoint for the Fabric Deployer CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let config_arg = Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to the network YAML config file")
        .value_parser(clap::value_parser!(PathBuf));
    let matches = Command::new("fabric-deployer")
        .version(crate_version())
        .about("Deploy Hyperledger Fabric components to a Kubernetes cluster.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("kubeconfig")
                .long("kubeconfig")
                .help("Path to the kubeconfig file (defaults to the ambient one)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("context")
                .long("context")
                .help("Kubeconfig context to use")
                .value_parser(clap::value_parser!(String)),
        )
        .subcommand(
            Command::new(fabric::CMD)
                .about("Deploy network components onto the cluster.")
                .subcommand(
                    Command::new(fabric::ORDERER_CMD)
                        .about("Deploy the ordering service.")
                        .arg(config_arg.clone()),
                )
                .subcommand(
                    Command::new(fabric::PEER_CMD)
                        .about("Deploy one peer (and its shell pod) for an organization.")
                        .arg(config_arg.clone())
                        .arg(
                            Arg::new("org")
                                .long("org")
                                .required(true)
                                .help("Owning organization name")
                                .value_parser(clap::value_parser!(String)),
                        )
                        .arg(
                            Arg::new("peer")
                                .long("peer")
                                .required(true)
                                .help("Peer hostname")
                                .value_parser(clap::value_parser!(String)),
                        ),
                )
                .subcommand(
                    Command::new(fabric::CHANNEL_CMD)
                        .about("Create a channel and join every configured peer to it.")
                        .arg(config_arg.clone())
                        .arg(
                            Arg::new("channel")
                                .long("channel")
                                .required(true)
                                .help("Channel name")
                                .value_parser(clap::value_parser!(String)),
                        ),
                )
                .subcommand(
                    Command::new(fabric::CHAINCODE_CMD)
                        .about("Install, approve, and commit a chaincode across every organization.")
                        .arg(config_arg.clone())
                        .arg(
                            Arg::new("channel")
                                .long("channel")
                                .required(true)
                                .help("Channel the chaincode is committed on")
                                .value_parser(clap::value_parser!(String)),
                        )
                        .arg(
                            Arg::new("chaincode")
                                .long("chaincode")
                                .required(true)
                                .help("Chaincode name")
                                .value_parser(clap::value_parser!(String)),
                        )
                        .arg(
                            Arg::new("image")
                                .long("image")
                                .required(true)
                                .help("Image the chaincode service runs")
                                .value_parser(clap::value_parser!(String)),
                        )
                        .arg(
                            Arg::new("indexes")
                                .long("indexes")
                                .help("Directory of CouchDB index definitions to bundle")
                                .value_parser(clap::value_parser!(PathBuf)),
                        )
                        .arg(
                            Arg::new("version")
                                .long("version")
                                .help("Pin the definition version instead of deriving it")
                                .value_parser(clap::value_parser!(f64)),
                        )
                        .arg(
                            Arg::new("update")
                                .long("update")
                                .help("Permit redeploying over a committed definition")
                                .action(ArgAction::SetTrue),
                        ),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Client-level options, threaded into the shared clients
    let kubeconfig = matches.get_one::<PathBuf>("kubeconfig").cloned();
    let context = matches.get_one::<String>("context").cloned();

    // Parse subcommands
    if let Some(deploy_matches) = matches.subcommand_matches(fabric::CMD) {
        match deploy_matches.subcommand() {
            Some((fabric::ORDERER_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                if let Err(e) = deploy_orderer(config_path, kubeconfig, context).await {
                    error!(error = ?e, "failed to deploy orderer");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((fabric::PEER_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                let org = matches.get_one::<String>("org").unwrap();
                let peer = matches.get_one::<String>("peer").unwrap();
                if let Err(e) = deploy_peer(config_path, kubeconfig, context, org, peer).await {
                    error!(error = ?e, "failed to deploy peer");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((fabric::CHANNEL_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                let channel = matches.get_one::<String>("channel").unwrap();
                if let Err(e) = deploy_channel(config_path, kubeconfig, context, channel).await {
                    error!(error = ?e, "failed to deploy channel");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((fabric::CHAINCODE_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                let spec = ChaincodeSpec {
                    name: matches.get_one::<String>("chaincode").unwrap().clone(),
                    channel: matches.get_one::<String>("channel").unwrap().clone(),
                    image: matches.get_one::<String>("image").unwrap().clone(),
                    indexes: matches.get_one::<PathBuf>("indexes").cloned(),
                    version: matches.get_one::<f64>("version").copied(),
                    update: matches.get_flag("update"),
                };
                if let Err(e) = deploy_chaincode(config_path, kubeconfig, context, spec).await {
                    error!(error = ?e, "failed to deploy chaincode");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
            }
            None => {
                error!("no subcommand provided");
            }
        }
    } else if let Some(cmd) = matches.subcommand_name() {
        error!(cmd, "invalid subcommand");
    } else {
        error!("no subcommand provided");
    }
    std::process::ExitCode::FAILURE
}

async fn deploy_orderer(
    config_path: &PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
) -> Result<(), Error> {
    let config = Config::load(config_path)?;
    let kube = Kubectl::new(kubeconfig.clone(), context.clone());
    let helm = Helm::new(config.charts.clone(), kubeconfig, context);
    let watcher = KubeWatcher::new(kube.clone());
    fabric::orderer::deploy(&kube, &helm, &watcher, &config).await
}

async fn deploy_peer(
    config_path: &PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    org: &str,
    peer: &str,
) -> Result<(), Error> {
    let config = Config::load(config_path)?;
    let kube = Kubectl::new(kubeconfig.clone(), context.clone());
    let helm = Helm::new(config.charts.clone(), kubeconfig, context);
    let watcher = KubeWatcher::new(kube.clone());
    fabric::peer::deploy(&kube, &helm, &watcher, &config, org, peer).await
}

async fn deploy_channel(
    config_path: &PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    channel: &str,
) -> Result<(), Error> {
    let config = Config::load(config_path)?;
    let kube = Kubectl::new(kubeconfig, context);
    let watcher = KubeWatcher::new(kube.clone());
    fabric::channel::deploy(&kube, &watcher, &config, channel).await
}

async fn deploy_chaincode(
    config_path: &PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    spec: ChaincodeSpec,
) -> Result<(), Error> {
    let config = Config::load(config_path)?;
    let kube = Kubectl::new(kubeconfig.clone(), context.clone());
    let helm = Helm::new(config.charts.clone(), kubeconfig, context);
    let watcher = KubeWatcher::new(kube.clone());
    let mut rollout = Rollout::new(&kube, &watcher, &helm, &config);
    if let Some(inspector) = stderr_inspector() {
        rollout = rollout.with_inspector(inspector);
    }
    rollout.deploy(&spec).await
}

/// Interactive hook that offers to dump the captured stderr of a failed
/// remote command; disabled when stdin is not a terminal
fn stderr_inspector() -> Option<StderrHook> {
    if !std::io::stdin().is_terminal() {
        return None;
    }
    Some(Arc::new(|stderr: &str| {
        eprint!("display captured stderr? [y/N] ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_ok() && line.trim().eq_ignore_ascii_case("y") {
            eprintln!("{stderr}");
        }
    }))
}
