//! `deploy chaincode` subcommand: the install/approve/commit lifecycle.
//!
//! One rollout drives a chaincode definition from whatever state a prior run
//! left it in to committed on the channel: a global status probe, then per
//! (organization, peer) install + service chart + approval, then
//! commit-readiness aggregation and a single multi-party commit. Every fact
//! is re-derived from the live network, so a rerun resumes where the last
//! one stopped.

use crate::fabric::{
    chaincode_release, cli_selector,
    exec::{ExecResult, Executor, Target},
    helm::{merge_values, ChartInstaller},
    package::{write_package, PackageSpec},
    peer_selector,
    status::{self, CommitStatus},
    transfer,
    watch::{require_ready, WaitSpec, Watcher},
    Config, Error, StderrHook, CHAINCODE_PORT,
};
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info};

/// Dial timeout written into the connection descriptor
const DIAL_TIMEOUT: &str = "10s";

/// Remote staging directory for install packages
const REMOTE_STAGING: &str = "/tmp";

/// Version assigned to a definition that was never committed
const INITIAL_VERSION: f64 = 1.0;

/// Smallest unit a definition version is bumped by on update
const VERSION_STEP: f64 = 0.1;

/// Caller configuration for one chaincode rollout
pub struct ChaincodeSpec {
    pub name: String,
    pub channel: String,
    /// Image the chaincode service chart runs
    pub image: String,
    /// Directory of CouchDB index definitions to bundle, if any
    pub indexes: Option<PathBuf>,
    /// Explicitly pinned definition version
    pub version: Option<f64>,
    /// Whether redeploying over a committed definition is permitted
    pub update: bool,
}

/// Version and sequence of the definition being rolled out
#[derive(Clone, Copy, Debug, PartialEq)]
struct Definition {
    version: f64,
    sequence: u64,
}

/// Decides the definition to roll out from the current commit status.
///
/// Returns `None` when the definition is already committed and no update was
/// requested: the rollout is then a no-op. The version auto-increments only
/// when the caller did not pin one.
fn resolve_definition(status: &CommitStatus, pinned: Option<f64>, update: bool) -> Option<Definition> {
    if !status.committed {
        return Some(Definition {
            version: pinned.unwrap_or(INITIAL_VERSION),
            sequence: 1,
        });
    }
    if !update {
        return None;
    }
    Some(Definition {
        version: pinned.unwrap_or(status.version + VERSION_STEP),
        sequence: status.sequence + 1,
    })
}

/// Drives the install/approve/commit lifecycle for one chaincode on one
/// channel, across every configured (organization, peer) pair
pub struct Rollout<'a, E, W, H> {
    exec: &'a E,
    watcher: &'a W,
    helm: &'a H,
    config: &'a Config,
    inspect: Option<StderrHook>,
}

impl<'a, E: Executor, W: Watcher, H: ChartInstaller> Rollout<'a, E, W, H> {
    pub fn new(exec: &'a E, watcher: &'a W, helm: &'a H, config: &'a Config) -> Self {
        Self {
            exec,
            watcher,
            helm,
            config,
            inspect: None,
        }
    }

    /// Attaches a hook that surfaces captured stderr on remote failures
    pub fn with_inspector(mut self, inspect: StderrHook) -> Self {
        self.inspect = Some(inspect);
        self
    }

    pub async fn deploy(&self, spec: &ChaincodeSpec) -> Result<(), Error> {
        validate(spec)?;
        let pairs = self.config.org_peers();
        let Some((first_org, first_peer)) = pairs.first() else {
            return Err(Error::InvalidArguments(vec![
                "no organizations configured".to_string(),
            ]));
        };

        // Probe the committed state once, globally. The query fails remotely
        // when the chaincode was never committed, so a failed result here is
        // an answer, not an abort.
        let probe_cli = self.shell_pod(first_org, first_peer).await?;
        let query = query_committed_command(spec);
        let result = self.exec.exec_shell(&probe_cli, &query).await?;
        let current = status::commit_status(&result.text());
        let Some(definition) = resolve_definition(&current, spec.version, spec.update) else {
            info!(
                chaincode = spec.name.as_str(),
                version = format!("{:.1}", current.version).as_str(),
                sequence = current.sequence,
                "chaincode already committed, nothing to do"
            );
            return Ok(());
        };
        if current.committed {
            info!(
                chaincode = spec.name.as_str(),
                version = format!("{:.1}", definition.version).as_str(),
                sequence = definition.sequence,
                "preparing definition update"
            );
        }

        // Install, deploy, and approve on every pair, in configured order
        let mut available = probe_cli;
        for (org_name, peer) in pairs.pairs() {
            available = self.process_pair(spec, &definition, org_name, peer).await?;
        }

        // Aggregate commit readiness; a partial commit is never attempted
        let readiness = check_readiness_command(spec, &definition);
        let result = self.exec.exec_shell(&available, &readiness).await?;
        if result.failed {
            return Err(self.remote_failure(&readiness, &result));
        }
        let (ready, unapproved) = status::commit_readiness(&result.text());
        if !ready {
            return Err(Error::UnapprovedOrganizations(unapproved));
        }

        // One commit carrying every organization's endorsement address
        let commit = self.commit_command(spec, &definition)?;
        let result = self.exec.exec_shell(&available, &commit).await?;
        if result.failed {
            return Err(self.remote_failure(&commit, &result));
        }
        info!(
            chaincode = spec.name.as_str(),
            channel = spec.channel.as_str(),
            version = format!("{:.1}", definition.version).as_str(),
            sequence = definition.sequence,
            "chaincode committed"
        );
        Ok(())
    }

    /// Steps (a)-(f) for one (organization, peer) pair; returns the pair's
    /// shell pod as the execution context for the commit phase
    async fn process_pair(
        &self,
        spec: &ChaincodeSpec,
        definition: &Definition,
        org_name: &str,
        peer: &str,
    ) -> Result<Target, Error> {
        let org = self.config.org(org_name)?;
        info!(org = org_name, peer, chaincode = spec.name.as_str(), "processing pair");

        // (a) peer pod, then its shell pod
        require_ready(
            self.watcher,
            WaitSpec::new(
                &self.config.namespace,
                &peer_selector(org_name, peer),
                self.config.ready_timeout(),
                self.config.warn_interval(),
            ),
            &format!("peer pod {org_name}/{peer}"),
        )
        .await?;
        let cli = self.shell_pod(org_name, peer).await?;

        // (b) stage the install package
        let release = chaincode_release(&spec.name, org_name, peer);
        let staging = tempfile::tempdir()?;
        let address = format!("{release}:{CHAINCODE_PORT}");
        let package = write_package(
            staging.path(),
            &PackageSpec {
                label: &spec.name,
                address: &address,
                dial_timeout: DIAL_TIMEOUT,
                indexes: spec.indexes.as_deref(),
            },
        )?;

        // (c) transfer and install, recovering the package identifier
        let remote = format!("{REMOTE_STAGING}/{}.tar.gz", spec.name);
        transfer::copy_all(
            self.exec,
            &cli,
            &[(package, remote.clone())],
            transfer::DEFAULT_CONCURRENCY,
        )
        .await?;
        let install = format!("peer lifecycle chaincode install {remote}");
        let result = self.exec.exec_shell(&cli, &install).await?;
        if result.failed {
            return Err(self.remote_failure(&install, &result));
        }
        let package_id = status::parse_package_id(&result.text());
        if package_id.is_empty() {
            return Err(Error::MissingPackageId);
        }
        debug!(package_id = package_id.as_str(), "installed chaincode package");

        // (d) chaincode service chart for this pair
        let mut values = json!({
            "image": {"repository": spec.image.as_str()},
            "peer": peer,
            "org": org_name,
            "chaincode": spec.name.as_str(),
            "ccid": package_id.as_str(),
        });
        merge_values(&mut values, &self.config.values.chaincode);
        self.helm
            .upgrade(&release, "chaincode", &self.config.namespace, &values)
            .await?;

        // (e) approve unless this organization already has
        let readiness = check_readiness_command(spec, definition);
        let result = self.exec.exec_shell(&cli, &readiness).await?;
        if result.failed {
            return Err(self.remote_failure(&readiness, &result));
        }
        if status::approved(&result.text(), &org.msp_id) {
            info!(org = org_name, "definition already approved, skipping");
        } else {
            let approve = self.approve_command(spec, definition, &package_id);
            let result = self.exec.exec_shell(&cli, &approve).await?;
            if result.failed {
                return Err(self.remote_failure(&approve, &result));
            }
            info!(org = org_name, "approved definition");
        }

        // (f) this shell pod is the execution context for the next phase
        Ok(cli)
    }

    /// Waits for the shell pod colocated with a peer and returns it
    async fn shell_pod(&self, org: &str, peer: &str) -> Result<Target, Error> {
        require_ready(
            self.watcher,
            WaitSpec::new(
                &self.config.namespace,
                &cli_selector(org, peer),
                self.config.ready_timeout(),
                self.config.warn_interval(),
            ),
            &format!("shell pod {org}/{peer}"),
        )
        .await
    }

    fn approve_command(&self, spec: &ChaincodeSpec, definition: &Definition, package_id: &str) -> String {
        format!(
            "peer lifecycle chaincode approveformyorg --channelID {} --name {} --version {:.1} --sequence {} --package-id {} --init-required=false -o {} --tls --cafile $ORDERER_CA",
            spec.channel,
            spec.name,
            definition.version,
            definition.sequence,
            package_id,
            self.config.orderer_address(),
        )
    }

    /// Builds the single commit invocation, its tail extended once per
    /// (organization, peer) pair with that peer's endorsement address
    fn commit_command(&self, spec: &ChaincodeSpec, definition: &Definition) -> Result<String, Error> {
        let mut command = format!(
            "peer lifecycle chaincode commit --channelID {} --name {} --version {:.1} --sequence {} --init-required=false -o {} --tls --cafile $ORDERER_CA",
            spec.channel,
            spec.name,
            definition.version,
            definition.sequence,
            self.config.orderer_address(),
        );
        let pairs = self.config.org_peers();
        for (org_name, peer) in pairs.pairs() {
            let org = self.config.org(org_name)?;
            command.push_str(&format!(
                " --peerAddresses {} --tlsRootCertFiles {}",
                self.config.peer_address(org, peer),
                self.config.peer_tls_root(org, peer),
            ));
        }
        Ok(command)
    }

    /// Builds the abort error for a failed remote command, giving the
    /// caller-supplied hook a chance to surface the captured stderr first
    fn remote_failure(&self, command: &str, result: &ExecResult) -> Error {
        if let Some(inspect) = &self.inspect {
            inspect(&result.stderr);
        }
        Error::RemoteCommand {
            command: command.to_string(),
            stderr: result.stderr.clone(),
        }
    }
}

fn validate(spec: &ChaincodeSpec) -> Result<(), Error> {
    let mut issues = Vec::new();
    if spec.name.is_empty() {
        issues.push("chaincode name must not be empty".to_string());
    }
    if spec.channel.is_empty() {
        issues.push("channel must not be empty".to_string());
    }
    if spec.image.is_empty() {
        issues.push("image must not be empty".to_string());
    }
    if let Some(version) = spec.version {
        if version <= 0.0 {
            issues.push(format!("version must be positive, got {version:.1}"));
        }
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidArguments(issues))
    }
}

fn query_committed_command(spec: &ChaincodeSpec) -> String {
    format!(
        "peer lifecycle chaincode querycommitted --channelID {} --name {}",
        spec.channel, spec.name
    )
}

fn check_readiness_command(spec: &ChaincodeSpec, definition: &Definition) -> String {
    format!(
        "peer lifecycle chaincode checkcommitreadiness --channelID {} --name {} --version {:.1} --sequence {} --init-required=false",
        spec.channel, spec.name, definition.version, definition.sequence
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::status::CommitStatus;
    use crate::fabric::testing::{self, failed, ok, ReadyWatcher, RecordingHelm, ScriptedExec};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn spec(version: Option<f64>, update: bool) -> ChaincodeSpec {
        ChaincodeSpec {
            name: "assets".to_string(),
            channel: "supply".to_string(),
            image: "registry.example.com/assets".to_string(),
            indexes: None,
            version,
            update,
        }
    }

    const UNCOMMITTED: &str = "Error: query failed with status: 404 - namespace assets is not defined";

    fn install_output(id: &str) -> String {
        format!("Chaincode code package identifier: assets_1.0:{id}")
    }

    #[tokio::test]
    async fn fresh_deploy_runs_full_lifecycle() {
        let exec = ScriptedExec::default();
        let helm = RecordingHelm::default();
        // Probe: never committed.
        exec.respond(failed(UNCOMMITTED));
        // org1/peer0: install, readiness, approve.
        exec.respond(ok("", &install_output("abc123")));
        exec.respond(ok("Org1MSP: false\nOrg2MSP: false", ""));
        exec.respond(ok("", ""));
        // org2/peer0: install, readiness, approve.
        exec.respond(ok("", &install_output("def456")));
        exec.respond(ok("Org1MSP: true\nOrg2MSP: false", ""));
        exec.respond(ok("", ""));
        // Aggregation, then commit.
        exec.respond(ok("Org1MSP: true\nOrg2MSP: true", ""));
        exec.respond(ok("", ""));

        let config = testing::config();
        let rollout = Rollout::new(&exec, &ReadyWatcher, &helm, &config);
        rollout.deploy(&spec(None, false)).await.unwrap();

        // One chaincode service chart per pair, carrying its package id.
        let releases = helm.releases.lock().unwrap().clone();
        assert_eq!(releases.len(), 2);
        assert_eq!(releases[0].0, "assets-org1-peer0");
        assert_eq!(releases[0].1["ccid"], "abc123");
        assert_eq!(releases[1].0, "assets-org2-peer0");
        assert_eq!(releases[1].1["ccid"], "def456");

        // The package was staged into both shell pods.
        assert_eq!(exec.copies.lock().unwrap().len(), 2);

        // Exactly one commit, carrying one endorsement address per pair, in
        // configured order.
        let commands = exec.commands();
        let commits: Vec<_> = commands
            .iter()
            .filter(|c| c.contains("lifecycle chaincode commit"))
            .collect();
        assert_eq!(commits.len(), 1);
        let commit = commits[0];
        assert_eq!(commit.matches("--peerAddresses").count(), 2);
        let org1 = commit.find("peer0.org1.example.com:443").unwrap();
        let org2 = commit.find("peer0.org2.example.com:443").unwrap();
        assert!(org1 < org2);
        assert!(commit.contains("--version 1.0"));
        assert!(commit.contains("--sequence 1"));
        assert!(commit.contains("--init-required=false"));
        assert!(commit.contains("--cafile $ORDERER_CA"));
        assert!(commit.contains("--tlsRootCertFiles /crypto-config/peerOrganizations/org1.example.com/peers/peer0.org1.example.com/tls/ca.crt"));
    }

    #[tokio::test]
    async fn committed_without_update_is_a_noop() {
        let exec = ScriptedExec::default();
        let helm = RecordingHelm::default();
        exec.respond(ok(
            "Committed chaincode definition for chaincode 'assets' on channel 'supply':\nVersion: 1.0, Sequence: 1, Endorsement Plugin: escc, Validation Plugin: vscc",
            "",
        ));
        let config = testing::config();
        let rollout = Rollout::new(&exec, &ReadyWatcher, &helm, &config);
        rollout.deploy(&spec(None, false)).await.unwrap();

        // Only the status probe ran.
        assert_eq!(exec.commands().len(), 1);
        assert!(helm.releases.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_auto_increments_version_and_sequence() {
        let exec = ScriptedExec::default();
        let helm = RecordingHelm::default();
        exec.respond(ok(
            "Committed chaincode definition for chaincode 'assets' on channel 'supply':\nVersion: 1.0, Sequence: 1, Endorsement Plugin: escc, Validation Plugin: vscc",
            "",
        ));
        exec.respond(ok("", &install_output("abc123")));
        exec.respond(ok("Org1MSP: false\nOrg2MSP: false", ""));
        exec.respond(ok("", ""));
        exec.respond(ok("", &install_output("def456")));
        exec.respond(ok("Org1MSP: true\nOrg2MSP: false", ""));
        exec.respond(ok("", ""));
        exec.respond(ok("Org1MSP: true\nOrg2MSP: true", ""));
        exec.respond(ok("", ""));

        let config = testing::config();
        let rollout = Rollout::new(&exec, &ReadyWatcher, &helm, &config);
        rollout.deploy(&spec(None, true)).await.unwrap();

        let commands = exec.commands();
        let approve = commands
            .iter()
            .find(|c| c.contains("approveformyorg"))
            .unwrap();
        assert!(approve.contains("--version 1.1"));
        assert!(approve.contains("--sequence 2"));
        assert!(approve.contains("--package-id abc123"));
    }

    #[tokio::test]
    async fn laggard_organizations_block_the_commit() {
        let exec = ScriptedExec::default();
        let helm = RecordingHelm::default();
        exec.respond(failed(UNCOMMITTED));
        exec.respond(ok("", &install_output("abc123")));
        exec.respond(ok("Org1MSP: false\nOrg2MSP: false", ""));
        exec.respond(ok("", ""));
        exec.respond(ok("", &install_output("def456")));
        exec.respond(ok("Org1MSP: true\nOrg2MSP: false", ""));
        exec.respond(ok("", ""));
        // Aggregation still sees a laggard.
        exec.respond(ok("Org1MSP: true\nOrg2MSP: false", ""));

        let config = testing::config();
        let rollout = Rollout::new(&exec, &ReadyWatcher, &helm, &config);
        let result = rollout.deploy(&spec(None, false)).await;
        let Err(Error::UnapprovedOrganizations(laggards)) = result else {
            panic!("expected unapproved organizations");
        };
        assert_eq!(laggards, vec!["Org2MSP".to_string()]);
        assert!(exec
            .commands()
            .iter()
            .all(|c| !c.contains("lifecycle chaincode commit")));
    }

    #[tokio::test]
    async fn approved_organization_is_skipped() {
        let exec = ScriptedExec::default();
        let helm = RecordingHelm::default();
        exec.respond(failed(UNCOMMITTED));
        // org1 already approved in a prior run.
        exec.respond(ok("", &install_output("abc123")));
        exec.respond(ok("Org1MSP: true\nOrg2MSP: false", ""));
        exec.respond(ok("", &install_output("def456")));
        exec.respond(ok("Org1MSP: true\nOrg2MSP: false", ""));
        exec.respond(ok("", ""));
        exec.respond(ok("Org1MSP: true\nOrg2MSP: true", ""));
        exec.respond(ok("", ""));

        let config = testing::config();
        let rollout = Rollout::new(&exec, &ReadyWatcher, &helm, &config);
        rollout.deploy(&spec(None, false)).await.unwrap();

        let approvals = exec
            .commands()
            .iter()
            .filter(|c| c.contains("approveformyorg"))
            .count();
        assert_eq!(approvals, 1);
    }

    #[tokio::test]
    async fn remote_failure_carries_stderr_and_fires_the_hook() {
        let exec = ScriptedExec::default();
        let helm = RecordingHelm::default();
        exec.respond(failed(UNCOMMITTED));
        exec.respond(failed("Error: chaincode install failed with status: 500"));

        let inspected = Arc::new(AtomicBool::new(false));
        let flag = inspected.clone();
        let config = testing::config();
        let rollout = Rollout::new(&exec, &ReadyWatcher, &helm, &config)
            .with_inspector(Arc::new(move |stderr: &str| {
                assert!(stderr.contains("status: 500"));
                flag.store(true, Ordering::SeqCst);
            }));
        let result = rollout.deploy(&spec(None, false)).await;
        let Err(Error::RemoteCommand { stderr, .. }) = result else {
            panic!("expected remote command failure");
        };
        assert!(stderr.contains("status: 500"));
        assert!(inspected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_package_id_aborts() {
        let exec = ScriptedExec::default();
        let helm = RecordingHelm::default();
        exec.respond(failed(UNCOMMITTED));
        exec.respond(ok("installed, but no identifier line", ""));
        let config = testing::config();
        let rollout = Rollout::new(&exec, &ReadyWatcher, &helm, &config);
        let result = rollout.deploy(&spec(None, false)).await;
        assert!(matches!(result, Err(Error::MissingPackageId)));
    }

    #[tokio::test]
    async fn invalid_spec_fails_before_any_remote_call() {
        let exec = ScriptedExec::default();
        let helm = RecordingHelm::default();
        let config = testing::config();
        let rollout = Rollout::new(&exec, &ReadyWatcher, &helm, &config);
        let bad = ChaincodeSpec {
            name: String::new(),
            channel: String::new(),
            image: String::new(),
            indexes: None,
            version: Some(-1.0),
            update: false,
        };
        let Err(Error::InvalidArguments(issues)) = rollout.deploy(&bad).await else {
            panic!("expected aggregated validation failure");
        };
        assert_eq!(issues.len(), 4);
        assert!(exec.commands().is_empty());
    }

    #[test]
    fn definition_resolution() {
        let fresh = CommitStatus::default();
        assert_eq!(
            resolve_definition(&fresh, None, false),
            Some(Definition { version: 1.0, sequence: 1 })
        );
        assert_eq!(
            resolve_definition(&fresh, Some(2.0), false),
            Some(Definition { version: 2.0, sequence: 1 })
        );

        let committed = CommitStatus { committed: true, version: 1.0, sequence: 1 };
        assert_eq!(resolve_definition(&committed, None, false), None);
        let updated = resolve_definition(&committed, None, true).unwrap();
        assert_eq!(format!("{:.1}", updated.version), "1.1");
        assert_eq!(updated.sequence, 2);
        assert_eq!(
            resolve_definition(&committed, Some(4.0), true),
            Some(Definition { version: 4.0, sequence: 2 })
        );
    }
}
