//! Scripted fakes for isolated component tests

use crate::fabric::{
    exec::{ExecResult, Executor, Target},
    helm::ChartInstaller,
    secrets::SecretProvisioner,
    status,
    watch::{WaitSpec, Watcher},
    Config, Error, OrdererConfig, OrganizationConfig, Timeouts, ValueOverrides,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Result of a successful remote command
pub fn ok(stdout: &str, stderr: &str) -> ExecResult {
    ExecResult {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        failed: status::command_failed(stderr),
    }
}

/// Result of a failed remote command
pub fn failed(stderr: &str) -> ExecResult {
    ExecResult {
        stdout: String::new(),
        stderr: stderr.to_string(),
        failed: true,
    }
}

/// Executor that pops scripted results and records every command.
///
/// An empty script yields successful empty results, so tests only script the
/// calls they care about.
#[derive(Default)]
pub struct ScriptedExec {
    pub responses: Mutex<VecDeque<ExecResult>>,
    pub commands: Mutex<Vec<String>>,
    pub copies: Mutex<Vec<(PathBuf, String)>>,
}

impl ScriptedExec {
    pub fn respond(&self, result: ExecResult) {
        self.responses.lock().unwrap().push_back(result);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn next(&self) -> ExecResult {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ok("", ""))
    }
}

#[async_trait]
impl Executor for ScriptedExec {
    async fn resolve(&self, target: &Target) -> Result<Target, Error> {
        let mut resolved = target.clone();
        if resolved.name.is_none() {
            resolved.name = Some("scripted-pod".to_string());
        }
        Ok(resolved)
    }

    async fn exec(&self, _target: &Target, argv: &[&str]) -> Result<ExecResult, Error> {
        self.commands.lock().unwrap().push(argv.join(" "));
        Ok(self.next())
    }

    async fn exec_shell(&self, _target: &Target, command: &str) -> Result<ExecResult, Error> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self.next())
    }

    async fn copy(&self, _target: &Target, local: &Path, remote: &str) -> Result<(), Error> {
        self.copies
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }
}

/// Watcher whose resources are always immediately ready
pub struct ReadyWatcher;

#[async_trait]
impl Watcher for ReadyWatcher {
    async fn await_ready(&self, spec: &mut WaitSpec) -> Result<bool, Error> {
        if spec.expected_name.is_none() {
            spec.expected_name = Some("ready-pod".to_string());
        }
        Ok(true)
    }
}

/// Chart installer that records every release it is asked for
#[derive(Default)]
pub struct RecordingHelm {
    pub releases: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ChartInstaller for RecordingHelm {
    async fn upgrade(
        &self,
        release: &str,
        _chart: &str,
        _namespace: &str,
        values: &Value,
    ) -> Result<(), Error> {
        self.releases
            .lock()
            .unwrap()
            .push((release.to_string(), values.clone()));
        Ok(())
    }
}

/// Secret provisioner that records the name of every secret it ensures
#[derive(Default)]
pub struct RecordingSecrets {
    pub secrets: Mutex<Vec<String>>,
}

#[async_trait]
impl SecretProvisioner for RecordingSecrets {
    async fn ensure_tls(
        &self,
        _namespace: &str,
        name: &str,
        _cert: &Path,
        _key: &Path,
    ) -> Result<(), Error> {
        self.secrets.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn ensure_files(
        &self,
        _namespace: &str,
        name: &str,
        _files: &[(&str, &Path)],
    ) -> Result<(), Error> {
        self.secrets.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Two-organization network configuration for tests
pub fn config() -> Config {
    Config {
        domain: "example.com".to_string(),
        namespace: "fabric".to_string(),
        orderer: OrdererConfig {
            domain: "orderer.example.com".to_string(),
        },
        charts: PathBuf::from("./charts"),
        crypto: PathBuf::from("./crypto-config"),
        artifacts: PathBuf::from("./channel-artifacts"),
        organizations: vec![
            OrganizationConfig {
                name: "org1".to_string(),
                msp_id: "Org1MSP".to_string(),
                domain: None,
                peers: vec!["peer0".to_string()],
            },
            OrganizationConfig {
                name: "org2".to_string(),
                msp_id: "Org2MSP".to_string(),
                domain: None,
                peers: vec!["peer0".to_string()],
            },
        ],
        timeouts: Timeouts::default(),
        values: ValueOverrides::default(),
    }
}
