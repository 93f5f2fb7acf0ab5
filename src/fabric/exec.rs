//! Remote command execution inside cluster pods

use crate::fabric::{status, Error};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Identifies the remote execution context for a command.
///
/// `name` may be unset when the pod carries a generated name; it is then
/// discovered through `selector` on first use.
#[derive(Clone, Debug)]
pub struct Target {
    pub namespace: String,
    pub name: Option<String>,
    pub selector: String,
    pub container: Option<String>,
}

impl Target {
    /// Target discovered by label selector
    pub fn selected(namespace: &str, selector: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: None,
            selector: selector.to_string(),
            container: None,
        }
    }

    /// Target with a known pod name
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: Some(name.to_string()),
            selector: String::new(),
            container: None,
        }
    }
}

/// Captured output of a remote command.
///
/// `failed` is true iff the last non-empty stderr line carries the remote
/// tool's failure signature; transport problems never surface here and are
/// returned as hard errors instead.
#[derive(Clone, Debug)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub failed: bool,
}

impl ExecResult {
    /// Both captured streams, stdout first
    pub fn text(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Runs commands inside remote execution targets
#[async_trait]
pub trait Executor: Send + Sync {
    /// Resolves a target's pod name via its label selector
    async fn resolve(&self, target: &Target) -> Result<Target, Error>;

    /// Runs a command inside the target
    async fn exec(&self, target: &Target, argv: &[&str]) -> Result<ExecResult, Error>;

    /// Runs a command line through a shell inside the target.
    ///
    /// Required whenever the command needs piping, redirection, or variable
    /// expansion (e.g. `--cafile $ORDERER_CA`).
    async fn exec_shell(&self, target: &Target, command: &str) -> Result<ExecResult, Error>;

    /// Copies a local file into the target
    async fn copy(&self, target: &Target, local: &Path, remote: &str) -> Result<(), Error>;
}

/// Shared low-level cluster client backed by the `kubectl` binary.
///
/// Constructed once at process start and passed into every component.
#[derive(Clone, Default)]
pub struct Kubectl {
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl Kubectl {
    pub fn new(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self { kubeconfig, context }
    }

    /// Base `kubectl` invocation with client-level options applied
    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new("kubectl");
        if let Some(kubeconfig) = &self.kubeconfig {
            command.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.context {
            command.arg("--context").arg(context);
        }
        command
    }

    /// Runs `kubectl` to completion, capturing output
    pub(crate) async fn run(&self, args: &[&str]) -> Result<Output, Error> {
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Transport(format!("failed to run kubectl: {e}")))
    }

    /// Runs `kubectl` with bytes piped to its stdin
    pub(crate) async fn run_with_stdin(&self, args: &[&str], input: &[u8]) -> Result<Output, Error> {
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to run kubectl: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("kubectl stdin unavailable".to_string()))?;
        stdin
            .write_all(input)
            .await
            .map_err(|e| Error::Transport(format!("failed to write to kubectl: {e}")))?;
        drop(stdin);
        child
            .wait_with_output()
            .await
            .map_err(|e| Error::Transport(format!("failed to run kubectl: {e}")))
    }
}

#[async_trait]
impl Executor for Kubectl {
    async fn resolve(&self, target: &Target) -> Result<Target, Error> {
        if target.name.is_some() {
            return Ok(target.clone());
        }
        let output = self
            .run(&[
                "get",
                "pods",
                "-n",
                target.namespace.as_str(),
                "-l",
                target.selector.as_str(),
                "-o",
                "jsonpath={.items[*].metadata.name}",
            ])
            .await?;
        if !output.status.success() {
            return Err(Error::Transport(format!(
                "pod lookup failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let names = String::from_utf8_lossy(&output.stdout);
        let Some(name) = names.split_whitespace().next().map(str::to_string) else {
            return Err(Error::NoSuchPod(target.selector.clone()));
        };
        debug!(
            selector = target.selector.as_str(),
            pod = name.as_str(),
            "resolved execution target"
        );
        let mut resolved = target.clone();
        resolved.name = Some(name);
        Ok(resolved)
    }

    async fn exec(&self, target: &Target, argv: &[&str]) -> Result<ExecResult, Error> {
        let target = self.resolve(target).await?;
        let name = target.name.as_deref().unwrap_or_default();
        let mut args = vec!["exec", "-n", target.namespace.as_str(), name];
        if let Some(container) = &target.container {
            args.push("-c");
            args.push(container.as_str());
        }
        args.push("--");
        args.extend_from_slice(argv);
        let rendered = argv.join(" ");
        debug!(pod = name, command = rendered.as_str(), "executing remote command");
        let output = self.run(&args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // The remote tool signals failure only through stderr text; a
        // non-zero exit without that signature means the plumbing itself
        // (connection, auth, missing pod) broke.
        let failed = status::command_failed(&stderr);
        if !output.status.success() && !failed {
            return Err(Error::Transport(format!(
                "exec into {name} failed: {}",
                last_line(&stderr)
            )));
        }
        Ok(ExecResult {
            stdout,
            stderr,
            failed,
        })
    }

    async fn exec_shell(&self, target: &Target, command: &str) -> Result<ExecResult, Error> {
        self.exec(target, &["sh", "-c", command]).await
    }

    async fn copy(&self, target: &Target, local: &Path, remote: &str) -> Result<(), Error> {
        let target = self.resolve(target).await?;
        let name = target.name.as_deref().unwrap_or_default();
        let local = local.to_string_lossy();
        let dest = format!("{}/{}:{}", target.namespace, name, remote);
        let mut args = vec!["cp", local.as_ref(), dest.as_str()];
        if let Some(container) = &target.container {
            args.push("-c");
            args.push(container.as_str());
        }
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(Error::Transport(format!(
                "copy to {name} failed: {}",
                last_line(&String::from_utf8_lossy(&output.stderr))
            )));
        }
        debug!(pod = name, remote = remote, "copied file into pod");
        Ok(())
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("(no output)")
        .trim()
        .to_string()
}
