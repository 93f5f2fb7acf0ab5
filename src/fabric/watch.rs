//! Waiting on cluster resources to reach a target condition.
//!
//! Readiness is observed through a `kubectl get --watch` feed that renders
//! one line per delivered event. A timeout is a reportable outcome
//! (`Ok(false)`), not an error; only a broken feed subscription is. Caller
//! cancellation is dropping the future — the feed process is killed on every
//! exit path.

use crate::fabric::{
    exec::{Kubectl, Target},
    Error,
};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, warn};

/// Describes a condition to await
#[derive(Clone, Debug)]
pub struct WaitSpec {
    pub namespace: String,
    pub selector: String,
    /// Name of the matched resource, recorded once observed.
    ///
    /// Pod names are generated by the platform, so the selector is the only
    /// handle until the feed reports a concrete name.
    pub expected_name: Option<String>,
    pub timeout: Duration,
    pub warn_after: Duration,
}

impl WaitSpec {
    pub fn new(namespace: &str, selector: &str, timeout: Duration, warn_after: Duration) -> Self {
        Self {
            namespace: namespace.to_string(),
            selector: selector.to_string(),
            expected_name: None,
            timeout,
            warn_after,
        }
    }
}

/// One observed state change of a watched resource
#[derive(Clone, Debug)]
pub struct Event {
    pub name: String,
    pub ready: bool,
}

/// Blocks until a matched resource reports ready
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Waits for a resource matching the spec to become ready.
    ///
    /// Returns `Ok(false)` on deadline expiry. On success, the observed
    /// resource name is recorded into `spec.expected_name`.
    async fn await_ready(&self, spec: &mut WaitSpec) -> Result<bool, Error>;
}

/// How one feed-consumption loop ended
enum FeedEnd {
    Satisfied,
    TimedOut,
    Closed,
}

/// Watches resources via the shared cluster client
#[derive(Clone)]
pub struct KubeWatcher {
    kube: Kubectl,
}

impl KubeWatcher {
    pub fn new(kube: Kubectl) -> Self {
        Self { kube }
    }

    /// Subscribes to the change feed and blocks until `on_event` returns
    /// true, the deadline passes, or the caller cancels.
    ///
    /// Events reach `on_event` strictly in feed delivery order. The predicate
    /// must be side-effect-free apart from recording the observed name.
    pub async fn wait<F>(&self, spec: &WaitSpec, on_event: F) -> Result<bool, Error>
    where
        F: FnMut(&Event) -> bool + Send,
    {
        // Render one `name<TAB>ready` line per delivered event.
        let template = concat!(
            r#"jsonpath={.metadata.name}{"\t"}"#,
            r#"{.status.conditions[?(@.type=="Ready")].status}{"\n"}"#
        );
        let mut child = self
            .kube
            .command()
            .args([
                "get",
                "pods",
                "-n",
                spec.namespace.as_str(),
                "-l",
                spec.selector.as_str(),
                "--watch",
                "-o",
                template,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to start watch: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("watch stdout unavailable".to_string()))?;

        // Forward feed lines as events; the channel preserves arrival order.
        let (tx, rx) = mpsc::channel(32);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(event) = parse_event(&line) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let (end, _) = drive(spec, rx, on_event).await;
        reader.abort();
        match end {
            FeedEnd::Satisfied => {
                child.kill().await.ok();
                Ok(true)
            }
            FeedEnd::TimedOut => {
                child.kill().await.ok();
                warn!(
                    selector = spec.selector.as_str(),
                    timeout = ?spec.timeout,
                    "timed out waiting for readiness"
                );
                Ok(false)
            }
            FeedEnd::Closed => {
                // The feed died before the condition or the deadline: the
                // subscription itself was rejected.
                let output = child
                    .wait_with_output()
                    .await
                    .map_err(|e| Error::Transport(format!("watch feed lost: {e}")))?;
                Err(Error::Transport(format!(
                    "watch feed closed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        }
    }
}

#[async_trait]
impl Watcher for KubeWatcher {
    async fn await_ready(&self, spec: &mut WaitSpec) -> Result<bool, Error> {
        let expected = spec.expected_name.clone();
        let mut observed = None;
        let satisfied = self
            .wait(spec, |event| {
                if let Some(expected) = &expected {
                    if &event.name != expected {
                        return false;
                    }
                }
                if !event.ready {
                    return false;
                }
                observed = Some(event.name.clone());
                true
            })
            .await?;
        if satisfied && spec.expected_name.is_none() {
            spec.expected_name = observed;
        }
        Ok(satisfied)
    }
}

/// Waits for a resource to become ready and returns it as an execution
/// target, treating a timeout as fatal for the enclosing step.
pub async fn require_ready<W: Watcher + ?Sized>(
    watcher: &W,
    mut spec: WaitSpec,
    what: &str,
) -> Result<Target, Error> {
    let timeout = spec.timeout;
    if !watcher.await_ready(&mut spec).await? {
        return Err(Error::NotReady {
            what: what.to_string(),
            timeout,
        });
    }
    Ok(match spec.expected_name {
        Some(name) => Target::named(&spec.namespace, &name),
        None => Target::selected(&spec.namespace, &spec.selector),
    })
}

/// Select loop over the feed, the warning timer, and the deadline.
///
/// Returns how the loop ended and how many slow-wait warnings fired.
async fn drive<F>(spec: &WaitSpec, mut rx: mpsc::Receiver<Event>, mut on_event: F) -> (FeedEnd, usize)
where
    F: FnMut(&Event) -> bool + Send,
{
    let deadline = sleep(spec.timeout);
    tokio::pin!(deadline);
    let mut warnings = 0;
    let mut warn_timer = interval_at(Instant::now() + spec.warn_after, spec.warn_after);
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    return (FeedEnd::Closed, warnings);
                };
                debug!(name = event.name.as_str(), ready = event.ready, "observed event");
                if on_event(&event) {
                    return (FeedEnd::Satisfied, warnings);
                }
            }
            _ = warn_timer.tick() => {
                warnings += 1;
                warn!(
                    selector = spec.selector.as_str(),
                    "readiness is taking longer than expected"
                );
            }
            _ = &mut deadline => {
                return (FeedEnd::TimedOut, warnings);
            }
        }
    }
}

/// Parses one feed line; lines without a name are noise
fn parse_event(line: &str) -> Option<Event> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let ready = fields.next().map(|f| f.trim() == "True").unwrap_or(false);
    Some(Event {
        name: name.to_string(),
        ready,
    })
}
