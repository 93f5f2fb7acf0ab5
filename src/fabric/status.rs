//! The status protocol: structured facts parsed from `peer` CLI text.
//!
//! Fabric's control plane exposes no structured status API, so every fact the
//! orchestrator acts on is extracted from captured command output with a
//! fixed-structure pattern. The grammar below is a versioned contract with
//! the wrapped tool:
//!
//! - install:           `Chaincode code package identifier: <label>:<id>`
//! - commit readiness:  one `<org>: true|false` line per organization
//! - committed query:   `Version: <d.d>, Sequence: <n>, ...`
//! - failure:           last non-empty stderr line carries `Error:`
//!
//! Absence of a match is "unknown/false", never an error; the orchestrator
//! must stay resilient to unrelated log noise. Present-but-unmatched text is
//! logged at debug so grammar drift is observable rather than silently
//! ignored.

use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static PACKAGE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Chaincode code package identifier:\s*(?:\S+:)?(\S+)").unwrap()
});

static APPROVAL_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*([A-Za-z0-9._-]+):\s*(true|false)\s*$").unwrap());

static COMMITTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Version:\s*([0-9]+(?:\.[0-9]+)?),\s*Sequence:\s*([0-9]+)").unwrap()
});

/// Commit state of one chaincode definition on one channel
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CommitStatus {
    pub committed: bool,
    pub version: f64,
    pub sequence: u64,
}

/// Whether captured stderr indicates the remote command itself failed.
///
/// The `peer` CLI prints `Error: ...` as its final line on failure. This is a
/// best-effort convention of the wrapped tool, not a guaranteed contract; it
/// is preserved exactly and is the only place text is classified as a command
/// failure.
pub fn command_failed(stderr: &str) -> bool {
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.contains("Error:"))
        .unwrap_or(false)
}

/// Package identifier emitted by the install step, last occurrence wins.
///
/// Returns an empty string when no identifier is present.
pub fn parse_package_id(output: &str) -> String {
    let id = PACKAGE_ID
        .captures_iter(output)
        .last()
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    if id.is_empty() && !output.trim().is_empty() {
        debug!("no package identifier in install output");
    }
    id
}

/// Whether the given organization is listed as having approved the definition
pub fn approved(output: &str, org: &str) -> bool {
    APPROVAL_LINE
        .captures_iter(output)
        .any(|c| &c[1] == org && &c[2] == "true")
}

/// Aggregates per-organization approvals into commit readiness.
///
/// Returns whether every listed organization approved, and the names of the
/// ones that have not. No approval lines at all reads as "not ready".
pub fn commit_readiness(output: &str) -> (bool, Vec<String>) {
    let mut listed = false;
    let mut unapproved = Vec::new();
    for capture in APPROVAL_LINE.captures_iter(output) {
        listed = true;
        if &capture[2] == "false" {
            unapproved.push(capture[1].to_string());
        }
    }
    if !listed && !output.trim().is_empty() {
        debug!("no approval lines in commit readiness output");
    }
    (listed && unapproved.is_empty(), unapproved)
}

/// Committed version and sequence of a chaincode definition.
///
/// A query against an uncommitted chaincode fails remotely or prints nothing
/// matching the grammar; both read as "not committed".
pub fn commit_status(output: &str) -> CommitStatus {
    let Some(capture) = COMMITTED.captures(output) else {
        if !output.trim().is_empty() {
            debug!("no committed definition in query output");
        }
        return CommitStatus::default();
    };
    // The grammar guarantees both captures parse.
    CommitStatus {
        committed: true,
        version: capture[1].parse().unwrap_or_default(),
        sequence: capture[2].parse().unwrap_or_default(),
    }
}
