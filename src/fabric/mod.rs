//! Deploy Hyperledger Fabric components onto a Kubernetes cluster.
//!
//! The cluster and the chart engine are consumed through the `kubectl` and
//! `helm` binaries only; the Fabric control plane is driven by shelling into
//! pods and interpreting the text output of the `peer` CLI (see [`status`]).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error as ThisError;

pub mod chaincode;
pub mod channel;
pub mod exec;
pub mod helm;
pub mod orderer;
pub mod package;
pub mod peer;
pub mod secrets;
pub mod status;
#[cfg(test)]
pub(crate) mod testing;
pub mod transfer;
pub mod watch;

pub const CMD: &str = "deploy";
pub const ORDERER_CMD: &str = "orderer";
pub const PEER_CMD: &str = "peer";
pub const CHANNEL_CMD: &str = "channel";
pub const CHAINCODE_CMD: &str = "chaincode";

/// Label key carrying the component id of a deployed resource
pub const COMPONENT_LABEL: &str = "fabric/cid";

/// Label key carrying the owning organization of a deployed resource
pub const ORG_LABEL: &str = "fabric/org";

/// Label key carrying the owning peer of a deployed resource
pub const PEER_LABEL: &str = "fabric/peer";

/// Label key carrying the network domain of a deployed resource
pub const DOMAIN_LABEL: &str = "fabric/domain";

/// Port the ordering service is reachable on from inside shell pods
pub const ORDERER_PORT: u16 = 443;

/// Port peers expose for endorsement traffic
pub const PEER_PORT: u16 = 443;

/// Port a chaincode service listens on for peer connections
pub const CHAINCODE_PORT: u16 = 7052;

/// Default readiness timeout (seconds)
const DEFAULT_READY_TIMEOUT: u64 = 300;

/// Default interval between slow-wait warnings (seconds)
const DEFAULT_WARN_INTERVAL: u64 = 15;

/// Hook invoked with captured stderr when a remote command fails.
///
/// The CLI layer uses this to offer an interactive dump of the full output;
/// non-interactive callers leave it unset.
pub type StderrHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Errors that can occur while deploying Fabric components
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("could not render json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid arguments: {}", .0.join("; "))]
    InvalidArguments(Vec<String>),
    #[error("transport: {0}")]
    Transport(String),
    #[error("remote command failed: {command}")]
    RemoteCommand { command: String, stderr: String },
    #[error("chart install failed for release {release}")]
    ChartInstall { release: String, stderr: String },
    #[error("{what} was not ready after {timeout:?}")]
    NotReady { what: String, timeout: Duration },
    #[error("no pod matched selector {0}")]
    NoSuchPod(String),
    #[error("no package identifier in install output")]
    MissingPackageId,
    #[error("organizations have not approved the definition: {}", .0.join(", "))]
    UnapprovedOrganizations(Vec<String>),
}

/// Mapping from organization name to the peer hostnames it operates.
///
/// Iteration order is insertion order; every multi-party step processes the
/// network in this order, so it is part of the observable contract.
#[derive(Clone, Debug, Default)]
pub struct OrgPeerSet(IndexMap<String, Vec<String>>);

impl OrgPeerSet {
    pub fn insert(&mut self, org: &str, peer: &str) {
        let peers = self.0.entry(org.to_string()).or_default();
        if !peers.iter().any(|p| p == peer) {
            peers.push(peer.to_string());
        }
    }

    /// Iterates over every (organization, peer) pair in insertion order
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(org, peers)| peers.iter().map(move |p| (org.as_str(), p.as_str())))
    }

    /// First (organization, peer) pair, if any
    pub fn first(&self) -> Option<(&str, &str)> {
        self.pairs().next()
    }
}

#[derive(Serialize, Deserialize, Clone)]
pub struct OrdererConfig {
    /// Fully-qualified hostname of the ordering service
    pub domain: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct OrganizationConfig {
    pub name: String,
    #[serde(rename = "mspID")]
    pub msp_id: String,
    /// Organization domain; defaults to `<name>.<network domain>`
    pub domain: Option<String>,
    pub peers: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Timeouts {
    /// Seconds to wait for a resource to become ready
    #[serde(default = "default_ready_timeout")]
    pub ready: u64,
    /// Seconds between slow-wait warnings
    #[serde(default = "default_warn_interval")]
    pub warn: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: DEFAULT_READY_TIMEOUT,
            warn: DEFAULT_WARN_INTERVAL,
        }
    }
}

fn default_ready_timeout() -> u64 {
    DEFAULT_READY_TIMEOUT
}

fn default_warn_interval() -> u64 {
    DEFAULT_WARN_INTERVAL
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Per-component chart value overrides, passed through to `helm` untouched
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct ValueOverrides {
    #[serde(default)]
    pub orderer: serde_json::Value,
    #[serde(default)]
    pub peer: serde_json::Value,
    #[serde(default)]
    pub chaincode: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    /// Root domain of the network
    pub domain: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub orderer: OrdererConfig,
    /// Directory holding the chart templates
    pub charts: PathBuf,
    /// Directory holding generated crypto material
    pub crypto: PathBuf,
    /// Directory holding generated channel artifacts
    pub artifacts: PathBuf,
    pub organizations: Vec<OrganizationConfig>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub values: ValueOverrides,
}

impl Config {
    /// Loads and validates a configuration from a YAML file.
    ///
    /// Validation issues are aggregated so a single run reports everything
    /// wrong with the file, before any remote call is attempted.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config: Config = {
            let config_file = File::open(path)?;
            serde_yaml::from_reader(config_file)?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut issues = Vec::new();
        if self.domain.is_empty() {
            issues.push("domain must not be empty".to_string());
        }
        if self.orderer.domain.is_empty() {
            issues.push("orderer.domain must not be empty".to_string());
        }
        if self.organizations.is_empty() {
            issues.push("at least one organization is required".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for org in &self.organizations {
            if !seen.insert(org.name.as_str()) {
                issues.push(format!("duplicate organization {}", org.name));
            }
            if org.msp_id.is_empty() {
                issues.push(format!("organization {} is missing mspID", org.name));
            }
            if org.peers.is_empty() {
                issues.push(format!("organization {} has no peers", org.name));
            }
            let mut peers = std::collections::HashSet::new();
            for peer in &org.peers {
                if !peers.insert(peer.as_str()) {
                    issues.push(format!("duplicate peer {} in organization {}", peer, org.name));
                }
            }
        }
        if self.timeouts.ready == 0 {
            issues.push("timeouts.ready must be positive".to_string());
        }
        if self.timeouts.warn == 0 {
            issues.push("timeouts.warn must be positive".to_string());
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidArguments(issues))
        }
    }

    /// Looks up an organization by name
    pub fn org(&self, name: &str) -> Result<&OrganizationConfig, Error> {
        self.organizations
            .iter()
            .find(|o| o.name == name)
            .ok_or_else(|| {
                Error::InvalidArguments(vec![format!("unknown organization {name}")])
            })
    }

    /// Domain of an organization (explicit or derived from the network domain)
    pub fn org_domain(&self, org: &OrganizationConfig) -> String {
        org.domain
            .clone()
            .unwrap_or_else(|| format!("{}.{}", org.name, self.domain))
    }

    /// Every (organization, peer) pair in configuration order
    pub fn org_peers(&self) -> OrgPeerSet {
        let mut set = OrgPeerSet::default();
        for org in &self.organizations {
            for peer in &org.peers {
                set.insert(&org.name, peer);
            }
        }
        set
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.ready)
    }

    pub fn warn_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts.warn)
    }

    /// Address of the ordering service as seen from shell pods
    pub fn orderer_address(&self) -> String {
        format!("{}:{}", self.orderer.domain, ORDERER_PORT)
    }

    /// External address of a peer as seen from shell pods
    pub fn peer_address(&self, org: &OrganizationConfig, peer: &str) -> String {
        format!("{}.{}:{}", peer, self.org_domain(org), PEER_PORT)
    }

    /// TLS directory of a peer inside the crypto-material tree
    pub fn peer_tls_dir(&self, org: &OrganizationConfig, peer: &str) -> PathBuf {
        let org_domain = self.org_domain(org);
        self.crypto
            .join("peerOrganizations")
            .join(&org_domain)
            .join("peers")
            .join(format!("{peer}.{org_domain}"))
            .join("tls")
    }

    /// TLS directory of the orderer inside the crypto-material tree
    pub fn orderer_tls_dir(&self) -> PathBuf {
        self.crypto
            .join("ordererOrganizations")
            .join(&self.domain)
            .join("orderers")
            .join(&self.orderer.domain)
            .join("tls")
    }

    /// Path of a peer's TLS root certificate inside shell pods.
    ///
    /// The shell pod mounts the crypto-material tree at `/crypto-config`;
    /// this path is part of the contract with the chart templates.
    pub fn peer_tls_root(&self, org: &OrganizationConfig, peer: &str) -> String {
        let org_domain = self.org_domain(org);
        format!(
            "/crypto-config/peerOrganizations/{org_domain}/peers/{peer}.{org_domain}/tls/ca.crt"
        )
    }
}

/// Release name of a peer deployment
pub fn peer_release(org: &str, peer: &str) -> String {
    format!("{peer}-{org}")
}

/// Release name of a chaincode service deployment
pub fn chaincode_release(chaincode: &str, org: &str, peer: &str) -> String {
    format!("{chaincode}-{org}-{peer}")
}

/// Selector matching the ordering service pod of a network
pub fn orderer_selector(domain: &str) -> String {
    format!("{COMPONENT_LABEL}=orderer,{DOMAIN_LABEL}={domain}")
}

/// Selector matching one peer pod
pub fn peer_selector(org: &str, peer: &str) -> String {
    format!("{COMPONENT_LABEL}=peer,{ORG_LABEL}={org},{PEER_LABEL}={peer}")
}

/// Selector matching the shell pod colocated with one peer
pub fn cli_selector(org: &str, peer: &str) -> String {
    format!("{COMPONENT_LABEL}=cli,{ORG_LABEL}={org},{PEER_LABEL}={peer}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(name: &str, msp: &str, peers: &[&str]) -> OrganizationConfig {
        OrganizationConfig {
            name: name.to_string(),
            msp_id: msp.to_string(),
            domain: None,
            peers: peers.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn config() -> Config {
        Config {
            domain: "example.com".to_string(),
            namespace: "fabric".to_string(),
            orderer: OrdererConfig {
                domain: "orderer.example.com".to_string(),
            },
            charts: PathBuf::from("./charts"),
            crypto: PathBuf::from("./crypto-config"),
            artifacts: PathBuf::from("./channel-artifacts"),
            organizations: vec![org("org1", "Org1MSP", &["peer0"]), org("org2", "Org2MSP", &["peer0"])],
            timeouts: Timeouts::default(),
            values: ValueOverrides::default(),
        }
    }

    #[test]
    fn validate_aggregates_every_issue() {
        let mut bad = config();
        bad.domain = String::new();
        bad.organizations[1].msp_id = String::new();
        bad.organizations[1].peers = vec![];
        let Err(Error::InvalidArguments(issues)) = bad.validate() else {
            panic!("expected aggregated validation failure");
        };
        assert_eq!(issues.len(), 3);
    }

    #[test]
    fn validate_rejects_duplicates() {
        let mut bad = config();
        bad.organizations.push(org("org1", "Org1MSP", &["peer0", "peer0"]));
        let Err(Error::InvalidArguments(issues)) = bad.validate() else {
            panic!("expected aggregated validation failure");
        };
        assert!(issues.iter().any(|i| i.contains("duplicate organization")));
        assert!(issues.iter().any(|i| i.contains("duplicate peer")));
    }

    #[test]
    fn org_peers_preserves_insertion_order() {
        let pairs: Vec<_> = config().org_peers().pairs().map(|(o, p)| (o.to_string(), p.to_string())).collect();
        assert_eq!(
            pairs,
            vec![
                ("org1".to_string(), "peer0".to_string()),
                ("org2".to_string(), "peer0".to_string()),
            ]
        );
    }

    #[test]
    fn org_peer_set_deduplicates() {
        let mut set = OrgPeerSet::default();
        set.insert("org1", "peer0");
        set.insert("org1", "peer0");
        set.insert("org1", "peer1");
        assert_eq!(set.pairs().count(), 2);
    }

    #[test]
    fn derived_addresses() {
        let config = config();
        assert_eq!(config.orderer_address(), "orderer.example.com:443");
        let org = config.org("org1").unwrap().clone();
        assert_eq!(config.peer_address(&org, "peer0"), "peer0.org1.example.com:443");
        assert_eq!(
            config.peer_tls_root(&org, "peer0"),
            "/crypto-config/peerOrganizations/org1.example.com/peers/peer0.org1.example.com/tls/ca.crt"
        );
    }
}
