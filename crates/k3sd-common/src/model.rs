//! Persisted fleet model
//!
//! The state file is a JSON array of [`Cluster`] records. Clusters and workers
//! share their connection/identity fields through [`NodeSpec`], flattened into
//! each record so the on-disk shape stays a single flat object per node.
//!
//! `done` flags and `addonsDone` are the only checkpoints: they flip to `true`
//! when a unit of work completes and are only reset by uninstall.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Connection and identity fields shared by control-plane and worker nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// IP address or hostname, optionally with `:port`
    pub address: String,
    /// Remote SSH user
    pub user: String,
    /// SSH password; empty means key-only authentication
    #[serde(default)]
    pub password: String,
    /// Kubernetes node name
    pub node_name: String,
    /// Labels merged onto the Kubernetes node
    #[serde(default, deserialize_with = "deserialize_labels")]
    pub labels: BTreeMap<String, String>,
}

/// A worker node of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    /// Connection and identity fields
    #[serde(flatten)]
    pub node: NodeSpec,
    /// Whether the worker has joined the cluster
    #[serde(default)]
    pub done: bool,
}

/// Database credentials consumed by the application manifests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCredentials {
    /// Database user
    #[serde(default)]
    pub username: String,
    /// Database password
    #[serde(default)]
    pub password: String,
    /// Database name
    #[serde(default)]
    pub db_name: String,
}

/// Application sub-configuration of a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Credentials of the application's database
    #[serde(default, alias = "pg")]
    pub database: DatabaseCredentials,
}

/// A cluster: its control-plane node plus an ordered list of workers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Connection and identity fields of the control-plane node
    #[serde(flatten)]
    pub node: NodeSpec,
    /// Public domain used by ingress and certificate issuers
    #[serde(default)]
    pub domain: String,
    /// Workers are only reachable from the control-plane node
    #[serde(default)]
    pub private_net: bool,
    /// Whether the control plane has been bootstrapped
    #[serde(default)]
    pub done: bool,
    /// Whether the control-plane labels and every enabled add-on went on cleanly
    #[serde(default)]
    pub addons_done: bool,
    /// Optional application configuration
    #[serde(default, alias = "gitea", skip_serializing_if = "Option::is_none")]
    pub app: Option<AppConfig>,
    /// Workers, joined in order
    #[serde(default)]
    pub workers: Vec<Worker>,
}

/// Provisioning state of a cluster, derived from its `done` flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    /// Control plane not bootstrapped yet
    Pending,
    /// Control plane up, at least one worker still to join
    MasterProvisioned,
    /// Control plane up and every worker joined
    Complete,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::MasterProvisioned => write!(f, "MasterProvisioned"),
            Self::Complete => write!(f, "Complete"),
        }
    }
}

impl Cluster {
    /// Kubernetes node name of the control plane
    pub fn name(&self) -> &str {
        &self.node.node_name
    }

    /// Current provisioning state
    pub fn state(&self) -> ProvisionState {
        if !self.done {
            ProvisionState::Pending
        } else if self.workers.iter().all(|w| w.done) {
            ProvisionState::Complete
        } else {
            ProvisionState::MasterProvisioned
        }
    }

    /// Indices of workers that still have to join
    pub fn pending_workers(&self) -> Vec<usize> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.done)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Accept labels either as a JSON object or as a legacy `k=v,k2=v2` string.
fn deserialize_labels<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Labels {
        Map(BTreeMap<String, String>),
        Text(String),
        Null(()),
    }

    match Labels::deserialize(deserializer)? {
        Labels::Map(map) => Ok(map),
        Labels::Text(text) => parse_label_string(&text).map_err(serde::de::Error::custom),
        Labels::Null(()) => Ok(BTreeMap::new()),
    }
}

/// Parse a `k=v,k2=v2` label string.
///
/// Empty segments are ignored; a segment without `=` is rejected.
pub fn parse_label_string(text: &str) -> Result<BTreeMap<String, String>, String> {
    let mut labels = BTreeMap::new();
    for segment in text.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment
            .split_once('=')
            .ok_or_else(|| format!("invalid label '{}', expected key=value", segment))?;
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(labels)
}
