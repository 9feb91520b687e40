//! Fakes shared by the provisioner and uninstall tests

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use k3sd_common::{Cluster, ClusterStore, Error, NodeSpec, Result};
use k3sd_remote::{Connector, RemoteSession};

pub(crate) const K3S_YAML: &str = r#"apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTg==
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
preferences: {}
users:
- name: default
  user:
    client-certificate-data: LS0tLS1CRUdJTg==
    client-key-data: LS0tLS1CRUdJTg==
"#;

#[derive(Default)]
struct FleetState {
    connects: Vec<String>,
    commands: Vec<(String, String)>,
    failing: Vec<String>,
    unreachable: Vec<String>,
    empty_token: bool,
}

/// Scripted hosts: every command succeeds unless it matches a failing pattern
#[derive(Clone, Default)]
pub(crate) struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeFleet {
    pub(crate) fn fail_on(&self, pattern: &str) {
        self.state.lock().unwrap().failing.push(pattern.to_string());
    }

    /// Stop failing commands; the next run sees healthy hosts
    pub(crate) fn recover(&self) {
        self.state.lock().unwrap().failing.clear();
    }

    pub(crate) fn unreachable(&self, host: &str) {
        self.state.lock().unwrap().unreachable.push(host.to_string());
    }

    pub(crate) fn empty_token(&self) {
        self.state.lock().unwrap().empty_token = true;
    }

    pub(crate) fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    pub(crate) fn commands_on(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for FakeFleet {
    async fn connect(&self, node: &NodeSpec) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(&node.address) {
            return Err(Error::connection(&node.address, "connection refused"));
        }
        state.connects.push(node.address.clone());
        Ok(Box::new(FakeSession {
            host: node.address.clone(),
            fleet: self.clone(),
        }))
    }
}

struct FakeSession {
    host: String,
    fleet: FakeFleet,
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(
        &self,
        command: &str,
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
    ) -> Result<u32> {
        let (fails, empty_token) = {
            let mut state = self.fleet.state.lock().unwrap();
            state.commands.push((self.host.clone(), command.to_string()));
            let fails = state.failing.iter().any(|p| command.contains(p.as_str()));
            (fails, state.empty_token)
        };

        if fails {
            let _ = stderr.send(b"boom\n".to_vec()).await;
            return Ok(1);
        }
        if command.contains("k3s token create") {
            let token: &[u8] = if empty_token { b"\n" } else { b"K10token::server:abc\n" };
            let _ = stdout.send(token.to_vec()).await;
        } else if command.contains("k3s.yaml") {
            let _ = stdout.send(K3S_YAML.as_bytes().to_vec()).await;
        }
        Ok(0)
    }
}

/// Store keeping every saved snapshot in memory
#[derive(Default)]
pub(crate) struct MemoryStore {
    pub(crate) saves: Mutex<Vec<Vec<Cluster>>>,
    pub(crate) broken: bool,
}

impl MemoryStore {
    pub(crate) fn broken() -> Self {
        Self {
            broken: true,
            ..Default::default()
        }
    }

    pub(crate) fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    pub(crate) fn last(&self) -> Option<Vec<Cluster>> {
        self.saves.lock().unwrap().last().cloned()
    }
}

impl ClusterStore for MemoryStore {
    fn load(&self, path: &Path) -> Result<Vec<Cluster>> {
        Err(Error::persistence(path, "not backed by a file"))
    }

    fn save(&self, path: &Path, clusters: &[Cluster]) -> Result<()> {
        if self.broken {
            return Err(Error::persistence(path, "disk full"));
        }
        self.saves.lock().unwrap().push(clusters.to_vec());
        Ok(())
    }
}

pub(crate) fn node(address: &str, name: &str) -> NodeSpec {
    NodeSpec {
        address: address.to_string(),
        user: "root".to_string(),
        node_name: name.to_string(),
        ..Default::default()
    }
}
