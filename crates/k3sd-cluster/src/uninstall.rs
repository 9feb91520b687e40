//! Fleet teardown
//!
//! Workers are removed through the control-plane node, then k3s itself. Every
//! `done` flag is reset so the next `create` starts from scratch.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use k3sd_common::{Cluster, ClusterStore, Error, Logger, Result};
use k3sd_remote::{execute_commands, relay, Connector, RemoteSession};

use crate::commands::{AGENT_UNINSTALL, SERVER_UNINSTALL};
use crate::provisioner::RunSummary;

/// Tears k3s down on every node of the fleet
pub struct Uninstaller {
    connector: Arc<dyn Connector>,
    store: Arc<dyn ClusterStore>,
    state_path: PathBuf,
    logger: Logger,
}

impl Uninstaller {
    /// Uninstaller persisting reset flags to `state_path`
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn ClusterStore>,
        state_path: impl Into<PathBuf>,
        logger: Logger,
    ) -> Self {
        Self {
            connector,
            store,
            state_path: state_path.into(),
            logger,
        }
    }

    /// Uninstall every cluster. Only a failed save returns `Err`.
    pub async fn run(&self, clusters: &mut [Cluster]) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for idx in 0..clusters.len() {
            let name = clusters[idx].name().to_string();
            info!(run_id = %self.logger.run_id(), cluster = %name, "uninstalling cluster");
            let session = match self.connector.connect(&clusters[idx].node).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(cluster = %name, error = %e, "cannot reach control plane");
                    self.logger
                        .log_err(format!("cluster {} skipped: {}", name, e))
                        .await;
                    summary.record(&name, e);
                    continue;
                }
            };

            self.teardown(session.as_ref(), &mut clusters[idx]).await;
            session.close().await;

            self.store.save(&self.state_path, clusters)?;
            info!(cluster = %name, "cluster uninstalled");
            summary.completed.push(name);
        }

        Ok(summary)
    }

    async fn teardown(&self, session: &dyn RemoteSession, cluster: &mut Cluster) {
        for worker in cluster.workers.iter_mut() {
            self.logger
                .log(format!("uninstalling k3s agent on {}", worker.node.node_name))
                .await;
            let command = relay(&worker.node, AGENT_UNINSTALL);
            if let Err(e) = execute_commands(session, &[command], &self.logger).await {
                self.report(&worker.node.node_name, e).await;
            }
            worker.done = false;
        }

        self.logger
            .log(format!("uninstalling k3s server on {}", cluster.name()))
            .await;
        if let Err(e) = execute_commands(session, &[SERVER_UNINSTALL], &self.logger).await {
            self.report(cluster.name(), e).await;
        }
        cluster.done = false;
        cluster.addons_done = false;
    }

    async fn report(&self, node: &str, error: Error) {
        warn!(node = %node, error = %error, "uninstall step failed");
        self.logger
            .log_err(format!("uninstall on {} failed: {}", node, error))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{node, FakeFleet, MemoryStore};
    use k3sd_common::Worker;

    fn fleet_model() -> Vec<Cluster> {
        vec![
            Cluster {
                node: node("203.0.113.10", "master-1"),
                done: true,
                addons_done: true,
                workers: vec![
                    Worker { node: node("10.0.0.2", "w1"), done: true },
                    Worker { node: node("10.0.0.3", "w2"), done: true },
                ],
                ..Default::default()
            },
            Cluster {
                node: node("203.0.113.20", "master-2"),
                done: true,
                ..Default::default()
            },
        ]
    }

    fn uninstaller(fleet: &FakeFleet, store: Arc<MemoryStore>) -> Uninstaller {
        let (logger, _rx) = Logger::channels("r", 16);
        Uninstaller::new(Arc::new(fleet.clone()), store, "clusters.json", logger)
    }

    #[tokio::test]
    async fn resets_every_flag_and_relays_agent_uninstall() {
        let fleet = FakeFleet::default();
        let store = Arc::new(MemoryStore::default());
        let mut clusters = fleet_model();

        let summary = uninstaller(&fleet, store.clone()).run(&mut clusters).await.unwrap();

        assert!(summary.is_success());
        assert_eq!(fleet.connects(), vec!["203.0.113.10".to_string(), "203.0.113.20".to_string()]);
        assert_eq!(
            fleet.commands_on("203.0.113.10"),
            vec![
                "ssh root@10.0.0.2 'k3s-agent-uninstall.sh'".to_string(),
                "ssh root@10.0.0.3 'k3s-agent-uninstall.sh'".to_string(),
                "k3s-uninstall.sh".to_string(),
            ]
        );
        assert!(clusters
            .iter()
            .all(|c| !c.done && !c.addons_done && c.workers.iter().all(|w| !w.done)));
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn failed_steps_are_logged_and_flags_still_reset() {
        let fleet = FakeFleet::default();
        fleet.fail_on("k3s-agent-uninstall.sh");
        let store = Arc::new(MemoryStore::default());
        let mut clusters = fleet_model();

        let summary = uninstaller(&fleet, store).run(&mut clusters).await.unwrap();

        assert!(summary.is_success());
        assert!(!clusters[0].done);
        assert!(!clusters[0].workers[1].done);
        assert!(fleet
            .commands_on("203.0.113.10")
            .contains(&"k3s-uninstall.sh".to_string()));
    }

    #[tokio::test]
    async fn unreachable_cluster_is_left_untouched() {
        let fleet = FakeFleet::default();
        fleet.unreachable("203.0.113.10");
        let store = Arc::new(MemoryStore::default());
        let mut clusters = fleet_model();

        let summary = uninstaller(&fleet, store).run(&mut clusters).await.unwrap();

        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].cluster, "master-1");
        assert!(clusters[0].done);
        assert!(clusters[0].addons_done);
        assert!(!clusters[1].done);
    }
}
