//! Resumable fleet provisioning
//!
//! One pass over the fleet model, strictly sequential. Each cluster moves
//! Pending -> MasterProvisioned -> Complete, and every transition is persisted
//! before the next unit of work starts. A failure on a cluster's required path
//! stops that cluster only; persistence failures stop the whole run.
//!
//! Control-plane labels and add-ons have their own checkpoint (`addons_done`).
//! It is set only once they all went on cleanly, so an interrupted or partly
//! failed finish is replayed on the next run without touching the bootstrap.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use k3sd_common::{Cluster, ClusterStore, Error, Logger, NodeSpec, ProvisionConfig, Result};
use k3sd_remote::{execute_commands, execute_script, Connector, RemoteSession};

use crate::addons::install_addons;
use crate::api::ClusterApi;
use crate::commands::{bootstrap_commands, join_commands, relayed_join_commands, TOKEN_SCRIPT};
use crate::kubeconfig::repatriate_kubeconfig;
use crate::mesh::MeshCli;

/// A cluster whose required path failed
#[derive(Debug)]
pub struct ClusterFailure {
    /// Control-plane node name
    pub cluster: String,
    /// What stopped it
    pub error: Error,
}

/// Outcome of one pass over the fleet
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Clusters that went through without a required-path failure
    pub completed: Vec<String>,
    /// Clusters that stopped early
    pub failures: Vec<ClusterFailure>,
    /// Optional components that failed; these never stop a cluster
    pub optional_failures: Vec<Error>,
}

impl RunSummary {
    /// No cluster failed on its required path
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn record(&mut self, cluster: &str, error: Error) {
        self.failures.push(ClusterFailure {
            cluster: cluster.to_string(),
            error,
        });
    }
}

/// Drives the fleet model towards fully provisioned
pub struct Provisioner {
    connector: Arc<dyn Connector>,
    api: Arc<dyn ClusterApi>,
    mesh: Arc<dyn MeshCli>,
    store: Arc<dyn ClusterStore>,
    state_path: PathBuf,
    config: ProvisionConfig,
    logger: Logger,
}

impl Provisioner {
    /// Provisioner persisting checkpoints to `state_path` through `store`
    pub fn new(
        connector: Arc<dyn Connector>,
        api: Arc<dyn ClusterApi>,
        mesh: Arc<dyn MeshCli>,
        store: Arc<dyn ClusterStore>,
        state_path: impl Into<PathBuf>,
        config: ProvisionConfig,
        logger: Logger,
    ) -> Self {
        Self {
            connector,
            api,
            mesh,
            store,
            state_path: state_path.into(),
            config,
            logger,
        }
    }

    /// Provision every cluster in order, mutating `done` flags in place.
    ///
    /// Returns `Err` only when a checkpoint could not be persisted; every
    /// other failure is reported in the summary.
    pub async fn run(&self, clusters: &mut [Cluster]) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for idx in 0..clusters.len() {
            let name = clusters[idx].name().to_string();
            info!(
                run_id = %self.logger.run_id(),
                cluster = %name,
                state = %clusters[idx].state(),
                "provisioning cluster"
            );
            self.logger
                .log(format!("cluster {} is {}", name, clusters[idx].state()))
                .await;

            match self.provision_cluster(clusters, idx, &mut summary).await {
                Ok(()) => summary.completed.push(name),
                Err(e) if e.is_fatal_for_run() => return Err(e),
                Err(e) => {
                    warn!(cluster = %name, error = %e, "cluster provisioning stopped");
                    self.logger
                        .log_err(format!("cluster {} failed: {}", name, e))
                        .await;
                    summary.record(&name, e);
                }
            }
        }

        Ok(summary)
    }

    async fn provision_cluster(
        &self,
        clusters: &mut [Cluster],
        idx: usize,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let session = self.connector.connect(&clusters[idx].node).await?;
        let result = self.drive(session.as_ref(), clusters, idx, summary).await;
        session.close().await;

        let kubeconfig = result?;
        self.publish(&kubeconfig).await;
        Ok(())
    }

    /// Everything done over the control-plane session; returns the kubeconfig path
    async fn drive(
        &self,
        session: &dyn RemoteSession,
        clusters: &mut [Cluster],
        idx: usize,
        summary: &mut RunSummary,
    ) -> Result<PathBuf> {
        if !clusters[idx].done {
            let name = clusters[idx].name().to_string();
            self.logger
                .log(format!("bootstrapping control plane {}", name))
                .await;
            let commands = bootstrap_commands(
                &name,
                self.config.settle_delay.as_secs(),
                &self.config.extra_commands,
            );
            execute_commands(session, &commands, &self.logger).await?;

            clusters[idx].done = true;
            self.persist(clusters)?;
            info!(cluster = %name, "control plane bootstrapped");
        }

        let kubeconfig = repatriate_kubeconfig(session, &clusters[idx], &self.config, &self.logger).await?;

        if !clusters[idx].addons_done {
            self.finish_control_plane(clusters, idx, &kubeconfig, summary)
                .await?;
        }

        for worker_idx in clusters[idx].pending_workers() {
            self.join_worker(session, clusters, idx, worker_idx, &kubeconfig)
                .await?;
        }

        Ok(kubeconfig)
    }

    /// Label the control plane and install add-ons; checkpoint when all succeeded
    async fn finish_control_plane(
        &self,
        clusters: &mut [Cluster],
        idx: usize,
        kubeconfig: &Path,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let labelled = self.label(kubeconfig, &clusters[idx].node).await;
        let failures = install_addons(
            self.api.as_ref(),
            self.mesh.as_ref(),
            &clusters[idx],
            kubeconfig,
            &self.config,
            &self.logger,
        )
        .await;

        if !labelled || !failures.is_empty() {
            self.logger
                .log(format!(
                    "{} add-on step(s) on {} did not finish, retrying next run",
                    failures.len() + usize::from(!labelled),
                    clusters[idx].name()
                ))
                .await;
            summary.optional_failures.extend(failures);
            return Ok(());
        }

        clusters[idx].addons_done = true;
        self.persist(clusters)?;
        info!(cluster = %clusters[idx].name(), "add-ons installed");
        Ok(())
    }

    async fn join_worker(
        &self,
        session: &dyn RemoteSession,
        clusters: &mut [Cluster],
        idx: usize,
        worker_idx: usize,
        kubeconfig: &Path,
    ) -> Result<()> {
        let master_address = clusters[idx].node.address.clone();
        let private_net = clusters[idx].private_net;
        let worker = clusters[idx].workers[worker_idx].node.clone();

        self.logger
            .log(format!("joining worker {} to {}", worker.node_name, clusters[idx].name()))
            .await;

        let token = execute_script(session, TOKEN_SCRIPT).await?;
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::script(session.host(), Some(0), "k3s returned an empty join token"));
        }

        if private_net {
            let commands = relayed_join_commands(&master_address, token, &worker);
            execute_commands(session, &commands, &self.logger).await?;
        } else {
            let worker_session = self.connector.connect(&worker).await?;
            let commands = join_commands(&master_address, token, &worker);
            let result = execute_commands(worker_session.as_ref(), &commands, &self.logger).await;
            worker_session.close().await;
            result?;
        }

        clusters[idx].workers[worker_idx].done = true;
        self.persist(clusters)?;
        info!(cluster = %clusters[idx].name(), node = %worker.node_name, "worker joined");

        self.label(kubeconfig, &worker).await;
        Ok(())
    }

    /// Merge the node's labels; failures are only logged.
    ///
    /// Returns whether the node carries its labels.
    async fn label(&self, kubeconfig: &Path, node: &NodeSpec) -> bool {
        if node.labels.is_empty() {
            return true;
        }
        match self.api.label_node(kubeconfig, &node.node_name, &node.labels).await {
            Ok(()) => true,
            Err(e) => {
                warn!(node = %node.node_name, error = %e, "failed to label node");
                self.logger
                    .log_err(format!("failed to label node {}: {}", node.node_name, e))
                    .await;
                false
            }
        }
    }

    async fn publish(&self, kubeconfig: &Path) {
        match tokio::fs::read_to_string(kubeconfig).await {
            Ok(content) => self.logger.log_file(kubeconfig, content).await,
            Err(e) => debug!(path = %kubeconfig.display(), error = %e, "kubeconfig not published"),
        }
    }

    fn persist(&self, clusters: &[Cluster]) -> Result<()> {
        self.store.save(&self.state_path, clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockClusterApi;
    use crate::mesh::MockMeshCli;
    use crate::testing::{node, FakeFleet, MemoryStore};
    use k3sd_common::{Feature, Features, Worker};
    use k3sd_manifest::ApplyReport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        fleet: FakeFleet,
        store: Arc<MemoryStore>,
        _dir: tempfile::TempDir,
        provisioner: Provisioner,
    }

    fn harness(api: MockClusterApi, store: MemoryStore) -> Harness {
        harness_with(api, store, Features::none())
    }

    fn harness_with(api: MockClusterApi, store: MemoryStore, features: Features) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ProvisionConfig::new("abc123");
        config.kubeconfig_root = dir.path().to_path_buf();
        config.features = features;

        let fleet = FakeFleet::default();
        let store = Arc::new(store);
        let (logger, _rx) = Logger::channels("abc123", 1024);
        let provisioner = Provisioner::new(
            Arc::new(fleet.clone()),
            Arc::new(api),
            Arc::new(MockMeshCli::new()),
            store.clone(),
            dir.path().join("clusters.json"),
            config,
            logger,
        );
        Harness {
            fleet,
            store,
            _dir: dir,
            provisioner,
        }
    }

    fn cluster(address: &str, name: &str, done: bool, workers: &[(&str, &str, bool)]) -> Cluster {
        Cluster {
            node: node(address, name),
            domain: "example.com".to_string(),
            done,
            addons_done: done,
            workers: workers
                .iter()
                .map(|(a, n, d)| Worker {
                    node: node(a, n),
                    done: *d,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn finished_cluster_only_refetches_kubeconfig() {
        let h = harness(MockClusterApi::new(), MemoryStore::default());
        let mut clusters = vec![cluster("203.0.113.10", "master-1", true, &[("10.0.0.2", "w1", true)])];

        let summary = h.provisioner.run(&mut clusters).await.unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.completed, vec!["master-1".to_string()]);
        assert_eq!(h.fleet.connects(), vec!["203.0.113.10".to_string()]);
        let commands = h.fleet.commands_on("203.0.113.10");
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("cat /etc/rancher/k3s/k3s.yaml"));
        assert_eq!(h.store.save_count(), 0);

        let path = h.provisioner.config.kubeconfig_path("master-1");
        let saved = std::fs::read_to_string(path).unwrap();
        assert!(saved.contains("https://203.0.113.10:6443"));
    }

    #[tokio::test]
    async fn only_the_pending_worker_joins() {
        let h = harness(MockClusterApi::new(), MemoryStore::default());
        let mut clusters = vec![cluster(
            "203.0.113.10",
            "master-1",
            true,
            &[("10.0.0.2", "w1", true), ("10.0.0.3", "w2", false)],
        )];

        let summary = h.provisioner.run(&mut clusters).await.unwrap();

        assert!(summary.is_success());
        let master = h.fleet.commands_on("203.0.113.10");
        assert_eq!(master.len(), 2);
        assert!(master[1].contains("k3s token create"));
        assert!(h.fleet.commands_on("10.0.0.2").is_empty());

        let worker = h.fleet.commands_on("10.0.0.3");
        assert_eq!(worker.len(), 2);
        assert!(worker[1].contains("K3S_URL=https://203.0.113.10:6443"));
        assert!(worker[1].contains("K3S_TOKEN='K10token::server:abc'"));
        assert!(worker[1].contains("--node-name w2"));

        assert!(clusters[0].workers[1].done);
        assert_eq!(h.store.save_count(), 1);
        assert!(h.store.last().unwrap()[0].workers[1].done);
    }

    #[tokio::test]
    async fn private_workers_join_through_the_control_plane() {
        let h = harness(MockClusterApi::new(), MemoryStore::default());
        let mut c = cluster("203.0.113.10", "master-1", true, &[("10.0.0.2", "w1", false)]);
        c.private_net = true;
        let mut clusters = vec![c];

        h.provisioner.run(&mut clusters).await.unwrap();

        assert_eq!(h.fleet.connects(), vec!["203.0.113.10".to_string()]);
        let master = h.fleet.commands_on("203.0.113.10");
        assert_eq!(master.len(), 4);
        assert!(master[2..].iter().all(|c| c.starts_with("ssh root@10.0.0.2 '")));
        assert!(clusters[0].workers[0].done);
    }

    #[tokio::test]
    async fn failed_bootstrap_stops_only_that_cluster() {
        let h = harness(MockClusterApi::new(), MemoryStore::default());
        h.fleet.fail_on("get.k3s.io");
        let mut clusters = vec![
            cluster("203.0.113.10", "master-1", false, &[("10.0.0.2", "w1", false)]),
            cluster("203.0.113.20", "master-2", true, &[]),
        ];

        let summary = h.provisioner.run(&mut clusters).await.unwrap();

        assert!(!summary.is_success());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].cluster, "master-1");
        assert!(matches!(summary.failures[0].error, Error::Command { exit_status: Some(1), .. }));
        assert_eq!(summary.completed, vec!["master-2".to_string()]);

        assert!(!clusters[0].done);
        assert!(!clusters[0].workers[0].done);
        assert_eq!(h.store.save_count(), 0);
        // the sequence stopped at the failing install, before the settle delay
        assert!(h
            .fleet
            .commands_on("203.0.113.10")
            .iter()
            .all(|c| !c.starts_with("sleep")));
    }

    #[tokio::test]
    async fn fresh_bootstrap_persists_and_labels_control_plane() {
        let mut api = MockClusterApi::new();
        api.expect_label_node()
            .withf(|_, name, labels| name == "master-1" && labels.get("role").map(String::as_str) == Some("cp"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let h = harness(api, MemoryStore::default());
        let mut c = cluster("203.0.113.10", "master-1", false, &[]);
        c.node.labels.insert("role".to_string(), "cp".to_string());
        let mut clusters = vec![c];

        let summary = h.provisioner.run(&mut clusters).await.unwrap();

        assert!(summary.is_success());
        assert!(clusters[0].done);
        assert!(clusters[0].addons_done);
        assert_eq!(h.store.save_count(), 2);
        let commands = h.fleet.commands_on("203.0.113.10");
        assert!(commands[2].contains("--disable traefik --node-name master-1"));
        assert_eq!(commands[3], "sleep 10");
    }

    #[tokio::test]
    async fn failed_worker_keeps_earlier_joins() {
        let h = harness(MockClusterApi::new(), MemoryStore::default());
        h.fleet.fail_on("--node-name w2");
        let mut clusters = vec![cluster(
            "203.0.113.10",
            "master-1",
            true,
            &[("10.0.0.2", "w1", false), ("10.0.0.3", "w2", false)],
        )];

        let summary = h.provisioner.run(&mut clusters).await.unwrap();

        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].cluster, "master-1");
        assert!(matches!(summary.failures[0].error, Error::Command { .. }));
        assert!(clusters[0].workers[0].done);
        assert!(!clusters[0].workers[1].done);

        assert_eq!(h.store.save_count(), 1);
        let saved = h.store.last().unwrap();
        assert!(saved[0].workers[0].done);
        assert!(!saved[0].workers[1].done);

        // the next run only retries w2
        h.fleet.recover();
        let summary = h.provisioner.run(&mut clusters).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(h.fleet.commands_on("10.0.0.2").len(), 2);
        assert_eq!(h.fleet.commands_on("10.0.0.3").len(), 4);
        assert!(h.store.last().unwrap()[0].workers[1].done);
    }

    #[tokio::test]
    async fn addons_replay_after_kubeconfig_failure() {
        let mut api = MockClusterApi::new();
        api.expect_apply_manifest()
            .withf(|_, source, _| source.to_string().ends_with("traefik-values.yaml"))
            .times(1)
            .returning(|_, _, _| Ok(ApplyReport::default()));

        let h = harness_with(api, MemoryStore::default(), Features::none().with(Feature::TraefikValues));
        h.fleet.fail_on("k3s.yaml");
        let mut clusters = vec![cluster("203.0.113.10", "master-1", false, &[])];

        let first = h.provisioner.run(&mut clusters).await.unwrap();
        assert!(matches!(first.failures[0].error, Error::Script { .. }));
        assert!(clusters[0].done);
        assert!(!clusters[0].addons_done);
        let saved = h.store.last().unwrap();
        assert!(saved[0].done);
        assert!(!saved[0].addons_done);

        h.fleet.recover();
        let second = h.provisioner.run(&mut clusters).await.unwrap();
        assert!(second.is_success());
        assert!(clusters[0].addons_done);
        assert!(h.store.last().unwrap()[0].addons_done);

        let installs = h
            .fleet
            .commands_on("203.0.113.10")
            .iter()
            .filter(|c| c.contains("get.k3s.io"))
            .count();
        assert_eq!(installs, 1);
    }

    #[tokio::test]
    async fn failed_addon_is_retried_next_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut api = MockClusterApi::new();
        api.expect_apply_manifest().times(2).returning(move |_, _, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::manifest("yamls/traefik-values.yaml", "connection reset"))
            } else {
                Ok(ApplyReport::default())
            }
        });

        let h = harness_with(api, MemoryStore::default(), Features::none().with(Feature::TraefikValues));
        let mut clusters = vec![cluster("203.0.113.10", "master-1", false, &[])];

        let first = h.provisioner.run(&mut clusters).await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.optional_failures.len(), 1);
        assert!(clusters[0].done);
        assert!(!clusters[0].addons_done);

        let second = h.provisioner.run(&mut clusters).await.unwrap();
        assert!(second.is_success());
        assert!(second.optional_failures.is_empty());
        assert!(clusters[0].addons_done);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.store.save_count(), 2);
        let installs = h
            .fleet
            .commands_on("203.0.113.10")
            .iter()
            .filter(|c| c.contains("get.k3s.io"))
            .count();
        assert_eq!(installs, 1);
    }

    #[tokio::test]
    async fn label_failure_does_not_fail_the_cluster() {
        let mut api = MockClusterApi::new();
        api.expect_label_node()
            .returning(|_, _, _| Err(Error::validation("api unreachable")));

        let h = harness(api, MemoryStore::default());
        let mut c = cluster("203.0.113.10", "master-1", true, &[("10.0.0.2", "w1", false)]);
        c.workers[0].node.labels.insert("zone".to_string(), "a".to_string());
        let mut clusters = vec![c];

        let summary = h.provisioner.run(&mut clusters).await.unwrap();
        assert!(summary.is_success());
        assert!(clusters[0].workers[0].done);
    }

    #[tokio::test]
    async fn empty_token_aborts_the_cluster() {
        let h = harness(MockClusterApi::new(), MemoryStore::default());
        h.fleet.empty_token();
        let mut clusters = vec![cluster("203.0.113.10", "master-1", true, &[("10.0.0.2", "w1", false)])];

        let summary = h.provisioner.run(&mut clusters).await.unwrap();

        assert!(matches!(summary.failures[0].error, Error::Script { .. }));
        assert!(!clusters[0].workers[0].done);
        assert!(h.fleet.commands_on("10.0.0.2").is_empty());
    }

    #[tokio::test]
    async fn unreachable_cluster_is_reported() {
        let h = harness(MockClusterApi::new(), MemoryStore::default());
        h.fleet.unreachable("203.0.113.10");
        let mut clusters = vec![cluster("203.0.113.10", "master-1", false, &[])];

        let summary = h.provisioner.run(&mut clusters).await.unwrap();
        assert!(matches!(summary.failures[0].error, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn persistence_failure_is_fatal() {
        let h = harness(MockClusterApi::new(), MemoryStore::broken());
        let mut clusters = vec![
            cluster("203.0.113.10", "master-1", false, &[]),
            cluster("203.0.113.20", "master-2", false, &[]),
        ];

        let err = h.provisioner.run(&mut clusters).await.unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        assert!(h.fleet.commands_on("203.0.113.20").is_empty());
    }
}
