//! Create command - provision every cluster in the state file
//!
//! Usage: k3sd create --config-path <file> [feature flags]
//!
//! Clusters already marked done are not bootstrapped again; their kubeconfig
//! is refreshed and any pending workers are joined. Ctrl-C stops the run and
//! saves the state file before exiting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use tracing::{info, warn};

use k3sd_cluster::{LinkerdCli, LiveClusterApi, Provisioner};
use k3sd_common::logger::DEFAULT_QUEUE_CAPACITY;
use k3sd_common::{ClusterStore, Feature, Features, HelmSettings, JsonFileStore, Logger, ProvisionConfig};
use k3sd_helm::{ChartInstaller, HelmCli, KubeNamespaces};
use k3sd_remote::SshConnector;

use super::{finish, until_interrupted, CommonArgs};
use crate::{Error, Result};

/// Provision the fleet described in the state file
#[derive(Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Install cert-manager
    #[arg(long)]
    pub cert_manager: bool,

    /// Apply Traefik values
    #[arg(long)]
    pub traefik: bool,

    /// Apply the ACME ClusterIssuer for the cluster domain
    #[arg(long)]
    pub cluster_issuer: bool,

    /// Deploy Gitea
    #[arg(long)]
    pub gitea: bool,

    /// Expose Gitea through an ingress on the cluster domain
    #[arg(long)]
    pub gitea_ingress: bool,

    /// Install kube-prometheus-stack
    #[arg(long)]
    pub prometheus: bool,

    /// Install the Linkerd mesh
    #[arg(long)]
    pub linkerd: bool,

    /// Install Linkerd with the multicluster extension
    #[arg(long = "linkerd-mc")]
    pub linkerd_mc: bool,

    /// Roll back failed helm installs and upgrades
    #[arg(long)]
    pub helm_atomic: bool,

    /// Extra command run on each new control plane after k3s is installed (repeatable)
    #[arg(long = "command", value_name = "CMD")]
    pub commands: Vec<String>,

    /// Root directory kubeconfigs are written under
    #[arg(long, default_value = "kubeconfigs")]
    pub kubeconfig_root: PathBuf,

    /// Directory holding add-on manifests and values files
    #[arg(long, default_value = "yamls")]
    pub manifest_dir: PathBuf,

    /// Directory for helm repository configuration and cache
    #[arg(long, default_value = ".helm")]
    pub helm_data_dir: PathBuf,
}

impl CreateArgs {
    /// Feature set selected by the flags
    pub fn features(&self) -> Features {
        [
            (self.cert_manager, Feature::CertManager),
            (self.traefik, Feature::TraefikValues),
            (self.cluster_issuer, Feature::ClusterIssuer),
            (self.gitea, Feature::Gitea),
            (self.gitea_ingress, Feature::GiteaIngress),
            (self.prometheus, Feature::Prometheus),
            (self.linkerd, Feature::Linkerd),
            (self.linkerd_mc, Feature::LinkerdMulticluster),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .map(|(_, feature)| feature)
        .collect()
    }

    /// Full configuration for this run
    pub fn provision_config(&self) -> ProvisionConfig {
        let mut config = self.common.provision_config();
        config.kubeconfig_root = self.kubeconfig_root.clone();
        config.manifest_dir = self.manifest_dir.clone();
        config.features = self.features();
        config.helm = HelmSettings::new(&self.helm_data_dir, self.helm_atomic);
        config.extra_commands = self.commands.clone();
        config
    }
}

fn build_provisioner(
    config: ProvisionConfig,
    store: Arc<dyn ClusterStore>,
    state_path: &Path,
    logger: &Logger,
) -> Provisioner {
    let connector = Arc::new(SshConnector::new(config.key_dir(), config.host_key_policy));
    let charts = ChartInstaller::new(
        Arc::new(HelmCli::new(config.helm.clone())),
        Arc::new(KubeNamespaces),
        config.helm.clone(),
        logger.clone(),
    );
    let api = Arc::new(LiveClusterApi::new(charts, logger.clone()));
    Provisioner::new(
        connector,
        api,
        Arc::new(LinkerdCli::default()),
        store,
        state_path,
        config,
        logger.clone(),
    )
}

pub async fn run(args: CreateArgs) -> Result<()> {
    let config = args.provision_config();
    let state_path = args.common.config_path.clone();
    let store: Arc<dyn ClusterStore> = Arc::new(JsonFileStore);
    let mut clusters = store.load(&state_path)?;
    if clusters.is_empty() {
        return Err(Error::validation(format!(
            "no clusters in {}",
            state_path.display()
        )));
    }

    info!(
        run_id = %config.run_id,
        clusters = clusters.len(),
        features = ?config.features.iter().map(|f| f.name()).collect::<Vec<_>>(),
        "starting provisioning run"
    );
    let (logger, receivers) = Logger::channels(config.run_id.as_str(), DEFAULT_QUEUE_CAPACITY);
    let workers = receivers.spawn(args.common.verbose);

    let outcome = {
        let provisioner = build_provisioner(config, store.clone(), &state_path, &logger);
        until_interrupted(provisioner.run(&mut clusters)).await
    };

    // every sender must be gone before the consumers can drain and exit
    drop(logger);
    workers.shutdown().await;

    match outcome {
        Some(result) => {
            let summary = result?;
            store.save(&state_path, &clusters)?;
            finish("provisioned", &summary)
        }
        None => {
            warn!("interrupted, saving state");
            store.save(&state_path, &clusters)?;
            Err(Error::Interrupted { path: state_path })
        }
    }
}
