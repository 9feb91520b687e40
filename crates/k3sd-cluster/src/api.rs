//! What the orchestrator needs from a provisioned cluster's API

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use k3sd_common::{kube_utils, Logger, Result};
use k3sd_helm::{ChartInstaller, ChartRequest, InstallOutcome};
use k3sd_manifest::{ApplyReport, CreateOnlyApplier, ManifestEngine, ManifestSource, Substitutions};

/// Cluster-side operations, addressed by kubeconfig path
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Merge `labels` onto node `node_name`
    async fn label_node(
        &self,
        kubeconfig: &Path,
        node_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Create every document of `source`, after substitution
    async fn apply_manifest(
        &self,
        kubeconfig: &Path,
        source: &ManifestSource,
        substitutions: &Substitutions,
    ) -> Result<ApplyReport>;

    /// Install or upgrade a chart
    async fn install_chart(&self, request: &ChartRequest) -> Result<InstallOutcome>;
}

/// [`ClusterApi`] talking to real clusters
pub struct LiveClusterApi {
    charts: ChartInstaller,
    logger: Logger,
}

impl LiveClusterApi {
    /// API using `charts` for helm releases
    pub fn new(charts: ChartInstaller, logger: Logger) -> Self {
        Self { charts, logger }
    }
}

#[async_trait]
impl ClusterApi for LiveClusterApi {
    async fn label_node(
        &self,
        kubeconfig: &Path,
        node_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let client = kube_utils::create_client(kubeconfig).await?;
        kube_utils::patch_node_labels(&client, node_name, labels).await
    }

    async fn apply_manifest(
        &self,
        kubeconfig: &Path,
        source: &ManifestSource,
        substitutions: &Substitutions,
    ) -> Result<ApplyReport> {
        let client = kube_utils::create_client(kubeconfig).await?;
        let engine = ManifestEngine::new(Arc::new(CreateOnlyApplier::new(client)), self.logger.clone());
        engine.apply_source(source, substitutions).await
    }

    async fn install_chart(&self, request: &ChartRequest) -> Result<InstallOutcome> {
        self.charts.install_or_upgrade(request).await
    }
}
