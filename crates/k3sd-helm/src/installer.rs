//! Install-or-upgrade decision

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use k3sd_common::{kube_utils, Error, HelmSettings, Logger, Result, DEFAULT_NAMESPACE};

use crate::backend::{HelmBackend, ReleaseAction};

/// Namespaces that always exist and are never created
const BUILTIN_NAMESPACES: [&str; 2] = [DEFAULT_NAMESPACE, "kube-system"];

/// Creates namespaces on a target cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceProvisioner: Send + Sync {
    /// Make sure `namespace` exists; an existing one is fine
    async fn ensure_namespace(&self, kubeconfig: &Path, namespace: &str) -> Result<()>;
}

/// [`NamespaceProvisioner`] backed by the Kubernetes API
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeNamespaces;

#[async_trait]
impl NamespaceProvisioner for KubeNamespaces {
    async fn ensure_namespace(&self, kubeconfig: &Path, namespace: &str) -> Result<()> {
        let client = kube_utils::create_client(kubeconfig).await?;
        kube_utils::ensure_namespace(&client, namespace).await
    }
}

/// One chart to install or upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRequest {
    /// Kubeconfig of the target cluster
    pub kubeconfig: PathBuf,
    /// Release name
    pub release: String,
    /// Target namespace
    pub namespace: String,
    /// Repository alias
    pub repo_name: String,
    /// Repository index URL
    pub repo_url: String,
    /// Chart name inside the repository
    pub chart: String,
    /// Exact chart version
    pub version: String,
    /// Optional YAML values file
    pub values_file: Option<PathBuf>,
}

/// Which path the installer took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No release existed; it was installed
    Installed,
    /// A release existed; it was upgraded
    Upgraded,
}

/// Parse a values document; empty text is an empty mapping
pub fn parse_values(text: &str) -> std::result::Result<serde_json::Value, String> {
    if text.trim().is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }
    let value: serde_json::Value =
        serde_yaml::from_str(text).map_err(|e| format!("invalid values: {}", e))?;
    match value {
        serde_json::Value::Object(_) => Ok(value),
        serde_json::Value::Null => Ok(serde_json::Value::Object(Default::default())),
        _ => Err("values must be a mapping".to_string()),
    }
}

/// Drives a chart from repository sync to a deployed release
pub struct ChartInstaller {
    backend: Arc<dyn HelmBackend>,
    namespaces: Arc<dyn NamespaceProvisioner>,
    settings: HelmSettings,
    logger: Logger,
}

impl ChartInstaller {
    /// Installer using `backend` and `namespaces`, with policies from `settings`
    pub fn new(
        backend: Arc<dyn HelmBackend>,
        namespaces: Arc<dyn NamespaceProvisioner>,
        settings: HelmSettings,
        logger: Logger,
    ) -> Self {
        Self {
            backend,
            namespaces,
            settings,
            logger,
        }
    }

    /// Install `request` if no release of that name exists in its namespace,
    /// otherwise upgrade it.
    pub async fn install_or_upgrade(&self, request: &ChartRequest) -> Result<InstallOutcome> {
        let release = request.release.as_str();
        let namespace = request.namespace.as_str();

        if !BUILTIN_NAMESPACES.contains(&namespace) {
            self.namespaces
                .ensure_namespace(&request.kubeconfig, namespace)
                .await?;
        }

        self.sync_repositories(&request.repo_name, &request.repo_url)
            .await?;

        let values = self.load_values(request.values_file.as_deref()).await?;

        let chart_path = self
            .backend
            .pull_chart(&request.repo_name, &request.chart, &request.version)
            .await?;
        debug!(chart = %chart_path.display(), "pulled chart");

        let exists = match self.backend.list_releases(&request.kubeconfig, namespace).await {
            Ok(releases) => releases.iter().any(|r| r.name == release),
            Err(e) => {
                warn!(release = %release, namespace = %namespace, error = %e, "failed to list releases, assuming none");
                self.logger
                    .log_err(format!("failed to list releases in {}: {}", namespace, e))
                    .await;
                false
            }
        };

        let (outcome, policy) = if exists {
            (InstallOutcome::Upgraded, self.settings.upgrade)
        } else {
            (InstallOutcome::Installed, self.settings.install)
        };
        let action = ReleaseAction {
            kubeconfig: request.kubeconfig.clone(),
            release: release.to_string(),
            namespace: namespace.to_string(),
            chart_path,
            values,
            policy,
        };

        let verb = match outcome {
            InstallOutcome::Installed => "install",
            InstallOutcome::Upgraded => "upgrade",
        };
        self.logger
            .log(format!("helm {} {} ({} {}) in {}", verb, release, request.chart, request.version, namespace))
            .await;

        let result = match outcome {
            InstallOutcome::Installed => self.backend.install(&action).await,
            InstallOutcome::Upgraded => self.backend.upgrade(&action).await,
        };

        if let Err(e) = result {
            let description = self
                .backend
                .release_description(&request.kubeconfig, release, namespace)
                .await
                .ok()
                .flatten();
            let message = match description {
                Some(desc) => format!("{} failed: {} (release status: {})", verb, e, desc),
                None => format!("{} failed: {}", verb, e),
            };
            self.logger.log_err(format!("{}: {}", release, message)).await;
            return Err(Error::helm(release, message));
        }

        info!(release = %release, namespace = %namespace, verb = %verb, "helm release ready");
        Ok(outcome)
    }

    /// Register the repository when missing, then refresh every index
    async fn sync_repositories(&self, name: &str, url: &str) -> Result<()> {
        let registered = self.backend.registered_repos().await?;
        if !registered.contains(name) {
            self.logger.log(format!("adding helm repository {} ({})", name, url)).await;
            self.backend.add_repo(name, url).await?;
        }
        self.backend.update_repos().await
    }

    async fn load_values(&self, path: Option<&Path>) -> Result<serde_json::Value> {
        let Some(path) = path else {
            return Ok(serde_json::Value::Object(Default::default()));
        };
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::helm(path.display().to_string(), format!("failed to read values: {}", e))
        })?;
        parse_values(&text).map_err(|e| Error::helm(path.display().to_string(), e))
    }
}
