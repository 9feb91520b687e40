//! Helm backend seam

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use k3sd_common::{ReleasePolicy, Result};

use crate::repository::RepositoryFile;

/// A release as reported by `helm list`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReleaseInfo {
    /// Release name
    pub name: String,
    /// Namespace the release lives in
    #[serde(default)]
    pub namespace: String,
    /// Status such as `deployed` or `failed`
    #[serde(default)]
    pub status: String,
    /// `chart-version` string
    #[serde(default)]
    pub chart: String,
}

/// Everything needed to install or upgrade one release
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseAction {
    /// Kubeconfig of the target cluster
    pub kubeconfig: PathBuf,
    /// Release name
    pub release: String,
    /// Target namespace
    pub namespace: String,
    /// Local chart archive
    pub chart_path: PathBuf,
    /// Values mapping
    pub values: serde_json::Value,
    /// Wait/timeout/atomic policy
    pub policy: ReleasePolicy,
}

/// Operations the installer needs from helm
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmBackend: Send + Sync {
    /// The local repository registry
    async fn registered_repos(&self) -> Result<RepositoryFile>;

    /// Register a repository
    async fn add_repo(&self, name: &str, url: &str) -> Result<()>;

    /// Refresh the index of every registered repository
    async fn update_repos(&self) -> Result<()>;

    /// Download exactly `version` of `repo/chart`, returning the archive path
    async fn pull_chart(&self, repo: &str, chart: &str, version: &str) -> Result<PathBuf>;

    /// Releases in `namespace`, in any state
    async fn list_releases(&self, kubeconfig: &Path, namespace: &str) -> Result<Vec<ReleaseInfo>>;

    /// First install of a release
    async fn install(&self, action: &ReleaseAction) -> Result<()>;

    /// Upgrade of an existing release
    async fn upgrade(&self, action: &ReleaseAction) -> Result<()>;

    /// Status description of a release, if helm has one
    async fn release_description(
        &self,
        kubeconfig: &Path,
        release: &str,
        namespace: &str,
    ) -> Result<Option<String>>;
}
