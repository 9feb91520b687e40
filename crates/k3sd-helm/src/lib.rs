//! Helm chart lifecycle for k3sd
//!
//! [`ChartInstaller`] keeps repositories in sync and decides between a fresh
//! install and an upgrade from the releases already present in the target
//! namespace. The helm binary sits behind the [`HelmBackend`] seam.

#![deny(missing_docs)]

mod backend;
mod cli;
mod installer;
mod repository;

pub use backend::{HelmBackend, ReleaseAction, ReleaseInfo};
pub use cli::{release_args, HelmCli};
pub use installer::{
    parse_values, ChartInstaller, ChartRequest, InstallOutcome, KubeNamespaces, NamespaceProvisioner,
};
pub use repository::{RepositoryEntry, RepositoryFile};

#[cfg(test)]
pub use backend::MockHelmBackend;
#[cfg(test)]
pub use installer::MockNamespaceProvisioner;
