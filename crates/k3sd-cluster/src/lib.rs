//! Cluster provisioning for k3sd
//!
//! The [`Provisioner`] walks the fleet model cluster by cluster: bootstrap the
//! control plane, repatriate its kubeconfig, install optional components until
//! they have all gone on, then join every pending worker. `done` and
//! `addons_done` are persisted at each checkpoint so an interrupted run resumes
//! where it stopped.

#![deny(missing_docs)]

pub mod addons;
pub mod api;
pub mod commands;
pub mod kubeconfig;
pub mod mesh;
pub mod provisioner;
pub mod uninstall;

#[cfg(test)]
mod testing;

pub use addons::install_addons;
pub use api::{ClusterApi, LiveClusterApi};
pub use kubeconfig::{repatriate_kubeconfig, rewrite_kubeconfig};
pub use mesh::{LinkerdCli, MeshCli};
pub use provisioner::{ClusterFailure, Provisioner, RunSummary};
pub use uninstall::Uninstaller;
