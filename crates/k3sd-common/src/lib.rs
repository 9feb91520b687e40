//! Common types for k3sd: fleet model, errors, configuration and utilities

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod kube_utils;
pub mod logger;
pub mod model;
pub mod store;

pub use config::{Feature, Features, HelmSettings, HostKeyPolicy, ProvisionConfig, ReleasePolicy};
pub use error::Error;
pub use logger::Logger;
pub use model::{AppConfig, Cluster, DatabaseCredentials, NodeSpec, ProvisionState, Worker};
pub use store::{ClusterStore, JsonFileStore};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default SSH port used when a node address carries no explicit port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Port the k3s API server listens on
pub const K3S_API_PORT: u16 = 6443;

/// Namespace used for objects whose manifest omits one
pub const DEFAULT_NAMESPACE: &str = "default";
