//! Error types for k3sd
//!
//! Errors are structured with fields to aid debugging: each variant carries the
//! host, node, command or path it concerns. Variants map onto how the
//! orchestrator reacts to them:
//!
//! - `Connection`, `Auth`, `Command`, `Script`: fatal for the affected cluster
//! - `OptionalComponent`: logged, the run continues
//! - `Discovery`: the offending manifest document is skipped
//! - `Persistence`: fatal, surfaced to the caller
//!
//! A create conflict is not an error at all; the manifest engine reports it as
//! an "already exists" outcome.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for k3sd operations
#[derive(Debug, Error)]
pub enum Error {
    /// Dialing a remote host failed
    #[error("connection error for {host}: {message}")]
    Connection {
        /// Host that could not be reached
        host: String,
        /// Description of what failed
        message: String,
    },

    /// No usable authentication method, or every method was rejected
    #[error("authentication error for {user}@{host}: {message}")]
    Auth {
        /// Host being authenticated against
        host: String,
        /// Remote user
        user: String,
        /// Description of what failed
        message: String,
    },

    /// A remote command exited non-zero or its session broke
    #[error("command failed on {host} (exit {exit_status:?}): {command}: {message}")]
    Command {
        /// Host the command ran on
        host: String,
        /// The command line that failed
        command: String,
        /// Exit status, if the remote side reported one
        exit_status: Option<u32>,
        /// Description of what failed
        message: String,
    },

    /// A buffered remote script exited non-zero
    #[error("script failed on {host} (exit {exit_status:?}): {stderr}")]
    Script {
        /// Host the script ran on
        host: String,
        /// Exit status, if the remote side reported one
        exit_status: Option<u32>,
        /// Captured standard error
        stderr: String,
    },

    /// An optional add-on failed; never aborts a run
    #[error("optional component {component} failed: {source}")]
    OptionalComponent {
        /// Feature name of the component
        component: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A resource kind could not be mapped through API discovery
    #[error("discovery error: no API resource for {api_version}/{kind}")]
    Discovery {
        /// apiVersion of the document
        api_version: String,
        /// kind of the document
        kind: String,
    },

    /// The fleet state file could not be read or written
    #[error("persistence error for {}: {message}", .path.display())]
    Persistence {
        /// Path of the state file
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A manifest source could not be fetched or decoded
    #[error("manifest error [{source_ref}]: {message}")]
    Manifest {
        /// Path, URL or name of the manifest source
        source_ref: String,
        /// Description of what failed
        message: String,
    },

    /// A helm operation failed
    #[error("helm error [{context}]: {message}")]
    Helm {
        /// Release or repository the operation concerned
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A fetched kubeconfig could not be rewritten or stored
    #[error("kubeconfig error for {node}: {message}")]
    Kubeconfig {
        /// Node the kubeconfig belongs to
        node: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration or input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Local IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a connection error
    pub fn connection(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(host: impl Into<String>, user: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Auth {
            host: host.into(),
            user: user.into(),
            message: msg.into(),
        }
    }

    /// Create a command error
    pub fn command(
        host: impl Into<String>,
        command: impl Into<String>,
        exit_status: Option<u32>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Command {
            host: host.into(),
            command: command.into(),
            exit_status,
            message: msg.into(),
        }
    }

    /// Create a script error carrying the captured stderr
    pub fn script(host: impl Into<String>, exit_status: Option<u32>, stderr: impl Into<String>) -> Self {
        Self::Script {
            host: host.into(),
            exit_status,
            stderr: stderr.into(),
        }
    }

    /// Wrap a failure of an optional component
    pub fn optional_component(component: impl Into<String>, source: Error) -> Self {
        Self::OptionalComponent {
            component: component.into(),
            source: Box::new(source),
        }
    }

    /// Create a discovery error
    pub fn discovery(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::Discovery {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(source_ref: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            source_ref: source_ref.into(),
            message: msg.into(),
        }
    }

    /// Create a helm error
    pub fn helm(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Helm {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a kubeconfig error
    pub fn kubeconfig(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Whether this error must stop the whole run rather than one cluster.
    ///
    /// Only a lost checkpoint qualifies.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
