//! CLI commands

use std::future::Future;
use std::path::PathBuf;

use clap::Args;
use tracing::warn;

use k3sd_cluster::RunSummary;
use k3sd_common::config::generate_run_id;
use k3sd_common::{HostKeyPolicy, ProvisionConfig};

use crate::{Error, Result};

pub mod create;
pub mod uninstall;

/// Arguments shared by every command
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Path to the fleet state file
    #[arg(long = "config-path", env = "K3SD_CONFIG")]
    pub config_path: PathBuf,

    /// Directory private keys are loaded from (defaults to ~/.ssh)
    #[arg(long, env = "K3SD_KEY_DIR")]
    pub key_dir: Option<PathBuf>,

    /// Check host keys against known_hosts instead of trusting any key
    #[arg(long)]
    pub verify_host_keys: bool,

    /// Echo remote command output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run ID namespacing kubeconfigs and certificates (auto-generated if not provided)
    #[arg(long, env = "K3SD_RUN_ID")]
    pub run_id: Option<String>,
}

impl CommonArgs {
    /// Base configuration for this invocation
    pub fn provision_config(&self) -> ProvisionConfig {
        let run_id = self.run_id.clone().unwrap_or_else(generate_run_id);
        let mut config = ProvisionConfig::new(run_id);
        config.ssh_key_dir = self.key_dir.clone();
        config.host_key_policy = if self.verify_host_keys {
            HostKeyPolicy::KnownHosts
        } else {
            HostKeyPolicy::AcceptAny
        };
        config
    }
}

/// Drive `work` to completion unless Ctrl-C arrives first
pub(crate) async fn until_interrupted<F: Future>(work: F) -> Option<F::Output> {
    tokio::select! {
        out = work => Some(out),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for Ctrl-C");
            }
            None
        }
    }
}

/// Print the run summary; any failed cluster makes the command fail
pub(crate) fn finish(action: &str, summary: &RunSummary) -> Result<()> {
    for name in &summary.completed {
        println!("{}: {}", action, name);
    }
    for failure in &summary.optional_failures {
        println!("warning: {}", failure);
    }
    if summary.is_success() {
        return Ok(());
    }

    for failure in &summary.failures {
        eprintln!("failed: {}: {}", failure.cluster, failure.error);
    }
    let names: Vec<&str> = summary.failures.iter().map(|f| f.cluster.as_str()).collect();
    Err(Error::command_failed(format!(
        "{} cluster(s) failed: {}",
        names.len(),
        names.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k3sd_cluster::ClusterFailure;

    #[test]
    fn clean_summary_succeeds() {
        let summary = RunSummary {
            completed: vec!["master-1".to_string()],
            ..Default::default()
        };
        assert!(finish("provisioned", &summary).is_ok());
    }

    #[test]
    fn optional_failures_alone_do_not_fail_the_command() {
        let summary = RunSummary {
            completed: vec!["master-1".to_string()],
            optional_failures: vec![k3sd_common::Error::optional_component(
                "prometheus",
                k3sd_common::Error::helm("kube-prom-stack", "timed out"),
            )],
            ..Default::default()
        };
        assert!(finish("provisioned", &summary).is_ok());
    }

    #[test]
    fn failed_clusters_are_named() {
        let summary = RunSummary {
            failures: vec![ClusterFailure {
                cluster: "master-2".to_string(),
                error: k3sd_common::Error::connection("203.0.113.20", "timed out"),
            }],
            ..Default::default()
        };
        let err = finish("provisioned", &summary).unwrap_err();
        assert!(err.to_string().contains("master-2"));
    }

    #[test]
    fn host_key_verification_is_opt_in() {
        let mut args = CommonArgs {
            config_path: PathBuf::from("clusters.json"),
            key_dir: None,
            verify_host_keys: false,
            verbose: false,
            run_id: Some("abc123".to_string()),
        };
        let config = args.provision_config();
        assert_eq!(config.run_id, "abc123");
        assert_eq!(config.host_key_policy, HostKeyPolicy::AcceptAny);

        args.verify_host_keys = true;
        assert_eq!(args.provision_config().host_key_policy, HostKeyPolicy::KnownHosts);
    }
}
