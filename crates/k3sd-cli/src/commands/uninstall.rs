//! Uninstall command - remove k3s from every node in the state file
//!
//! Usage: k3sd uninstall --config-path <file> [--yes]
//!
//! Workers are torn down through their control-plane node, then the control
//! plane itself. All `done` flags are reset so a later `create` starts over.

use std::sync::Arc;

use clap::Args;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{info, warn};

use k3sd_cluster::Uninstaller;
use k3sd_common::logger::DEFAULT_QUEUE_CAPACITY;
use k3sd_common::{ClusterStore, JsonFileStore, Logger};
use k3sd_remote::SshConnector;

use super::{finish, until_interrupted, CommonArgs};
use crate::{Error, Result};

/// Tear down every cluster of the fleet
#[derive(Args, Debug)]
pub struct UninstallArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Skip confirmation prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

async fn confirm(clusters: usize, workers: usize) -> Result<bool> {
    println!(
        "This will uninstall k3s from {} control plane(s) and {} worker(s).",
        clusters, workers
    );
    print!("Are you sure? [y/N] ");
    tokio::io::stdout().flush().await?;

    let mut input = String::new();
    let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
    reader.read_line(&mut input).await?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

pub async fn run(args: UninstallArgs) -> Result<()> {
    let config = args.common.provision_config();
    let state_path = args.common.config_path.clone();
    let store: Arc<dyn ClusterStore> = Arc::new(JsonFileStore);
    let mut clusters = store.load(&state_path)?;

    let workers_total = clusters.iter().map(|c| c.workers.len()).sum();
    if !args.yes && !confirm(clusters.len(), workers_total).await? {
        println!("Aborted");
        return Ok(());
    }

    info!(run_id = %config.run_id, clusters = clusters.len(), "starting uninstall");
    let (logger, receivers) = Logger::channels(config.run_id.as_str(), DEFAULT_QUEUE_CAPACITY);
    let log_workers = receivers.spawn(args.common.verbose);

    let outcome = {
        let connector = Arc::new(SshConnector::new(config.key_dir(), config.host_key_policy));
        let uninstaller = Uninstaller::new(connector, store.clone(), &state_path, logger.clone());
        until_interrupted(uninstaller.run(&mut clusters)).await
    };

    drop(logger);
    log_workers.shutdown().await;

    match outcome {
        Some(result) => finish("uninstalled", &result?),
        None => {
            warn!("interrupted, saving state");
            store.save(&state_path, &clusters)?;
            Err(Error::Interrupted { path: state_path })
        }
    }
}
