//! k3sd CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// k3sd - resumable k3s fleet provisioning over SSH
#[derive(Parser, Debug)]
#[command(name = "k3sd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap control planes, join workers and install optional components
    Create(commands::create::CreateArgs),
    /// Remove k3s from every node of the fleet
    Uninstall(commands::uninstall::UninstallArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Create(args) => commands::create::run(args).await,
            Commands::Uninstall(args) => commands::uninstall::run(args).await,
        }
    }
}
