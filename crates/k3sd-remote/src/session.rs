//! Session and connector seams

use async_trait::async_trait;
use tokio::sync::mpsc;

use k3sd_common::{NodeSpec, Result};

/// An authenticated session on one remote host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Address the session is connected to, used to tag output and errors
    fn host(&self) -> &str;

    /// Run `command` on a fresh channel.
    ///
    /// Raw stdout and stderr chunks are forwarded on the two senders as they
    /// arrive; both senders are dropped when the channel closes. Returns the
    /// remote exit status.
    async fn exec(
        &self,
        command: &str,
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
    ) -> Result<u32>;

    /// Close the session
    async fn close(&self) {}
}

/// Opens sessions to nodes
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial and authenticate against `node`
    async fn connect(&self, node: &NodeSpec) -> Result<Box<dyn RemoteSession>>;
}
