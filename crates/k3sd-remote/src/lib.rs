//! Remote execution for k3sd
//!
//! [`Connector`] dials a node and returns a [`RemoteSession`]; the executor
//! functions run command sequences and scripts over a session while streaming
//! output into the run logger.

#![deny(missing_docs)]

mod executor;
mod session;
mod ssh;

pub use executor::{execute_commands, execute_script, relay, shell_quote, LineBuffer};
pub use session::{Connector, RemoteSession};
pub use ssh::{collect_auth_methods, split_host_port, url_host, AuthMethod, SshConnector};
