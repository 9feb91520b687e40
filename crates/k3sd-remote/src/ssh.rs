//! russh-backed connector

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use k3sd_common::{Error, HostKeyPolicy, NodeSpec, Result, DEFAULT_SSH_PORT};

use crate::session::{Connector, RemoteSession};

/// One way of authenticating, tried in collection order
pub enum AuthMethod {
    /// Private key loaded from disk
    PublicKey {
        /// File the key was loaded from
        path: PathBuf,
        /// The decoded key
        key: Arc<KeyPair>,
    },
    /// Password fallback
    Password(String),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey { path, .. } => f.debug_struct("PublicKey").field("path", path).finish(),
            Self::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Collect authentication methods for a node.
///
/// Every parsable private key in `key_dir` comes first, in file-name order;
/// `*.pub` files and anything that does not decode as an unencrypted private
/// key are skipped. A non-empty `password` is appended last.
pub fn collect_auth_methods(key_dir: &Path, password: &str) -> Vec<AuthMethod> {
    let mut methods = Vec::new();

    match std::fs::read_dir(key_dir) {
        Ok(entries) => {
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .filter(|p| p.extension().map_or(true, |ext| ext != "pub"))
                .collect();
            paths.sort();

            for path in paths {
                match russh_keys::load_secret_key(&path, None) {
                    Ok(key) => {
                        debug!(path = %path.display(), "loaded private key");
                        methods.push(AuthMethod::PublicKey {
                            path,
                            key: Arc::new(key),
                        });
                    }
                    Err(e) => trace!(path = %path.display(), error = %e, "skipping non-key file"),
                }
            }
        }
        Err(e) => debug!(dir = %key_dir.display(), error = %e, "key directory not readable"),
    }

    if !password.is_empty() {
        methods.push(AuthMethod::Password(password.to_string()));
    }
    methods
}

/// Split `host[:port]` into host and port.
///
/// Bracketed IPv6 (`[::1]:2222`) is supported; an unbracketed address with
/// more than one colon is treated as a bare IPv6 host.
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::validation("empty node address"));
    }

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::validation(format!("unterminated IPv6 address '{}'", address)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(address, p)?,
            None if tail.is_empty() => DEFAULT_SSH_PORT,
            None => return Err(Error::validation(format!("invalid address '{}'", address))),
        };
        return Ok((host.to_string(), port));
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), parse_port(address, port)?)),
        _ => Ok((address.to_string(), DEFAULT_SSH_PORT)),
    }
}

/// `host` as written in a URL authority; IPv6 literals are bracketed
pub fn url_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn parse_port(address: &str, port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::validation(format!("invalid port in address '{}'", address)))
}

/// Host key verification callback
struct HostKeyCheck {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::KnownHosts => {
                match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(host = %self.host, "host key not present in known_hosts");
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(host = %self.host, error = %e, "host key verification failed");
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Connector dialing nodes over SSH
pub struct SshConnector {
    key_dir: PathBuf,
    policy: HostKeyPolicy,
    config: Arc<client::Config>,
}

impl SshConnector {
    /// Connector loading keys from `key_dir` and checking host keys per `policy`
    pub fn new(key_dir: impl Into<PathBuf>, policy: HostKeyPolicy) -> Self {
        Self {
            key_dir: key_dir.into(),
            policy,
            config: Arc::new(client::Config::default()),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, node: &NodeSpec) -> Result<Box<dyn RemoteSession>> {
        let methods = collect_auth_methods(&self.key_dir, &node.password);
        if methods.is_empty() {
            return Err(Error::auth(
                &node.address,
                &node.user,
                format!("no usable private keys in {} and no password", self.key_dir.display()),
            ));
        }

        let (host, port) = split_host_port(&node.address)?;
        let handler = HostKeyCheck {
            host: host.clone(),
            port,
            policy: self.policy,
        };
        let mut handle = client::connect(self.config.clone(), (host.as_str(), port), handler)
            .await
            .map_err(|e| Error::connection(&node.address, e.to_string()))?;

        for method in methods {
            let accepted = match &method {
                AuthMethod::PublicKey { key, .. } => {
                    handle.authenticate_publickey(&node.user, key.clone()).await
                }
                AuthMethod::Password(password) => {
                    handle.authenticate_password(&node.user, password).await
                }
            }
            .map_err(|e| Error::connection(&node.address, format!("authentication exchange failed: {}", e)))?;

            if accepted {
                debug!(host = %node.address, user = %node.user, method = ?method, "authenticated");
                return Ok(Box::new(SshSession {
                    host: node.address.clone(),
                    handle,
                }));
            }
            trace!(host = %node.address, method = ?method, "authentication method rejected");
        }

        Err(Error::auth(
            &node.address,
            &node.user,
            "every authentication method was rejected",
        ))
    }
}

/// Authenticated SSH session
struct SshSession {
    host: String,
    handle: Handle<HostKeyCheck>,
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(
        &self,
        command: &str,
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
    ) -> Result<u32> {
        let broken = |e: russh::Error| Error::command(&self.host, command, None, e.to_string());

        let mut channel = self.handle.channel_open_session().await.map_err(broken)?;
        channel.exec(true, command).await.map_err(broken)?;

        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    // Receiver gone means nobody wants the output; keep draining.
                    let _ = stdout.send(data.to_vec()).await;
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    let _ = stderr.send(data.to_vec()).await;
                }
                ChannelMsg::ExitStatus { exit_status: status } => {
                    exit_status = Some(status);
                }
                _ => {}
            }
        }

        exit_status.ok_or_else(|| {
            Error::command(&self.host, command, None, "channel closed without an exit status")
        })
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            trace!(host = %self.host, error = %e, "disconnect failed");
        }
    }
}
