//! Kubeconfig repatriation
//!
//! k3s writes an admin kubeconfig pointing at `127.0.0.1` with entries all
//! named `default`. We fetch it, point it at the node's address, rename the
//! entries to the node name so configs of several clusters can be merged, and
//! store it under the run directory.
//!
//! Only the first cluster, user and context entries are renamed.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::info;

use k3sd_common::{Cluster, Error, Logger, ProvisionConfig, Result};
use k3sd_remote::{execute_script, split_host_port, url_host, RemoteSession};

use crate::commands::kubeconfig_script;

/// Loopback address k3s puts in the server URL
const LOOPBACK: &str = "127.0.0.1";

/// Point `raw` at `host` and rename its entries to `node_name`
pub fn rewrite_kubeconfig(raw: &str, host: &str, node_name: &str) -> Result<String> {
    let invalid = |msg: String| Error::kubeconfig(node_name, msg);

    let text = raw.replace(LOOPBACK, &url_host(host));
    let mut doc: Value =
        serde_yaml::from_str(&text).map_err(|e| invalid(format!("invalid kubeconfig: {}", e)))?;

    for section in ["clusters", "users", "contexts"] {
        if let Some(first) = doc
            .get_mut(section)
            .and_then(Value::as_sequence_mut)
            .and_then(|entries| entries.first_mut())
            .filter(|entry| entry.is_mapping())
        {
            first["name"] = Value::from(node_name);
        }
    }

    if let Some(context) = doc
        .get_mut("contexts")
        .and_then(Value::as_sequence_mut)
        .and_then(|entries| entries.first_mut())
        .and_then(|entry| entry.get_mut("context"))
        .filter(|context| context.is_mapping())
    {
        context["cluster"] = Value::from(node_name);
        context["user"] = Value::from(node_name);
    }

    match doc.as_mapping_mut() {
        Some(map) => {
            map.insert(Value::from("current-context"), Value::from(node_name));
        }
        None => return Err(invalid("kubeconfig is not a mapping".to_string())),
    }

    let out = serde_yaml::to_string(&doc)
        .map_err(|e| invalid(format!("failed to serialize kubeconfig: {}", e)))?;
    kube::config::Kubeconfig::from_yaml(&out)
        .map_err(|e| invalid(format!("rewritten kubeconfig does not parse: {}", e)))?;
    Ok(out)
}

/// Fetch the cluster's kubeconfig over `session` and store it for this run.
///
/// Returns the path written.
pub async fn repatriate_kubeconfig(
    session: &dyn RemoteSession,
    cluster: &Cluster,
    config: &ProvisionConfig,
    logger: &Logger,
) -> Result<PathBuf> {
    let node_name = cluster.name();
    let raw = execute_script(session, &kubeconfig_script()).await?;
    let (host, _) = split_host_port(&cluster.node.address)?;
    let rewritten = rewrite_kubeconfig(&raw, &host, node_name)?;

    let path = config.kubeconfig_path(node_name);
    write_private(&path, &rewritten)
        .map_err(|e| Error::kubeconfig(node_name, format!("failed to write {}: {}", path.display(), e)))?;

    info!(cluster = %node_name, path = %path.display(), "saved kubeconfig");
    logger
        .log(format!("saved kubeconfig for {} to {}", node_name, path.display()))
        .await;
    Ok(path)
}

/// Write `content` readable only by the owner, creating parent directories
pub(crate) fn write_private(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())
}
