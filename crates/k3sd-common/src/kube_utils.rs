//! Kubernetes helpers shared by the manifest engine, helm installer and
//! orchestrator.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from a kubeconfig file with default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from a kubeconfig file with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let node = kubeconfig.display().to_string();
    let parsed = Kubeconfig::read_from(kubeconfig)
        .map_err(|e| Error::kubeconfig(&node, format!("failed to read kubeconfig: {}", e)))?;
    let mut config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(&node, format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config)
        .map_err(|e| Error::kubeconfig(&node, format!("failed to create client: {}", e)))
}

/// Parse apiVersion into (group, version)
///
/// ```
/// use k3sd_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Merge patch body setting `labels` on an object's metadata
pub fn label_patch(labels: &BTreeMap<String, String>) -> serde_json::Value {
    serde_json::json!({ "metadata": { "labels": labels } })
}

/// Merge `labels` onto a node. Existing labels not named are left untouched.
pub async fn patch_node_labels(
    client: &Client,
    node_name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<(), Error> {
    if labels.is_empty() {
        debug!(node = %node_name, "no labels to apply");
        return Ok(());
    }
    let api: Api<Node> = Api::all(client.clone());
    api.patch(
        node_name,
        &PatchParams::default(),
        &Patch::Merge(&label_patch(labels)),
    )
    .await?;
    debug!(node = %node_name, count = labels.len(), "patched node labels");
    Ok(())
}

/// Ensure a namespace exists. An existing namespace is not an error.
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<(), Error> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns: Namespace = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    }))?;
    match api.create(&PostParams::default(), &ns).await {
        Ok(_) => {
            debug!(namespace = %name, "created namespace");
            Ok(())
        }
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether an API error is a create conflict on an existing object
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn conflict_is_already_exists() {
        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
    }

    #[test]
    fn other_conflicts_are_not_already_exists() {
        assert!(!is_already_exists(&api_error(409, "Conflict")));
        assert!(!is_already_exists(&api_error(404, "NotFound")));
    }

    #[test]
    fn label_patch_nests_under_metadata() {
        let labels = BTreeMap::from([("zone".to_string(), "a".to_string())]);
        let patch = label_patch(&labels);
        assert_eq!(patch["metadata"]["labels"]["zone"], "a");
    }

    #[test]
    fn parse_api_version_with_group() {
        let (group, version) = parse_api_version("cert-manager.io/v1");
        assert_eq!(group, "cert-manager.io");
        assert_eq!(version, "v1");
    }

    #[test]
    fn parse_api_version_core() {
        let (group, version) = parse_api_version("v1");
        assert_eq!(group, "");
        assert_eq!(version, "v1");
    }
}
