//! Apply backends

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind, PostParams};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use k3sd_common::kube_utils::{is_already_exists, parse_api_version};
use k3sd_common::{Error, Result, DEFAULT_NAMESPACE};

use crate::decode::ManifestObject;

/// Result of applying one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object was created
    Created,
    /// An object with that identity already existed and was left as is
    AlreadyExists,
}

/// Applies one decoded document to a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Applier: Send + Sync {
    /// Apply `object`.
    ///
    /// Returns [`Error::Discovery`] when its kind cannot be resolved.
    async fn apply(&self, object: &ManifestObject) -> Result<ApplyOutcome>;
}

/// Map the result of a create call onto an outcome.
///
/// A 409 `AlreadyExists` is success; any other error is returned.
pub fn classify_create<T>(result: std::result::Result<T, kube::Error>) -> Result<ApplyOutcome> {
    match result {
        Ok(_) => Ok(ApplyOutcome::Created),
        Err(e) if is_already_exists(&e) => Ok(ApplyOutcome::AlreadyExists),
        Err(e) => Err(e.into()),
    }
}

/// Create-only backend resolving kinds through live API discovery.
///
/// Existing objects are never patched, so drift is not reconciled.
pub struct CreateOnlyApplier {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl CreateOnlyApplier {
    /// Backend talking to the cluster behind `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(None),
        }
    }

    async fn lookup(&self, gvk: &GroupVersionKind) -> Option<(ApiResource, ApiCapabilities)> {
        let snapshot = self.discovery.read().await.clone()?;
        snapshot.resolve_gvk(gvk)
    }

    async fn refresh(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        *self.discovery.write().await = Some(Arc::new(discovery));
        debug!("refreshed API discovery snapshot");
        Ok(())
    }

    /// Resolve a kind, refreshing the snapshot once on a miss
    async fn resolve(&self, object: &ManifestObject) -> Result<(ApiResource, ApiCapabilities)> {
        let (group, version) = parse_api_version(&object.api_version);
        let gvk = GroupVersionKind {
            group,
            version,
            kind: object.kind.clone(),
        };

        if let Some(found) = self.lookup(&gvk).await {
            return Ok(found);
        }
        self.refresh().await?;
        self.lookup(&gvk)
            .await
            .ok_or_else(|| Error::discovery(&object.api_version, &object.kind))
    }
}

#[async_trait]
impl Applier for CreateOnlyApplier {
    async fn apply(&self, object: &ManifestObject) -> Result<ApplyOutcome> {
        let (resource, caps) = self.resolve(object).await?;
        let mut dynamic: DynamicObject = serde_json::from_value(object.value.clone())?;

        let api: Api<DynamicObject> = match caps.scope {
            Scope::Namespaced => {
                let namespace = object.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
                dynamic.metadata.namespace = Some(namespace.to_string());
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        };

        classify_create(api.create(&PostParams::default(), &dynamic).await)
    }
}
