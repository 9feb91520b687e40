//! Optional platform components
//!
//! Each enabled feature runs in catalogue order. A failing component is
//! reported as [`Error::OptionalComponent`] and the next one still runs.

use std::path::Path;

use tracing::warn;

use k3sd_common::{Cluster, Error, Feature, Logger, ProvisionConfig, Result};
use k3sd_helm::ChartRequest;
use k3sd_manifest::{ManifestSource, Substitutions};

use crate::api::ClusterApi;
use crate::mesh::{install_mesh, MeshCli};

/// cert-manager release manifest
pub const CERT_MANAGER_MANIFEST: &str =
    "https://github.com/cert-manager/cert-manager/releases/download/v1.17.2/cert-manager.yaml";
/// cert-manager CRDs
pub const CERT_MANAGER_CRDS: &str =
    "https://github.com/cert-manager/cert-manager/releases/download/v1.17.2/cert-manager.crds.yaml";

/// Install every enabled component on a control plane whose add-ons are not checkpointed yet.
///
/// Returns the failures, already logged.
pub async fn install_addons(
    api: &dyn ClusterApi,
    mesh: &dyn MeshCli,
    cluster: &Cluster,
    kubeconfig: &Path,
    config: &ProvisionConfig,
    logger: &Logger,
) -> Vec<Error> {
    let mut failures = Vec::new();
    let features = &config.features;

    for feature in features.iter() {
        // gitea-ingress rides on gitea
        if feature == Feature::GiteaIngress && !features.contains(Feature::Gitea) {
            logger
                .log("gitea-ingress requested without gitea, skipping".to_string())
                .await;
            continue;
        }
        // the multicluster install already lays down the control plane
        if feature == Feature::Linkerd && features.contains(Feature::LinkerdMulticluster) {
            continue;
        }

        logger
            .log(format!("installing {} on {}", feature, cluster.name()))
            .await;
        if let Err(e) = install_one(api, mesh, feature, cluster, kubeconfig, config, logger).await {
            let e = Error::optional_component(feature.name(), e);
            warn!(cluster = %cluster.name(), error = %e, "optional component failed");
            logger.log_err(e.to_string()).await;
            failures.push(e);
        }
    }
    failures
}

async fn install_one(
    api: &dyn ClusterApi,
    mesh: &dyn MeshCli,
    feature: Feature,
    cluster: &Cluster,
    kubeconfig: &Path,
    config: &ProvisionConfig,
    logger: &Logger,
) -> Result<()> {
    let domain = || Substitutions::new().variable("DOMAIN", cluster.domain.as_str());
    let local = |file: &str| ManifestSource::Path(config.manifest_path(file));

    match feature {
        Feature::CertManager => {
            api.apply_manifest(kubeconfig, &ManifestSource::parse(CERT_MANAGER_MANIFEST), &Substitutions::new())
                .await?;
            api.apply_manifest(kubeconfig, &ManifestSource::parse(CERT_MANAGER_CRDS), &Substitutions::new())
                .await?;
            logger
                .log(format!(
                    "waiting {}s for cert-manager to come up",
                    config.cert_manager_settle.as_secs()
                ))
                .await;
            tokio::time::sleep(config.cert_manager_settle).await;
        }
        Feature::TraefikValues => {
            api.apply_manifest(kubeconfig, &local("traefik-values.yaml"), &Substitutions::new())
                .await?;
        }
        Feature::ClusterIssuer => {
            api.apply_manifest(kubeconfig, &local("clusterissuer.yaml"), &domain())
                .await?;
        }
        Feature::Gitea => {
            let app = cluster
                .app
                .as_ref()
                .ok_or_else(|| Error::validation(format!("cluster {} has no app configuration", cluster.name())))?;
            let db = &app.database;
            let substitutions = Substitutions::new()
                .insert("${POSTGRES_USER}", db.username.as_str())
                .insert("${POSTGRES_PASSWORD}", db.password.as_str())
                .insert("${POSTGRES_DB}", db.db_name.as_str());
            api.apply_manifest(kubeconfig, &local("gitea.yaml"), &substitutions)
                .await?;
        }
        Feature::GiteaIngress => {
            api.apply_manifest(kubeconfig, &local("gitea.ingress.yaml"), &domain())
                .await?;
        }
        Feature::Prometheus => {
            api.install_chart(&ChartRequest {
                kubeconfig: kubeconfig.to_path_buf(),
                release: "kube-prom-stack".to_string(),
                namespace: "monitoring".to_string(),
                repo_name: "prometheus-community".to_string(),
                repo_url: "https://prometheus-community.github.io/helm-charts".to_string(),
                chart: "kube-prometheus-stack".to_string(),
                version: "35.5.1".to_string(),
                values_file: Some(config.manifest_path("prom-stack-values.yaml")),
            })
            .await?;
        }
        Feature::Linkerd => {
            install_mesh(mesh, api, cluster, kubeconfig, config, logger, false).await?;
        }
        Feature::LinkerdMulticluster => {
            install_mesh(mesh, api, cluster, kubeconfig, config, logger, true).await?;
        }
    }
    Ok(())
}
