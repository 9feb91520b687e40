//! Linkerd mesh overlay
//!
//! Every cluster of a run shares one trust anchor so multicluster links can
//! verify each other; each cluster gets its own issuer signed by it. Manifests
//! rendered by the `linkerd` CLI go through the regular manifest engine.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use k3sd_common::{Cluster, Error, Logger, ProvisionConfig, Result};
use k3sd_manifest::{ManifestSource, Substitutions};

use crate::api::ClusterApi;
use crate::kubeconfig::write_private;

/// Common name of the shared trust anchor
pub const TRUST_ANCHOR_CN: &str = "identity.linkerd.cluster.local";

/// Validity of anchor and issuer certificates (438000h)
const CERT_VALIDITY_DAYS: i64 = 18_250;

/// Runs the mesh CLI
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MeshCli: Send + Sync {
    /// Run with `args` and return stdout
    async fn run(&self, args: &[String]) -> Result<String>;
}

/// [`MeshCli`] invoking the `linkerd` binary
#[derive(Debug, Clone)]
pub struct LinkerdCli {
    binary: String,
}

impl LinkerdCli {
    /// CLI found as `binary` on the PATH
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for LinkerdCli {
    fn default() -> Self {
        Self::new("linkerd")
    }
}

#[async_trait]
impl MeshCli for LinkerdCli {
    async fn run(&self, args: &[String]) -> Result<String> {
        let context = args.first().cloned().unwrap_or_default();
        debug!(args = ?args, "running linkerd");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::command("localhost", format!("{} {}", self.binary, args.join(" ")), None, e.to_string()))?;

        if !output.status.success() {
            return Err(Error::command(
                "localhost",
                format!("{} {}", self.binary, context),
                output.status.code().map(|c| c as u32),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// PEM-encoded certificate and key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPair {
    /// Certificate PEM
    pub cert_pem: String,
    /// Private key PEM
    pub key_pem: String,
}

fn validity() -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    (now, now + time::Duration::days(CERT_VALIDITY_DAYS))
}

fn ca_params(common_name: &str, constraints: BasicConstraints) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(constraints);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (not_before, not_after) = validity();
    params.not_before = not_before;
    params.not_after = not_after;
    params
}

fn pki_error(msg: String) -> Error {
    Error::validation(format!("mesh PKI: {}", msg))
}

/// Generate a self-signed root CA
pub fn generate_trust_anchor() -> Result<CertPair> {
    let key = KeyPair::generate().map_err(|e| pki_error(format!("failed to generate anchor key: {}", e)))?;
    let cert = ca_params(TRUST_ANCHOR_CN, BasicConstraints::Unconstrained)
        .self_signed(&key)
        .map_err(|e| pki_error(format!("failed to create trust anchor: {}", e)))?;
    Ok(CertPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Generate an intermediate CA for `domain`, signed by `anchor`
pub fn generate_issuer(anchor: &CertPair, domain: &str) -> Result<CertPair> {
    let anchor_key = KeyPair::from_pem(&anchor.key_pem)
        .map_err(|e| pki_error(format!("failed to parse anchor key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&anchor.cert_pem, &anchor_key)
        .map_err(|e| pki_error(format!("failed to load trust anchor: {}", e)))?;

    let key = KeyPair::generate().map_err(|e| pki_error(format!("failed to generate issuer key: {}", e)))?;
    let cert = ca_params(&format!("identity.linkerd.{}", domain), BasicConstraints::Constrained(0))
        .signed_by(&key, &issuer)
        .map_err(|e| pki_error(format!("failed to sign issuer: {}", e)))?;
    Ok(CertPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Load the run's trust anchor from `dir`, creating it on first use
pub fn load_or_create_anchor(dir: &Path) -> Result<CertPair> {
    let cert_path = dir.join("ca.crt");
    let key_path = dir.join("ca.key");

    if cert_path.is_file() && key_path.is_file() {
        debug!(dir = %dir.display(), "reusing trust anchor");
        return Ok(CertPair {
            cert_pem: std::fs::read_to_string(&cert_path)?,
            key_pem: std::fs::read_to_string(&key_path)?,
        });
    }

    let anchor = generate_trust_anchor()?;
    write_private(&cert_path, &anchor.cert_pem)?;
    write_private(&key_path, &anchor.key_pem)?;
    info!(dir = %dir.display(), "created trust anchor");
    Ok(anchor)
}

/// Paths of a cluster's issuer files
pub fn issuer_paths(dir: &Path, node_name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}-issuer.crt", node_name)),
        dir.join(format!("{}-issuer.key", node_name)),
    )
}

fn args<I: IntoIterator<Item = S>, S: Into<String>>(items: I) -> Vec<String> {
    items.into_iter().map(Into::into).collect()
}

/// Install the mesh on `cluster`, optionally with the multicluster extension
pub async fn install_mesh(
    cli: &dyn MeshCli,
    api: &dyn ClusterApi,
    cluster: &Cluster,
    kubeconfig: &Path,
    config: &ProvisionConfig,
    logger: &Logger,
    multicluster: bool,
) -> Result<()> {
    let dir = config.run_dir();
    let kc = kubeconfig.display().to_string();
    let node = cluster.name();

    let anchor = load_or_create_anchor(&dir)?;

    let crds = cli.run(&args(["install", "--crds", "--kubeconfig", kc.as_str()])).await?;
    apply_rendered(api, kubeconfig, "linkerd-crds", crds).await?;

    let issuer = generate_issuer(&anchor, &cluster.domain)?;
    let (issuer_crt, issuer_key) = issuer_paths(&dir, node);
    write_private(&issuer_crt, &issuer.cert_pem)?;
    write_private(&issuer_key, &issuer.key_pem)?;

    let control_plane = cli
        .run(&args([
            "install".to_string(),
            "--proxy-log-level=linkerd=debug,warn".to_string(),
            "--cluster-domain=cluster.local".to_string(),
            "--identity-trust-domain=cluster.local".to_string(),
            format!("--identity-trust-anchors-file={}", dir.join("ca.crt").display()),
            format!("--identity-issuer-certificate-file={}", issuer_crt.display()),
            format!("--identity-issuer-key-file={}", issuer_key.display()),
            "--kubeconfig".to_string(),
            kc.clone(),
        ]))
        .await?;
    apply_rendered(api, kubeconfig, "linkerd-control-plane", control_plane).await?;
    logger.log(format!("linkerd installed on {}", node)).await;

    if multicluster {
        let mc = cli
            .run(&args(["multicluster", "install", "--kubeconfig", kc.as_str()]))
            .await?;
        apply_rendered(api, kubeconfig, "linkerd-multicluster", mc).await?;
        logger.log(format!("linkerd multicluster installed on {}", node)).await;
        log_check(cli, logger, args(["multicluster", "check", "--kubeconfig", kc.as_str()])).await;
    } else {
        log_check(cli, logger, args(["check", "--pre", "--kubeconfig", kc.as_str()])).await;
        log_check(cli, logger, args(["check", "--kubeconfig", kc.as_str()])).await;
    }
    Ok(())
}

async fn apply_rendered(api: &dyn ClusterApi, kubeconfig: &Path, name: &str, rendered: String) -> Result<()> {
    let report = api
        .apply_manifest(kubeconfig, &ManifestSource::inline(name, rendered), &Substitutions::new())
        .await?;
    debug!(manifest = %name, created = report.created, existing = report.existing, "applied mesh manifest");
    Ok(())
}

/// Run a health check and log its report; a failing check does not fail the install
async fn log_check(cli: &dyn MeshCli, logger: &Logger, check: Vec<String>) {
    match cli.run(&check).await {
        Ok(report) => {
            for line in report.lines() {
                logger.log(line.to_string()).await;
            }
        }
        Err(e) => logger.log_err(format!("linkerd {} failed: {}", check.join(" "), e)).await,
    }
}
