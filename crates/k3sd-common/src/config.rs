//! Provisioning configuration
//!
//! Everything the orchestrator needs to know about a run is carried by a
//! [`ProvisionConfig`] value built once by the CLI and threaded into
//! constructors. There is no global mutable state.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

/// Optional platform component, addressed by its feature-flag name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    /// cert-manager release manifests and CRDs
    CertManager,
    /// Traefik HelmChartConfig values
    TraefikValues,
    /// ACME ClusterIssuer for the cluster domain
    ClusterIssuer,
    /// Gitea application manifests
    Gitea,
    /// Ingress for Gitea on the cluster domain
    GiteaIngress,
    /// kube-prometheus-stack chart
    Prometheus,
    /// Linkerd mesh
    Linkerd,
    /// Linkerd mesh with the multicluster extension
    LinkerdMulticluster,
}

impl Feature {
    /// Every feature, in the order components are applied
    pub const ALL: [Feature; 8] = [
        Feature::CertManager,
        Feature::TraefikValues,
        Feature::ClusterIssuer,
        Feature::Gitea,
        Feature::GiteaIngress,
        Feature::Prometheus,
        Feature::Linkerd,
        Feature::LinkerdMulticluster,
    ];

    /// Flag name used for lookups and log lines
    pub fn name(&self) -> &'static str {
        match self {
            Self::CertManager => "cert-manager",
            Self::TraefikValues => "traefik-values",
            Self::ClusterIssuer => "clusterissuer",
            Self::Gitea => "gitea",
            Self::GiteaIngress => "gitea-ingress",
            Self::Prometheus => "prometheus",
            Self::Linkerd => "linkerd",
            Self::LinkerdMulticluster => "linkerd-mc",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| Error::validation(format!("unknown feature '{}'", s)))
    }
}

/// Set of enabled features
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    enabled: BTreeSet<Feature>,
}

impl Features {
    /// No features enabled
    pub fn none() -> Self {
        Self::default()
    }

    /// Enable a feature (builder style)
    pub fn with(mut self, feature: Feature) -> Self {
        self.enabled.insert(feature);
        self
    }

    /// Whether a feature is enabled
    pub fn contains(&self, feature: Feature) -> bool {
        self.enabled.contains(&feature)
    }

    /// Enabled features in application order
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.enabled.iter().copied()
    }
}

impl FromIterator<Feature> for Features {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self {
            enabled: iter.into_iter().collect(),
        }
    }
}

/// How remote host keys are checked when dialing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Trust any host key (ephemeral lab machines)
    #[default]
    AcceptAny,
    /// Require the key to be present in the operator's `known_hosts`
    KnownHosts,
}

/// Wait/timeout/rollback policy of one helm action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePolicy {
    /// Wait for resources to become ready
    pub wait: bool,
    /// Upper bound helm waits for
    pub timeout: Duration,
    /// Roll back on failure
    pub atomic: bool,
}

impl ReleasePolicy {
    /// Policy with the default 600 s timeout and the given atomic toggle
    pub fn with_atomic(atomic: bool) -> Self {
        Self {
            wait: true,
            timeout: DEFAULT_HELM_TIMEOUT,
            atomic,
        }
    }
}

/// Default timeout for helm install and upgrade
pub const DEFAULT_HELM_TIMEOUT: Duration = Duration::from_secs(600);

/// Helm backend settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmSettings {
    /// helm binary to invoke
    pub binary: String,
    /// Directory holding `repositories.yaml`, the index cache and pulled charts
    pub data_dir: PathBuf,
    /// Policy applied to first installs
    pub install: ReleasePolicy,
    /// Policy applied to upgrades of existing releases
    pub upgrade: ReleasePolicy,
}

impl HelmSettings {
    /// Settings rooted at `data_dir` with the global atomic toggle
    pub fn new(data_dir: impl Into<PathBuf>, atomic: bool) -> Self {
        Self {
            binary: "helm".to_string(),
            data_dir: data_dir.into(),
            install: ReleasePolicy::with_atomic(atomic),
            upgrade: ReleasePolicy::with_atomic(atomic),
        }
    }

    /// Path of the repository registry file
    pub fn repository_config(&self) -> PathBuf {
        self.data_dir.join("repositories.yaml")
    }

    /// Path of the repository index cache
    pub fn repository_cache(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Directory pulled chart archives are stored in
    pub fn chart_dir(&self) -> PathBuf {
        self.data_dir.join("charts")
    }
}

impl Default for HelmSettings {
    fn default() -> Self {
        Self::new(".helm", false)
    }
}

/// Configuration of one provisioning run
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Identifier namespacing this run's kubeconfigs and certificates
    pub run_id: String,
    /// Root directory kubeconfigs are written under
    pub kubeconfig_root: PathBuf,
    /// Directory holding the add-on manifests and values files
    pub manifest_dir: PathBuf,
    /// Directory private keys are loaded from; `None` means `~/.ssh`
    pub ssh_key_dir: Option<PathBuf>,
    /// Host key checking policy
    pub host_key_policy: HostKeyPolicy,
    /// Enabled optional components
    pub features: Features,
    /// Helm settings
    pub helm: HelmSettings,
    /// Delay after the control-plane install before the API is used
    pub settle_delay: Duration,
    /// Delay after cert-manager is applied so its webhook can come up
    pub cert_manager_settle: Duration,
    /// Extra commands appended to the control-plane bootstrap sequence
    pub extra_commands: Vec<String>,
}

impl ProvisionConfig {
    /// Configuration with defaults for the given run id
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            kubeconfig_root: PathBuf::from("kubeconfigs"),
            manifest_dir: PathBuf::from("yamls"),
            ssh_key_dir: None,
            host_key_policy: HostKeyPolicy::default(),
            features: Features::none(),
            helm: HelmSettings::default(),
            settle_delay: Duration::from_secs(10),
            cert_manager_settle: Duration::from_secs(30),
            extra_commands: Vec::new(),
        }
    }

    /// Directory holding this run's kubeconfigs and mesh certificates
    pub fn run_dir(&self) -> PathBuf {
        self.kubeconfig_root.join(&self.run_id)
    }

    /// Path of the kubeconfig written for `node_name`
    pub fn kubeconfig_path(&self, node_name: &str) -> PathBuf {
        self.run_dir().join(format!("{}.yaml", node_name))
    }

    /// Path of an add-on manifest or values file
    pub fn manifest_path(&self, file: &str) -> PathBuf {
        self.manifest_dir.join(file)
    }

    /// Directory private keys are enumerated from
    pub fn key_dir(&self) -> PathBuf {
        match &self.ssh_key_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir().unwrap_or_default().join(".ssh"),
        }
    }
}

/// Width of a generated run ID, in hex digits
pub const RUN_ID_LEN: usize = 6;

/// Fresh run ID naming this invocation's directory under the kubeconfig root.
///
/// Mixes wall-clock seconds, microseconds and the pid.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let seed = now.as_secs().rotate_left(24)
        ^ u64::from(now.subsec_micros())
        ^ u64::from(std::process::id()).rotate_left(12);
    let mask = (1u64 << (4 * RUN_ID_LEN)) - 1;
    format!("{:0width$x}", seed & mask, width = RUN_ID_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("cert-manager", Feature::CertManager)]
    #[case("traefik-values", Feature::TraefikValues)]
    #[case("clusterissuer", Feature::ClusterIssuer)]
    #[case("gitea-ingress", Feature::GiteaIngress)]
    #[case("linkerd-mc", Feature::LinkerdMulticluster)]
    fn feature_names_round_trip(#[case] name: &str, #[case] feature: Feature) {
        assert_eq!(name.parse::<Feature>().unwrap(), feature);
        assert_eq!(feature.name(), name);
    }

    #[test]
    fn unknown_feature_is_rejected() {
        assert!("istio".parse::<Feature>().is_err());
    }

    #[test]
    fn builder_enables_only_named_features() {
        let features = Features::none().with(Feature::Gitea).with(Feature::Prometheus);
        assert!(features.contains(Feature::Gitea));
        assert!(features.contains(Feature::Prometheus));
        assert!(!features.contains(Feature::Linkerd));
    }

    #[test]
    fn features_iterate_in_application_order() {
        let features: Features = [Feature::Linkerd, Feature::CertManager, Feature::Gitea]
            .into_iter()
            .collect();
        let order: Vec<_> = features.iter().collect();
        assert_eq!(order, vec![Feature::CertManager, Feature::Gitea, Feature::Linkerd]);
    }

    #[test]
    fn kubeconfig_paths_are_run_scoped() {
        let mut config = ProvisionConfig::new("abc123");
        config.kubeconfig_root = PathBuf::from("/tmp/kc");
        assert_eq!(config.run_dir(), PathBuf::from("/tmp/kc/abc123"));
        assert_eq!(
            config.kubeconfig_path("master-1"),
            PathBuf::from("/tmp/kc/abc123/master-1.yaml")
        );
    }

    #[test]
    fn helm_policies_share_the_atomic_toggle() {
        let helm = HelmSettings::new("/tmp/helm", true);
        assert!(helm.install.atomic);
        assert!(helm.upgrade.atomic);
        assert_eq!(helm.install.timeout, DEFAULT_HELM_TIMEOUT);
        assert_eq!(helm.repository_config(), PathBuf::from("/tmp/helm/repositories.yaml"));
    }

    #[test]
    fn explicit_key_dir_wins() {
        let mut config = ProvisionConfig::new("r");
        config.ssh_key_dir = Some(PathBuf::from("/keys"));
        assert_eq!(config.key_dir(), PathBuf::from("/keys"));
    }

    #[test]
    fn run_id_is_six_hex_chars() {
        let id = generate_run_id();
        assert_eq!(id.len(), RUN_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
