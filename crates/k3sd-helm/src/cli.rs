//! [`HelmBackend`] driving the `helm` binary

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use k3sd_common::{Error, HelmSettings, Result};

use crate::backend::{HelmBackend, ReleaseAction, ReleaseInfo};
use crate::repository::RepositoryFile;

/// Runs helm with its repository state confined to the configured data dir
pub struct HelmCli {
    settings: HelmSettings,
}

impl HelmCli {
    /// Backend using `settings`
    pub fn new(settings: HelmSettings) -> Self {
        Self { settings }
    }

    async fn run(&self, context: &str, args: Vec<OsString>) -> Result<String> {
        tokio::fs::create_dir_all(&self.settings.data_dir).await?;

        let mut command = Command::new(&self.settings.binary);
        command
            .args(&args)
            .arg("--repository-config")
            .arg(self.settings.repository_config())
            .arg("--repository-cache")
            .arg(self.settings.repository_cache());
        debug!(context = %context, args = ?args, "running helm");

        let output = command
            .output()
            .await
            .map_err(|e| Error::helm(context, format!("failed to run {}: {}", self.settings.binary, e)))?;

        if !output.status.success() {
            return Err(Error::helm(
                context,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn release(&self, verb: &str, action: &ReleaseAction) -> Result<()> {
        let mut values = tempfile::Builder::new()
            .prefix("k3sd-values-")
            .suffix(".json")
            .tempfile()?;
        values.write_all(serde_json::to_string(&action.values)?.as_bytes())?;
        values.flush()?;

        self.run(&action.release, release_args(verb, action, values.path()))
            .await
            .map(|_| ())
    }
}

/// Arguments of `helm install` or `helm upgrade` for `action`
pub fn release_args(verb: &str, action: &ReleaseAction, values_file: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        verb.into(),
        action.release.as_str().into(),
        action.chart_path.as_os_str().into(),
        "--namespace".into(),
        action.namespace.as_str().into(),
        "--kubeconfig".into(),
        action.kubeconfig.as_os_str().into(),
        "--values".into(),
        values_file.as_os_str().into(),
        "--timeout".into(),
        format!("{}s", action.policy.timeout.as_secs()).into(),
    ];
    if action.policy.wait {
        args.push("--wait".into());
    }
    if action.policy.atomic {
        args.push("--atomic".into());
    }
    args
}

#[derive(Deserialize)]
struct ReleaseStatus {
    #[serde(default)]
    info: ReleaseStatusInfo,
}

#[derive(Default, Deserialize)]
struct ReleaseStatusInfo {
    #[serde(default)]
    description: String,
}

#[async_trait]
impl HelmBackend for HelmCli {
    async fn registered_repos(&self) -> Result<RepositoryFile> {
        RepositoryFile::load(&self.settings.repository_config())
    }

    async fn add_repo(&self, name: &str, url: &str) -> Result<()> {
        self.run(name, vec!["repo".into(), "add".into(), name.into(), url.into()])
            .await
            .map(|_| ())
    }

    async fn update_repos(&self) -> Result<()> {
        self.run("repo update", vec!["repo".into(), "update".into()])
            .await
            .map(|_| ())
    }

    async fn pull_chart(&self, repo: &str, chart: &str, version: &str) -> Result<PathBuf> {
        let destination = self.settings.chart_dir();
        tokio::fs::create_dir_all(&destination).await?;

        let chart_ref = format!("{}/{}", repo, chart);
        self.run(
            &chart_ref,
            vec![
                "pull".into(),
                chart_ref.as_str().into(),
                "--version".into(),
                version.into(),
                "--destination".into(),
                destination.as_os_str().into(),
            ],
        )
        .await?;

        let archive = destination.join(format!("{}-{}.tgz", chart, version));
        if !archive.is_file() {
            return Err(Error::helm(
                &chart_ref,
                format!("pulled chart not found at {}", archive.display()),
            ));
        }
        Ok(archive)
    }

    async fn list_releases(&self, kubeconfig: &Path, namespace: &str) -> Result<Vec<ReleaseInfo>> {
        let stdout = self
            .run(
                namespace,
                vec![
                    "list".into(),
                    "--namespace".into(),
                    namespace.into(),
                    "--kubeconfig".into(),
                    kubeconfig.as_os_str().into(),
                    "--all".into(),
                    "--output".into(),
                    "json".into(),
                ],
            )
            .await?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn install(&self, action: &ReleaseAction) -> Result<()> {
        self.release("install", action).await
    }

    async fn upgrade(&self, action: &ReleaseAction) -> Result<()> {
        self.release("upgrade", action).await
    }

    async fn release_description(
        &self,
        kubeconfig: &Path,
        release: &str,
        namespace: &str,
    ) -> Result<Option<String>> {
        let stdout = self
            .run(
                release,
                vec![
                    "status".into(),
                    release.into(),
                    "--namespace".into(),
                    namespace.into(),
                    "--kubeconfig".into(),
                    kubeconfig.as_os_str().into(),
                    "--output".into(),
                    "json".into(),
                ],
            )
            .await?;
        let status: ReleaseStatus = serde_json::from_str(&stdout)?;
        Ok(Some(status.info.description).filter(|d| !d.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k3sd_common::ReleasePolicy;

    fn action(atomic: bool) -> ReleaseAction {
        ReleaseAction {
            kubeconfig: PathBuf::from("kubeconfigs/r1/master.yaml"),
            release: "kube-prom-stack".to_string(),
            namespace: "monitoring".to_string(),
            chart_path: PathBuf::from(".helm/charts/kube-prometheus-stack-35.5.1.tgz"),
            values: serde_json::json!({}),
            policy: ReleasePolicy::with_atomic(atomic),
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn install_args_carry_policy() {
        let args = strings(release_args("install", &action(true), Path::new("/tmp/v.json")));
        assert_eq!(&args[..3], ["install", "kube-prom-stack", ".helm/charts/kube-prometheus-stack-35.5.1.tgz"]);
        assert!(args.windows(2).any(|w| w == ["--namespace", "monitoring"]));
        assert!(args.windows(2).any(|w| w == ["--timeout", "600s"]));
        assert!(args.windows(2).any(|w| w == ["--values", "/tmp/v.json"]));
        assert!(args.contains(&"--wait".to_string()));
        assert!(args.contains(&"--atomic".to_string()));
    }

    #[test]
    fn atomic_is_omitted_when_disabled() {
        let args = strings(release_args("upgrade", &action(false), Path::new("/tmp/v.json")));
        assert_eq!(args[0], "upgrade");
        assert!(!args.contains(&"--atomic".to_string()));
    }

    #[test]
    fn release_list_json_decodes() {
        let releases: Vec<ReleaseInfo> = serde_json::from_str(
            r#"[{"name":"kube-prom-stack","namespace":"monitoring","revision":"1","updated":"2024-01-01","status":"deployed","chart":"kube-prometheus-stack-35.5.1","app_version":"0.56.3"}]"#,
        )
        .unwrap();
        assert_eq!(releases[0].name, "kube-prom-stack");
        assert_eq!(releases[0].status, "deployed");
    }

    #[test]
    fn status_description_decodes() {
        let status: ReleaseStatus = serde_json::from_str(
            r#"{"name":"x","info":{"status":"failed","description":"timed out waiting for the condition"}}"#,
        )
        .unwrap();
        assert_eq!(status.info.description, "timed out waiting for the condition");
    }
}
