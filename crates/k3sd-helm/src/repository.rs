//! The local `repositories.yaml` registry

use std::path::Path;

use serde::{Deserialize, Serialize};

use k3sd_common::{Error, Result};

/// One registered chart repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEntry {
    /// Local alias
    pub name: String,
    /// Index URL
    pub url: String,
}

/// Parsed helm repository registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryFile {
    /// Registered repositories
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,
}

impl RepositoryFile {
    /// Load the registry at `path`; a missing or empty file is an empty registry
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::helm(
                    path.display().to_string(),
                    format!("failed to read repository file: {}", e),
                ))
            }
        };
        Self::parse(&text).map_err(|e| Error::helm(path.display().to_string(), e))
    }

    /// Parse registry text
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| format!("invalid repository file: {}", e))
    }

    /// Whether a repository named `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.repositories.iter().any(|r| r.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPOS: &str = r#"
apiVersion: ""
generated: "0001-01-01T00:00:00Z"
repositories:
- caFile: ""
  certFile: ""
  insecure_skip_tls_verify: false
  keyFile: ""
  name: prometheus-community
  pass_credentials_all: false
  password: ""
  url: https://prometheus-community.github.io/helm-charts
  username: ""
"#;

    #[test]
    fn parses_helm_registry() {
        let file = RepositoryFile::parse(REPOS).unwrap();
        assert!(file.contains("prometheus-community"));
        assert!(!file.contains("jetstack"));
        assert_eq!(
            file.repositories[0].url,
            "https://prometheus-community.github.io/helm-charts"
        );
    }

    #[test]
    fn empty_text_is_empty_registry() {
        assert_eq!(RepositoryFile::parse("  \n").unwrap(), RepositoryFile::default());
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let file = RepositoryFile::load(Path::new("/nonexistent/k3sd/repositories.yaml")).unwrap();
        assert!(file.repositories.is_empty());
    }
}
