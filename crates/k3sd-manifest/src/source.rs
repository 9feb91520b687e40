//! Where manifest text comes from

use std::fmt;
use std::path::PathBuf;

use k3sd_common::{Error, Result};

/// A manifest location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Local file
    Path(PathBuf),
    /// `http://` or `https://` URL
    Url(String),
    /// Text already in memory, such as rendered CLI output
    Inline {
        /// Name used in logs and errors
        name: String,
        /// Manifest text
        content: String,
    },
}

impl ManifestSource {
    /// Interpret `location` as a URL when it has an http(s) scheme, else a path
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Url(location.to_string())
        } else {
            Self::Path(PathBuf::from(location))
        }
    }

    /// Inline manifest text
    pub fn inline(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Inline {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Read the raw manifest text
    pub async fn fetch(&self, http: &reqwest::Client) -> Result<String> {
        match self {
            Self::Path(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::manifest(self.to_string(), format!("failed to read: {}", e))),
            Self::Url(url) => {
                let response = http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| Error::manifest(url, format!("request failed: {}", e)))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Error::manifest(url, format!("unexpected HTTP status {}", status)));
                }
                response
                    .text()
                    .await
                    .map_err(|e| Error::manifest(url, format!("failed to read body: {}", e)))
            }
            Self::Inline { content, .. } => Ok(content.clone()),
        }
    }
}

impl fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
            Self::Inline { name, .. } => write!(f, "<{}>", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_schemes_are_urls() {
        assert_eq!(
            ManifestSource::parse("https://example.com/a.yaml"),
            ManifestSource::Url("https://example.com/a.yaml".to_string())
        );
        assert_eq!(
            ManifestSource::parse("http://example.com/a.yaml"),
            ManifestSource::Url("http://example.com/a.yaml".to_string())
        );
    }

    #[test]
    fn everything_else_is_a_path() {
        assert_eq!(
            ManifestSource::parse("yamls/gitea.yaml"),
            ManifestSource::Path(PathBuf::from("yamls/gitea.yaml"))
        );
    }

    #[tokio::test]
    async fn reads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.yaml");
        std::fs::write(&path, "a: 1\n").unwrap();

        let text = ManifestSource::Path(path).fetch(&reqwest::Client::new()).await.unwrap();
        assert_eq!(text, "a: 1\n");
    }

    #[tokio::test]
    async fn missing_file_is_a_manifest_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ManifestSource::Path(dir.path().join("absent.yaml"))
            .fetch(&reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Manifest { .. }));
    }

    #[tokio::test]
    async fn inline_returns_content() {
        let source = ManifestSource::inline("linkerd-crds", "kind: X");
        assert_eq!(source.to_string(), "<linkerd-crds>");
        assert_eq!(source.fetch(&reqwest::Client::new()).await.unwrap(), "kind: X");
    }
}
