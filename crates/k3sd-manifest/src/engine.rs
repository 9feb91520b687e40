//! Multi-document apply pipeline

use std::sync::Arc;

use tracing::{debug, info, warn};

use k3sd_common::{Error, Logger, Result};

use crate::applier::{Applier, ApplyOutcome};
use crate::decode::ManifestObject;
use crate::source::ManifestSource;
use crate::text::{split_documents, Substitutions};

/// Per-document tally of one apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Documents created
    pub created: usize,
    /// Documents whose object already existed
    pub existing: usize,
    /// Documents that could not be decoded or mapped to an API resource
    pub skipped: usize,
    /// Documents the API server rejected
    pub failed: usize,
}

impl ApplyReport {
    /// Whether every document was created or already present
    pub fn is_clean(&self) -> bool {
        self.skipped == 0 && self.failed == 0
    }

    /// Total number of documents seen
    pub fn total(&self) -> usize {
        self.created + self.existing + self.skipped + self.failed
    }
}

/// Fetches, splits and applies manifests through an [`Applier`]
#[derive(Clone)]
pub struct ManifestEngine {
    applier: Arc<dyn Applier>,
    logger: Logger,
    http: reqwest::Client,
}

impl ManifestEngine {
    /// Engine applying through `applier` and reporting on `logger`
    pub fn new(applier: Arc<dyn Applier>, logger: Logger) -> Self {
        Self {
            applier,
            logger,
            http: reqwest::Client::new(),
        }
    }

    /// Fetch `source`, substitute placeholders and apply every document.
    ///
    /// Only a fetch failure is an error; per-document problems are logged and
    /// counted in the report.
    pub async fn apply_source(
        &self,
        source: &ManifestSource,
        substitutions: &Substitutions,
    ) -> Result<ApplyReport> {
        let raw = source.fetch(&self.http).await?;
        let text = substitutions.apply(&raw);
        let report = self.apply_text(&source.to_string(), &text).await;
        if report.is_clean() {
            info!(
                source = %source,
                documents = report.total(),
                created = report.created,
                existing = report.existing,
                "applied manifest"
            );
        } else {
            warn!(
                source = %source,
                documents = report.total(),
                skipped = report.skipped,
                failed = report.failed,
                "applied manifest with errors"
            );
            self.logger
                .log_err(format!(
                    "{}: {} of {} documents not applied",
                    source,
                    report.skipped + report.failed,
                    report.total()
                ))
                .await;
        }
        Ok(report)
    }

    /// Apply every document of already substituted `text`
    pub async fn apply_text(&self, source_ref: &str, text: &str) -> ApplyReport {
        let mut report = ApplyReport::default();

        for (index, document) in split_documents(text).into_iter().enumerate() {
            let object = match ManifestObject::decode(document) {
                Ok(object) => object,
                Err(e) => {
                    warn!(source = %source_ref, document = index, error = %e, "skipping document");
                    self.logger
                        .log_err(format!("{}: skipping document {}: {}", source_ref, index, e))
                        .await;
                    report.skipped += 1;
                    continue;
                }
            };

            match self.applier.apply(&object).await {
                Ok(ApplyOutcome::Created) => {
                    debug!(object = %object.display_name(), "created");
                    self.logger.log(format!("created {}", object.display_name())).await;
                    report.created += 1;
                }
                Ok(ApplyOutcome::AlreadyExists) => {
                    debug!(object = %object.display_name(), "already exists");
                    self.logger
                        .log(format!("{} already exists", object.display_name()))
                        .await;
                    report.existing += 1;
                }
                Err(e @ Error::Discovery { .. }) => {
                    warn!(object = %object.display_name(), error = %e, "skipping unmapped document");
                    self.logger
                        .log_err(format!("{}: skipping {}: {}", source_ref, object.display_name(), e))
                        .await;
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(object = %object.display_name(), error = %e, "failed to apply document");
                    self.logger
                        .log_err(format!("{}: failed to apply {}: {}", source_ref, object.display_name(), e))
                        .await;
                    report.failed += 1;
                }
            }
        }

        report
    }
}
