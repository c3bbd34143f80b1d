//! Sync engine that drives one load, diff and apply pass.

use std::sync::Arc;
use tracing::{info, warn};

use reposync_common::Result;
use reposync_storage::RepositoryProxy;

use crate::apply::apply;
use crate::config::SyncConfig;
use crate::conflict::SyncMode;
use crate::diff::{compare, ManifestComparison};
use crate::report::{ApplyReport, Reporter};

/// Coordinates a source and a destination repository.
///
/// The caller decides what to do with a comparison (show it, refuse it,
/// apply it) and must call `release` when done, on error paths too.
pub struct SyncEngine {
    source: Arc<dyn RepositoryProxy>,
    dest: Arc<dyn RepositoryProxy>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn RepositoryProxy>,
        dest: Arc<dyn RepositoryProxy>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            dest,
            config,
        }
    }

    pub fn source(&self) -> &Arc<dyn RepositoryProxy> {
        &self.source
    }

    pub fn dest(&self) -> &Arc<dyn RepositoryProxy> {
        &self.dest
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Load both manifests and compare them. Nothing is written.
    pub async fn compare(&self) -> Result<ManifestComparison> {
        let (source, dest) = tokio::try_join!(self.source.manifest(), self.dest.manifest())?;
        let comparison = compare(&source, &dest);
        info!(
            source = %self.source.location(),
            dest = %self.dest.location(),
            differences = comparison.file_differences(),
            "Compared manifests"
        );
        Ok(comparison)
    }

    /// Apply `comparison` under `mode`, then persist both manifests.
    pub async fn apply(
        &self,
        comparison: &ManifestComparison,
        mode: SyncMode,
        reporter: &dyn Reporter,
    ) -> Result<ApplyReport> {
        let applied = apply(
            comparison,
            self.source.as_ref(),
            self.dest.as_ref(),
            mode,
            &self.config,
            reporter,
        )
        .await;
        // Persist whatever landed, even if planning failed midway.
        let flushed = self.flush().await;
        let report = applied?;
        flushed?;
        Ok(report)
    }

    /// Compare and apply in one pass.
    pub async fn run(&self, mode: SyncMode, reporter: &dyn Reporter) -> Result<ApplyReport> {
        let comparison = self.compare().await?;
        self.apply(&comparison, mode, reporter).await
    }

    async fn flush(&self) -> Result<()> {
        let (source, dest) = tokio::join!(self.source.flush(), self.dest.flush());
        source.and(dest)
    }

    /// Release staging areas of both repositories. Both are released even
    /// if the first fails.
    pub async fn release(&self) -> Result<()> {
        let source = self.source.cleanup_before_exit().await;
        let dest = self.dest.cleanup_before_exit().await;
        if let Err(e) = &source {
            warn!(location = %self.source.location(), error = %e, "Cleanup failed");
        }
        if let Err(e) = &dest {
            warn!(location = %self.dest.location(), error = %e, "Cleanup failed");
        }
        source.and(dest)
    }
}
