//! Indexer facade
//!
//! [`Indexer`] owns the database, configuration and the collaborator seams
//! (session factory, category classifier, release handoff) and runs the
//! pipeline phases in order: scan, assemble, finalize, reap.

use crate::assemble::assemble;
use crate::config::Config;
use crate::db::{Database, Group, NewRelease};
use crate::error::{Error, ParseError, Result};
use crate::nntp::{NntpSessionFactory, SessionFactory};
use crate::nzb;
use crate::publish::ReleasePublisher;
use crate::release::{
    CategoryClassifier, NoopHandoff, ReleaseFinalizer, ReleaseHandoff, StaticClassifier, clean_release_name,
    search_name,
};
use crate::scan::{PoolReport, ScanContext, ScanJob, scan_groups};
use crate::types::{AssembleStats, FinalizeStats, ReleaseId, ReleaseStatus, ReleaseSummary};
use chrono::{DateTime, TimeZone, Utc};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Counts from one update cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Per-group scan outcomes
    pub scan: PoolReport,
    /// Assembly counts, early processing included
    pub assembled: AssembleStats,
    /// Finalization counts, early processing included
    pub finalized: FinalizeStats,
    /// Unconsumed parts deleted by age
    pub reaped_parts: u64,
    /// Incomplete binaries deleted by age
    pub reaped_binaries: u64,
}

/// Outcome of importing a file or directory of NZB documents
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Releases created
    pub imported: Vec<ReleaseId>,
    /// Documents rejected, with the reason
    pub rejected: Vec<(PathBuf, String)>,
}

/// The indexing pipeline
pub struct Indexer {
    db: Arc<Database>,
    config: Arc<Config>,
    factory: Arc<dyn SessionFactory>,
    classifier: Arc<dyn CategoryClassifier>,
    handoff: Arc<dyn ReleaseHandoff>,
    cancel: CancellationToken,
}

impl Indexer {
    /// Build an indexer from configuration
    ///
    /// Opens (and migrates) the database, and wires the NNTP session factory,
    /// the configured category rules and, when enabled, release publishing.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.persistence.database_path).await?;
        let factory: Arc<dyn SessionFactory> =
            Arc::new(NntpSessionFactory::new(config.server.clone()));
        let classifier: Arc<dyn CategoryClassifier> =
            Arc::new(StaticClassifier::from_config(&config.categories)?);
        let handoff: Arc<dyn ReleaseHandoff> = if config.publish.enabled {
            Arc::new(ReleasePublisher::new(&config.publish, config.retry.clone())?)
        } else {
            Arc::new(NoopHandoff)
        };

        tracing::info!(
            database = %config.persistence.database_path.display(),
            server = %config.server.host,
            publish = config.publish.enabled,
            "Indexer initialized"
        );

        Ok(Self::from_parts(db, config, factory, classifier, handoff))
    }

    /// Build an indexer from already constructed collaborators
    pub fn from_parts(
        db: Database,
        config: Config,
        factory: Arc<dyn SessionFactory>,
        classifier: Arc<dyn CategoryClassifier>,
        handoff: Arc<dyn ReleaseHandoff>,
    ) -> Self {
        Self {
            db: Arc::new(db),
            config: Arc::new(config),
            factory,
            classifier,
            handoff,
            cancel: CancellationToken::new(),
        }
    }

    /// Database handle
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that stops the indexer when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a cooperative shutdown
    pub fn shutdown(&self) {
        tracing::info!("Shutdown requested");
        self.cancel.cancel();
    }

    fn scan_context(&self) -> ScanContext {
        ScanContext {
            db: Arc::clone(&self.db),
            config: Arc::clone(&self.config),
            factory: Arc::clone(&self.factory),
            cancel: self.cancel.clone(),
        }
    }

    /// Groups to scan: the named one (which must be registered) or every active group
    async fn target_groups(&self, group: Option<&str>) -> Result<Vec<String>> {
        match group {
            Some(name) => {
                self.db
                    .get_group(name)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("group '{}'", name)))?;
                Ok(vec![name.to_string()])
            }
            None => Ok(self
                .db
                .list_groups(true)
                .await?
                .into_iter()
                .map(|g| g.name)
                .collect()),
        }
    }

    /// Run one update cycle
    ///
    /// Processes early when too many segments are waiting, scans every
    /// active group (or just `group`) forward, assembles and finalizes, then
    /// reaps stale parts and binaries.
    pub async fn update_cycle(&self, group: Option<&str>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        if let Some(threshold) = self.config.scan.early_process_threshold {
            let waiting = self.db.count_segments().await?;
            if waiting >= i64::try_from(threshold).unwrap_or(i64::MAX) {
                tracing::info!(waiting, threshold, "Segment backlog over threshold, processing before scan");
                let (assembled, finalized) = self.process().await?;
                add_assemble(&mut report.assembled, assembled);
                add_finalize(&mut report.finalized, finalized);
            }
        }

        let groups = self.target_groups(group).await?;
        if groups.is_empty() {
            tracing::warn!("No active groups to update");
        }
        report.scan = scan_groups(&self.scan_context(), groups, ScanJob::Update).await?;
        for (group, error) in &report.scan.failed {
            tracing::error!(group = %group, error = %error, "Group update failed");
        }

        let (assembled, finalized) = self.process().await?;
        add_assemble(&mut report.assembled, assembled);
        add_finalize(&mut report.finalized, finalized);

        let (parts, binaries) = self.reap().await?;
        report.reaped_parts = parts;
        report.reaped_binaries = binaries;

        tracing::info!(
            groups = report.scan.completed.len(),
            failed_groups = report.scan.failed.len(),
            parts_processed = report.assembled.processed,
            binaries_formed = report.assembled.formed,
            releases = report.finalized.created,
            reaped_parts = report.reaped_parts,
            reaped_binaries = report.reaped_binaries,
            "Update cycle complete"
        );
        Ok(report)
    }

    /// Run update cycles until cancelled, sleeping `update_wait` between them
    ///
    /// A cycle that fails with a non-fatal error is logged and the loop
    /// continues; authentication and configuration errors end the loop.
    pub async fn run_update(&self, group: Option<&str>) -> Result<()> {
        loop {
            match self.update_cycle(group).await {
                Ok(_) => {}
                Err(Error::ShuttingDown) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::error!(error = %e, "Update cycle failed"),
            }

            let wait = self.config.scan.update_wait;
            tracing::debug!(wait_secs = wait.as_secs(), "Sleeping until next update cycle");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        tracing::info!("Update loop stopped");
        Ok(())
    }

    /// Scan backward only, down to `target` or `backfill_days` ago
    pub async fn backfill(
        &self,
        group: Option<&str>,
        target: Option<DateTime<Utc>>,
    ) -> Result<PoolReport> {
        let groups = self.target_groups(group).await?;
        let report = scan_groups(&self.scan_context(), groups, ScanJob::Backfill { target }).await?;
        for (group, error) in &report.failed {
            tracing::error!(group = %group, error = %error, "Group backfill failed");
        }
        Ok(report)
    }

    /// Assemble binaries, then turn complete ones into releases
    pub async fn process(&self) -> Result<(AssembleStats, FinalizeStats)> {
        let scan = &self.config.scan;
        let assembled = assemble(
            &self.db,
            scan.binary_process_chunk_size,
            scan.orphan_grace_period,
            &self.cancel,
        )
        .await?;

        let finalizer = ReleaseFinalizer::new(
            &self.db,
            self.classifier.as_ref(),
            self.handoff.as_ref(),
            &self.config.release.min_archives,
            scan.release_chunk_size,
        );
        let finalized = finalizer.finalize(&self.cancel).await?;

        Ok((assembled, finalized))
    }

    /// Delete parts and binaries older than `dead_binary_age_days`
    ///
    /// Returns `(parts, binaries)` deleted; does nothing when the age is 0.
    pub async fn reap(&self) -> Result<(u64, u64)> {
        let days = self.config.scan.dead_binary_age_days;
        if days == 0 {
            return Ok((0, 0));
        }

        let older_than = Utc::now().timestamp() - i64::from(days) * 86_400;
        let parts = self.db.reap_unassigned_parts(older_than).await?;
        let binaries = self.db.reap_stale_binaries(older_than).await?;
        if parts > 0 || binaries > 0 {
            tracing::info!(parts, binaries, age_days = days, "Reaped dead parts and binaries");
        }
        Ok((parts, binaries))
    }

    /// Import one NZB document (plain or gzip) as a release
    ///
    /// The document's first listed group must be registered, and no release
    /// with the same name may exist.
    pub async fn import_nzb(&self, data: &[u8]) -> Result<ReleaseId> {
        let summary = nzb::decode(data)?;
        let stored = nzb::compress(data)?;
        self.import_summary(summary, stored).await
    }

    /// Import one `.nzb` or `.nzb.gz` file as a release
    ///
    /// The file is parsed and compressed as a stream on the blocking pool, so
    /// only the compressed document is held in memory.
    pub async fn import_file(&self, path: &Path) -> Result<ReleaseId> {
        let owned = path.to_path_buf();
        let (summary, stored) = tokio::task::spawn_blocking(move || -> Result<_> {
            let summary = nzb::decode_reader(BufReader::new(File::open(&owned)?))?;
            let stored = nzb::compress_reader(BufReader::new(File::open(&owned)?))?;
            Ok((summary, stored))
        })
        .await
        .map_err(|e| Error::Other(format!("NZB import task panicked: {}", e)))??;

        self.import_summary(summary, stored).await
    }

    async fn import_summary(&self, summary: nzb::NzbSummary, stored: Vec<u8>) -> Result<ReleaseId> {
        let name = clean_release_name(&summary.name);

        if self.db.find_release_by_name(&name).await?.is_some() {
            return Err(Error::Precondition(format!(
                "a release named '{}' already exists",
                name
            )));
        }

        let group_name = summary
            .files
            .iter()
            .flat_map(|f| f.groups.first())
            .next()
            .ok_or_else(|| ParseError::Nzb("document lists no groups".to_string()))?;
        let group = self
            .db
            .get_group(group_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group '{}'", group_name)))?;

        let category = self.classifier.classify(&name, &group.name).await?;
        let posted = summary
            .earliest_date()
            .unwrap_or_else(|| Utc::now().timestamp());
        let poster = summary
            .files
            .first()
            .map(|f| f.poster.clone())
            .unwrap_or_default();

        let release = NewRelease {
            search_name: search_name(&name),
            name,
            posted,
            posted_by: poster,
            group_id: group.id,
            category_id: category.id,
            regex_id: None,
            req_id: None,
            status: ReleaseStatus::Imported.to_i32(),
            total_parts: summary.file_count() as i64,
            size: i64::try_from(summary.total_bytes()).unwrap_or(i64::MAX),
        };

        let id = self
            .db
            .create_release(&release, &stored, None)
            .await?
            .ok_or_else(|| {
                Error::Precondition(format!(
                    "a release named '{}' posted at {} already exists",
                    release.name, release.posted
                ))
            })?;

        tracing::info!(release_id = %id, name = %release.name, group = %group.name, files = release.total_parts, "NZB imported");

        let summary = ReleaseSummary {
            id: id.clone(),
            name: release.name,
            search_name: release.search_name,
            group_name: group.name,
            category_id: category.id,
            posted: Utc
                .timestamp_opt(release.posted, 0)
                .single()
                .unwrap_or_else(Utc::now),
            posted_by: release.posted_by,
            total_parts: release.total_parts,
            size: release.size,
        };
        self.handoff.release_created(&summary).await;

        Ok(id)
    }

    /// Import a `.nzb`/`.nzb.gz` file, or every such file in a directory
    ///
    /// Rejected documents are reported, not fatal; database failures are.
    pub async fn import_path(&self, path: &Path) -> Result<ImportReport> {
        let files = if tokio::fs::metadata(path).await?.is_dir() {
            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let candidate = entry.path();
                if is_nzb_path(&candidate) {
                    files.push(candidate);
                }
            }
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut report = ImportReport::default();
        for file in files {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.import_file(&file).await {
                Ok(id) => report.imported.push(id),
                Err(e @ (Error::Database(_) | Error::Sqlx(_))) => return Err(e),
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "NZB import rejected");
                    report.rejected.push((file, e.to_string()));
                }
            }
        }

        tracing::info!(
            imported = report.imported.len(),
            rejected = report.rejected.len(),
            "NZB import complete"
        );
        Ok(report)
    }

    /// Register a group, or re-activate it if it exists
    pub async fn add_group(&self, name: &str) -> Result<i64> {
        let id = self.db.add_group(name).await?;
        tracing::info!(group = name, id, "Group added");
        Ok(id)
    }

    /// Remove a group; refused while releases reference it
    pub async fn remove_group(&self, name: &str) -> Result<()> {
        if !self.db.remove_group(name).await? {
            return Err(Error::NotFound(format!("group '{}'", name)));
        }
        tracing::info!(group = name, "Group removed");
        Ok(())
    }

    /// Enable or disable scanning of a group
    pub async fn set_group_active(&self, name: &str, active: bool) -> Result<()> {
        if !self.db.set_group_active(name, active).await? {
            return Err(Error::NotFound(format!("group '{}'", name)));
        }
        tracing::info!(group = name, active, "Group updated");
        Ok(())
    }

    /// Forget a group's scan cursors
    pub async fn reset_group(&self, name: &str) -> Result<()> {
        if !self.db.reset_group(name).await? {
            return Err(Error::NotFound(format!("group '{}'", name)));
        }
        tracing::info!(group = name, "Group cursors reset");
        Ok(())
    }

    /// Look up one group
    pub async fn group_info(&self, name: &str) -> Result<Group> {
        self.db
            .get_group(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group '{}'", name)))
    }

    /// Registered groups
    pub async fn list_groups(&self, active_only: bool) -> Result<Vec<Group>> {
        self.db.list_groups(active_only).await
    }
}

fn is_nzb_path(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    name.ends_with(".nzb") || name.ends_with(".nzb.gz")
}

fn add_assemble(total: &mut AssembleStats, pass: AssembleStats) {
    total.processed += pass.processed;
    total.formed += pass.formed;
    total.dead += pass.dead;
    total.deferred += pass.deferred;
}

fn add_finalize(total: &mut FinalizeStats, pass: FinalizeStats) {
    total.created += pass.created;
    total.duplicates += pass.duplicates;
    total.discarded += pass.discarded;
    total.failed += pass.failed;
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
