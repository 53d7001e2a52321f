//! Group scanning
//!
//! [`GroupScanController`] drives one news session across a group's article
//! range in bounded windows. Forward scans ("update") continue after the
//! group's `last` cursor; backward scans ("backfill") extend below its
//! `first` cursor. Each window's parts, misses and cursor movement commit
//! together, so an interrupted scan resumes at the last committed window.
//!
//! Transient protocol failures are retried in place a bounded number of
//! times on a fresh connection; after that the group's scan fails without
//! affecting other groups. Authentication failures are fatal for the run.

use crate::aggregate::{Blacklist, aggregate};
use crate::config::Config;
use crate::db::{CursorAdvance, Database, WindowCommit};
use crate::error::{Error, Result};
use crate::nntp::{GroupStats, NewsSession, SessionFactory};
use crate::retry::{Backoff, IsRetryable};
use crate::types::{OverviewBatch, ScanDirection, ScanState, ScanSummary};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod pool;

pub use pool::{PoolReport, ScanJob, scan_groups};

/// Shared dependencies of every scanner in a run
#[derive(Clone)]
pub struct ScanContext {
    /// Persistence
    pub db: Arc<Database>,
    /// Configuration
    pub config: Arc<Config>,
    /// Opens news sessions
    pub factory: Arc<dyn SessionFactory>,
    /// Cooperative cancellation, checked between windows
    pub cancel: CancellationToken,
}

/// Result of retrying missed articles for one group
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MissedRetry {
    /// Ids that were requested again
    pub requested: u64,
    /// Ids the server returned this time
    pub recovered: u64,
    /// Ids given up after reaching the retry limit
    pub dropped: u64,
}

/// Split `start..=end` into forward windows of at most `limit` articles
pub fn plan_forward_windows(start: u64, end: u64, limit: u64) -> Vec<(u64, u64)> {
    let limit = limit.max(1);
    let mut windows = Vec::new();
    let mut first = start;
    while first <= end {
        let last = first.saturating_add(limit - 1).min(end);
        windows.push((first, last));
        if last == u64::MAX {
            break;
        }
        first = last + 1;
    }
    windows
}

/// Split `floor..=start` into windows of at most `limit` articles, highest first
pub fn plan_backward_windows(start: u64, floor: u64, limit: u64) -> Vec<(u64, u64)> {
    let limit = limit.max(1);
    let mut windows = Vec::new();
    let mut last = start;
    while last >= floor {
        let first = last.saturating_sub(limit - 1).max(floor);
        windows.push((first, last));
        if first == 0 || first == floor {
            break;
        }
        last = first - 1;
    }
    windows
}

/// Collapse sorted article ids into inclusive ranges of consecutive ids
pub fn contiguous_ranges(ids: &[u64]) -> Vec<(u64, u64)> {
    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for &id in ids {
        match ranges.last_mut() {
            Some((_, last)) if *last + 1 == id => *last = id,
            _ => ranges.push((id, id)),
        }
    }
    ranges
}

/// One protocol step that can be retried on a fresh session
#[async_trait::async_trait]
trait Attempt: Sync {
    type Output: Send;

    async fn run(&self, session: &mut dyn NewsSession) -> Result<Self::Output>;
}

struct SelectGroup<'a> {
    group: &'a str,
}

#[async_trait::async_trait]
impl Attempt for SelectGroup<'_> {
    type Output = GroupStats;

    async fn run(&self, session: &mut dyn NewsSession) -> Result<GroupStats> {
        session.select_group(self.group).await
    }
}

struct DateLookup<'a> {
    group: &'a str,
    target: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Attempt for DateLookup<'_> {
    type Output = u64;

    async fn run(&self, session: &mut dyn NewsSession) -> Result<u64> {
        session.date_to_article_id(self.group, self.target).await
    }
}

struct FetchWindow<'a> {
    group: &'a str,
    first: u64,
    last: u64,
}

#[async_trait::async_trait]
impl Attempt for FetchWindow<'_> {
    type Output = OverviewBatch;

    async fn run(&self, session: &mut dyn NewsSession) -> Result<OverviewBatch> {
        session.scan(self.group, self.first, self.last).await
    }
}

/// Scans groups over one (re)connectable news session
pub struct GroupScanController {
    ctx: ScanContext,
    session: Option<Box<dyn NewsSession>>,
    state: ScanState,
}

impl GroupScanController {
    /// Create a controller; the session is opened on first use
    pub fn new(ctx: ScanContext) -> Self {
        Self {
            ctx,
            session: None,
            state: ScanState::Idle,
        }
    }

    /// Current state of the scan in progress
    pub fn state(&self) -> ScanState {
        self.state
    }

    fn transition(&mut self, summary: &mut ScanSummary, state: ScanState) {
        tracing::debug!(
            group = %summary.group,
            direction = %summary.direction,
            from = ?self.state,
            to = ?state,
            "Scan state transition"
        );
        self.state = state;
        summary.state = state;
    }

    async fn session(&mut self) -> Result<&mut (dyn NewsSession + 'static)> {
        if self.session.is_none() {
            let session = self.ctx.factory.connect().await?;
            self.session = Some(session);
        }
        self.session
            .as_deref_mut()
            .ok_or_else(|| Error::Other("news session unavailable".to_string()))
    }

    /// Run a protocol step, retrying transient failures on a new connection
    async fn retrying<A: Attempt>(&mut self, group: &str, attempt: &A) -> Result<A::Output> {
        let retry = self.ctx.config.retry.clone();
        let mut backoff = Backoff::new(&retry);
        let mut tries = 0u32;

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(Error::ShuttingDown);
            }

            let result = match self.session().await {
                Ok(session) => attempt.run(session).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && tries < retry.max_attempts => {
                    tries += 1;
                    self.state = ScanState::Retrying;
                    // The connection may be half-dead; start over on a new one
                    self.session = None;
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        group,
                        error = %e,
                        attempt = tries,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Protocol step failed, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.ctx.cancel.cancelled() => return Err(Error::ShuttingDown),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the session if one is open
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.quit().await;
        }
    }

    /// Scan a group forward from its `last` cursor to the server's last article
    ///
    /// A never-scanned group starts at the article posted
    /// `new_group_scan_days` ago. At most `group_scan_limit` articles are
    /// taken per call.
    pub async fn update_group(&mut self, name: &str) -> Result<ScanSummary> {
        let mut summary = ScanSummary::new(name, ScanDirection::Forward);
        self.transition(&mut summary, ScanState::DeterminingStart);

        let result = self.run_update(name, &mut summary).await;
        self.finish(&mut summary, result)
    }

    async fn run_update(&mut self, name: &str, summary: &mut ScanSummary) -> Result<()> {
        let group = self
            .ctx
            .db
            .get_group(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group '{}'", name)))?;
        let blacklist = Blacklist::compile(name, &self.ctx.db.list_enabled_blacklists().await?);

        let stats = self.retrying(name, &SelectGroup { group: name }).await?;

        let start = match group.last {
            Some(last) => {
                let last = u64::try_from(last).unwrap_or(0);
                if stats.last < last {
                    return Err(Error::Precondition(format!(
                        "server last article {} is behind local last {} for '{}'",
                        stats.last, last, name
                    )));
                }
                last + 1
            }
            None => {
                let days = self.ctx.config.scan.new_group_scan_days;
                let target = Utc::now() - chrono::Duration::days(i64::from(days));
                let id = self.retrying(name, &DateLookup { group: name, target }).await?;
                tracing::info!(group = name, start = id, days, "New group, starting from lookback");
                id.max(stats.first)
            }
        };

        let mut end = stats.last;
        if let Some(limit) = self.ctx.config.scan.group_scan_limit {
            end = end.min(start.saturating_add(limit.saturating_sub(1)));
        }

        if start > end {
            tracing::info!(group = name, last = stats.last, "Group is up to date");
            return Ok(());
        }

        tracing::info!(group = name, start, end, total = end - start + 1, "Updating group");
        let limit = self.ctx.config.scan.message_scan_limit;
        for (first, last) in plan_forward_windows(start, end, limit) {
            let cursor = CursorAdvance::Forward {
                first: start as i64,
                last: last as i64,
            };
            self.scan_window(name, first, last, cursor, &blacklist, summary)
                .await?;
        }

        Ok(())
    }

    /// Scan a group backward from its `first` cursor down to `target`
    ///
    /// Refused for groups that were never updated. The scan stops at the
    /// later of the article posted at `target` and the server's first article.
    pub async fn backfill_group(
        &mut self,
        name: &str,
        target: DateTime<Utc>,
    ) -> Result<ScanSummary> {
        let mut summary = ScanSummary::new(name, ScanDirection::Backward);
        self.transition(&mut summary, ScanState::DeterminingStart);

        let result = self.run_backfill(name, target, &mut summary).await;
        self.finish(&mut summary, result)
    }

    async fn run_backfill(
        &mut self,
        name: &str,
        target: DateTime<Utc>,
        summary: &mut ScanSummary,
    ) -> Result<()> {
        let group = self
            .ctx
            .db
            .get_group(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("group '{}'", name)))?;
        let Some(first) = group.first else {
            return Err(Error::Precondition(format!(
                "group '{}' has never been updated; run update before backfill",
                name
            )));
        };
        let first = u64::try_from(first).unwrap_or(0);
        let blacklist = Blacklist::compile(name, &self.ctx.db.list_enabled_blacklists().await?);

        let stats = self.retrying(name, &SelectGroup { group: name }).await?;
        let target_id = self.retrying(name, &DateLookup { group: name, target }).await?;
        let floor = target_id.max(stats.first).max(1);

        if first <= floor {
            tracing::info!(group = name, first, floor, "Backfill target already reached");
            return Ok(());
        }
        let start = first - 1;

        tracing::info!(group = name, start, floor, total = start - floor + 1, "Backfilling group");
        let limit = self.ctx.config.scan.message_scan_limit;
        for (first, last) in plan_backward_windows(start, floor, limit) {
            let cursor = CursorAdvance::Backward {
                first: first as i64,
            };
            self.scan_window(name, first, last, cursor, &blacklist, summary)
                .await?;
        }

        Ok(())
    }

    /// Fetch, aggregate and commit one window
    async fn scan_window(
        &mut self,
        group: &str,
        first: u64,
        last: u64,
        cursor: CursorAdvance,
        blacklist: &Blacklist,
        summary: &mut ScanSummary,
    ) -> Result<()> {
        if self.ctx.cancel.is_cancelled() {
            tracing::info!(group, first, last, "Scan cancelled between windows");
            return Err(Error::ShuttingDown);
        }
        self.transition(summary, ScanState::ScanningWindow);

        let batch = self
            .retrying(group, &FetchWindow { group, first, last })
            .await?;

        let aggregation = aggregate(group, &batch.records, blacklist);
        let (received, ignored, blacklisted) = (
            aggregation.received,
            aggregation.ignored,
            aggregation.blacklisted,
        );
        let parts: Vec<_> = aggregation.parts.into_values().collect();
        let missing: &[u64] = if self.ctx.config.scan.retry_missed {
            &batch.missing
        } else {
            &[]
        };

        let written = self
            .ctx
            .db
            .save_window(
                &WindowCommit {
                    group,
                    parts: &parts,
                    missing,
                    cursor: Some(cursor),
                },
                self.ctx.config.scan.part_chunk_size,
            )
            .await?;

        summary.windows += 1;
        summary.received += received;
        summary.parts += written;
        summary.ignored += ignored;
        summary.blacklisted += blacklisted;
        summary.missing += batch.missing.len() as u64;

        tracing::info!(
            group,
            start = first,
            end = last,
            received,
            parts = written,
            ignored,
            blacklisted,
            missing = batch.missing.len(),
            "Window committed"
        );
        Ok(())
    }

    /// Re-request article ids that were missing from earlier overview responses
    pub async fn retry_missed(&mut self, name: &str) -> Result<MissedRetry> {
        let scan = self.ctx.config.scan.clone();
        let mut outcome = MissedRetry::default();
        if !scan.retry_missed {
            return Ok(outcome);
        }

        let misses = self
            .ctx
            .db
            .pending_misses(name, scan.message_scan_limit as usize)
            .await?;
        if misses.is_empty() {
            return Ok(outcome);
        }
        let ids: Vec<u64> = misses
            .iter()
            .filter_map(|m| u64::try_from(m.message).ok())
            .collect();
        outcome.requested = ids.len() as u64;

        let blacklist = Blacklist::compile(name, &self.ctx.db.list_enabled_blacklists().await?);
        let mut found = Vec::new();
        let mut still_missing = Vec::new();

        for (first, last) in contiguous_ranges(&ids) {
            if self.ctx.cancel.is_cancelled() {
                return Err(Error::ShuttingDown);
            }
            let batch = self
                .retrying(name, &FetchWindow { group: name, first, last })
                .await?;

            let aggregation = aggregate(name, &batch.records, &blacklist);
            let parts: Vec<_> = aggregation.parts.into_values().collect();
            self.ctx
                .db
                .save_window(
                    &WindowCommit {
                        group: name,
                        parts: &parts,
                        missing: &[],
                        cursor: None,
                    },
                    scan.part_chunk_size,
                )
                .await?;

            found.extend(batch.records.iter().map(|r| r.article as i64));
            still_missing.extend(batch.missing.iter().map(|&id| id as i64));
        }

        outcome.recovered = found.len() as u64;
        outcome.dropped = self
            .ctx
            .db
            .settle_misses(name, &found, &still_missing, scan.miss_retry_limit)
            .await?;

        tracing::info!(
            group = name,
            requested = outcome.requested,
            recovered = outcome.recovered,
            dropped = outcome.dropped,
            "Missed articles retried"
        );
        Ok(outcome)
    }

    fn finish(&mut self, summary: &mut ScanSummary, result: Result<()>) -> Result<ScanSummary> {
        match result {
            Ok(()) => {
                self.transition(summary, ScanState::Committed);
                tracing::info!(
                    group = %summary.group,
                    direction = %summary.direction,
                    windows = summary.windows,
                    received = summary.received,
                    parts = summary.parts,
                    ignored = summary.ignored,
                    blacklisted = summary.blacklisted,
                    missing = summary.missing,
                    "Group scan complete"
                );
                Ok(summary.clone())
            }
            Err(e) => {
                self.transition(summary, ScanState::Failed);
                if matches!(e, Error::ShuttingDown) {
                    tracing::info!(group = %summary.group, windows = summary.windows, "Group scan stopped for shutdown");
                } else {
                    tracing::error!(
                        group = %summary.group,
                        direction = %summary.direction,
                        windows = summary.windows,
                        error = %e,
                        "Group scan failed"
                    );
                }
                Err(e)
            }
        }
    }
}
