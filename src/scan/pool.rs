//! Worker pool that spreads group scans over several news sessions

use super::{GroupScanController, ScanContext};
use crate::error::{Error, Result};
use crate::types::ScanSummary;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// What each worker does with a group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanJob {
    /// Forward scan, followed by a retry of missed articles when enabled
    Update,
    /// Backward scan down to `target`, or `backfill_days` ago when unset
    Backfill {
        /// Oldest posting date to reach
        target: Option<DateTime<Utc>>,
    },
}

/// Outcome of a pool run
#[derive(Debug, Default)]
pub struct PoolReport {
    /// Groups scanned to completion
    pub completed: Vec<ScanSummary>,
    /// Groups whose scan failed, with the error message
    pub failed: Vec<(String, String)>,
}

/// Scan `groups` with up to `update_threads` concurrent workers
///
/// Every worker owns one session and pulls group names from a shared queue, so
/// a group is only ever scanned by one worker. A failing group does not stop
/// the others; an authentication or configuration error stops the whole run
/// and is returned.
pub async fn scan_groups(ctx: &ScanContext, groups: Vec<String>, job: ScanJob) -> Result<PoolReport> {
    if groups.is_empty() {
        return Ok(PoolReport::default());
    }

    let workers = ctx.config.scan.update_threads.clamp(1, groups.len());
    let queue = Arc::new(Mutex::new(VecDeque::from(groups)));
    let run_cancel = ctx.cancel.child_token();

    tracing::info!(workers, ?job, "Starting group scan workers");

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let ctx = ScanContext {
                cancel: run_cancel.clone(),
                ..ctx.clone()
            };
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { run_worker(worker, ctx, queue, job).await })
        })
        .collect();

    let mut report = PoolReport::default();
    let mut fatal = None;
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(outcome) => {
                report.completed.extend(outcome.completed);
                report.failed.extend(outcome.failed);
                if fatal.is_none() {
                    fatal = outcome.fatal;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Scan worker panicked");
                report.failed.push(("<worker>".to_string(), e.to_string()));
            }
        }
    }

    if let Some(e) = fatal {
        return Err(e);
    }

    tracing::info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        "Group scan workers finished"
    );
    Ok(report)
}

struct WorkerOutcome {
    completed: Vec<ScanSummary>,
    failed: Vec<(String, String)>,
    fatal: Option<Error>,
}

async fn run_worker(
    worker: usize,
    ctx: ScanContext,
    queue: Arc<Mutex<VecDeque<String>>>,
    job: ScanJob,
) -> WorkerOutcome {
    let cancel = ctx.cancel.clone();
    let backfill_days = ctx.config.scan.backfill_days;
    let mut controller = GroupScanController::new(ctx);
    let mut outcome = WorkerOutcome {
        completed: Vec::new(),
        failed: Vec::new(),
        fatal: None,
    };

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(group) = queue.lock().await.pop_front() else {
            break;
        };
        tracing::debug!(worker, group = %group, "Worker picked group");

        let result = match job {
            ScanJob::Update => match controller.update_group(&group).await {
                // The forward scan is already committed; a failed miss retry
                // leaves the misses pending for the next cycle
                Ok(summary) => match controller.retry_missed(&group).await {
                    Err(e) if !e.is_fatal() && !matches!(e, Error::ShuttingDown) => {
                        tracing::warn!(worker, group = %group, error = %e, "Missed-article retry failed");
                        Ok(summary)
                    }
                    Err(e) => Err(e),
                    Ok(_) => Ok(summary),
                },
                Err(e) => Err(e),
            },
            ScanJob::Backfill { target } => {
                let target = target.unwrap_or_else(|| {
                    Utc::now() - chrono::Duration::days(i64::from(backfill_days))
                });
                controller.backfill_group(&group, target).await
            }
        };

        match result {
            Ok(summary) => outcome.completed.push(summary),
            Err(Error::ShuttingDown) => break,
            Err(e) if e.is_fatal() => {
                tracing::error!(worker, group = %group, error = %e, "Fatal scan error, stopping run");
                cancel.cancel();
                outcome.fatal = Some(e);
                break;
            }
            Err(e) => outcome.failed.push((group, e.to_string())),
        }
    }

    controller.close().await;
    outcome
}
