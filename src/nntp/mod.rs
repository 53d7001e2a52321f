//! News server access
//!
//! Only the subset of NNTP the indexer needs is used: selecting a group,
//! fetching overview ranges and retrieving article bodies, all through the
//! nntp-rs client. The pipeline talks to the server through the [`NewsSession`] trait so scan
//! logic can be exercised against a scripted in-memory server.

use crate::config::NewsServerConfig;
use crate::error::Result;
use crate::types::OverviewBatch;
use chrono::{DateTime, Utc};

mod connection;
mod overview;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use connection::NntpConnection;
pub use overview::{overview_record, parse_overview_date};

/// How many consecutive article ids [`NewsSession::post_date`] probes before
/// giving up on a hole in the group
const POST_DATE_PROBES: u64 = 10;

/// Upper bound on binary-search steps when mapping a date to an article id
const MAX_SEARCH_STEPS: u32 = 64;

/// Counters returned by `GROUP`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupStats {
    /// Estimated number of articles
    pub count: u64,
    /// Lowest available article id
    pub first: u64,
    /// Highest available article id
    pub last: u64,
}

/// One session with an upstream news server
///
/// A session is owned by exactly one scanner at a time.
#[async_trait::async_trait]
pub trait NewsSession: Send {
    /// Select a group, returning its article counters
    async fn select_group(&mut self, name: &str) -> Result<GroupStats>;

    /// Fetch overview records for `first..=last` in the selected group
    async fn fetch_overview(&mut self, first: u64, last: u64) -> Result<OverviewBatch>;

    /// Retrieve the raw body of an article
    async fn fetch_article_body(&mut self, group: &str, message_id: &str) -> Result<Vec<u8>>;

    /// Name of the currently selected group
    fn selected_group(&self) -> Option<&str>;

    /// Close the session politely
    async fn quit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Select `group` if needed, then fetch `first..=last`
    async fn scan(&mut self, group: &str, first: u64, last: u64) -> Result<OverviewBatch> {
        if self.selected_group() != Some(group) {
            self.select_group(group).await?;
        }
        self.fetch_overview(first, last).await
    }

    /// Posting date of the first present article at or after `article`
    ///
    /// Probes up to ten consecutive ids (never past `limit`) because expired or
    /// cancelled articles leave holes. Returns the id actually found with its date.
    async fn post_date(
        &mut self,
        article: u64,
        limit: u64,
    ) -> Result<Option<(u64, DateTime<Utc>)>> {
        let end = article.saturating_add(POST_DATE_PROBES - 1).min(limit);
        if article > end {
            return Ok(None);
        }

        let batch = self.fetch_overview(article, end).await?;
        Ok(batch
            .records
            .into_iter()
            .find_map(|r| r.date.map(|d| (r.article, d))))
    }

    /// Map a date to the lowest article id posted at or after it
    ///
    /// Dates before the group's first article resolve to `first`, dates after
    /// the last article resolve to `last`.
    async fn date_to_article_id(&mut self, group: &str, target: DateTime<Utc>) -> Result<u64> {
        let stats = self.select_group(group).await?;
        if stats.last <= stats.first {
            return Ok(stats.first);
        }

        let Some((mut lo, first_date)) = self.post_date(stats.first, stats.last).await? else {
            return Ok(stats.first);
        };
        if target <= first_date {
            return Ok(stats.first);
        }

        let last_probe_start = stats.last.saturating_sub(POST_DATE_PROBES - 1).max(lo);
        // Newest dated article near the end of the group
        let tail = self.fetch_overview(last_probe_start, stats.last).await?;
        let newest = tail
            .records
            .iter()
            .rev()
            .find_map(|r| r.date.map(|d| (r.article, d)));
        let mut hi = match newest {
            Some((_, last_date)) if target > last_date => return Ok(stats.last),
            Some((id, _)) => id,
            None => stats.last,
        };

        let mut steps = 0;
        while hi > lo + 1 && steps < MAX_SEARCH_STEPS {
            steps += 1;
            let mid = lo + (hi - lo) / 2;
            match self.post_date(mid, hi - 1).await? {
                Some((found, date)) if date >= target => hi = found,
                Some((found, _)) => lo = found,
                // Nothing dated between mid and hi
                None => hi = mid,
            }
        }

        tracing::debug!(group, target = %target, article = hi, steps, "Resolved date to article id");
        Ok(hi)
    }
}

/// Creates news sessions; one per scan worker
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open and authenticate a new session
    async fn connect(&self) -> Result<Box<dyn NewsSession>>;
}

/// Production [`SessionFactory`] that opens NNTP connections
pub struct NntpSessionFactory {
    config: NewsServerConfig,
}

impl NntpSessionFactory {
    /// Create a factory for the configured server
    pub fn new(config: NewsServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl SessionFactory for NntpSessionFactory {
    async fn connect(&self) -> Result<Box<dyn NewsSession>> {
        let conn = NntpConnection::connect(&self.config).await?;
        Ok(Box::new(conn))
    }
}
