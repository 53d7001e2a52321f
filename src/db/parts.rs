//! Part and segment persistence.
//!
//! A scanned window is written as a [`WindowCommit`]: its parts are merged
//! into the store chunk by chunk, one transaction per chunk, and the group's
//! cursor moves in the same transaction as the final chunk. A crash between
//! chunks therefore re-scans the window instead of skipping it, and because
//! parts merge by hash and segments by number, re-ingesting is idempotent.

use crate::aggregate::PendingPart;
use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;

use super::{Database, PartRow, SegmentRow};

/// SQLite default SQLITE_MAX_VARIABLE_NUMBER is 999.
/// Each segment row uses 4 bind variables.
const MAX_SEGMENTS_PER_BATCH: usize = 249;

/// Each miss row uses 3 bind variables.
const MAX_MISSES_PER_BATCH: usize = 333;

/// Maximum ids in one `IN (...)` list
pub(super) const MAX_IDS_PER_QUERY: usize = 900;

/// Cursor movement committed together with a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorAdvance {
    /// Forward scan reached `last`; `first` is set only if the group has none yet
    Forward {
        /// Start of the very first window
        first: i64,
        /// Highest article id covered
        last: i64,
    },
    /// Backward scan reached `first`
    Backward {
        /// Lowest article id covered
        first: i64,
    },
}

/// Everything persisted for one scanned window
#[derive(Debug, Clone, Copy)]
pub struct WindowCommit<'a> {
    /// Group the window belongs to
    pub group: &'a str,
    /// Aggregated parts
    pub parts: &'a [PendingPart],
    /// Article ids to record as missed (empty when missed-retry is off)
    pub missing: &'a [u64],
    /// Cursor movement, if the window advances the group
    pub cursor: Option<CursorAdvance>,
}

impl Database {
    /// Persist a scanned window
    ///
    /// Returns the number of parts inserted or extended.
    pub async fn save_window(&self, commit: &WindowCommit<'_>, chunk_size: usize) -> Result<u64> {
        let empty: &[PendingPart] = &[];
        let chunks: Vec<&[PendingPart]> = if commit.parts.is_empty() {
            vec![empty]
        } else {
            commit.parts.chunks(chunk_size.max(1)).collect()
        };
        let last_chunk = chunks.len() - 1;
        let now = chrono::Utc::now().timestamp();
        let mut written = 0u64;

        for (idx, chunk) in chunks.into_iter().enumerate() {
            let mut tx = self.pool.begin().await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

            let mut segments = Vec::new();
            for part in chunk {
                let part_id = Self::upsert_part(&mut tx, part, now).await?;
                segments.extend(part.segments.values().map(|s| (part_id, s)));
            }

            for batch in segments.chunks(MAX_SEGMENTS_PER_BATCH) {
                let mut query_builder = sqlx::QueryBuilder::new(
                    "INSERT OR IGNORE INTO segments (part_id, number, size, message_id) ",
                );
                query_builder.push_values(batch, |mut b, (part_id, segment)| {
                    b.push_bind(*part_id)
                        .push_bind(segment.number as i64)
                        .push_bind(segment.size as i64)
                        .push_bind(&segment.message_id);
                });
                query_builder.build().execute(&mut *tx).await.map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to insert segments batch: {}",
                        e
                    )))
                })?;
            }

            if idx == last_chunk {
                Self::insert_misses(&mut tx, commit.group, commit.missing).await?;
                if let Some(cursor) = commit.cursor {
                    Self::advance_cursor(&mut tx, commit.group, cursor).await?;
                }
            }

            tx.commit().await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to commit window chunk: {}",
                    e
                )))
            })?;
            written += chunk.len() as u64;
        }

        Ok(written)
    }

    /// Insert a part or merge it into the stored part with the same hash
    async fn upsert_part(conn: &mut SqliteConnection, part: &PendingPart, now: i64) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO parts (hash, subject, group_name, posted, posted_by, xref, total_segments, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(group_name, hash) DO UPDATE SET posted = MIN(posted, excluded.posted)
            RETURNING id
            "#,
        )
        .bind(&part.hash)
        .bind(&part.subject)
        .bind(&part.group_name)
        .bind(part.posted.timestamp())
        .bind(&part.posted_by)
        .bind(&part.xref)
        .bind(part.total_segments as i64)
        .bind(now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert part: {}",
                e
            )))
        })?;

        Ok(id)
    }

    async fn insert_misses(conn: &mut SqliteConnection, group: &str, missing: &[u64]) -> Result<()> {
        for batch in missing.chunks(MAX_MISSES_PER_BATCH) {
            let mut query_builder =
                sqlx::QueryBuilder::new("INSERT OR IGNORE INTO misses (group_name, message, attempts) ");
            query_builder.push_values(batch, |mut b, message| {
                b.push_bind(group).push_bind(*message as i64).push_bind(0i64);
            });
            query_builder.build().execute(&mut *conn).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to record missed articles: {}",
                    e
                )))
            })?;
        }
        Ok(())
    }

    async fn advance_cursor(
        conn: &mut SqliteConnection,
        group: &str,
        cursor: CursorAdvance,
    ) -> Result<()> {
        let query = match cursor {
            CursorAdvance::Forward { first, last } => {
                sqlx::query("UPDATE groups SET last = ?, first = COALESCE(first, ?) WHERE name = ?")
                    .bind(last)
                    .bind(first)
                    .bind(group)
            }
            CursorAdvance::Backward { first } => {
                sqlx::query("UPDATE groups SET first = ? WHERE name = ?")
                    .bind(first)
                    .bind(group)
            }
        };

        let result = query.execute(&mut *conn).await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to advance group cursor: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "group '{}'",
                group
            ))));
        }
        Ok(())
    }

    /// Get a part by group and hash
    pub async fn get_part(&self, group: &str, hash: &str) -> Result<Option<PartRow>> {
        let part = sqlx::query_as::<_, PartRow>(
            r#"
            SELECT id, hash, subject, group_name, posted, posted_by, xref,
                   total_segments, binary_id, part_index
            FROM parts
            WHERE group_name = ? AND hash = ?
            "#,
        )
        .bind(group)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get part: {}",
                e
            )))
        })?;

        Ok(part)
    }

    /// Parts not yet assigned to a binary, in id order, after `after_id`
    pub async fn unassigned_parts(&self, after_id: i64, limit: usize) -> Result<Vec<PartRow>> {
        let parts = sqlx::query_as::<_, PartRow>(
            r#"
            SELECT id, hash, subject, group_name, posted, posted_by, xref,
                   total_segments, binary_id, part_index
            FROM parts
            WHERE binary_id IS NULL AND id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load unassigned parts: {}",
                e
            )))
        })?;

        Ok(parts)
    }

    /// All segments of the given parts, ordered by part then number
    pub async fn segments_for_parts(&self, part_ids: &[i64]) -> Result<Vec<SegmentRow>> {
        let mut segments = Vec::new();
        for batch in part_ids.chunks(MAX_IDS_PER_QUERY) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "SELECT id, part_id, number, size, message_id FROM segments WHERE part_id IN (",
            );
            let mut separated = query_builder.separated(", ");
            for id in batch {
                separated.push_bind(*id);
            }
            separated.push_unseparated(") ORDER BY part_id ASC, number ASC");

            let rows = query_builder
                .build_query_as::<SegmentRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to load segments: {}",
                        e
                    )))
                })?;
            segments.extend(rows);
        }
        Ok(segments)
    }

    /// Number of segments currently stored
    pub async fn count_segments(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM segments")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count segments: {}",
                    e
                )))
            })?;

        Ok(count)
    }

    /// Number of parts not yet assigned to a binary
    pub async fn count_unassigned_parts(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parts WHERE binary_id IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count parts: {}",
                    e
                )))
            })?;

        Ok(count)
    }

    /// Delete unassigned parts posted before `older_than` (unix seconds)
    pub async fn reap_unassigned_parts(&self, older_than: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM parts WHERE binary_id IS NULL AND posted < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to reap dead parts: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }
}
