//! Binary assembly commits and completion queries.

use crate::error::DatabaseError;
use crate::{Error, Result};
use std::collections::BTreeMap;

use super::parts::MAX_IDS_PER_QUERY;
use super::{BinaryRow, BinarySlot, Database, PartRow};

const BINARY_COLUMNS: &str = "b.id, b.hash, b.name, b.group_name, b.posted, b.posted_by, b.xref, \
     b.total_parts, b.regex_id, b.category_id, b.req_id, b.created_at";

/// A binary formed or extended by one assembler chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDraft {
    /// Dedup hash of name, group, poster and total
    pub hash: String,
    /// Extracted binary name
    pub name: String,
    /// Group name
    pub group_name: String,
    /// Unix timestamp of the earliest part
    pub posted: i64,
    /// Poster
    pub posted_by: String,
    /// Xref of the first part
    pub xref: String,
    /// Declared number of parts
    pub total_parts: i64,
    /// Rule that matched
    pub regex_id: Option<i64>,
    /// Category hint from the rule
    pub category_id: Option<i64>,
    /// Request id captured by the rule
    pub req_id: Option<String>,
    /// Part index to part id
    pub slots: BTreeMap<i64, i64>,
}

/// Everything one assembler chunk writes
#[derive(Debug, Clone, Default)]
pub struct AssemblyCommit {
    /// Binaries to create or extend, with their new part assignments
    pub binaries: Vec<BinaryDraft>,
    /// Parts to delete: unmatched, or displaced by a closer part
    pub dead_parts: Vec<i64>,
}

impl Database {
    /// Commit one assembler chunk in a single transaction
    pub async fn commit_assembly(&self, commit: &AssemblyCommit) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        // Dead parts go first: a displaced stored part frees its slot
        for batch in commit.dead_parts.chunks(MAX_IDS_PER_QUERY) {
            let mut query_builder = sqlx::QueryBuilder::new("DELETE FROM parts WHERE id IN (");
            let mut separated = query_builder.separated(", ");
            for id in batch {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            query_builder.build().execute(&mut *tx).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete dead parts: {}",
                    e
                )))
            })?;
        }

        for binary in &commit.binaries {
            let binary_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO binaries (hash, name, group_name, posted, posted_by, xref,
                                      total_parts, regex_id, category_id, req_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(hash) DO UPDATE SET posted = MIN(posted, excluded.posted)
                RETURNING id
                "#,
            )
            .bind(&binary.hash)
            .bind(&binary.name)
            .bind(&binary.group_name)
            .bind(binary.posted)
            .bind(&binary.posted_by)
            .bind(&binary.xref)
            .bind(binary.total_parts)
            .bind(binary.regex_id)
            .bind(binary.category_id)
            .bind(&binary.req_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to upsert binary: {}",
                    e
                )))
            })?;

            for (part_index, part_id) in &binary.slots {
                sqlx::query("UPDATE parts SET binary_id = ?, part_index = ? WHERE id = ?")
                    .bind(binary_id)
                    .bind(*part_index)
                    .bind(*part_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::QueryFailed(format!(
                            "Failed to assign part to binary: {}",
                            e
                        )))
                    })?;
            }
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit assembly chunk: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Get a binary by hash
    pub async fn get_binary_by_hash(&self, hash: &str) -> Result<Option<BinaryRow>> {
        let binary = sqlx::query_as::<_, BinaryRow>(&format!(
            "SELECT {} FROM binaries b WHERE b.hash = ?",
            BINARY_COLUMNS
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get binary: {}",
                e
            )))
        })?;

        Ok(binary)
    }

    /// Part slots already assigned to a binary
    pub async fn binary_slots(&self, binary_id: i64) -> Result<Vec<BinarySlot>> {
        let slots = sqlx::query_as::<_, BinarySlot>(
            r#"
            SELECT id AS part_id, part_index, posted
            FROM parts
            WHERE binary_id = ?
            ORDER BY part_index ASC
            "#,
        )
        .bind(binary_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load binary slots: {}",
                e
            )))
        })?;

        Ok(slots)
    }

    /// Binaries holding every segment of every declared part
    ///
    /// A binary qualifies when each of its assigned parts is segment-complete
    /// and the number of complete parts reaches `total_parts`. Results are
    /// ordered oldest first; `after` is the `(posted, id)` of the last binary
    /// of the previous page.
    pub async fn complete_binaries(
        &self,
        after: Option<(i64, i64)>,
        limit: usize,
    ) -> Result<Vec<BinaryRow>> {
        let (after_posted, after_id) = after.unwrap_or((i64::MIN, i64::MIN));
        let binaries = sqlx::query_as::<_, BinaryRow>(&format!(
            r#"
            SELECT {}
            FROM binaries b
            JOIN (
                SELECT p.binary_id,
                       COUNT(*) AS held_parts,
                       SUM(CASE WHEN COALESCE(s.held, 0) >= p.total_segments THEN 1 ELSE 0 END)
                           AS complete_parts
                FROM parts p
                LEFT JOIN (
                    SELECT part_id, COUNT(*) AS held FROM segments GROUP BY part_id
                ) s ON s.part_id = p.id
                WHERE p.binary_id IS NOT NULL
                GROUP BY p.binary_id
            ) c ON c.binary_id = b.id
            WHERE c.complete_parts = c.held_parts
              AND c.complete_parts >= b.total_parts
              AND (b.posted > ? OR (b.posted = ? AND b.id > ?))
            ORDER BY b.posted ASC, b.id ASC
            LIMIT ?
            "#,
            BINARY_COLUMNS
        ))
        .bind(after_posted)
        .bind(after_posted)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to query complete binaries: {}",
                e
            )))
        })?;

        Ok(binaries)
    }

    /// Parts of a binary ordered by part index
    pub async fn binary_parts(&self, binary_id: i64) -> Result<Vec<PartRow>> {
        let parts = sqlx::query_as::<_, PartRow>(
            r#"
            SELECT id, hash, subject, group_name, posted, posted_by, xref,
                   total_segments, binary_id, part_index
            FROM parts
            WHERE binary_id = ?
            ORDER BY part_index ASC
            "#,
        )
        .bind(binary_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load binary parts: {}",
                e
            )))
        })?;

        Ok(parts)
    }

    /// Delete a binary together with its parts and segments
    pub async fn delete_binary(&self, binary_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM binaries WHERE id = ?")
            .bind(binary_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete binary: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete binaries posted before `older_than` (unix seconds) that never completed
    pub async fn reap_stale_binaries(&self, older_than: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM binaries WHERE posted < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to reap stale binaries: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Number of stored binaries
    pub async fn count_binaries(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM binaries")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count binaries: {}",
                    e
                )))
            })?;

        Ok(count)
    }
}
