//! Article ids absent from overview responses.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::parts::MAX_IDS_PER_QUERY;
use super::{Database, Miss};

impl Database {
    /// Missed article ids of a group awaiting a retry, lowest first
    pub async fn pending_misses(&self, group: &str, limit: usize) -> Result<Vec<Miss>> {
        let misses = sqlx::query_as::<_, Miss>(
            r#"
            SELECT id, group_name, message, attempts
            FROM misses
            WHERE group_name = ?
            ORDER BY message ASC
            LIMIT ?
            "#,
        )
        .bind(group)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load missed articles: {}",
                e
            )))
        })?;

        Ok(misses)
    }

    /// Settle one retry of missed articles
    ///
    /// Ids in `found` are forgotten. Ids in `still_missing` get one more
    /// attempt counted and are dropped once they reach `retry_limit`.
    /// Returns the number of ids given up.
    pub async fn settle_misses(
        &self,
        group: &str,
        found: &[i64],
        still_missing: &[i64],
        retry_limit: u32,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        for batch in found.chunks(MAX_IDS_PER_QUERY) {
            let mut query_builder =
                sqlx::QueryBuilder::new("DELETE FROM misses WHERE group_name = ");
            query_builder.push_bind(group);
            query_builder.push(" AND message IN (");
            let mut separated = query_builder.separated(", ");
            for id in batch {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            query_builder.build().execute(&mut *tx).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to clear recovered misses: {}",
                    e
                )))
            })?;
        }

        for batch in still_missing.chunks(MAX_IDS_PER_QUERY) {
            let mut query_builder =
                sqlx::QueryBuilder::new("UPDATE misses SET attempts = attempts + 1 WHERE group_name = ");
            query_builder.push_bind(group);
            query_builder.push(" AND message IN (");
            let mut separated = query_builder.separated(", ");
            for id in batch {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            query_builder.build().execute(&mut *tx).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count miss attempts: {}",
                    e
                )))
            })?;
        }

        let dropped = sqlx::query("DELETE FROM misses WHERE group_name = ? AND attempts >= ?")
            .bind(group)
            .bind(retry_limit as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to expire misses: {}",
                    e
                )))
            })?
            .rows_affected();

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit miss retry: {}",
                e
            )))
        })?;

        Ok(dropped)
    }

    /// Number of missed article ids recorded for a group
    pub async fn count_misses(&self, group: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM misses WHERE group_name = ?")
            .bind(group)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count misses: {}",
                    e
                )))
            })?;

        Ok(count)
    }
}
