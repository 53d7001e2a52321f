//! Group registry and scan cursors.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, Group};

impl Database {
    /// Add a group, or re-activate it if it already exists
    pub async fn add_group(&self, name: &str) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO groups (name, active, created_at)
            VALUES (?, 1, ?)
            ON CONFLICT(name) DO UPDATE SET active = 1
            "#,
        )
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to add group: {}",
                e
            )))
        })?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM groups WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read group id: {}",
                    e
                )))
            })?;

        Ok(id)
    }

    /// Get a group by name
    pub async fn get_group(&self, name: &str) -> Result<Option<Group>> {
        let group = sqlx::query_as::<_, Group>(
            "SELECT id, name, active, first, last, created_at FROM groups WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get group: {}",
                e
            )))
        })?;

        Ok(group)
    }

    /// List groups ordered by name
    pub async fn list_groups(&self, active_only: bool) -> Result<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>(
            r#"
            SELECT id, name, active, first, last, created_at
            FROM groups
            WHERE active = 1 OR ? = 0
            ORDER BY name ASC
            "#,
        )
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list groups: {}",
                e
            )))
        })?;

        Ok(groups)
    }

    /// Enable or disable a group; returns false if the group does not exist
    pub async fn set_group_active(&self, name: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE groups SET active = ? WHERE name = ?")
            .bind(active)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update group: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Clear a group's scan cursors so the next update starts fresh
    pub async fn reset_group(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE groups SET first = NULL, last = NULL WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to reset group: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove a group
    ///
    /// Refused while releases reference it. Returns false if the group does not exist.
    pub async fn remove_group(&self, name: &str) -> Result<bool> {
        let referenced: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM releases r
            JOIN groups g ON g.id = r.group_id
            WHERE g.name = ?
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count group releases: {}",
                e
            )))
        })?;

        if referenced > 0 {
            return Err(Error::Database(DatabaseError::ConstraintViolation(format!(
                "group '{}' is referenced by {} releases",
                name, referenced
            ))));
        }

        let result = sqlx::query("DELETE FROM groups WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to remove group: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
