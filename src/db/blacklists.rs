//! Blacklist rules applied during aggregation.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{BlacklistRule, Database, NewBlacklistRule};

impl Database {
    /// Insert a blacklist rule
    pub async fn insert_blacklist(&self, rule: &NewBlacklistRule) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO blacklists (group_name, field, pattern, description, status)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.group_name)
        .bind(&rule.field)
        .bind(&rule.pattern)
        .bind(&rule.description)
        .bind(if rule.enabled { 1 } else { 0 })
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert blacklist: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// All enabled blacklist rules
    pub async fn list_enabled_blacklists(&self) -> Result<Vec<BlacklistRule>> {
        let rules = sqlx::query_as::<_, BlacklistRule>(
            r#"
            SELECT id, group_name, field, pattern, description, status
            FROM blacklists
            WHERE status = 1
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list blacklists: {}",
                e
            )))
        })?;

        Ok(rules)
    }
}
