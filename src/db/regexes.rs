//! Binary-matching rule source.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{Database, NewRegexRule, RegexRule};

impl Database {
    /// Insert a binary-matching rule
    pub async fn insert_regex(&self, rule: &NewRegexRule) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO regexes (group_name, pattern, description, ordinal, status, category_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.group_name)
        .bind(&rule.pattern)
        .bind(&rule.description)
        .bind(rule.ordinal)
        .bind(if rule.enabled { 1 } else { 0 })
        .bind(rule.category_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert regex: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// All enabled rules, ordered by ordinal then id
    ///
    /// Group applicability and exact-before-wildcard ordering are resolved by
    /// the caller, which knows the group each part belongs to.
    pub async fn list_enabled_regexes(&self) -> Result<Vec<RegexRule>> {
        let rules = sqlx::query_as::<_, RegexRule>(
            r#"
            SELECT id, group_name, pattern, description, ordinal, status, category_id
            FROM regexes
            WHERE status = 1
            ORDER BY ordinal ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list regexes: {}",
                e
            )))
        })?;

        Ok(rules)
    }

    /// Enable or disable a rule
    pub async fn set_regex_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE regexes SET status = ? WHERE id = ?")
            .bind(if enabled { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update regex: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
