//! Release and NZB blob storage.

use crate::error::DatabaseError;
use crate::types::ReleaseId;
use crate::{Error, Result};

use super::{Database, NewRelease, Release};

const RELEASE_COLUMNS: &str = "id, name, search_name, posted, posted_by, group_id, category_id, \
     regex_id, req_id, nzb_id, status, total_parts, size, added";

impl Database {
    /// Store an NZB and its release, consuming the source binary, atomically
    ///
    /// Returns `None` without writing anything when a release with the same
    /// name and posting time already exists. In that case the binary is
    /// still deleted, since it can never become a release.
    pub async fn create_release(
        &self,
        release: &NewRelease,
        nzb: &[u8],
        binary_id: Option<i64>,
    ) -> Result<Option<ReleaseId>> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin transaction: {}",
                e
            )))
        })?;

        let nzb_id = sqlx::query("INSERT INTO nzbs (data, created_at) VALUES (?, ?)")
            .bind(nzb)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert NZB: {}",
                    e
                )))
            })?
            .last_insert_rowid();

        let id = ReleaseId::generate();
        let inserted = sqlx::query(
            r#"
            INSERT INTO releases (id, name, search_name, posted, posted_by, group_id, category_id,
                                  regex_id, req_id, nzb_id, status, total_parts, size, added)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name, posted) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&release.name)
        .bind(&release.search_name)
        .bind(release.posted)
        .bind(&release.posted_by)
        .bind(release.group_id)
        .bind(release.category_id)
        .bind(release.regex_id)
        .bind(&release.req_id)
        .bind(nzb_id)
        .bind(release.status)
        .bind(release.total_parts)
        .bind(release.size)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert release: {}",
                e
            )))
        })?
        .rows_affected();

        if inserted == 0 {
            sqlx::query("DELETE FROM nzbs WHERE id = ?")
                .bind(nzb_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to discard duplicate NZB: {}",
                        e
                    )))
                })?;
        }

        if let Some(binary_id) = binary_id {
            sqlx::query("DELETE FROM binaries WHERE id = ?")
                .bind(binary_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to delete consumed binary: {}",
                        e
                    )))
                })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit release: {}",
                e
            )))
        })?;

        Ok((inserted > 0).then_some(id))
    }

    /// Whether a release with this name and posting time exists
    pub async fn release_exists(&self, name: &str, posted: i64) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM releases WHERE name = ? AND posted = ?")
                .bind(name)
                .bind(posted)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to check release existence: {}",
                        e
                    )))
                })?;

        Ok(count > 0)
    }

    /// Get a release by id
    pub async fn get_release(&self, id: &ReleaseId) -> Result<Option<Release>> {
        let release = sqlx::query_as::<_, Release>(&format!(
            "SELECT {} FROM releases WHERE id = ?",
            RELEASE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get release: {}",
                e
            )))
        })?;

        Ok(release)
    }

    /// Find the most recent release with this exact name
    pub async fn find_release_by_name(&self, name: &str) -> Result<Option<Release>> {
        let release = sqlx::query_as::<_, Release>(&format!(
            "SELECT {} FROM releases WHERE name = ? ORDER BY posted DESC LIMIT 1",
            RELEASE_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to find release: {}",
                e
            )))
        })?;

        Ok(release)
    }

    /// Most recently added releases
    pub async fn list_releases(&self, limit: usize) -> Result<Vec<Release>> {
        let releases = sqlx::query_as::<_, Release>(&format!(
            "SELECT {} FROM releases ORDER BY added DESC, posted DESC LIMIT ?",
            RELEASE_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list releases: {}",
                e
            )))
        })?;

        Ok(releases)
    }

    /// Number of stored releases
    pub async fn count_releases(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM releases")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count releases: {}",
                    e
                )))
            })?;

        Ok(count)
    }

    /// Stored NZB document of a release
    pub async fn get_release_nzb(&self, id: &ReleaseId) -> Result<Option<Vec<u8>>> {
        let data: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT n.data FROM nzbs n JOIN releases r ON r.nzb_id = n.id WHERE r.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to load NZB: {}",
                e
            )))
        })?;

        Ok(data)
    }

    /// Update a release's status code
    pub async fn set_release_status(&self, id: &ReleaseId, status: i32) -> Result<bool> {
        let result = sqlx::query("UPDATE releases SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update release status: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }
}
