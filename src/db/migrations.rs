//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // Connect to database with foreign key enforcement and WAL mode
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };

        // Run migrations
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        // Create schema version table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        // Check current version
        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        // Apply migrations
        if current_version < 1 {
            Self::apply_migration(&mut conn, 1).await?;
        }
        if current_version < 2 {
            Self::apply_migration(&mut conn, 2).await?;
        }

        Ok(())
    }

    /// Apply one migration inside a transaction so a partial failure leaves
    /// the previous schema intact
    async fn apply_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        tracing::info!(version, "Applying database migration");

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            match version {
                1 => {
                    Self::create_group_schema(conn).await?;
                    Self::create_rule_schema(conn).await?;
                    Self::create_binary_schema(conn).await?;
                    Self::create_part_schema(conn).await?;
                    Self::create_release_schema(conn).await?;
                }
                2 => Self::create_miss_schema(conn).await?,
                other => {
                    return Err(Error::Database(DatabaseError::MigrationFailed(format!(
                        "Unknown migration version {}",
                        other
                    ))));
                }
            }
            Self::record_migration(conn, version).await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v{}: {}",
                            version, e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!(version, "Database migration complete");
        Ok(())
    }

    /// Execute one DDL statement, naming `what` in the error
    async fn run_ddl(conn: &mut SqliteConnection, what: &str, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create {}: {}",
                what, e
            )))
        })?;
        Ok(())
    }

    /// Create groups table
    async fn create_group_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::run_ddl(
            conn,
            "groups table",
            r#"
            CREATE TABLE groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                active INTEGER NOT NULL DEFAULT 1,
                first INTEGER,
                last INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .await
    }

    /// Create regex and blacklist rule tables
    async fn create_rule_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::run_ddl(
            conn,
            "regexes table",
            r#"
            CREATE TABLE regexes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_name TEXT NOT NULL,
                pattern TEXT NOT NULL,
                description TEXT,
                ordinal INTEGER NOT NULL DEFAULT 0,
                status INTEGER NOT NULL DEFAULT 1,
                category_id INTEGER
            )
            "#,
        )
        .await?;
        Self::run_ddl(
            conn,
            "regexes index",
            "CREATE INDEX idx_regexes_status ON regexes(status, ordinal)",
        )
        .await?;

        Self::run_ddl(
            conn,
            "blacklists table",
            r#"
            CREATE TABLE blacklists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_name TEXT NOT NULL,
                field TEXT NOT NULL DEFAULT 'subject',
                pattern TEXT NOT NULL,
                description TEXT,
                status INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .await
    }

    /// Create binaries table and its indexes
    async fn create_binary_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::run_ddl(
            conn,
            "binaries table",
            r#"
            CREATE TABLE binaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                group_name TEXT NOT NULL,
                posted INTEGER NOT NULL,
                posted_by TEXT NOT NULL,
                xref TEXT NOT NULL DEFAULT '',
                total_parts INTEGER NOT NULL,
                regex_id INTEGER,
                category_id INTEGER,
                req_id TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .await?;
        Self::run_ddl(
            conn,
            "binaries posted index",
            "CREATE INDEX idx_binaries_posted ON binaries(posted, id)",
        )
        .await
    }

    /// Create parts and segments tables and their indexes
    async fn create_part_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::run_ddl(
            conn,
            "parts table",
            r#"
            CREATE TABLE parts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT NOT NULL,
                subject TEXT NOT NULL,
                group_name TEXT NOT NULL,
                posted INTEGER NOT NULL,
                posted_by TEXT NOT NULL,
                xref TEXT NOT NULL DEFAULT '',
                total_segments INTEGER NOT NULL,
                binary_id INTEGER REFERENCES binaries(id) ON DELETE CASCADE,
                part_index INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE(group_name, hash),
                UNIQUE(binary_id, part_index)
            )
            "#,
        )
        .await?;
        Self::run_ddl(
            conn,
            "parts binary index",
            "CREATE INDEX idx_parts_binary ON parts(binary_id)",
        )
        .await?;
        Self::run_ddl(
            conn,
            "parts posted index",
            "CREATE INDEX idx_parts_posted ON parts(posted)",
        )
        .await?;

        Self::run_ddl(
            conn,
            "segments table",
            r#"
            CREATE TABLE segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                part_id INTEGER NOT NULL REFERENCES parts(id) ON DELETE CASCADE,
                number INTEGER NOT NULL,
                size INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                UNIQUE(part_id, number)
            )
            "#,
        )
        .await
    }

    /// Create nzbs and releases tables
    async fn create_release_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::run_ddl(
            conn,
            "nzbs table",
            r#"
            CREATE TABLE nzbs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .await?;

        Self::run_ddl(
            conn,
            "releases table",
            r#"
            CREATE TABLE releases (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                search_name TEXT NOT NULL,
                posted INTEGER NOT NULL,
                posted_by TEXT NOT NULL,
                group_id INTEGER NOT NULL REFERENCES groups(id),
                category_id INTEGER NOT NULL,
                regex_id INTEGER,
                req_id TEXT,
                nzb_id INTEGER NOT NULL REFERENCES nzbs(id),
                status INTEGER NOT NULL DEFAULT 0,
                total_parts INTEGER NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                added INTEGER NOT NULL,
                UNIQUE(name, posted)
            )
            "#,
        )
        .await?;
        Self::run_ddl(
            conn,
            "releases search index",
            "CREATE INDEX idx_releases_search_name ON releases(search_name)",
        )
        .await
    }

    /// Create misses table
    async fn create_miss_schema(conn: &mut SqliteConnection) -> Result<()> {
        Self::run_ddl(
            conn,
            "misses table",
            r#"
            CREATE TABLE misses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_name TEXT NOT NULL,
                message INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                UNIQUE(group_name, message)
            )
            "#,
        )
        .await
    }

    /// Record a migration version
    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
