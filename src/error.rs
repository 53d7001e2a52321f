//! Error types for usenet-indexer
//!
//! The pipeline distinguishes four failure classes, each handled differently
//! by the phase that observes it:
//! - [`ProtocolError`] - transient news-server faults, retried a bounded number of times
//! - [`Error::Auth`] - authentication failure, fatal for the whole scan run
//! - [`ParseError`] - malformed subject, rule or NZB; the offending item is skipped
//! - [`DatabaseError`] - persistence failure; the pass fails and is resumed next cycle

use thiserror::Error;

/// Result type alias for usenet-indexer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-indexer
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "scan.update_threads")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// News server protocol or connection error
    #[error("NNTP error: {0}")]
    Protocol(#[from] ProtocolError),

    /// News server rejected our credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed subject, rule pattern or NZB document
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Group, release or other record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was requested before its preconditions hold
    /// (e.g. backfilling a group that was never updated)
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Shutdown in progress
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Network error (release publishing)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., duplicate key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// News-server protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// TCP/TLS connection could not be established or was dropped
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed {
        /// Server host
        host: String,
        /// Underlying cause
        reason: String,
    },

    /// Server did not answer within the configured timeout
    #[error("timed out waiting for server response after {0:?}")]
    Timeout(std::time::Duration),

    /// Server answered with an unexpected status code
    #[error("unexpected response {code}: {message}")]
    UnexpectedResponse {
        /// NNTP status code
        code: u16,
        /// Status line text
        message: String,
    },

    /// Server response could not be parsed
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The requested newsgroup does not exist on the server
    #[error("no such group: {0}")]
    NoSuchGroup(String),

    /// The requested article does not exist on the server
    #[error("no such article: {0}")]
    NoSuchArticle(String),

    /// The session was used before a group was selected
    #[error("no group selected")]
    NoGroupSelected,
}

/// Parse errors for items flowing through the pipeline
#[derive(Debug, Error)]
pub enum ParseError {
    /// A binary-matching rule pattern could not be compiled
    #[error("invalid rule {id} pattern: {reason}")]
    InvalidRule {
        /// Rule database id
        id: i64,
        /// Compiler error
        reason: String,
    },

    /// A part/total capture could not be interpreted
    #[error("invalid part count '{0}'")]
    InvalidPartCount(String),

    /// NZB document is malformed
    #[error("invalid NZB: {0}")]
    Nzb(String),

    /// NZB document has no name metadata
    #[error("NZB has no discoverable name")]
    MissingName,

    /// Overview or article date could not be parsed
    #[error("invalid date '{0}'")]
    InvalidDate(String),
}

impl Error {
    /// Whether this error must abort the entire scan run rather than one group
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Config { .. })
    }
}
