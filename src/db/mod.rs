//! Database layer for usenet-indexer
//!
//! Handles SQLite persistence for groups, parts, binaries, releases and the
//! rule tables that drive assembly.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`groups`] - Group registry and scan cursors
//! - [`parts`] - Part/segment persistence and window commits
//! - [`regexes`] - Binary-matching rule source
//! - [`blacklists`] - Blacklist rules applied during aggregation
//! - [`binaries`] - Binary assembly commits and completion queries
//! - [`releases`] - Release and NZB blob storage
//! - [`misses`] - Article ids absent from overview responses

use crate::types::ReleaseId;
use sqlx::{FromRow, sqlite::SqlitePool};

mod binaries;
mod blacklists;
mod groups;
mod migrations;
mod misses;
mod parts;
mod regexes;
mod releases;

pub use binaries::{AssemblyCommit, BinaryDraft};
pub use parts::{CursorAdvance, WindowCommit};

/// Newsgroup record from database
#[derive(Debug, Clone, FromRow)]
pub struct Group {
    /// Unique database ID
    pub id: i64,
    /// Group name, e.g. `alt.binaries.teevee`
    pub name: String,
    /// Whether the group is scanned by `update`
    pub active: bool,
    /// Lowest article id scanned so far (None until first scanned)
    pub first: Option<i64>,
    /// Highest article id scanned so far (None until first scanned)
    pub last: Option<i64>,
    /// Unix timestamp when the group was added
    pub created_at: i64,
}

/// Part record from database
#[derive(Debug, Clone, FromRow)]
pub struct PartRow {
    /// Unique database ID
    pub id: i64,
    /// Dedup hash within the group
    pub hash: String,
    /// Subject without the segment marker
    pub subject: String,
    /// Group the part was posted to
    pub group_name: String,
    /// Unix timestamp of the earliest segment
    pub posted: i64,
    /// Poster
    pub posted_by: String,
    /// Xref header of the first segment seen
    pub xref: String,
    /// Declared number of segments
    pub total_segments: i64,
    /// Binary this part is assigned to
    pub binary_id: Option<i64>,
    /// Position within the binary
    pub part_index: Option<i64>,
}

/// Segment record from database
#[derive(Debug, Clone, FromRow)]
pub struct SegmentRow {
    /// Unique database ID
    pub id: i64,
    /// Owning part
    pub part_id: i64,
    /// 1-based position within the part
    pub number: i64,
    /// Size in bytes
    pub size: i64,
    /// Message-ID
    pub message_id: String,
}

/// New binary-matching rule to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewRegexRule {
    /// Exact group name, `*` for every group, or a `prefix.*` wildcard
    pub group_name: String,
    /// Delimited pattern, e.g. `/^(?P<name>.+) \[(?P<parts>\d+\/\d+)\]/i`
    pub pattern: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Evaluation order within the rule's group class (ascending)
    pub ordinal: i64,
    /// Whether the rule is enabled
    pub enabled: bool,
    /// Category hint applied to releases matched by this rule
    pub category_id: Option<i64>,
}

/// Binary-matching rule record from database
#[derive(Debug, Clone, FromRow)]
pub struct RegexRule {
    /// Unique database ID
    pub id: i64,
    /// Group selector
    pub group_name: String,
    /// Delimited pattern
    pub pattern: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Evaluation order
    pub ordinal: i64,
    /// 1 = enabled, 0 = disabled
    pub status: i32,
    /// Category hint
    pub category_id: Option<i64>,
}

/// New blacklist rule to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewBlacklistRule {
    /// Group selector, same syntax as regex rules
    pub group_name: String,
    /// `subject` or `poster`
    pub field: String,
    /// Delimited or plain pattern
    pub pattern: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Whether the rule is enabled
    pub enabled: bool,
}

/// Blacklist rule record from database
#[derive(Debug, Clone, FromRow)]
pub struct BlacklistRule {
    /// Unique database ID
    pub id: i64,
    /// Group selector
    pub group_name: String,
    /// `subject` or `poster`
    pub field: String,
    /// Delimited or plain pattern
    pub pattern: String,
    /// Human-readable description
    pub description: Option<String>,
    /// 1 = enabled, 0 = disabled
    pub status: i32,
}

/// Binary record from database
#[derive(Debug, Clone, FromRow)]
pub struct BinaryRow {
    /// Unique database ID
    pub id: i64,
    /// Dedup hash of name, group, poster and total
    pub hash: String,
    /// Extracted binary name
    pub name: String,
    /// Group the binary was assembled in
    pub group_name: String,
    /// Unix timestamp of the earliest known part
    pub posted: i64,
    /// Poster
    pub posted_by: String,
    /// Xref of the first part seen
    pub xref: String,
    /// Declared number of parts
    pub total_parts: i64,
    /// Rule that produced the binary
    pub regex_id: Option<i64>,
    /// Category hint from the rule
    pub category_id: Option<i64>,
    /// Request id captured by the rule
    pub req_id: Option<String>,
    /// Unix timestamp when the binary was first formed
    pub created_at: i64,
}

/// Part index assignment stored for a binary
#[derive(Debug, Clone, Copy, FromRow)]
pub struct BinarySlot {
    /// Assigned part
    pub part_id: i64,
    /// Position within the binary
    pub part_index: i64,
    /// Unix timestamp of the part
    pub posted: i64,
}

/// New release to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewRelease {
    /// Sanitized release name
    pub name: String,
    /// Search-friendly name
    pub search_name: String,
    /// Unix timestamp of posting
    pub posted: i64,
    /// Poster
    pub posted_by: String,
    /// Owning group
    pub group_id: i64,
    /// Category id
    pub category_id: i64,
    /// Rule that produced the binary
    pub regex_id: Option<i64>,
    /// Request id
    pub req_id: Option<String>,
    /// Status code (see [`crate::types::ReleaseStatus`])
    pub status: i32,
    /// Number of files
    pub total_parts: i64,
    /// Sum of segment sizes in bytes
    pub size: i64,
}

/// Release record from database
#[derive(Debug, Clone, FromRow)]
pub struct Release {
    /// Opaque release id
    pub id: ReleaseId,
    /// Sanitized release name
    pub name: String,
    /// Search-friendly name
    pub search_name: String,
    /// Unix timestamp of posting
    pub posted: i64,
    /// Poster
    pub posted_by: String,
    /// Owning group
    pub group_id: i64,
    /// Category id
    pub category_id: i64,
    /// Rule that produced the binary
    pub regex_id: Option<i64>,
    /// Request id
    pub req_id: Option<String>,
    /// Stored NZB blob
    pub nzb_id: i64,
    /// Status code
    pub status: i32,
    /// Number of files
    pub total_parts: i64,
    /// Sum of segment sizes in bytes
    pub size: i64,
    /// Unix timestamp when the release was created
    pub added: i64,
}

/// Missed article record from database
#[derive(Debug, Clone, FromRow)]
pub struct Miss {
    /// Unique database ID
    pub id: i64,
    /// Group name
    pub group_name: String,
    /// Article id
    pub message: i64,
    /// Retry attempts so far
    pub attempts: i64,
}

/// Database handle for usenet-indexer
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
