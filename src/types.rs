//! Core types for usenet-indexer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque unique identifier for a release
///
/// Generated from random bytes and the creation time, rendered as 32 hex
/// characters. Stored as TEXT.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(pub String);

impl ReleaseId {
    /// Generate a fresh release id
    pub fn generate() -> Self {
        let nonce: [u8; 16] = rand::random();
        let mut hasher = Sha256::new();
        hasher.update(nonce);
        hasher.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        let digest = hasher.finalize();

        let mut id = String::with_capacity(32);
        for byte in &digest[..16] {
            id.push_str(&format!("{:02x}", byte));
        }
        Self(id)
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ReleaseId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for ReleaseId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ReleaseId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ReleaseId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Release lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    /// Freshly created, not yet seen by the downstream inspector
    New,
    /// Handed off and inspected downstream
    Inspected,
    /// Created from an imported NZB
    Imported,
}

impl ReleaseStatus {
    /// Convert integer status code to ReleaseStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            1 => ReleaseStatus::Inspected,
            2 => ReleaseStatus::Imported,
            _ => ReleaseStatus::New,
        }
    }

    /// Convert ReleaseStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            ReleaseStatus::New => 0,
            ReleaseStatus::Inspected => 1,
            ReleaseStatus::Imported => 2,
        }
    }
}

/// One overview (XOVER) line for an article
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverviewRecord {
    /// Article number within the selected group
    pub article: u64,
    /// Subject header
    pub subject: String,
    /// From header
    pub poster: String,
    /// Date header; `None` when the server sent something unparseable
    pub date: Option<DateTime<Utc>>,
    /// Message-ID including angle brackets
    pub message_id: String,
    /// Article size in bytes
    pub bytes: u64,
    /// Xref header value (may be empty)
    pub xref: String,
}

/// Result of one overview request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverviewBatch {
    /// Records the server returned, in article order
    pub records: Vec<OverviewRecord>,
    /// Article ids in the requested range the server did not return
    pub missing: Vec<u64>,
}

impl OverviewBatch {
    /// Build a batch for `first..=last`, deriving the missing ids from the records
    pub fn from_records(first: u64, last: u64, mut records: Vec<OverviewRecord>) -> Self {
        records.retain(|r| r.article >= first && r.article <= last);
        records.sort_by_key(|r| r.article);
        records.dedup_by_key(|r| r.article);

        let mut missing = Vec::new();
        let mut present = records.iter().map(|r| r.article).peekable();
        for id in first..=last {
            if present.peek() == Some(&id) {
                present.next();
            } else {
                missing.push(id);
            }
        }

        Self { records, missing }
    }
}

/// Direction of a group scan
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    /// Newer articles after the group's `last` cursor ("update")
    Forward,
    /// Older articles before the group's `first` cursor ("backfill")
    Backward,
}

impl std::fmt::Display for ScanDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanDirection::Forward => f.write_str("update"),
            ScanDirection::Backward => f.write_str("backfill"),
        }
    }
}

/// States of a single group scan
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    /// Not started
    Idle,
    /// Resolving the start and end article ids
    DeterminingStart,
    /// Fetching and aggregating one window
    ScanningWindow,
    /// Last window committed; the scan is done
    Committed,
    /// A window failed transiently and is being retried
    Retrying,
    /// Retries exhausted or a permanent error occurred
    Failed,
}

/// Summary of one group scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanSummary {
    /// Group name
    pub group: String,
    /// Scan direction
    pub direction: ScanDirection,
    /// Terminal state
    pub state: ScanState,
    /// Windows committed
    pub windows: u64,
    /// Overview records received
    pub received: u64,
    /// Parts written or extended
    pub parts: u64,
    /// Records without a usable segment marker
    pub ignored: u64,
    /// Records dropped by blacklist rules
    pub blacklisted: u64,
    /// Article ids absent from overview responses
    pub missing: u64,
}

impl ScanSummary {
    /// Empty summary for a group about to be scanned
    pub fn new(group: &str, direction: ScanDirection) -> Self {
        Self {
            group: group.to_string(),
            direction,
            state: ScanState::Idle,
            windows: 0,
            received: 0,
            parts: 0,
            ignored: 0,
            blacklisted: 0,
            missing: 0,
        }
    }
}

/// Counts reported by one binary assembler pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssembleStats {
    /// Parts examined
    pub processed: u64,
    /// Distinct binaries formed or extended
    pub formed: u64,
    /// Parts marked dead and deleted
    pub dead: u64,
    /// Parts left for a later pass (orphans inside the grace period)
    pub deferred: u64,
}

/// Counts reported by one release finalizer pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FinalizeStats {
    /// Releases created
    pub created: u64,
    /// Binaries deleted because a release with the same name and date exists
    pub duplicates: u64,
    /// Binaries deleted for having too few archive parts
    pub discarded: u64,
    /// Binaries skipped because their NZB or release could not be written
    pub failed: u64,
}

/// Category assigned to a release
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Numeric category id
    pub id: i64,
    /// Display name written into NZB metadata
    pub name: String,
}

/// Summary of a finalized release passed to downstream consumers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSummary {
    /// Release id
    pub id: ReleaseId,
    /// Sanitized release name
    pub name: String,
    /// Search-friendly name
    pub search_name: String,
    /// Group the release was assembled from
    pub group_name: String,
    /// Category id
    pub category_id: i64,
    /// Posting time
    pub posted: DateTime<Utc>,
    /// Poster
    pub posted_by: String,
    /// Number of files (parts)
    pub total_parts: i64,
    /// Sum of segment sizes in bytes
    pub size: i64,
}
