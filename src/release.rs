//! Release finalization
//!
//! Complete binaries become releases: the binary's parts are written into an
//! NZB document, stored with a new release row, and the binary (with its
//! parts and segments) is deleted in the same transaction.

use crate::config::{CategoryConfig, MinArchives};
use crate::db::{BinaryRow, Database, NewRelease, PartRow, SegmentRow};
use crate::error::{Error, Result};
use crate::nzb::{self, NzbDocument, NzbFile, NzbSegment};
use crate::patterns::compile_pattern;
use crate::types::{Category, FinalizeStats, ReleaseStatus, ReleaseSummary};
use chrono::{TimeZone, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;

// Split volumes count from .001; codec names like `H.264` are not volumes
static ARCHIVE_PART: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)\.(?:rar|r\d{2,3}|zip|7z|0\d{2})(?:[^.\w]|$)").expect("archive pattern is valid")
});

/// Characters removed from release names
const NAME_STRIP: &[char] = &['#', '@', '$', '%', '^', '§', '¨', '©', 'Ö'];

/// Release name as stored: junk characters removed, underscores as spaces
pub fn clean_release_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !NAME_STRIP.contains(c))
        .map(|c| if c == '_' { ' ' } else { c })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Name used for searching: dots and underscores become single spaces
pub fn search_name(name: &str) -> String {
    name.replace(['.', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a subject names an archive volume
pub fn is_archive_part(subject: &str) -> bool {
    ARCHIVE_PART.is_match(subject)
}

/// Assigns categories to releases
#[async_trait::async_trait]
pub trait CategoryClassifier: Send + Sync {
    /// Category for a release name posted in `group`
    async fn classify(&self, name: &str, group: &str) -> Result<Category>;

    /// Category for an id carried as a hint by a binary rule
    fn category(&self, id: i64) -> Category {
        Category {
            id,
            name: id.to_string(),
        }
    }
}

/// Classifier driven by the configured pattern list
///
/// Rules are tried in order; the first whose pattern matches the name (and
/// whose group prefix, if any, matches the group) wins.
#[derive(Debug)]
pub struct StaticClassifier {
    rules: Vec<(Regex, Option<String>, Category)>,
    names: HashMap<i64, String>,
    default: Category,
}

impl StaticClassifier {
    /// Compile the configured rules
    pub fn from_config(config: &CategoryConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.rules.len());
        let mut names = HashMap::new();
        names.insert(config.default_id, config.default_name.clone());

        for (index, rule) in config.rules.iter().enumerate() {
            let regex = compile_pattern(&rule.pattern).map_err(|e| Error::Config {
                message: format!("invalid category pattern: {}", e),
                key: Some(format!("categories.rules[{}].pattern", index)),
            })?;
            names.entry(rule.id).or_insert_with(|| rule.name.clone());
            rules.push((
                regex,
                rule.group_prefix.clone(),
                Category {
                    id: rule.id,
                    name: rule.name.clone(),
                },
            ));
        }

        Ok(Self {
            rules,
            names,
            default: Category {
                id: config.default_id,
                name: config.default_name.clone(),
            },
        })
    }
}

#[async_trait::async_trait]
impl CategoryClassifier for StaticClassifier {
    async fn classify(&self, name: &str, group: &str) -> Result<Category> {
        let found = self.rules.iter().find(|(regex, prefix, _)| {
            prefix.as_deref().is_none_or(|p| group.starts_with(p)) && regex.is_match(name)
        });
        Ok(found
            .map(|(_, _, category)| category.clone())
            .unwrap_or_else(|| self.default.clone()))
    }

    fn category(&self, id: i64) -> Category {
        Category {
            id,
            name: self
                .names
                .get(&id)
                .cloned()
                .unwrap_or_else(|| id.to_string()),
        }
    }
}

/// Receives every release the finalizer creates
#[async_trait::async_trait]
pub trait ReleaseHandoff: Send + Sync {
    /// Called once per created release, after it is committed
    async fn release_created(&self, release: &ReleaseSummary);
}

/// Handoff that does nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHandoff;

#[async_trait::async_trait]
impl ReleaseHandoff for NoopHandoff {
    async fn release_created(&self, _release: &ReleaseSummary) {}
}

/// Build the NZB document for a binary's parts
pub fn build_document(
    name: &str,
    category: &str,
    binary: &BinaryRow,
    parts: &[PartRow],
    segments: &[SegmentRow],
) -> NzbDocument {
    let mut by_part: HashMap<i64, Vec<&SegmentRow>> = HashMap::new();
    for segment in segments {
        by_part.entry(segment.part_id).or_default().push(segment);
    }

    let files = parts
        .iter()
        .map(|part| {
            let mut part_segments = by_part.remove(&part.id).unwrap_or_default();
            part_segments.sort_by_key(|s| s.number);

            let mut groups = nzb::parse_xref(&part.xref);
            if groups.is_empty() {
                groups.push(binary.group_name.clone());
            }

            NzbFile {
                subject: part.subject.clone(),
                total_segments: u32::try_from(part.total_segments).unwrap_or(0),
                poster: part.posted_by.clone(),
                date: part.posted,
                groups,
                segments: part_segments
                    .into_iter()
                    .map(|s| NzbSegment {
                        number: u32::try_from(s.number).unwrap_or(0),
                        bytes: u64::try_from(s.size).unwrap_or(0),
                        message_id: s.message_id.clone(),
                    })
                    .collect(),
            }
        })
        .collect();

    NzbDocument {
        name: name.to_string(),
        category: category.to_string(),
        files,
    }
}

/// Turns complete binaries into releases
pub struct ReleaseFinalizer<'a> {
    db: &'a Database,
    classifier: &'a dyn CategoryClassifier,
    handoff: &'a dyn ReleaseHandoff,
    min_archives: &'a MinArchives,
    chunk_size: usize,
}

enum Outcome {
    Created,
    Duplicate,
    Discarded,
    Failed,
}

impl<'a> ReleaseFinalizer<'a> {
    /// Create a finalizer
    pub fn new(
        db: &'a Database,
        classifier: &'a dyn CategoryClassifier,
        handoff: &'a dyn ReleaseHandoff,
        min_archives: &'a MinArchives,
        chunk_size: usize,
    ) -> Self {
        Self {
            db,
            classifier,
            handoff,
            min_archives,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Process every complete binary, oldest first
    pub async fn finalize(&self, cancel: &CancellationToken) -> Result<FinalizeStats> {
        let mut stats = FinalizeStats::default();
        let mut after = None;

        loop {
            if cancel.is_cancelled() {
                tracing::info!("Release finalization cancelled between chunks");
                break;
            }

            let binaries = self.db.complete_binaries(after, self.chunk_size).await?;
            let Some(last) = binaries.last() else {
                break;
            };
            after = Some((last.posted, last.id));

            let mut chunk = FinalizeStats::default();
            for binary in &binaries {
                match self.finalize_binary(binary).await? {
                    Outcome::Created => chunk.created += 1,
                    Outcome::Duplicate => chunk.duplicates += 1,
                    Outcome::Discarded => chunk.discarded += 1,
                    Outcome::Failed => chunk.failed += 1,
                }
            }

            tracing::info!(
                binaries = binaries.len(),
                created = chunk.created,
                duplicates = chunk.duplicates,
                discarded = chunk.discarded,
                failed = chunk.failed,
                "Release chunk finalized"
            );
            stats.created += chunk.created;
            stats.duplicates += chunk.duplicates;
            stats.discarded += chunk.discarded;
            stats.failed += chunk.failed;

            if binaries.len() < self.chunk_size {
                break;
            }
        }

        tracing::info!(
            created = stats.created,
            duplicates = stats.duplicates,
            discarded = stats.discarded,
            failed = stats.failed,
            "Release finalization complete"
        );
        Ok(stats)
    }

    async fn finalize_binary(&self, binary: &BinaryRow) -> Result<Outcome> {
        let name = clean_release_name(&binary.name);
        if name.is_empty() {
            tracing::warn!(binary_id = binary.id, raw_name = %binary.name, "Binary name is empty after cleaning");
            self.db.delete_binary(binary.id).await?;
            return Ok(Outcome::Discarded);
        }

        if self.db.release_exists(&name, binary.posted).await? {
            tracing::debug!(binary_id = binary.id, name = %name, "Release already exists");
            self.db.delete_binary(binary.id).await?;
            return Ok(Outcome::Duplicate);
        }

        let parts = self.db.binary_parts(binary.id).await?;
        let min_archives = self.min_archives.for_group(&binary.group_name);
        if min_archives > 0 {
            let archives = parts.iter().filter(|p| is_archive_part(&p.subject)).count();
            if archives < min_archives as usize {
                tracing::warn!(
                    binary_id = binary.id,
                    name = %name,
                    group = %binary.group_name,
                    archives,
                    min_archives,
                    "Discarding binary with too few archive parts"
                );
                self.db.delete_binary(binary.id).await?;
                return Ok(Outcome::Discarded);
            }
        }

        let Some(group) = self.db.get_group(&binary.group_name).await? else {
            tracing::warn!(binary_id = binary.id, group = %binary.group_name, "Binary group is not registered");
            return Ok(Outcome::Failed);
        };

        let category = match binary.category_id {
            Some(id) => self.classifier.category(id),
            None => self.classifier.classify(&name, &group.name).await?,
        };

        let part_ids: Vec<i64> = parts.iter().map(|p| p.id).collect();
        let segments = self.db.segments_for_parts(&part_ids).await?;
        let size: i64 = segments.iter().map(|s| s.size).sum();

        let document = build_document(&name, &category.name, binary, &parts, &segments);
        let nzb = match nzb::encode(&document) {
            Ok(nzb) => nzb,
            Err(e) => {
                tracing::warn!(binary_id = binary.id, name = %name, error = %e, "NZB generation failed");
                return Ok(Outcome::Failed);
            }
        };

        let release = NewRelease {
            search_name: search_name(&name),
            name,
            posted: binary.posted,
            posted_by: binary.posted_by.clone(),
            group_id: group.id,
            category_id: category.id,
            regex_id: binary.regex_id,
            req_id: binary.req_id.clone(),
            status: ReleaseStatus::New.to_i32(),
            total_parts: binary.total_parts,
            size,
        };

        let Some(id) = self
            .db
            .create_release(&release, &nzb, Some(binary.id))
            .await?
        else {
            return Ok(Outcome::Duplicate);
        };

        tracing::info!(
            release_id = %id,
            name = %release.name,
            group = %group.name,
            category = category.id,
            parts = release.total_parts,
            size = release.size,
            "Release created"
        );

        let summary = ReleaseSummary {
            id,
            name: release.name,
            search_name: release.search_name,
            group_name: group.name,
            category_id: category.id,
            posted: Utc
                .timestamp_opt(release.posted, 0)
                .single()
                .unwrap_or_else(Utc::now),
            posted_by: release.posted_by,
            total_parts: release.total_parts,
            size: release.size,
        };
        self.handoff.release_created(&summary).await;

        Ok(Outcome::Created)
    }
}
