//! Part aggregation
//!
//! Turns overview records for one group into [`PendingPart`]s: every record
//! whose subject carries a `(current/total)` segment marker is filed under
//! the subject with that marker removed. Records sharing that stripped
//! subject, poster and total become one part.

use crate::db::BlacklistRule;
use crate::patterns::{compile_pattern, group_selector_rank};
use crate::types::OverviewRecord;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

static SEGMENT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\((\d+)/(\d+)\)").expect("segment marker pattern is valid")
});

/// A segment marker found in a subject
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentMarker {
    /// Subject with the marker removed and trimmed
    pub key: String,
    /// 1-based segment number
    pub current: u32,
    /// Declared segment count
    pub total: u32,
}

/// Find the rightmost `(current/total)` marker in a subject
///
/// Returns `None` when there is no marker, when either number is zero or does
/// not fit, or when `current > total`.
pub fn strip_segment_marker(subject: &str) -> Option<SegmentMarker> {
    let caps = SEGMENT_MARKER.captures_iter(subject).last()?;
    let whole = caps.get(0)?;
    let current: u32 = caps.get(1)?.as_str().parse().ok()?;
    let total: u32 = caps.get(2)?.as_str().parse().ok()?;
    if current == 0 || total == 0 || current > total {
        return None;
    }

    let mut key = String::with_capacity(subject.len());
    key.push_str(&subject[..whole.start()]);
    key.push_str(&subject[whole.end()..]);

    Some(SegmentMarker {
        key: key.trim().to_string(),
        current,
        total,
    })
}

/// Dedup key of a part within its group
pub fn part_hash(subject: &str, poster: &str, group: &str, total_segments: u32) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{}{}{}{}", subject, poster, group, total_segments))
    )
}

/// One segment waiting to be persisted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingSegment {
    /// 1-based position in the part
    pub number: u32,
    /// Size in bytes
    pub size: u64,
    /// Message-ID
    pub message_id: String,
}

/// A part assembled from one overview batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingPart {
    /// Dedup hash, see [`part_hash`]
    pub hash: String,
    /// Subject without the segment marker
    pub subject: String,
    /// Group the records came from
    pub group_name: String,
    /// Earliest posting date among the segments
    pub posted: DateTime<Utc>,
    /// Poster
    pub posted_by: String,
    /// Xref of the first segment seen
    pub xref: String,
    /// Declared number of segments
    pub total_segments: u32,
    /// Segments by number; duplicates within a batch keep the first seen
    pub segments: BTreeMap<u32, PendingSegment>,
}

impl PendingPart {
    /// Whether every declared segment is present
    pub fn is_segment_complete(&self) -> bool {
        self.segments.len() as u32 >= self.total_segments
    }
}

/// Output of [`aggregate`]
#[derive(Debug, Default)]
pub struct Aggregation {
    /// Parts keyed by hash
    pub parts: HashMap<String, PendingPart>,
    /// Records in the batch
    pub received: u64,
    /// Records without a usable marker
    pub ignored: u64,
    /// Records dropped by blacklist rules
    pub blacklisted: u64,
}

/// Which header a blacklist rule inspects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlacklistField {
    /// The subject with the segment marker removed
    Subject,
    /// The poster
    Poster,
}

impl BlacklistField {
    fn parse(field: &str) -> Option<Self> {
        match field.to_ascii_lowercase().as_str() {
            "subject" => Some(Self::Subject),
            "poster" | "from" => Some(Self::Poster),
            _ => None,
        }
    }
}

/// Blacklist rules compiled for one group
#[derive(Debug, Default)]
pub struct Blacklist {
    rules: Vec<(BlacklistField, Regex)>,
}

impl Blacklist {
    /// Compile the enabled rules that apply to `group`
    ///
    /// Rules with an unknown field or a pattern that fails to compile are
    /// logged and skipped.
    pub fn compile(group: &str, rules: &[BlacklistRule]) -> Self {
        let rules = rules
            .iter()
            .filter(|rule| rule.status != 0)
            .filter(|rule| group_selector_rank(&rule.group_name, group).is_some())
            .filter_map(|rule| {
                let Some(field) = BlacklistField::parse(&rule.field) else {
                    tracing::warn!(rule_id = rule.id, field = %rule.field, "Unknown blacklist field");
                    return None;
                };
                compile_pattern(&rule.pattern)
                    .map_err(|e| {
                        tracing::warn!(rule_id = rule.id, error = %e, "Invalid blacklist pattern");
                    })
                    .ok()
                    .map(|regex| (field, regex))
            })
            .collect();
        Self { rules }
    }

    /// Whether a part with this subject and poster is blacklisted
    pub fn is_blocked(&self, subject: &str, poster: &str) -> bool {
        self.rules.iter().any(|(field, regex)| match field {
            BlacklistField::Subject => regex.is_match(subject),
            BlacklistField::Poster => regex.is_match(poster),
        })
    }

    /// Whether no rule applies
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Group one batch of overview records into parts
pub fn aggregate(group: &str, records: &[OverviewRecord], blacklist: &Blacklist) -> Aggregation {
    let mut result = Aggregation {
        received: records.len() as u64,
        ..Aggregation::default()
    };
    let fallback_date = Utc::now();

    for record in records {
        let Some(marker) = strip_segment_marker(&record.subject) else {
            result.ignored += 1;
            continue;
        };

        if blacklist.is_blocked(&marker.key, &record.poster) {
            result.blacklisted += 1;
            continue;
        }

        let posted = record.date.unwrap_or(fallback_date);
        let hash = part_hash(&marker.key, &record.poster, group, marker.total);
        let part = result.parts.entry(hash.clone()).or_insert_with(|| PendingPart {
            hash,
            subject: marker.key.clone(),
            group_name: group.to_string(),
            posted,
            posted_by: record.poster.clone(),
            xref: record.xref.clone(),
            total_segments: marker.total,
            segments: BTreeMap::new(),
        });

        part.posted = part.posted.min(posted);
        part.segments
            .entry(marker.current)
            .or_insert_with(|| PendingSegment {
                number: marker.current,
                size: record.bytes,
                message_id: record.message_id.clone(),
            });
    }

    result
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(article: u64, subject: &str) -> OverviewRecord {
        OverviewRecord {
            article,
            subject: subject.to_string(),
            poster: "poster@example.com".to_string(),
            date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, article as u32 % 60).unwrap()),
            message_id: format!("<{article}@example.com>"),
            bytes: 1000 + article,
            xref: format!("news.example.com g:{article}"),
        }
    }

    fn rule(field: &str, pattern: &str) -> BlacklistRule {
        BlacklistRule {
            id: 1,
            group_name: "*".to_string(),
            field: field.to_string(),
            pattern: pattern.to_string(),
            description: None,
            status: 1,
        }
    }

    #[test]
    fn two_segments_form_one_complete_part() {
        let records = [record(1, "foo (1/2)"), record(2, "foo (2/2)")];

        let result = aggregate("g", &records, &Blacklist::default());

        assert_eq!(result.parts.len(), 1);
        let part = result.parts.values().next().unwrap();
        assert_eq!(part.subject, "foo");
        assert_eq!(part.total_segments, 2);
        assert_eq!(part.segments.len(), 2);
        assert!(part.is_segment_complete());
        assert_eq!(result.ignored, 0);
    }

    #[test]
    fn rightmost_marker_wins() {
        let marker = strip_segment_marker("show [01/10] - \"a.rar\" (3/7) yEnc (2/5)").unwrap();
        assert_eq!(marker.current, 2);
        assert_eq!(marker.total, 5);
        assert_eq!(marker.key, "show [01/10] - \"a.rar\" (3/7) yEnc");
    }

    #[test]
    fn invalid_markers_are_ignored() {
        assert!(strip_segment_marker("no marker here").is_none());
        assert!(strip_segment_marker("zero (0/5)").is_none());
        assert!(strip_segment_marker("empty total (1/0)").is_none());
        assert!(strip_segment_marker("overflow (6/5)").is_none());

        let records = [record(1, "plain subject"), record(2, "bad (3/2)")];
        let result = aggregate("g", &records, &Blacklist::default());
        assert!(result.parts.is_empty());
        assert_eq!(result.ignored, 2);
        assert_eq!(result.received, 2);
    }

    #[test]
    fn duplicate_segment_numbers_are_dropped() {
        let records = [
            record(1, "foo (1/3)"),
            record(2, "foo (1/3)"),
            record(3, "foo (3/3)"),
        ];
        let result = aggregate("g", &records, &Blacklist::default());

        let part = result.parts.values().next().unwrap();
        assert_eq!(part.segments.len(), 2);
        assert_eq!(part.segments[&1].message_id, "<1@example.com>");
        assert!(!part.is_segment_complete());
    }

    #[test]
    fn different_totals_are_different_parts() {
        let records = [record(1, "foo (1/2)"), record(2, "foo (1/3)")];
        let result = aggregate("g", &records, &Blacklist::default());
        assert_eq!(result.parts.len(), 2);
    }

    #[test]
    fn part_posted_is_earliest_segment_date() {
        let records = [record(30, "foo (2/2)"), record(10, "foo (1/2)")];
        let result = aggregate("g", &records, &Blacklist::default());
        let part = result.parts.values().next().unwrap();
        assert_eq!(part.posted, records[1].date.unwrap());
    }

    #[test]
    fn part_hash_depends_on_every_component() {
        let base = part_hash("foo", "p", "g", 2);
        assert_eq!(base.len(), 32);
        assert_ne!(base, part_hash("foo", "p", "g", 3));
        assert_ne!(base, part_hash("foo", "q", "g", 2));
        assert_ne!(base, part_hash("foo", "p", "h", 2));
        assert_eq!(base, part_hash("foo", "p", "g", 2));
    }

    #[test]
    fn blacklisted_records_are_counted_and_dropped() {
        let rules = vec![rule("subject", "/password/i"), rule("poster", "^spam@")];
        let blacklist = Blacklist::compile("alt.binaries.test", &rules);

        let mut spam = record(3, "normal (1/1)");
        spam.poster = "spam@example.com".to_string();
        let records = [record(1, "Password Protected (1/1)"), record(2, "ok (1/1)"), spam];

        let result = aggregate("alt.binaries.test", &records, &blacklist);
        assert_eq!(result.blacklisted, 2);
        assert_eq!(result.parts.len(), 1);
        assert_eq!(result.parts.values().next().unwrap().subject, "ok");
    }

    #[test]
    fn blacklist_skips_disabled_foreign_and_broken_rules() {
        let mut disabled = rule("subject", "foo");
        disabled.status = 0;
        let mut foreign = rule("subject", "foo");
        foreign.group_name = "alt.binaries.other".to_string();
        let broken = rule("subject", "/foo(?=bar)/");
        let unknown_field = rule("body", "foo");

        let blacklist = Blacklist::compile(
            "alt.binaries.test",
            &[disabled, foreign, broken, unknown_field],
        );
        assert!(blacklist.is_empty());
        assert!(!blacklist.is_blocked("foo", "poster"));
    }
}
