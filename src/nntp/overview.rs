//! Overview record conversion

use crate::error::ProtocolError;
use crate::types::OverviewRecord;
use chrono::{DateTime, NaiveDateTime, Utc};
use nntp_rs::XoverEntry;

/// Convert one XOVER entry into an overview record
///
/// `XOVER` output carries no `Xref` through nntp-rs, so the record's xref is
/// left empty and release assembly falls back to the binary's own group.
pub fn overview_record(entry: XoverEntry) -> Result<OverviewRecord, ProtocolError> {
    // nntp-rs reports an unparseable article number as 0
    if entry.article_number == 0 {
        return Err(ProtocolError::Malformed(format!(
            "overview entry '{}' has no article number",
            entry.subject
        )));
    }

    let message_id = entry.message_id.trim();
    if message_id.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "article {} has no message-id",
            entry.article_number
        )));
    }

    Ok(OverviewRecord {
        article: entry.article_number,
        date: parse_overview_date(&entry.date),
        message_id: message_id.to_string(),
        poster: entry.author.trim().to_string(),
        bytes: entry.bytes as u64,
        subject: entry.subject,
        xref: String::new(),
    })
}

/// Parse an overview `Date` value
///
/// RFC 5322 dates go through nntp-rs; a trailing zone comment such as `(UTC)`
/// is dropped first, and zone names chrono cannot parse are taken as UTC.
pub fn parse_overview_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let without_comment = match raw.find('(') {
        Some(idx) => raw[..idx].trim(),
        None => raw,
    };

    if let Ok(dt) = nntp_rs::parse_date(without_comment) {
        return Some(dt);
    }

    let naive_part = without_comment
        .rsplit_once(' ')
        .map(|(head, _)| head)
        .unwrap_or(without_comment);
    ["%a, %d %b %Y %H:%M:%S", "%d %b %Y %H:%M:%S"]
        .into_iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive_part, format).ok())
        .map(|naive| naive.and_utc())
}
