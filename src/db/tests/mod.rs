use crate::aggregate::{PendingPart, PendingSegment, part_hash};
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

mod misses;

/// Build a pending part holding the given segment numbers
fn pending_part(group: &str, subject: &str, total: u32, numbers: &[u32], posted: i64) -> PendingPart {
    let segments = numbers
        .iter()
        .map(|&number| {
            (
                number,
                PendingSegment {
                    number,
                    size: 1000 * number as u64,
                    message_id: format!("<{}.{}@example.com>", subject.replace(' ', "_"), number),
                },
            )
        })
        .collect::<BTreeMap<_, _>>();

    PendingPart {
        hash: part_hash(subject, "poster@example.com", group, total),
        subject: subject.to_string(),
        group_name: group.to_string(),
        posted: Utc.timestamp_opt(posted, 0).unwrap(),
        posted_by: "poster@example.com".to_string(),
        xref: format!("news.example.com {}:1", group),
        total_segments: total,
        segments,
    }
}
