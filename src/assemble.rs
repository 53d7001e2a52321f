//! Binary assembly
//!
//! Matches stored parts against the enabled binary rules to find the name of
//! the file set each part belongs to and the part's position in it. Parts
//! with the same name, group, poster and declared total are merged into one
//! binary. Parts that match no rule are deleted.
//!
//! Rules are stored in delimited form and carry named captures:
//!
//! | capture            | meaning                                          |
//! |--------------------|--------------------------------------------------|
//! | `name`             | binary name                                      |
//! | `reqid`            | request id; used as the name when `name` is empty |
//! | `parts`            | `a/b`, `a of b`, `a-b` or `a~b`                  |
//! | `part` + `total`   | position and count as separate captures          |

use crate::db::{AssemblyCommit, BinaryDraft, BinaryRow, BinarySlot, Database, PartRow, RegexRule};
use crate::error::Result;
use crate::patterns::{compile_pattern, group_selector_rank};
use crate::types::AssembleStats;
use regex::Regex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static PARTS_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)^\s*(\d+)\s*(?:/|of|-|~)\s*(\d+)\s*$").expect("parts value pattern is valid")
});

static PARTS_FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)[\[(]\s*(\d+)\s*(?:/|of|-|~)\s*(\d+)\s*[\])]")
        .expect("parts fallback pattern is valid")
});

static REPOST_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)repost|re-?up").expect("repost name pattern is valid")
});

static REPOST_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(?i)repost\d?|re-?up").expect("repost token pattern is valid")
});

/// Validate a part position against its declared total
///
/// Position 0 is accepted; posters number index files (`.nfo`, `.par2`)
/// that way.
fn checked_position(part: u32, total: u32) -> Option<(u32, u32)> {
    (total > 0 && part <= total).then_some((part, total))
}

/// Parse a `parts` capture such as `3/10`, `3 of 10`, `3-10` or `3~10`
pub fn parse_parts_value(value: &str) -> Option<(u32, u32)> {
    let caps = PARTS_VALUE.captures(value)?;
    let part = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    checked_position(part, total)
}

/// Last `[n/m]` or `(n/m)` style counter in a subject
pub fn fallback_parts(subject: &str) -> Option<(u32, u32)> {
    let caps = PARTS_FALLBACK.captures_iter(subject).last()?;
    let part = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    checked_position(part, total)
}

/// Append the subject's repost token to names that mark a repost
///
/// Keeps a repost apart from the original post of the same name.
pub fn with_repost_token(name: String, subject: &str) -> String {
    if !REPOST_NAME.is_match(&name) {
        return name;
    }
    match REPOST_TOKEN.find(subject) {
        Some(token) => format!("{} {}", name, token.as_str()),
        None => name,
    }
}

/// Dedup key of a binary
pub fn binary_hash(name: &str, group: &str, poster: &str, total_parts: u32) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{}{}{}{}", name, group, poster, total_parts))
    )
}

#[derive(Debug)]
struct CompiledRule {
    id: i64,
    group_name: String,
    ordinal: i64,
    category_id: Option<i64>,
    regex: Regex,
}

/// What a matching rule extracted from a subject
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleMatch {
    /// Rule that matched
    pub rule_id: i64,
    /// Category hint carried by the rule
    pub category_id: Option<i64>,
    /// Binary name, repost token included
    pub name: String,
    /// Request id capture
    pub req_id: Option<String>,
    /// Part position and declared total
    pub position: Option<(u32, u32)>,
}

/// Enabled binary rules, compiled once per assembler pass
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    by_group: HashMap<String, Vec<usize>>,
}

impl RuleSet {
    /// Compile enabled rules; invalid patterns are logged and skipped
    pub fn compile(rules: &[RegexRule]) -> Self {
        let rules = rules
            .iter()
            .filter(|rule| rule.status != 0)
            .filter_map(|rule| match compile_pattern(&rule.pattern) {
                Ok(regex) => Some(CompiledRule {
                    id: rule.id,
                    group_name: rule.group_name.clone(),
                    ordinal: rule.ordinal,
                    category_id: rule.category_id,
                    regex,
                }),
                Err(e) => {
                    tracing::warn!(rule_id = rule.id, error = %e, "Skipping invalid binary rule");
                    None
                }
            })
            .collect();

        Self {
            rules,
            by_group: HashMap::new(),
        }
    }

    /// Number of usable rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rule compiled
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Indices of the rules applying to `group`: exact first, then wildcard,
    /// then ascending ordinal
    fn ordered_for(&mut self, group: &str) -> &[usize] {
        let rules = &self.rules;
        self.by_group.entry(group.to_string()).or_insert_with(|| {
            let mut applicable: Vec<(u8, i64, i64, usize)> = rules
                .iter()
                .enumerate()
                .filter_map(|(index, rule)| {
                    group_selector_rank(&rule.group_name, group)
                        .map(|rank| (rank, rule.ordinal, rule.id, index))
                })
                .collect();
            applicable.sort_unstable();
            applicable.into_iter().map(|(_, _, _, index)| index).collect()
        })
    }

    /// First rule for `group` that matches `subject` and yields a name
    pub fn match_subject(&mut self, group: &str, subject: &str) -> Option<RuleMatch> {
        let order = self.ordered_for(group).to_vec();
        order
            .into_iter()
            .find_map(|index| extract(&self.rules[index], subject))
    }
}

fn non_empty(capture: Option<regex::Match<'_>>) -> Option<String> {
    capture
        .map(|m| m.as_str().trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn extract(rule: &CompiledRule, subject: &str) -> Option<RuleMatch> {
    let caps = rule.regex.captures(subject)?;

    let req_id = non_empty(caps.name("reqid"));
    let name = non_empty(caps.name("name")).or_else(|| req_id.clone())?;

    let declared = match (caps.name("parts"), caps.name("part"), caps.name("total")) {
        (Some(parts), _, _) => parse_parts_value(parts.as_str()),
        (None, Some(part), Some(total)) => {
            let part = part.as_str().trim().parse().ok();
            let total = total.as_str().trim().parse().ok();
            part.zip(total)
                .and_then(|(part, total)| checked_position(part, total))
        }
        _ => None,
    };

    Some(RuleMatch {
        rule_id: rule.id,
        category_id: rule.category_id,
        name: with_repost_token(name, subject),
        req_id,
        position: declared.or_else(|| fallback_parts(subject)),
    })
}

/// What the assembler does with one part
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Assign to the binary named by `rule` at `index` of `total`
    Assign {
        /// Extracted rule data
        rule: RuleMatch,
        /// Part position
        index: u32,
        /// Declared part count
        total: u32,
    },
    /// Leave for a later pass
    Deferred,
    /// Delete
    Dead,
}

/// Decide what happens to `part` at time `now`
///
/// A part whose subject names no position becomes a single-part binary only
/// once `grace` has passed since it was posted.
pub fn classify_part(rules: &mut RuleSet, part: &PartRow, now: i64, grace: Duration) -> Verdict {
    let Some(rule) = rules.match_subject(&part.group_name, &part.subject) else {
        return Verdict::Dead;
    };

    match rule.position {
        Some((index, total)) => Verdict::Assign { rule, index, total },
        None if now.saturating_sub(part.posted) >= grace.as_secs() as i64 => Verdict::Assign {
            rule,
            index: 1,
            total: 1,
        },
        None => Verdict::Deferred,
    }
}

/// A binary being built within one chunk
struct ChunkBinary {
    draft: BinaryDraft,
    slot_posted: HashMap<i64, i64>,
    stored: HashMap<i64, BinarySlot>,
    is_new: bool,
}

impl ChunkBinary {
    fn new(
        hash: String,
        rule: &RuleMatch,
        part: &PartRow,
        total: u32,
        stored: Option<(BinaryRow, Vec<BinarySlot>)>,
    ) -> Self {
        let is_new = stored.is_none();
        let (posted, stored) = match stored {
            Some((row, slots)) => (
                row.posted,
                slots.into_iter().map(|slot| (slot.part_index, slot)).collect(),
            ),
            None => (part.posted, HashMap::new()),
        };

        Self {
            draft: BinaryDraft {
                hash,
                name: rule.name.clone(),
                group_name: part.group_name.clone(),
                posted,
                posted_by: part.posted_by.clone(),
                xref: part.xref.clone(),
                total_parts: i64::from(total),
                regex_id: Some(rule.rule_id),
                category_id: rule.category_id,
                req_id: rule.req_id.clone(),
                slots: BTreeMap::new(),
            },
            slot_posted: HashMap::new(),
            stored,
            is_new,
        }
    }

    /// Place `part` at `index`, returning the id of a part that lost its slot
    ///
    /// On a collision the part posted closer to the binary's running
    /// `posted` keeps the slot; ties keep the part already there.
    fn place(&mut self, part: &PartRow, index: i64) -> Option<i64> {
        let running = self.draft.posted;
        let distance = |posted: i64| posted.abs_diff(running);

        let displaced = if let Some(&held_posted) = self.slot_posted.get(&index) {
            if distance(part.posted) >= distance(held_posted) {
                return Some(part.id);
            }
            self.draft.slots.get(&index).copied()
        } else if let Some(held) = self.stored.get(&index) {
            if distance(part.posted) >= distance(held.posted) {
                return Some(part.id);
            }
            let held_id = held.part_id;
            self.stored.remove(&index);
            Some(held_id)
        } else {
            None
        };

        self.draft.slots.insert(index, part.id);
        self.slot_posted.insert(index, part.posted);
        self.draft.posted = self.draft.posted.min(part.posted);
        displaced
    }
}

async fn load_stored(db: &Database, hash: &str) -> Result<Option<(BinaryRow, Vec<BinarySlot>)>> {
    match db.get_binary_by_hash(hash).await? {
        Some(row) => {
            let slots = db.binary_slots(row.id).await?;
            Ok(Some((row, slots)))
        }
        None => Ok(None),
    }
}

/// Build the commit for one chunk of unassigned parts
async fn assemble_chunk(
    db: &Database,
    rules: &mut RuleSet,
    parts: &[PartRow],
    now: i64,
    grace: Duration,
) -> Result<(AssemblyCommit, AssembleStats)> {
    let mut stats = AssembleStats::default();
    let mut binaries: HashMap<String, ChunkBinary> = HashMap::new();
    let mut dead_parts = Vec::new();

    for part in parts {
        stats.processed += 1;

        let (rule, index, total) = match classify_part(rules, part, now, grace) {
            Verdict::Assign { rule, index, total } => (rule, index, total),
            Verdict::Deferred => {
                stats.deferred += 1;
                continue;
            }
            Verdict::Dead => {
                dead_parts.push(part.id);
                continue;
            }
        };

        let hash = binary_hash(&rule.name, &part.group_name, &part.posted_by, total);
        let binary = match binaries.entry(hash) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let stored = load_stored(db, entry.key()).await?;
                let binary = ChunkBinary::new(entry.key().clone(), &rule, part, total, stored);
                entry.insert(binary)
            }
        };

        if let Some(loser) = binary.place(part, i64::from(index)) {
            tracing::debug!(
                binary = %binary.draft.name,
                part_index = index,
                part_id = loser,
                "Part lost slot collision"
            );
            dead_parts.push(loser);
        }
    }

    stats.dead = dead_parts.len() as u64;
    let binaries: Vec<BinaryDraft> = binaries
        .into_values()
        .filter(|binary| !binary.draft.slots.is_empty())
        .inspect(|binary| {
            if binary.is_new {
                stats.formed += 1;
            }
        })
        .map(|binary| binary.draft)
        .collect();

    Ok((
        AssemblyCommit {
            binaries,
            dead_parts,
        },
        stats,
    ))
}

/// Run one assembler pass over every unassigned part
///
/// Parts are taken in id order in chunks of `chunk_size`; each chunk commits
/// in one transaction. Cancellation is checked between chunks. A pass with no
/// usable rules does nothing, so that an empty rule table cannot delete every
/// stored part.
pub async fn assemble(
    db: &Database,
    chunk_size: usize,
    orphan_grace: Duration,
    cancel: &CancellationToken,
) -> Result<AssembleStats> {
    let mut rules = RuleSet::compile(&db.list_enabled_regexes().await?);
    let mut totals = AssembleStats::default();
    if rules.is_empty() {
        tracing::warn!("No enabled binary rules; skipping assembly");
        return Ok(totals);
    }

    let chunk_size = chunk_size.max(1);
    let mut after_id = 0;
    loop {
        if cancel.is_cancelled() {
            tracing::info!("Assembly cancelled between chunks");
            break;
        }

        let parts = db.unassigned_parts(after_id, chunk_size).await?;
        let Some(last) = parts.last() else {
            break;
        };
        after_id = last.id;

        let now = chrono::Utc::now().timestamp();
        let (commit, stats) = assemble_chunk(db, &mut rules, &parts, now, orphan_grace).await?;
        db.commit_assembly(&commit).await?;

        tracing::info!(
            processed = stats.processed,
            formed = stats.formed,
            extended = commit.binaries.len() as u64 - stats.formed,
            dead = stats.dead,
            deferred = stats.deferred,
            "Assembly chunk committed"
        );

        totals.processed += stats.processed;
        totals.formed += stats.formed;
        totals.dead += stats.dead;
        totals.deferred += stats.deferred;

        if parts.len() < chunk_size {
            break;
        }
    }

    tracing::info!(
        rules = rules.len(),
        processed = totals.processed,
        formed = totals.formed,
        dead = totals.dead,
        deferred = totals.deferred,
        "Assembly pass complete"
    );
    Ok(totals)
}
