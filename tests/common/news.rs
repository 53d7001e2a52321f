//! In-memory news server standing in for NNTP

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use usenet_indexer::error::{ProtocolError, Result};
use usenet_indexer::nntp::GroupStats;
use usenet_indexer::types::{OverviewBatch, OverviewRecord};
use usenet_indexer::{NewsSession, SessionFactory};

/// Articles per group, shared by every session
#[derive(Clone, Default)]
pub struct FakeNewsServer {
    groups: Arc<Mutex<HashMap<String, BTreeMap<u64, OverviewRecord>>>>,
    sessions: Arc<Mutex<u32>>,
}

impl FakeNewsServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post one article
    pub fn post(&self, group: &str, article: u64, subject: &str, posted: DateTime<Utc>, bytes: u64) {
        let record = OverviewRecord {
            article,
            subject: subject.to_string(),
            poster: "uploader@example.com".to_string(),
            date: Some(posted),
            message_id: format!("<{article}.{group}@example.com>"),
            bytes,
            xref: format!("news.example.com {group}:{article}"),
        };
        self.groups
            .lock()
            .unwrap()
            .entry(group.to_string())
            .or_default()
            .insert(article, record);
    }

    /// Post a multi-volume rar set, `segments` articles per volume, from `first`
    ///
    /// Returns the next free article id.
    pub fn post_rar_set(
        &self,
        group: &str,
        name: &str,
        volumes: u32,
        segments: u32,
        first: u64,
        posted: i64,
    ) -> u64 {
        let posted = Utc.timestamp_opt(posted, 0).unwrap();
        let mut article = first;
        for volume in 1..=volumes {
            for segment in 1..=segments {
                let subject = format!(
                    r#"[{volume}/{volumes}] - "{name}.part{volume:02}.rar" yEnc ({segment}/{segments})"#
                );
                self.post(group, article, &subject, posted, 1000);
                article += 1;
            }
        }
        article
    }

    /// Sessions opened so far
    pub fn sessions(&self) -> u32 {
        *self.sessions.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl SessionFactory for FakeNewsServer {
    async fn connect(&self) -> Result<Box<dyn NewsSession>> {
        *self.sessions.lock().unwrap() += 1;
        Ok(Box::new(FakeSession {
            server: self.clone(),
            group: None,
        }))
    }
}

pub struct FakeSession {
    server: FakeNewsServer,
    group: Option<String>,
}

#[async_trait::async_trait]
impl NewsSession for FakeSession {
    async fn select_group(&mut self, name: &str) -> Result<GroupStats> {
        let stats = {
            let groups = self.server.groups.lock().unwrap();
            let articles = groups
                .get(name)
                .ok_or_else(|| ProtocolError::NoSuchGroup(name.to_string()))?;
            GroupStats {
                count: articles.len() as u64,
                first: articles.keys().next().copied().unwrap_or(0),
                last: articles.keys().next_back().copied().unwrap_or(0),
            }
        };
        self.group = Some(name.to_string());
        Ok(stats)
    }

    async fn fetch_overview(&mut self, first: u64, last: u64) -> Result<OverviewBatch> {
        let group = self.group.clone().ok_or(ProtocolError::NoGroupSelected)?;
        let records = self
            .server
            .groups
            .lock()
            .unwrap()
            .get(&group)
            .map(|articles| articles.range(first..=last).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default();
        Ok(OverviewBatch::from_records(first, last, records))
    }

    async fn fetch_article_body(&mut self, _group: &str, message_id: &str) -> Result<Vec<u8>> {
        Err(ProtocolError::NoSuchArticle(message_id.to_string()).into())
    }

    fn selected_group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}
