//! Scripted in-memory news server for scan tests
#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{GroupStats, NewsSession, SessionFactory};
use crate::error::{Error, ProtocolError, Result};
use crate::types::{OverviewBatch, OverviewRecord};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    groups: HashMap<String, BTreeMap<u64, OverviewRecord>>,
    bounds: HashMap<String, (u64, u64)>,
    overview_failures: VecDeque<Error>,
    range_failures: HashMap<(u64, u64), Error>,
    connect_failures: VecDeque<Error>,
    overview_calls: Vec<(String, u64, u64)>,
    connections: u32,
}

/// Shared server state; every session and connection sees the same articles
#[derive(Clone, Default)]
pub(crate) struct MockServer {
    state: Arc<Mutex<MockState>>,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_group(&self, group: &str) {
        let mut state = self.state.lock().unwrap();
        state.groups.entry(group.to_string()).or_default();
    }

    pub(crate) fn add_article(&self, group: &str, id: u64, subject: &str, date: DateTime<Utc>) {
        self.add_record(
            group,
            OverviewRecord {
                article: id,
                subject: subject.to_string(),
                poster: "poster@example.com".to_string(),
                date: Some(date),
                message_id: format!("<{id}.{group}@example.com>"),
                bytes: 1000,
                xref: format!("news.example.com {group}:{id}"),
            },
        );
    }

    pub(crate) fn add_record(&self, group: &str, record: OverviewRecord) {
        let mut state = self.state.lock().unwrap();
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(record.article, record);
    }

    pub(crate) fn remove_article(&self, group: &str, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(articles) = state.groups.get_mut(group) {
            articles.remove(&id);
        }
    }

    /// Override the first/last counters `GROUP` reports
    pub(crate) fn set_bounds(&self, group: &str, first: u64, last: u64) {
        let mut state = self.state.lock().unwrap();
        state.groups.entry(group.to_string()).or_default();
        state.bounds.insert(group.to_string(), (first, last));
    }

    /// Make the next overview request fail with `err`
    pub(crate) fn fail_next_overview(&self, err: Error) {
        self.state.lock().unwrap().overview_failures.push_back(err);
    }

    /// Make the first overview request for exactly `first..=last` fail with `err`
    pub(crate) fn fail_overview_range(&self, first: u64, last: u64, err: Error) {
        self.state
            .lock()
            .unwrap()
            .range_failures
            .insert((first, last), err);
    }

    /// Make the next connection attempt fail with `err`
    pub(crate) fn fail_next_connect(&self, err: Error) {
        self.state.lock().unwrap().connect_failures.push_back(err);
    }

    /// Every overview range requested so far, in order
    pub(crate) fn overview_calls(&self) -> Vec<(String, u64, u64)> {
        self.state.lock().unwrap().overview_calls.clone()
    }

    pub(crate) fn connections(&self) -> u32 {
        self.state.lock().unwrap().connections
    }

    pub(crate) fn session(&self) -> MockSession {
        MockSession {
            server: self.clone(),
            group: None,
        }
    }
}

#[async_trait::async_trait]
impl SessionFactory for MockServer {
    async fn connect(&self) -> Result<Box<dyn NewsSession>> {
        let failure = {
            let mut state = self.state.lock().unwrap();
            state.connections += 1;
            state.connect_failures.pop_front()
        };
        match failure {
            Some(err) => Err(err),
            None => Ok(Box::new(self.session())),
        }
    }
}

pub(crate) struct MockSession {
    server: MockServer,
    group: Option<String>,
}

#[async_trait::async_trait]
impl NewsSession for MockSession {
    async fn select_group(&mut self, name: &str) -> Result<GroupStats> {
        let state = self.server.state.lock().unwrap();
        let articles = state
            .groups
            .get(name)
            .ok_or_else(|| ProtocolError::NoSuchGroup(name.to_string()))?;

        let (first, last) = match state.bounds.get(name) {
            Some(bounds) => *bounds,
            None => (
                articles.keys().next().copied().unwrap_or(0),
                articles.keys().next_back().copied().unwrap_or(0),
            ),
        };
        let stats = GroupStats {
            count: articles.len() as u64,
            first,
            last,
        };
        drop(state);

        self.group = Some(name.to_string());
        Ok(stats)
    }

    async fn fetch_overview(&mut self, first: u64, last: u64) -> Result<OverviewBatch> {
        let group = self.group.clone().ok_or(ProtocolError::NoGroupSelected)?;
        let mut state = self.server.state.lock().unwrap();
        state.overview_calls.push((group.clone(), first, last));
        if let Some(err) = state.overview_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = state.range_failures.remove(&(first, last)) {
            return Err(err);
        }

        let records = state
            .groups
            .get(&group)
            .map(|articles| articles.range(first..=last).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default();
        Ok(OverviewBatch::from_records(first, last, records))
    }

    async fn fetch_article_body(&mut self, group: &str, message_id: &str) -> Result<Vec<u8>> {
        let state = self.server.state.lock().unwrap();
        let found = state
            .groups
            .get(group)
            .map(|articles| articles.values().any(|r| r.message_id == message_id))
            .unwrap_or(false);
        if !found {
            return Err(ProtocolError::NoSuchArticle(message_id.to_string()).into());
        }
        Ok(format!("body of {message_id}").into_bytes())
    }

    fn selected_group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}
