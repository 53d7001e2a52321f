//! [`NewsSession`] backed by an nntp-rs client

use super::overview::overview_record;
use super::{GroupStats, NewsSession};
use crate::config::NewsServerConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::types::OverviewBatch;
use nntp_rs::{NntpClient, NntpError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A single authenticated connection to a news server
pub struct NntpConnection {
    host: String,
    client: NntpClient,
    timeout: Duration,
}

impl NntpConnection {
    /// Connect, read the greeting and authenticate if credentials are configured
    pub async fn connect(config: &NewsServerConfig) -> Result<Self> {
        let host = config.host.clone();
        let timeout = config.timeout;

        let client = bounded(
            &host,
            timeout,
            NntpClient::connect(Arc::new(config.into())),
        )
        .await?;
        let mut conn = Self {
            host,
            client,
            timeout,
        };

        if config.username.is_some() {
            bounded(&conn.host, timeout, conn.client.authenticate()).await?;
        }

        // Transit-mode servers need this; readers may refuse it
        let mode = tokio::time::timeout(timeout, conn.client.mode_reader())
            .await
            .map_err(|_| ProtocolError::Timeout(timeout))?;
        match mode {
            Ok(posting) => tracing::debug!(host = %conn.host, posting, "NNTP session ready"),
            Err(NntpError::Protocol { code, .. }) => {
                tracing::debug!(host = %conn.host, code, "MODE READER refused, continuing");
            }
            Err(e) => return Err(map_error(&conn.host, timeout, e)),
        }

        Ok(conn)
    }
}

#[async_trait::async_trait]
impl NewsSession for NntpConnection {
    async fn select_group(&mut self, name: &str) -> Result<GroupStats> {
        let info = bounded(&self.host, self.timeout, self.client.select_group(name)).await?;
        Ok(GroupStats {
            count: info.count,
            first: info.first,
            last: info.last,
        })
    }

    async fn fetch_overview(&mut self, first: u64, last: u64) -> Result<OverviewBatch> {
        if self.client.current_group().is_none() {
            return Err(ProtocolError::NoGroupSelected.into());
        }

        let timeout = self.timeout;
        let range = format!("{}-{}", first, last);
        let xover = tokio::time::timeout(timeout, self.client.fetch_xover(&range))
            .await
            .map_err(|_| ProtocolError::Timeout(timeout))?;
        let entries = match xover {
            Ok(entries) => entries,
            // Empty range
            Err(NntpError::Protocol {
                code: 420 | 423, ..
            }) => Vec::new(),
            Err(e) => return Err(map_error(&self.host, timeout, e)),
        };

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            match overview_record(entry) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(error = %e, "Skipping malformed overview entry"),
            }
        }

        Ok(OverviewBatch::from_records(first, last, records))
    }

    async fn fetch_article_body(&mut self, group: &str, message_id: &str) -> Result<Vec<u8>> {
        if self.client.current_group() != Some(group) {
            self.select_group(group).await?;
        }

        let timeout = self.timeout;
        let body = tokio::time::timeout(timeout, self.client.fetch_body_binary(message_id))
            .await
            .map_err(|_| ProtocolError::Timeout(timeout))?;
        match body {
            Ok(response) => Ok(response.data),
            Err(NntpError::Protocol {
                code: 423 | 430, ..
            }) => Err(ProtocolError::NoSuchArticle(message_id.to_string()).into()),
            Err(e) => Err(map_error(&self.host, timeout, e)),
        }
    }

    fn selected_group(&self) -> Option<&str> {
        self.client.current_group()
    }

    async fn quit(&mut self) -> Result<()> {
        if let Err(e) = self.client.quit().await {
            tracing::debug!(host = %self.host, error = %e, "QUIT failed");
        }
        Ok(())
    }
}

/// Run one client call under the configured timeout, mapping its error
async fn bounded<T>(
    host: &str,
    timeout: Duration,
    call: impl Future<Output = nntp_rs::Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ProtocolError::Timeout(timeout))?
        .map_err(|e| map_error(host, timeout, e))
}

/// Sort nntp-rs errors into the indexer's retryable and fatal classes
fn map_error(host: &str, timeout: Duration, err: NntpError) -> Error {
    let protocol = match err {
        NntpError::AuthFailed(reason) | NntpError::EncryptionRequired(reason) => {
            return Error::Auth(reason);
        }
        NntpError::Protocol {
            code: code @ (480 | 481 | 482 | 502),
            message,
        } => return Error::Auth(format!("{} {}", code, message)),
        NntpError::NoSuchGroup(group) => ProtocolError::NoSuchGroup(group),
        NntpError::NoSuchArticle(id) => ProtocolError::NoSuchArticle(id),
        NntpError::NoGroupSelected | NntpError::Protocol { code: 412, .. } => {
            ProtocolError::NoGroupSelected
        }
        NntpError::Protocol { code, message } => {
            ProtocolError::UnexpectedResponse { code, message }
        }
        NntpError::Timeout => ProtocolError::Timeout(timeout),
        NntpError::InvalidResponse(line) => ProtocolError::Malformed(line),
        NntpError::Utf8(e) => ProtocolError::Malformed(e.to_string()),
        other => ProtocolError::ConnectionFailed {
            host: host.to_string(),
            reason: other.to_string(),
        },
    };
    protocol.into()
}
