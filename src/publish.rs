//! Release publishing
//!
//! Posts a JSON summary of every new release to the configured hosts. Posts
//! run in the background so a slow or unreachable host never holds up
//! finalization; failures are retried a bounded number of times and then
//! logged.

use crate::config::{PublishConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::release::ReleaseHandoff;
use crate::retry::with_retry;
use crate::types::ReleaseSummary;
use url::Url;

/// [`ReleaseHandoff`] that POSTs release summaries over HTTP
#[derive(Clone, Debug)]
pub struct ReleasePublisher {
    client: reqwest::Client,
    hosts: Vec<Url>,
    retry: RetryConfig,
}

impl ReleasePublisher {
    /// Build a publisher for the configured hosts
    pub fn new(config: &PublishConfig, retry: RetryConfig) -> Result<Self> {
        let hosts = config
            .hosts
            .iter()
            .enumerate()
            .map(|(index, host)| {
                Url::parse(host).map_err(|e| Error::Config {
                    message: format!("invalid publish host '{}': {}", host, e),
                    key: Some(format!("publish.hosts[{}]", index)),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("usenet-indexer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            hosts,
            retry,
        })
    }

    /// Configured hosts
    pub fn hosts(&self) -> &[Url] {
        &self.hosts
    }

    /// POST `release` to every host, returning the last failure if any host failed
    pub async fn publish(&self, release: &ReleaseSummary) -> Result<()> {
        let mut last_error = None;

        for host in &self.hosts {
            let result = with_retry(&self.retry, || async move {
                self.client
                    .post(host.clone())
                    .json(release)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok::<_, Error>(())
            })
            .await;

            match result {
                Ok(()) => {
                    tracing::debug!(url = %host, release_id = %release.id, "Release published");
                }
                Err(e) => {
                    tracing::warn!(url = %host, release_id = %release.id, error = %e, "Release publish failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ReleaseHandoff for ReleasePublisher {
    async fn release_created(&self, release: &ReleaseSummary) {
        if self.hosts.is_empty() {
            return;
        }

        // Fire and forget
        let publisher = self.clone();
        let release = release.clone();
        tokio::spawn(async move {
            let _ = publisher.publish(&release).await;
        });
    }
}
