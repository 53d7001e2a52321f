//! # usenet-indexer
//!
//! Usenet binary indexer. Scans newsgroup overview data, groups article
//! segments into parts and parts into binaries, and turns complete binaries
//! into releases with stored NZB manifests.
//!
//! ## Pipeline
//!
//! 1. **Scan** ([`scan`]): per group, fetch overview windows forward from the
//!    last scanned article (or backward for backfill) and aggregate segments
//!    into parts ([`aggregate`]).
//! 2. **Assemble** ([`assemble`]): match part subjects against the binary
//!    rules and merge parts into binaries.
//! 3. **Finalize** ([`release`]): write an NZB ([`nzb`]) for every complete
//!    binary and store it with a new release.
//!
//! [`Indexer`] runs these phases in order and owns the shared state.
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_indexer::{Config, Indexer, run_until_signal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file(std::path::Path::new("indexer.json")).await?;
//!     let indexer = Indexer::new(config).await?;
//!     indexer.add_group("alt.binaries.teevee").await?;
//!
//!     // Update every active group until SIGTERM/SIGINT
//!     run_until_signal(indexer.cancel_token(), indexer.run_update(None)).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Segment-to-part aggregation of overview records
pub mod aggregate;
/// Part-to-binary assembly
pub mod assemble;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Pipeline facade
pub mod indexer;
/// NNTP client and session seams
pub mod nntp;
/// NZB encoding and decoding
pub mod nzb;
/// Delimited rule patterns and group selectors
pub mod patterns;
/// Release publishing over HTTP
pub mod publish;
/// Release finalization
pub mod release;
/// Retry logic with exponential backoff
pub mod retry;
/// Group scanning
pub mod scan;
/// Core types
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{DatabaseError, Error, ParseError, ProtocolError, Result};
pub use indexer::{CycleReport, ImportReport, Indexer};
pub use nntp::{NewsSession, SessionFactory};
pub use release::{CategoryClassifier, ReleaseHandoff};
pub use types::{
    AssembleStats, Category, FinalizeStats, ReleaseId, ReleaseStatus, ReleaseSummary, ScanState,
    ScanSummary,
};

/// Run `work` until it finishes or a termination signal arrives.
///
/// On a signal, `cancel` is cancelled and `work` is still awaited so it can
/// commit or roll back whatever it was doing.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_until_signal<F, T>(cancel: tokio_util::sync::CancellationToken, work: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::pin!(work);

    tokio::select! {
        result = &mut work => return result,
        _ = wait_for_signal() => {}
    }

    tracing::info!("Stopping, waiting for in-flight work to finish");
    cancel.cancel();
    work.await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
