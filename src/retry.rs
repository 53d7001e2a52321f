//! Bounded retry with exponential backoff
//!
//! Transient failures (dropped connections, timeouts, busy servers) are retried
//! a fixed number of times. There is no unbounded retry anywhere in the crate:
//! every loop built on this module exits after `max_attempts` retries.
//!
//! # Example
//!
//! ```no_run
//! use usenet_indexer::retry::{IsRetryable, with_retry};
//! use usenet_indexer::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, ProtocolError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) return `true`.
/// Permanent failures (authentication failed, missing group, corrupt data) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Protocol(e) => match e {
                ProtocolError::ConnectionFailed { .. }
                | ProtocolError::Timeout(_)
                | ProtocolError::Malformed(_) => true,
                // 400 service discontinued / 503 busy are temporary; 4xx for a
                // specific command are not
                ProtocolError::UnexpectedResponse { code, .. } => matches!(code, 400 | 503),
                ProtocolError::NoSuchGroup(_)
                | ProtocolError::NoSuchArticle(_)
                | ProtocolError::NoGroupSelected => false,
            },
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|status| status.is_server_error())
            }
            // Credentials will not start working on their own
            Error::Auth(_) => false,
            Error::Parse(_) => false,
            // A failed chunk commit is reprocessed by the next pass, never in place
            Error::Database(_) | Error::Sqlx(_) => false,
            Error::Config { .. } => false,
            Error::NotFound(_) => false,
            Error::Precondition(_) => false,
            Error::ShuttingDown => false,
            Error::Serialization(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// Delay sequence for one bounded retry loop
///
/// Each call to [`Backoff::next_delay`] returns the delay to sleep before the
/// next attempt and grows the base delay by `backoff_multiplier`, capped at
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Start a new delay sequence from a retry configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let current = if self.jitter {
            add_jitter(self.delay)
        } else {
            self.delay
        };

        let next = Duration::from_secs_f64(self.delay.as_secs_f64() * self.multiplier);
        self.delay = next.min(self.max_delay);

        current.min(self.max_delay)
    }
}

/// Execute an async operation with bounded exponential-backoff retry
///
/// Returns the successful result, the first non-retryable error, or the last
/// error once `config.max_attempts` retries are exhausted.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = Backoff::new(config);

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                let delay = backoff.next_delay();

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_success_no_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "should only call once");
    }

    #[tokio::test]
    async fn test_retry_transient_then_succeed() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let counter = counter_clone.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_after_bounded_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(
            counter.load(Ordering::SeqCst),
            4,
            "initial attempt plus three retries"
        );
    }

    #[tokio::test]
    async fn test_permanent_error_no_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast_config(3), || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Permanent)
            }
        })
        .await;

        assert!(matches!(result, Err(TestError::Permanent)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_caps_at_max_delay() {
        let mut backoff = Backoff::new(&RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }

    #[test]
    fn backoff_with_jitter_never_exceeds_max_delay() {
        let mut backoff = Backoff::new(&RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(600),
            backoff_multiplier: 2.0,
            jitter: true,
        });

        for _ in 0..50 {
            assert!(backoff.next_delay() <= Duration::from_millis(600));
        }
    }

    #[test]
    fn add_jitter_stays_within_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..200 {
            let d = add_jitter(base);
            assert!(d >= base && d <= base * 2, "jittered delay {d:?} out of range");
        }
    }

    #[test]
    fn protocol_faults_are_retryable_but_auth_is_not() {
        let transient = Error::Protocol(ProtocolError::ConnectionFailed {
            host: "news.example.com".into(),
            reason: "reset".into(),
        });
        assert!(transient.is_retryable());
        assert!(Error::Protocol(ProtocolError::Timeout(Duration::from_secs(30))).is_retryable());
        assert!(
            Error::Protocol(ProtocolError::UnexpectedResponse {
                code: 503,
                message: "busy".into()
            })
            .is_retryable()
        );

        assert!(!Error::Auth("481 Authentication failed".into()).is_retryable());
        assert!(!Error::Protocol(ProtocolError::NoSuchGroup("alt.none".into())).is_retryable());
        assert!(
            !Error::Protocol(ProtocolError::UnexpectedResponse {
                code: 423,
                message: "no such article number".into()
            })
            .is_retryable()
        );
    }

    #[test]
    fn io_errors_classified_by_kind() {
        let reset = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(reset.is_retryable());

        let denied = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!denied.is_retryable());
    }
}
