//! Fixed-delay retry loop for operations that may fail transiently.
//!
//! Every Kubernetes read or write and every readiness wait goes through
//! [`retry_loop`]. The loop honours the shutdown token between attempts and
//! returns [`Error::LoopCancelled`] once it trips.
//!
//! ```ignore
//! use candictl_common::retry::{retry_loop, RetryConfig};
//!
//! let secret = retry_loop(&RetryConfig::state_reads(), "Get cluster state", &token, || async {
//!     api.get_opt("d8-cluster-terraform-state").await.map_err(Error::from)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{Error, Result};

/// Retry parameters
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (at least one attempt is always made)
    pub max_attempts: u32,
    /// Delay between attempts
    pub delay: Duration,
    /// Suppress per-attempt warnings
    pub silent: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 45,
            delay: Duration::from_secs(10),
            silent: false,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given attempts and delay
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            silent: false,
        }
    }

    /// 45 attempts, 10 s apart: writes of IaC state into the cluster
    pub fn state_writes() -> Self {
        Self::new(45, Duration::from_secs(10))
    }

    /// 5 attempts, 5 s apart: reads of IaC state from the cluster
    pub fn state_reads() -> Self {
        Self::new(5, Duration::from_secs(5))
    }

    /// Disable per-attempt warnings
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

/// Run `operation` until it succeeds, attempts are exhausted or `cancel` trips.
///
/// Errors that already signal cancellation are returned without retrying.
pub async fn retry_loop<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::loop_cancelled(operation_name));
        }
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        if !config.silent {
            warn!(
                operation = %operation_name,
                attempt = attempt,
                max_attempts = max_attempts,
                error = %err,
                "Operation failed, retrying"
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::loop_cancelled(operation_name)),
            _ = tokio::time::sleep(config.delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig::new(attempts, Duration::from_millis(1)).silent()
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let token = CancellationToken::new();
        let result = retry_loop(&fast(3), "op", &token, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let token = CancellationToken::new();

        let result = retry_loop(&fast(5), "op", &token, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::internal("fail"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let token = CancellationToken::new();

        let result: Result<()> = retry_loop(&fast(3), "op", &token, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::internal("always fails"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Internal { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_loop() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> =
            retry_loop(&fast(3), "op", &token, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::LoopCancelled { .. })));
    }

    #[tokio::test]
    async fn test_cancel_during_sleep() {
        let token = CancellationToken::new();
        let config = RetryConfig::new(10, Duration::from_secs(60)).silent();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.cancel();
        });

        let result: Result<()> = retry_loop(&config, "op", &token, || async {
            Err(Error::internal("fail"))
        })
        .await;
        assert!(matches!(result, Err(Error::LoopCancelled { .. })));
    }

    #[tokio::test]
    async fn test_aborted_error_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let token = CancellationToken::new();

        let result: Result<()> = retry_loop(&fast(5), "op", &token, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::pipeline_aborted("p", "declined"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::PipelineAborted { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
