//! Capped exponential backoff around fallible remote operations.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::McpError;

/// Backoff schedule for retrying classified failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Draw each delay uniformly from `[0, capped]` instead of using the cap.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build a policy from the `[mcp.retry]` config section.
    pub fn from_settings(settings: &toolweave_core::config::RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }

    /// Deterministic delay after the failed attempt `attempt` (0-based):
    /// `min(initial * multiplier^attempt, max_delay)`.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let max = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= max {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Delay actually slept after attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter {
            return capped;
        }
        let capped_ms = capped.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=capped_ms))
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made.
///
/// Sleeps between attempts end early when `cancel` fires; the last error is
/// returned in that case.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut f: F,
) -> Result<T, McpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, McpError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;

        if !err.is_retryable() || attempt >= max_attempts || cancel.is_cancelled() {
            return Err(err);
        }

        let delay = policy.delay_for(attempt - 1);
        warn!(
            operation = operation,
            server = err.server_name(),
            kind = %err.kind(),
            attempt = attempt,
            max_attempts = max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(operation = operation, "Retry cancelled");
                return Err(err);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{McpErrorKind, OP_CALL_TOOL};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    fn retryable() -> McpError {
        McpError::timeout(OP_CALL_TOOL, "s", "stdio", anyhow::anyhow!("slow"))
    }

    fn fatal() -> McpError {
        McpError::new(OP_CALL_TOOL, "s", "stdio", McpErrorKind::Authentication, None)
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert!(!policy.jitter);
    }

    #[test]
    fn test_capped_delay_grows_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.capped_delay(0), Duration::from_secs(1));
        assert_eq!(policy.capped_delay(1), Duration::from_secs(2));
        assert_eq!(policy.capped_delay(4), Duration::from_secs(16));
        assert_eq!(policy.capped_delay(5), Duration::from_secs(30));
        assert_eq!(policy.capped_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy::default().with_jitter(true);
        for attempt in 0..8 {
            assert!(policy.delay_for(attempt) <= policy.capped_delay(attempt));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(5), &CancellationToken::new(), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(retryable())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            with_retry(&fast_policy(3), &CancellationToken::new(), "op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(retryable()) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), McpErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            with_retry(&fast_policy(5), &CancellationToken::new(), "op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(fatal()) }
            })
            .await;

        assert_eq!(result.unwrap_err().kind(), McpErrorKind::Authentication);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let calls = AtomicU32::new(0);
        let started = std::time::Instant::now();
        let result: Result<(), _> = with_retry(&policy, &cancel, "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(retryable()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
