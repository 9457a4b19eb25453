//! Statement execution with termination retries.
//!
//! Each attempt:
//! 1. probes the existing pool (if any and if enabled),
//! 2. gets or lazily builds the pool,
//! 3. acquires a connection, runs the statement and records its duration.
//!
//! A termination error discards the pool, waits `initial_delay * 2^attempt`
//! and tries again, up to `max_retries` times. Anything else, or a
//! termination after the last retry, is returned as is.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::{Connector, DatabaseConnection, DatabasePool};
use crate::classify::ErrorClass;
use crate::error::{Result, SentinelError};
use crate::manager::PoolManager;
use crate::outcome::QueryOutcome;
use crate::pg::Value;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each later one.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// Delay after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Whether a failure of `class` on attempt `attempt` gets another try.
    pub fn should_retry(&self, attempt: u32, class: ErrorClass) -> bool {
        class.is_retryable() && attempt < self.max_retries
    }

    /// Total attempts, counting the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sum of all backoff delays when every retry is used.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.delay_for(attempt)).sum()
    }
}

/// Runs statements through a [`PoolManager`] with the manager's policy.
pub struct RetryExecutor<C: Connector> {
    manager: PoolManager<C>,
    policy: RetryPolicy,
}

impl<C: Connector> RetryExecutor<C> {
    pub fn new(manager: PoolManager<C>) -> Self {
        let policy = manager.config().retry;
        Self { manager, policy }
    }

    pub fn with_policy(manager: PoolManager<C>, policy: RetryPolicy) -> Self {
        Self { manager, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `statement` with `params`.
    ///
    /// The connection is released on every path. A `cleanup()` during a
    /// backoff wait ends the wait early and returns the last error.
    pub async fn execute(&self, statement: &str, params: &[Value]) -> Result<QueryOutcome> {
        let shutdown = self.manager.shutdown_token();
        let mut attempt = 0;

        loop {
            let (error, pool_id) = match self.attempt(statement, params).await {
                Ok(outcome) => return Ok(outcome),
                Err(failure) => failure,
            };

            let Some(class) = error.class() else {
                return Err(error);
            };

            if !self.policy.should_retry(attempt, class) {
                if class.is_retryable() {
                    tracing::error!(
                        attempts = attempt + 1,
                        error = %error,
                        "database kept terminating connections; giving up"
                    );
                } else {
                    log_fatal(class, &error);
                }
                return Err(error);
            }

            let delay = self.policy.delay_for(attempt);
            tracing::warn!(
                attempt = attempt + 1,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "database terminated the connection; rebuilding pool and retrying"
            );

            if let Some(pool_id) = pool_id {
                self.manager.discard(pool_id).await;
            }
            self.manager.counters().retries.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("shutdown during retry backoff");
                    return Err(error);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// One attempt. On failure, also returns the id of the pool involved so
    /// the caller can discard exactly that instance.
    async fn attempt(
        &self,
        statement: &str,
        params: &[Value],
    ) -> std::result::Result<QueryOutcome, (SentinelError, Option<u64>)> {
        if self.manager.config().health_check_before_use {
            if let Some(handle) = self.manager.current() {
                // `false` means the pool was just discarded; get_pool rebuilds it.
                self.manager
                    .check_health(&handle)
                    .await
                    .map_err(|e| (e, Some(handle.id())))?;
            }
        }

        let handle = self.manager.get_pool().await.map_err(|e| (e, None))?;
        let pool_id = Some(handle.id());

        let mut conn = handle
            .acquire()
            .await
            .map_err(|e| (SentinelError::database(e), pool_id))?;

        let started = Instant::now();
        let result = conn.query(statement, params).await;
        let duration = started.elapsed();
        drop(conn);

        self.manager.touch();

        match result {
            Ok(result) => {
                tracing::trace!(
                    pool_id = handle.id(),
                    duration_ms = duration.as_secs_f64() * 1000.0,
                    "statement executed"
                );
                Ok(QueryOutcome::new(result, duration))
            }
            Err(e) => Err((SentinelError::database(e), pool_id)),
        }
    }
}

fn log_fatal(class: ErrorClass, error: &SentinelError) {
    match class {
        ErrorClass::SchemaRelated => {
            tracing::warn!(class = %class, error = %error, "statement references a missing relation")
        }
        ErrorClass::Authentication | ErrorClass::Certificate => {
            tracing::error!(class = %class, error = %error, "database rejected the connection")
        }
        _ => tracing::debug!(class = %class, error = %error, "statement failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.total_backoff(), Duration::from_secs(7));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0, ErrorClass::Termination));
        assert!(policy.should_retry(2, ErrorClass::Termination));
        assert!(!policy.should_retry(3, ErrorClass::Termination));
        assert!(!policy.should_retry(0, ErrorClass::Authentication));
        assert!(!policy.should_retry(0, ErrorClass::Other));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(u32::MAX as u64));
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).total_backoff(), Duration::ZERO);
    }
}
