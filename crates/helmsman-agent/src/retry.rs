//! Unified retry strategy: per-error-class backoff with jitter.
//!
//! The policy decides whether and when to retry based on the failure
//! signal; the executor wraps an async operation and applies it.

use std::collections::HashSet;
use std::future::Future;

use helmsman_core::{FailureKind, FailureSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    None,
    Immediate,
    Linear,
    Exponential,
    ExponentialJitter,
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries, not counting the first attempt.
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    /// Initial delay in seconds.
    pub initial_delay: f64,
    /// Delay cap in seconds.
    pub max_delay: f64,
    pub backoff_factor: f64,
    /// Jitter factor in [0, 1]; applied only by the jitter strategy.
    pub jitter_factor: f64,
    /// When non-empty, only these kinds are retried.
    pub retryable_kinds: HashSet<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::ExponentialJitter,
            initial_delay: 1.0,
            max_delay: 30.0,
            backoff_factor: 2.0,
            jitter_factor: 0.2,
            retryable_kinds: HashSet::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based), capped at `max_delay`,
    /// plus `delay * jitter_factor * U(0,1)` for the jitter strategy.
    pub fn delay_for_attempt(&self, attempt: u32) -> f64 {
        let base = match self.strategy {
            RetryStrategy::None | RetryStrategy::Immediate => return 0.0,
            RetryStrategy::Linear => self.initial_delay * attempt as f64,
            RetryStrategy::Exponential | RetryStrategy::ExponentialJitter => {
                self.initial_delay * self.backoff_factor.powi(attempt as i32 - 1)
            }
        };
        let mut delay = base.min(self.max_delay);
        if self.strategy == RetryStrategy::ExponentialJitter && self.jitter_factor > 0.0 {
            delay += delay * self.jitter_factor * rand::random::<f64>();
        }
        delay
    }

    pub fn should_retry(&self, failure: &FailureSignal, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        if self.strategy == RetryStrategy::None {
            return false;
        }
        if !failure.is_retryable() {
            return false;
        }
        if !self.retryable_kinds.is_empty() && !self.retryable_kinds.contains(&failure.kind) {
            return false;
        }
        true
    }

    /// Recommended policy per error class. Rate limits get a long fuse
    /// and heavy jitter; parameter and permission failures get none.
    pub fn for_kind(kind: FailureKind) -> Self {
        match kind {
            FailureKind::RateLimited => Self {
                max_retries: 5,
                strategy: RetryStrategy::ExponentialJitter,
                initial_delay: 5.0,
                max_delay: 120.0,
                backoff_factor: 2.5,
                jitter_factor: 0.3,
                ..Self::default()
            },
            FailureKind::NetworkError => Self {
                max_retries: 3,
                strategy: RetryStrategy::ExponentialJitter,
                initial_delay: 1.0,
                max_delay: 30.0,
                backoff_factor: 2.0,
                jitter_factor: 0.2,
                ..Self::default()
            },
            FailureKind::Timeout => Self {
                max_retries: 2,
                strategy: RetryStrategy::Exponential,
                initial_delay: 2.0,
                max_delay: 10.0,
                backoff_factor: 1.5,
                jitter_factor: 0.0,
                ..Self::default()
            },
            FailureKind::ExecutionError => Self {
                max_retries: 2,
                strategy: RetryStrategy::ExponentialJitter,
                initial_delay: 0.5,
                max_delay: 5.0,
                backoff_factor: 2.0,
                jitter_factor: 0.1,
                ..Self::default()
            },
            FailureKind::ResourceNotFound => Self {
                max_retries: 1,
                strategy: RetryStrategy::Immediate,
                initial_delay: 0.0,
                ..Self::default()
            },
            FailureKind::PermissionDenied
            | FailureKind::InvalidParams
            | FailureKind::Rejected => Self::no_retry(),
            _ => Self::default(),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            strategy: RetryStrategy::None,
            ..Self::default()
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            strategy: RetryStrategy::ExponentialJitter,
            initial_delay: 0.5,
            max_delay: 60.0,
            backoff_factor: 2.0,
            jitter_factor: 0.3,
            ..Self::default()
        }
    }
}

/// Outcome of a retried execution.
#[derive(Debug)]
pub struct RetryResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub error: Option<String>,
    pub failure_signal: Option<FailureSignal>,
    pub attempts: u32,
    pub total_delay: f64,
}

/// Wraps async operations under a retry policy.
pub struct RetryExecutor {
    policy: RetryPolicy,
    tool_name: Option<String>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            tool_name: None,
        }
    }

    pub fn for_tool(policy: RetryPolicy, tool_name: &str) -> Self {
        Self {
            policy,
            tool_name: Some(tool_name.to_string()),
        }
    }

    /// Repeatedly attempt `op` until it succeeds, the policy refuses a
    /// retry, or retries are exhausted.
    pub async fn execute<T, F, Fut>(&self, op: F) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        let mut total_delay = 0.0f64;
        let tool = self.tool_name.as_deref().unwrap_or("unknown");

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    tracing::debug!("execution succeeded on attempt {} for {}", attempt, tool);
                    return RetryResult {
                        success: true,
                        value: Some(value),
                        error: None,
                        failure_signal: None,
                        attempts: attempt,
                        total_delay,
                    };
                }
                Err(e) => {
                    let error = e.to_string();
                    let failure =
                        FailureSignal::from_tool_result(tool, false, Some(&error), "", None);

                    if !self.policy.should_retry(&failure, attempt) {
                        tracing::warn!(
                            "not retrying after attempt {} for {} ({}): {}",
                            attempt,
                            tool,
                            failure.kind.as_str(),
                            error
                        );
                        return RetryResult {
                            success: false,
                            value: None,
                            error: Some(error),
                            failure_signal: Some(failure),
                            attempts: attempt,
                            total_delay,
                        };
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    total_delay += delay;
                    tracing::info!(
                        "retry {}/{} after {:.2}s for {}: {}",
                        attempt,
                        self.policy.max_retries,
                        delay,
                        tool,
                        error
                    );
                    if delay > 0.0 {
                        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                    }
                }
            }
        }
    }

    /// Try the primary operation, then the fallback, merging attempt
    /// counts and delay totals.
    pub async fn execute_with_fallback<T, F, Fut, G, Gut>(
        &self,
        primary: F,
        fallback: G,
    ) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: Fn() -> Gut,
        Gut: Future<Output = anyhow::Result<T>>,
    {
        let result = self.execute(primary).await;
        if result.success {
            return result;
        }

        tracing::info!(
            "primary operation failed, trying fallback{}",
            self.tool_name
                .as_deref()
                .map(|t| format!(" for {}", t))
                .unwrap_or_default()
        );

        let mut fallback_result = self.execute(fallback).await;
        fallback_result.attempts += result.attempts;
        fallback_result.total_delay += result.total_delay;
        fallback_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(policy: RetryPolicy) -> RetryPolicy {
        // Keep unit tests quick: zero out wall-clock delays.
        RetryPolicy {
            initial_delay: 0.0,
            max_delay: 0.0,
            jitter_factor: 0.0,
            ..policy
        }
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Exponential,
            initial_delay: 1.0,
            max_delay: 4.0,
            backoff_factor: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), 1.0);
        assert_eq!(policy.delay_for_attempt(2), 2.0);
        assert_eq!(policy.delay_for_attempt(3), 4.0);
        assert_eq!(policy.delay_for_attempt(5), 4.0);
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::ExponentialJitter,
            initial_delay: 1.0,
            max_delay: 60.0,
            backoff_factor: 2.0,
            jitter_factor: 0.5,
            ..Default::default()
        };
        for _ in 0..32 {
            let d = policy.delay_for_attempt(2);
            assert!((2.0..=3.0).contains(&d));
        }
    }

    #[test]
    fn test_presets_for_non_retryable_kinds() {
        assert_eq!(
            RetryPolicy::for_kind(FailureKind::PermissionDenied).max_retries,
            0
        );
        assert_eq!(
            RetryPolicy::for_kind(FailureKind::InvalidParams).strategy,
            RetryStrategy::None
        );
        assert_eq!(RetryPolicy::for_kind(FailureKind::RateLimited).max_retries, 5);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let executor = RetryExecutor::for_tool(fast(RetryPolicy::default()), "flaky");

        let result = executor
            .execute(|| {
                let calls = seen.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("connection refused")
                    }
                    Ok(42)
                }
            })
            .await;

        assert!(result.success);
        assert_eq!(result.value, Some(42));
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let executor = RetryExecutor::for_tool(fast(RetryPolicy::default()), "strict");

        let result = executor
            .execute(|| {
                let calls = seen.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, anyhow::Error>(anyhow::anyhow!("invalid parameter: limit"))
                }
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.failure_signal.unwrap().kind,
            FailureKind::InvalidParams
        );
    }

    #[tokio::test]
    async fn test_fallback_merges_attempts() {
        let executor = RetryExecutor::new(fast(RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        }));

        let result = executor
            .execute_with_fallback(
                || async { anyhow::bail!("connection refused") },
                || async { Ok("fallback value") },
            )
            .await;

        assert!(result.success);
        assert_eq!(result.value, Some("fallback value"));
        // 2 primary attempts (1 retry) + 1 fallback attempt.
        assert_eq!(result.attempts, 3);
    }
}
