//! Retry decisions for execution attempts and for the correction loop.
//!
//! Whether an attempt is retried depends only on its `FailureKind`:
//! runtime faults and resource exhaustion are retried with exponential
//! backoff, everything else is returned as soon as it is seen.

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::core_types::{ExecutionRequest, ExecutionResult, FailureKind};
use crate::executors::Executor;

/// Upper bound on the wait between two attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries for requests that do not name their own budget.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
        }
    }

    /// `min(2^attempt, 60)` seconds, with `attempt` counted from zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let seconds = 2u64
            .checked_pow(attempt)
            .unwrap_or(u64::MAX)
            .min(MAX_BACKOFF.as_secs());
        Duration::from_secs(seconds)
    }

    /// The request's own budget, or the configured one when it has none.
    pub fn retries_for(&self, request: &ExecutionRequest) -> u32 {
        request.max_retries().unwrap_or(self.max_retries)
    }
}

/// Bounds the regenerate-and-revalidate loop. Counted separately from
/// execution retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionPolicy {
    pub max_attempts: u32,
}

impl Default for CorrectionPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl CorrectionPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_correction_attempts,
        }
    }

    /// Whether another correction may follow `attempts_so_far` corrections.
    pub fn allows(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}

/// Runs a request against one executor until it succeeds, fails in a way
/// that retrying cannot fix, or runs out of attempts. Always produces
/// exactly one result.
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run(
        &self,
        executor: &dyn Executor,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let request_id = request.request_id();
        let max_retries = self.policy.retries_for(request);
        let mut history: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            let attempts = attempt + 1;
            log::info!(
                "request_id={} attempt {}/{} on {} tier",
                request_id,
                attempts,
                max_retries.saturating_add(1),
                executor.tier()
            );

            let (kind, summary, last_result) = match executor.run(request, cancel).await {
                Ok(mut result) if result.is_success() => {
                    if attempt > 0 {
                        log::info!("request_id={} succeeded after {} attempts", request_id, attempts);
                    }
                    result.attempts = attempts;
                    return result;
                }
                Ok(mut result) => {
                    let kind = result.failure_kind().unwrap_or(FailureKind::RuntimeFault);
                    if !kind.is_retryable() {
                        log::warn!(
                            "request_id={} failed with {}, not retrying: {}",
                            request_id,
                            kind,
                            result.error_detail.as_deref().unwrap_or("")
                        );
                        result.attempts = attempts;
                        return result;
                    }
                    let summary = result
                        .error_detail
                        .clone()
                        .unwrap_or_else(|| format!("exit code {}", result.exit_code));
                    history.push(format!("attempt {}: {}: {}", attempts, kind, summary));
                    (kind, summary, Some(result))
                }
                Err(e) => {
                    let kind = e.kind();
                    history.push(format!("attempt {}: {}: {}", attempts, kind, e));
                    if !kind.is_retryable() {
                        log::error!("request_id={} execution error, not retrying: {}", request_id, e);
                        let mut result =
                            ExecutionResult::failure(request_id, kind, -1, history.join("; "));
                        result.attempts = attempts;
                        return result;
                    }
                    (kind, e.to_string(), None)
                }
            };

            if attempt >= max_retries {
                log::error!(
                    "request_id={} giving up after {} attempts",
                    request_id,
                    attempts
                );
                let detail = format!("failed after {} attempts: {}", attempts, history.join("; "));
                let mut result = match last_result {
                    Some(mut result) => {
                        result.error_detail = Some(detail);
                        result
                    }
                    None => ExecutionResult::failure(request_id, kind, -1, detail),
                };
                result.attempts = attempts;
                return result;
            }

            let delay = self.policy.backoff(attempt);
            log::warn!(
                "request_id={} attempt {} failed with {} ({}), retrying in {}s",
                request_id,
                attempts,
                kind,
                summary,
                delay.as_secs()
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("request_id={} cancelled while waiting to retry", request_id);
                    let detail = format!(
                        "cancelled after {} attempts: {}",
                        attempts,
                        history.join("; ")
                    );
                    let mut result =
                        ExecutionResult::failure(request_id, FailureKind::Fatal, -1, detail);
                    result.attempts = attempts;
                    return result;
                }
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
