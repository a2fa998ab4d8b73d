use std::time::Duration;

use swarmflow_core::error::SwarmError;
use swarmflow_core::types::RetryPolicy;

/// Exponential backoff for a zero-based attempt, with 0.8x to 1.2x jitter.
pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let ms = policy.base_backoff(attempt).as_millis() as f64;
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms * jitter) as u64)
}

/// Whether another attempt is allowed after `attempt` failed with `error`.
pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &SwarmError) -> bool {
    attempt < policy.max_retries && error.is_retryable()
}

/// Errors that make a step a no-op with a denied outcome rather than a
/// failure.
pub fn is_denial(error: &SwarmError) -> bool {
    matches!(
        error,
        SwarmError::PermissionDenied { .. } | SwarmError::ApprovalTimeout { .. }
    )
}
