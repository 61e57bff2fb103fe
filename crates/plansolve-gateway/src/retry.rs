//! Backoff policy for recoverable session-run failures.
//!
//! Grounded in `myagent/ws/retry_config.py`: exponential backoff with
//! jitter, capped at a maximum delay, with a classifier distinguishing
//! errors worth retrying from ones that never are. Python matches on
//! exception type; without an exception hierarchy this classifies on the
//! plan/solve [`plansolve_core::Error`] variant instead — transport and
//! transient-origin failures (`IoError`, `PlanningFailed`, `SolverFailed`,
//! `AggregatorFailed`, `Internal`) are retried, malformed-input failures
//! (`InvalidMessage`, `DuplicateTaskId`, `CoercionFailed`, `EmptyTaskList`)
//! never are.

use std::time::Duration;

use plansolve_core::Error;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl RetryConfig {
    pub const fn new(
        max_attempts: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            backoff_multiplier,
            jitter_factor,
        }
    }
}

pub const FAST_RETRY_CONFIG: RetryConfig = RetryConfig::new(2, 100, 1_000, 2.0, 0.2);
pub const STANDARD_RETRY_CONFIG: RetryConfig = RetryConfig::new(3, 500, 8_000, 2.0, 0.25);
pub const SLOW_RETRY_CONFIG: RetryConfig = RetryConfig::new(5, 2_000, 60_000, 2.0, 0.3);

/// Delay before attempt `attempt` (1-indexed: `attempt == 1` is the first
/// retry after an initial failed try), exponential with multiplicative
/// jitter, clamped to `[initial_delay_ms, max_delay_ms]`.
pub fn calculate_retry_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let raw = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = raw.min(config.max_delay_ms as f64);

    let jitter_span = capped * config.jitter_factor;
    let jitter = if jitter_span > 0.0 {
        rand::thread_rng().gen_range(-jitter_span..=jitter_span)
    } else {
        0.0
    };

    let delay_ms = (capped + jitter).max(config.initial_delay_ms as f64) as u64;
    Duration::from_millis(delay_ms.min(config.max_delay_ms))
}

/// Whether this error is worth retrying at all.
pub fn should_retry(error: &Error) -> bool {
    matches!(
        error,
        Error::IoError(_) | Error::PlanningFailed(_) | Error::SolverFailed(_) | Error::AggregatorFailed(_) | Error::Internal(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt_and_respects_cap() {
        let config = RetryConfig::new(5, 100, 1_000, 2.0, 0.0);
        assert_eq!(calculate_retry_delay(1, &config).as_millis(), 100);
        assert_eq!(calculate_retry_delay(2, &config).as_millis(), 200);
        assert_eq!(calculate_retry_delay(3, &config).as_millis(), 400);
        // Keeps doubling until the cap.
        assert_eq!(calculate_retry_delay(10, &config).as_millis(), 1000);
    }

    #[test]
    fn should_retry_distinguishes_transient_from_permanent_errors() {
        assert!(should_retry(&Error::PlanningFailed("timeout".into())));
        assert!(!should_retry(&Error::InvalidMessage("bad json".into())));
        assert!(!should_retry(&Error::DuplicateTaskId("task:1".into())));
    }
}
