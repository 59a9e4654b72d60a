//! Retry/backoff policy for the orchestration core.
//!
//! This crate is a pure function from `(strategy, initial, max, attempt)` to
//! a delay, plus an adaptive multiplier keyed on a [`RetryStrategy`]
//! classification and a small async executor for wiring the two together.
//!
//! # Example
//!
//! ```
//! use docbuilder_retry::{BackoffConfig, BackoffStrategy, delay_for_attempt};
//! use std::time::Duration;
//!
//! let config = BackoffConfig {
//!     strategy: BackoffStrategy::Exponential,
//!     initial: Duration::from_secs(1),
//!     max: Duration::from_secs(60),
//!     jitter: 0.0,
//!     max_attempts: 6,
//! };
//!
//! assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(1));
//! assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(2));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff shape. Matches the three strategies the orchestration core is
/// specified against: `fixed`, `linear`, `exponential`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every attempt.
    Fixed,
    /// `attempt * initial`.
    Linear,
    /// `initial * 2^(attempt-1)` (default).
    #[default]
    Exponential,
}

/// Configuration for a single backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_initial")]
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(default = "default_max")]
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Jitter factor in `[0.0, 1.0]`. `0.0` disables jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial() -> Duration {
    Duration::from_secs(2)
}

fn default_max() -> Duration {
    Duration::from_secs(120)
}

fn default_jitter() -> f64 {
    0.0
}

fn default_max_attempts() -> u32 {
    6
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial: default_initial(),
            max: default_max(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// The classification a [`ClassifiedError`]-like type carries, driving the
/// adaptive multiplier applied on top of the pure backoff delay.
///
/// This mirrors `docbuilder_types::RetryStrategy` by name but is kept
/// independent so this crate has no dependency on the domain types crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Never retry; the caller must not attempt the operation again.
    Never,
    /// Retry with no delay.
    Immediate,
    /// Retry using the configured backoff delay, unmultiplied.
    Backoff,
    /// Retry using the configured backoff delay, multiplied by a larger
    /// factor because the failure indicates the remote is rate-limiting us.
    RateLimit,
    /// Requires a human to act first; never retried automatically.
    UserAction,
}

/// Adaptive multiplier applied on top of [`delay_for_attempt`], keyed on the
/// classified retry strategy: `rate_limit` backs off three times harder than
/// a plain `backoff`.
pub fn adaptive_factor(strategy: RetryStrategy) -> f64 {
    match strategy {
        RetryStrategy::RateLimit => 3.0,
        _ => 1.0,
    }
}

/// True if a classified retry strategy permits retrying at all.
pub fn is_retryable(strategy: RetryStrategy) -> bool {
    !matches!(strategy, RetryStrategy::Never | RetryStrategy::UserAction)
}

/// Pure function: delay to wait before the given attempt (1-indexed),
/// per `(strategy, initial, max)`. Capped at `config.max`, then jittered.
pub fn delay_for_attempt(config: &BackoffConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        BackoffStrategy::Fixed => config.initial,
        BackoffStrategy::Linear => config.initial.saturating_mul(attempt),
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.initial.saturating_mul(2_u32.saturating_pow(pow))
        }
    };

    let capped = delay.min(config.max);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Delay for the given attempt, with the adaptive multiplier for `strategy`
/// applied, still capped at `config.max`.
pub fn adaptive_delay_for_attempt(
    config: &BackoffConfig,
    attempt: u32,
    strategy: RetryStrategy,
) -> Duration {
    let base = delay_for_attempt(config, attempt);
    let factor = adaptive_factor(strategy);
    let scaled = Duration::from_secs_f64(base.as_secs_f64() * factor);
    scaled.min(config.max.saturating_mul(4))
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Runs an async fallible operation, retrying per `config` while
/// `classify(&err)` reports a retryable [`RetryStrategy`]. `classify` lets
/// the caller map its own error type without this crate depending on it.
pub async fn with_retry<T, E, F, Fut, C>(
    config: &BackoffConfig,
    mut classify: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: FnMut(&E) -> RetryStrategy,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let strategy = classify(&err);
                if !is_retryable(strategy) || attempt >= config.max_attempts {
                    return Err(err);
                }
                let delay = adaptive_delay_for_attempt(config, attempt, strategy);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strategy_returns_initial_every_time() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Fixed,
            initial: Duration::from_secs(2),
            max: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&config, 5), Duration::from_secs(2));
    }

    #[test]
    fn linear_strategy_scales_with_attempt() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Linear,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&config, 3), Duration::from_secs(3));
        assert_eq!(delay_for_attempt(&config, 15), Duration::from_secs(10));
    }

    #[test]
    fn exponential_strategy_doubles_and_caps() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Exponential,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&config, 3), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(&config, 10), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Fixed,
            initial: Duration::from_secs(10),
            max: Duration::from_secs(60),
            jitter: 0.5,
            max_attempts: 10,
        };
        for _ in 0..100 {
            let delay = delay_for_attempt(&config, 1);
            assert!(delay >= Duration::from_millis(5000));
            assert!(delay <= Duration::from_millis(15000));
        }
    }

    #[test]
    fn rate_limit_multiplies_by_three() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Fixed,
            initial: Duration::from_millis(10),
            max: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
        };
        let backoff = adaptive_delay_for_attempt(&config, 1, RetryStrategy::Backoff);
        let rate_limited = adaptive_delay_for_attempt(&config, 1, RetryStrategy::RateLimit);
        assert_eq!(backoff, Duration::from_millis(10));
        assert_eq!(rate_limited, Duration::from_millis(30));
    }

    #[test]
    fn never_and_user_action_are_not_retryable() {
        assert!(!is_retryable(RetryStrategy::Never));
        assert!(!is_retryable(RetryStrategy::UserAction));
        assert!(is_retryable(RetryStrategy::Backoff));
        assert!(is_retryable(RetryStrategy::Immediate));
        assert!(is_retryable(RetryStrategy::RateLimit));
    }

    #[tokio::test]
    async fn with_retry_stops_at_max_attempts_for_backoff() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Fixed,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
            max_attempts: 3,
        };
        let mut calls = 0;
        let result: Result<(), &str> = with_retry(
            &config,
            |_err: &&str| RetryStrategy::Backoff,
            |_attempt| {
                calls += 1;
                async { Err("still failing") }
            },
        )
        .await;
        assert_eq!(result, Err("still failing"));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn with_retry_short_circuits_on_never() {
        let config = BackoffConfig::default();
        let mut calls = 0;
        let result: Result<(), &str> = with_retry(
            &config,
            |_err: &&str| RetryStrategy::Never,
            |_attempt| {
                calls += 1;
                async { Err("permanent") }
            },
        )
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn with_retry_succeeds_after_transient_failures() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Fixed,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
            max_attempts: 5,
        };
        let mut calls = 0;
        let result = with_retry(
            &config,
            |_err: &&str| RetryStrategy::Backoff,
            |attempt| {
                calls += 1;
                async move {
                    if attempt < 3 {
                        Err("transient")
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls, 3);
    }

    proptest::proptest! {
        #[test]
        fn delay_never_exceeds_max(initial_ms in 1u64..5000, max_ms in 1u64..10000, attempt in 1u32..50) {
            let config = BackoffConfig {
                strategy: BackoffStrategy::Exponential,
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(max_ms),
                jitter: 0.0,
                max_attempts: 50,
            };
            let delay = delay_for_attempt(&config, attempt);
            proptest::prop_assert!(delay <= config.max);
        }
    }
}
