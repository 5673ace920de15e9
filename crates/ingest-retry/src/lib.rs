//! Retry strategies and backoff policies for the ingestion pipelines.
//!
//! Generalizes the shape used elsewhere in this lineage for publish-step
//! retries: configurable backoff strategies, jitter, per-error-class
//! overrides, and predefined policies — re-parameterized here over
//! [`ingest_types::ErrorClass`] instead of a publish-specific taxonomy.

use std::time::Duration;

use ingest_types::ErrorClass;
use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately.
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt.
    Linear,
    /// Constant delay: same delay every attempt.
    Constant,
}

/// Predefined retry policies. `Default` matches §5's "base 5s, factor 2,
/// jitter, max 5 attempts" retry policy exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    Default,
    Aggressive,
    Conservative,
    Custom,
}

impl RetryPolicy {
    pub fn to_config(self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 5,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(160),
                jitter: 0.5,
            },
            RetryPolicy::Aggressive => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 10,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.3,
            },
            RetryPolicy::Conservative => RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 3,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(120),
                jitter: 0.1,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(160)
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 5,
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

/// Per-error-class retry configuration overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerErrorConfig {
    #[serde(default, rename = "retryable")]
    pub retryable: Option<RetryStrategyConfig>,
    #[serde(default, rename = "ambiguous")]
    pub ambiguous: Option<RetryStrategyConfig>,
    #[serde(default, rename = "permanent")]
    pub permanent: Option<RetryStrategyConfig>,
}

/// Calculate the delay before the next retry attempt (1-indexed attempt).
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Apply jitter to a delay. Jitter factor of 0.5 means delay * (0.5..1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::thread_rng();
    let random_value: f64 = rng.r#gen();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Resolve the effective retry config for an error class, falling back to
/// `default_config` when no per-class override is present.
pub fn config_for_error(
    default_config: &RetryStrategyConfig,
    per_error: Option<&PerErrorConfig>,
    class: ErrorClass,
) -> RetryStrategyConfig {
    if let Some(per_error) = per_error {
        let overridden = match class {
            ErrorClass::Retryable => &per_error.retryable,
            ErrorClass::Ambiguous => &per_error.ambiguous,
            ErrorClass::Permanent => &per_error.permanent,
        };
        if let Some(cfg) = overridden {
            return cfg.clone();
        }
    }
    default_config.clone()
}

/// An async retry executor. Every suspension point (the sleep between
/// attempts) yields back to the surrounding tokio runtime, per §5's
/// scheduling model.
pub struct RetryExecutor {
    config: RetryStrategyConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self { config }
    }

    pub fn from_policy(policy: RetryPolicy) -> Self {
        Self::new(policy.to_config())
    }

    /// Only retries when the classifier reports `Retryable`; `Ambiguous` and
    /// `Permanent` both stop the loop and surface the error immediately.
    pub async fn run<T, E, F, Fut>(&self, classify: impl Fn(&E) -> ErrorClass, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= self.config.max_attempts || classify(&e) != ErrorClass::Retryable {
                        return Err(e);
                    }
                    let delay = calculate_delay(&self.config, attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
