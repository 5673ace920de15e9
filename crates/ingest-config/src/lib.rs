//! Layered configuration for the ingestion platform, loaded from an
//! `.ingest.toml` file in the deployment root with environment-variable
//! overrides for secrets (`DATABASE_URL`, `REDIS_URL`) that should never
//! live in a checked-in file.
//!
//! Mirrors the nested-section-with-serde-defaults shape used elsewhere in
//! this lineage for project configuration: every section derives
//! `Default`, every field has a `#[serde(default = "...")]`, so a config
//! file may specify only the sections it wants to override.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ingest_notify::NotificationChannel;
use ingest_retry::{PerErrorConfig, RetryPolicy, RetryStrategyConfig, RetryStrategyType};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "postgres://localhost/ingest".to_string()
}

fn default_pool_size() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_database_url(), max_connections: default_pool_size() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: default_redis_url() }
    }
}

/// §4.G: cron-driven tick loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
    #[serde(default)]
    pub adapter_level_scheduling_enabled: bool,
    #[serde(default)]
    pub bypass_circuit_breaker: bool,
    #[serde(default = "default_snapshot_cron")]
    pub snapshot_cron: String,
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_snapshot_cron() -> String {
    ingest_types::DEFAULT_SNAPSHOT_CRON.to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            adapter_level_scheduling_enabled: false,
            bypass_circuit_breaker: false,
            snapshot_cron: default_snapshot_cron(),
        }
    }
}

/// §4.A: per-domain defaults; individual domains may be overridden at
/// runtime via `ingest_ratelimit::RateLimiter::set_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub default_requests_per_second: f64,
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: u32,
    #[serde(default)]
    pub default_min_delay_ms: u64,
}

fn default_requests_per_second() -> f64 {
    1.0
}

fn default_max_concurrent() -> u32 {
    4
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_requests_per_second: default_requests_per_second(),
            default_max_concurrent: default_max_concurrent(),
            default_min_delay_ms: 0,
        }
    }
}

/// §4.B: default lease for advisory locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(with = "humantime_serde", default = "default_lease")]
    pub default_lease: Duration,
}

fn default_lease() -> Duration {
    Duration::from_secs(60)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { default_lease: default_lease() }
    }
}

/// §4.C/§7: retry policy shared by the affiliate feed worker and scraper
/// cycle engine job consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySectionConfig {
    #[serde(default)]
    pub policy: RetryPolicy,
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    #[serde(default)]
    pub strategy: RetryStrategyType,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default)]
    pub per_error: PerErrorConfig,
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

impl Default for RetrySectionConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::Default,
            max_attempts: 5,
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            strategy: RetryStrategyType::Exponential,
            jitter: default_jitter(),
            per_error: PerErrorConfig::default(),
        }
    }
}

impl RetrySectionConfig {
    /// Effective config: explicit fields when `policy = custom`, otherwise
    /// the preset's config.
    pub fn to_effective_config(&self) -> RetryStrategyConfig {
        if self.policy == RetryPolicy::Custom {
            RetryStrategyConfig {
                strategy: self.strategy,
                max_attempts: self.max_attempts,
                base_delay: self.base_delay,
                max_delay: self.max_delay,
                jitter: self.jitter,
            }
        } else {
            self.policy.to_config()
        }
    }
}

/// §4.E circuit breaker thresholds and data-quality threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_breaker_min_active")]
    pub breaker_min_active_count: u64,
    #[serde(default = "default_expire_ratio_threshold")]
    pub expire_ratio_threshold: f64,
    #[serde(default = "default_fallback_ratio_threshold")]
    pub url_hash_fallback_ratio_threshold: f64,
    #[serde(default = "default_fallback_min_upserted")]
    pub url_hash_fallback_min_upserted: u64,
    #[serde(default = "default_data_quality_threshold_pct")]
    pub data_quality_missing_brand_threshold_pct: f64,
    #[serde(default = "default_data_quality_min_upserted")]
    pub data_quality_min_upserted: u64,
    #[serde(default = "default_max_parse_errors")]
    pub max_persisted_parse_errors: u64,
}

fn default_breaker_min_active() -> u64 {
    50
}
fn default_expire_ratio_threshold() -> f64 {
    0.30
}
fn default_fallback_ratio_threshold() -> f64 {
    0.20
}
fn default_fallback_min_upserted() -> u64 {
    20
}
fn default_data_quality_threshold_pct() -> f64 {
    10.0
}
fn default_data_quality_min_upserted() -> u64 {
    50
}
fn default_max_parse_errors() -> u64 {
    100
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            breaker_min_active_count: default_breaker_min_active(),
            expire_ratio_threshold: default_expire_ratio_threshold(),
            url_hash_fallback_ratio_threshold: default_fallback_ratio_threshold(),
            url_hash_fallback_min_upserted: default_fallback_min_upserted(),
            data_quality_missing_brand_threshold_pct: default_data_quality_threshold_pct(),
            data_quality_min_upserted: default_data_quality_min_upserted(),
            max_persisted_parse_errors: default_max_parse_errors(),
        }
    }
}

/// §4.F scraper cycle defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default = "default_cycle_timeout_minutes")]
    pub cycle_timeout_minutes: u32,
    #[serde(default = "default_max_consecutive_failed_batches")]
    pub max_consecutive_failed_batches: u32,
    #[serde(with = "humantime_serde", default = "default_manual_trigger_backoff_cap")]
    pub manual_trigger_backoff_cap: Duration,
    /// Targets dispatched per batch when the scheduler starts or resumes a cycle.
    #[serde(default = "default_target_batch_size")]
    pub target_batch_size: usize,
}

fn default_cycle_timeout_minutes() -> u32 {
    30
}
fn default_max_consecutive_failed_batches() -> u32 {
    ingest_types::MAX_CONSECUTIVE_FAILED_BATCHES
}
fn default_manual_trigger_backoff_cap() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_target_batch_size() -> usize {
    25
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            cycle_timeout_minutes: default_cycle_timeout_minutes(),
            max_consecutive_failed_batches: default_max_consecutive_failed_batches(),
            manual_trigger_backoff_cap: default_manual_trigger_backoff_cap(),
            target_batch_size: default_target_batch_size(),
        }
    }
}

/// §4.H snapshot computer defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_min_sample_count")]
    pub min_sample_count: u64,
    #[serde(default = "default_window_days")]
    pub window_days: Vec<u32>,
}

fn default_min_sample_count() -> u64 {
    ingest_types::MIN_SNAPSHOT_SAMPLE_COUNT
}
fn default_window_days() -> Vec<u32> {
    vec![7, 30, 90]
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { min_sample_count: default_min_sample_count(), window_days: default_window_days() }
    }
}

/// §4.I alert dispatcher cooldowns. Rule evaluation is external; these
/// gate only the scheduling glue's per-rule-type re-send interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(with = "humantime_serde", default = "default_price_drop_cooldown")]
    pub price_drop_cooldown: Duration,
    #[serde(with = "humantime_serde", default = "default_back_in_stock_cooldown")]
    pub back_in_stock_cooldown: Duration,
}

fn default_price_drop_cooldown() -> Duration {
    Duration::from_secs(24 * 3600)
}
fn default_back_in_stock_cooldown() -> Duration {
    Duration::from_secs(6 * 3600)
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { price_drop_cooldown: default_price_drop_cooldown(), back_in_stock_cooldown: default_back_in_stock_cooldown() }
    }
}

/// §10.3 logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_debug_sample_always_log_first")]
    pub debug_sample_always_log_first: u64,
    #[serde(default = "default_debug_sample_rate")]
    pub debug_sample_rate: f64,
}

fn default_debug_sample_always_log_first() -> u64 {
    20
}
fn default_debug_sample_rate() -> f64 {
    0.01
}

/// §4.I notification channels, keyed by name (e.g. "ops-slack").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub channels: std::collections::BTreeMap<String, NotificationChannel>,
}

/// Top-level configuration loaded from `.ingest.toml`.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub retry: RetrySectionConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub alert: AlertConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            scheduler: SchedulerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            lock: LockConfig::default(),
            retry: RetrySectionConfig::default(),
            feed: FeedConfig::default(),
            scrape: ScrapeConfig::default(),
            snapshot: SnapshotConfig::default(),
            logging: LoggingConfig::default(),
            notify: NotifyConfig::default(),
            alert: AlertConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Loads `.ingest.toml` from `root`, if present, and applies
    /// `DATABASE_URL`/`REDIS_URL` environment overrides on top. Returns the
    /// default configuration (still env-overridden) if no file exists.
    pub fn load_from_dir(root: &Path) -> Result<Self> {
        let path = root.join(".ingest.toml");
        let mut config = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.redis.url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            bail!("database.url must not be empty");
        }
        if self.scheduler.tick_interval.is_zero() {
            bail!("scheduler.tick_interval must be greater than 0");
        }
        if self.retry.jitter < 0.0 || self.retry.jitter > 1.0 {
            bail!("retry.jitter must be between 0.0 and 1.0");
        }
        if self.feed.expire_ratio_threshold <= 0.0 || self.feed.expire_ratio_threshold > 1.0 {
            bail!("feed.expire_ratio_threshold must be in (0.0, 1.0]");
        }
        if self.rate_limit.default_requests_per_second <= 0.0 {
            bail!("rate_limit.default_requests_per_second must be greater than 0");
        }
        if self.snapshot.min_sample_count == 0 {
            bail!("snapshot.min_sample_count must be greater than 0");
        }
        Ok(())
    }
}
