//! Rate Limiter (§4.A): sliding-window, per-eTLD+1 request permits
//! coordinated across worker processes via a shared key-value store.
//!
//! The sliding-window algorithm is a read-modify-write on a sorted set
//! keyed by `ratelimit:<domain>` (§9 design note); the Redis
//! implementation here executes that read-modify-write as a single
//! `EVAL` script so the decision is atomic regardless of how many worker
//! processes race on the same domain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_canon::{registrable_domain, registrable_domain_for_url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// State-key TTL: prevents stale accumulation for domains that stop being
/// scraped.
pub const STATE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DomainConfig {
    pub requests_per_second: f64,
    pub max_concurrent: u32,
    pub min_delay_ms: u64,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            max_concurrent: 4,
            min_delay_ms: 0,
        }
    }
}

impl DomainConfig {
    /// Window length in milliseconds derived as `1000/requestsPerSecond`.
    pub fn window_ms(&self) -> u64 {
        if self.requests_per_second <= 0.0 {
            1000
        } else {
            (1000.0 / self.requests_per_second).round() as u64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DomainState {
    pub active_count: u64,
    pub oldest_entry_at: Option<DateTime<Utc>>,
}

/// Derive the rate-limit key (eTLD+1) from either a full URL or a bare
/// hostname.
pub fn domain_key(url_or_domain: &str) -> String {
    registrable_domain_for_url(url_or_domain).unwrap_or_else(|| registrable_domain(url_or_domain))
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Blocks (cooperatively, via async sleep) until a token is granted.
    /// Cancellation-safe: callers that need to respect a shutdown signal
    /// should race this future against that signal with `tokio::select!`.
    async fn acquire(&self, url_or_domain: &str) -> Result<()>;

    /// Optional: removes one recent entry so a failed/aborted request
    /// doesn't count against the window.
    async fn release(&self, domain: &str) -> Result<()>;

    async fn set_config(&self, domain: &str, cfg: DomainConfig) -> Result<()>;

    async fn get_state(&self, domain: &str) -> Result<DomainState>;
}

// ---------------------------------------------------------------------
// Redis-backed implementation
// ---------------------------------------------------------------------

pub struct RedisRateLimiter {
    client: redis::Client,
    default_config: DomainConfig,
    overrides: Mutex<HashMap<String, DomainConfig>>,
}

impl RedisRateLimiter {
    pub fn new(client: redis::Client, default_config: DomainConfig) -> Self {
        Self {
            client,
            default_config,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    async fn config_for(&self, domain: &str) -> DomainConfig {
        self.overrides
            .lock()
            .await
            .get(domain)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// Atomic compare-and-update: trims the window, counts current
    /// entries, and either admits (ZADD) or rejects, all inside one Lua
    /// script so concurrent worker processes see a consistent count.
    const ACQUIRE_SCRIPT: &'static str = r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local window_ms = tonumber(ARGV[2])
        local max_concurrent = tonumber(ARGV[3])
        local ttl_secs = tonumber(ARGV[4])

        redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)
        local count = redis.call('ZCARD', key)
        if count >= max_concurrent then
            return 0
        end
        redis.call('ZADD', key, now, now .. '-' .. math.random())
        redis.call('EXPIRE', key, ttl_secs)
        return 1
    "#;

    async fn try_admit(&self, domain: &str, cfg: &DomainConfig) -> Result<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = Utc::now().timestamp_millis();
        let admitted: i64 = redis::Script::new(Self::ACQUIRE_SCRIPT)
            .key(format!("ratelimit:{domain}"))
            .arg(now)
            .arg(cfg.window_ms())
            .arg(cfg.max_concurrent)
            .arg(STATE_TTL.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn acquire(&self, url_or_domain: &str) -> Result<()> {
        let domain = domain_key(url_or_domain);
        let cfg = self.config_for(&domain).await;

        loop {
            if self.try_admit(&domain, &cfg).await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(cfg.min_delay_ms.max(10))).await;
        }
    }

    async fn release(&self, domain: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("ZPOPMAX")
            .arg(format!("ratelimit:{domain}"))
            .query_async(&mut conn)
            .await
            .unwrap_or(());
        Ok(())
    }

    async fn set_config(&self, domain: &str, cfg: DomainConfig) -> Result<()> {
        self.overrides.lock().await.insert(domain.to_string(), cfg);
        Ok(())
    }

    async fn get_state(&self, domain: &str) -> Result<DomainState> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = redis::cmd("ZCARD")
            .arg(format!("ratelimit:{domain}"))
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        Ok(DomainState {
            active_count: count,
            oldest_entry_at: None,
        })
    }
}

// ---------------------------------------------------------------------
// In-memory fake, used by this crate's own unit tests (no live Redis
// available to the test harness).
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryRateLimiter {
    windows: Arc<Mutex<HashMap<String, Vec<DateTime<Utc>>>>>,
    overrides: Arc<Mutex<HashMap<String, DomainConfig>>>,
    default_config: DomainConfig,
}

impl InMemoryRateLimiter {
    pub fn new(default_config: DomainConfig) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            overrides: Arc::new(Mutex::new(HashMap::new())),
            default_config,
        }
    }

    async fn config_for(&self, domain: &str) -> DomainConfig {
        self.overrides
            .lock()
            .await
            .get(domain)
            .copied()
            .unwrap_or(self.default_config)
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn acquire(&self, url_or_domain: &str) -> Result<()> {
        let domain = domain_key(url_or_domain);
        let cfg = self.config_for(&domain).await;
        let window = chrono::Duration::milliseconds(cfg.window_ms() as i64);

        loop {
            let now = Utc::now();
            let mut windows = self.windows.lock().await;
            let entries = windows.entry(domain.clone()).or_default();
            entries.retain(|t| now - *t < window);

            if (entries.len() as u32) < cfg.max_concurrent {
                entries.push(now);
                return Ok(());
            }
            drop(windows);
            tokio::time::sleep(Duration::from_millis(cfg.min_delay_ms.max(5))).await;
        }
    }

    async fn release(&self, domain: &str) -> Result<()> {
        let mut windows = self.windows.lock().await;
        if let Some(entries) = windows.get_mut(domain) {
            entries.pop();
        }
        Ok(())
    }

    async fn set_config(&self, domain: &str, cfg: DomainConfig) -> Result<()> {
        self.overrides.lock().await.insert(domain.to_string(), cfg);
        Ok(())
    }

    async fn get_state(&self, domain: &str) -> Result<DomainState> {
        let windows = self.windows.lock().await;
        let entries = windows.get(domain).cloned().unwrap_or_default();
        Ok(DomainState {
            active_count: entries.len() as u64,
            oldest_entry_at: entries.iter().min().copied(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_key_prefers_url_etld1() {
        assert_eq!(domain_key("https://shop.example.co.uk/p"), "example.co.uk");
    }

    #[test]
    fn domain_key_accepts_bare_hostname() {
        assert_eq!(domain_key("shop.example.com"), "example.com");
    }

    #[tokio::test]
    async fn acquire_respects_max_concurrent_within_window() {
        let limiter = InMemoryRateLimiter::new(DomainConfig {
            requests_per_second: 1000.0,
            max_concurrent: 2,
            min_delay_ms: 1,
        });

        limiter.acquire("example.com").await.unwrap();
        limiter.acquire("example.com").await.unwrap();

        let state = limiter.get_state("example.com").await.unwrap();
        assert_eq!(state.active_count, 2);
    }

    #[tokio::test]
    async fn per_domain_override_is_respected() {
        let limiter = InMemoryRateLimiter::new(DomainConfig::default());
        limiter
            .set_config(
                "example.com",
                DomainConfig {
                    requests_per_second: 50.0,
                    max_concurrent: 1,
                    min_delay_ms: 1,
                },
            )
            .await
            .unwrap();

        limiter.acquire("example.com").await.unwrap();
        let state = limiter.get_state("example.com").await.unwrap();
        assert_eq!(state.active_count, 1);
    }

    #[tokio::test]
    async fn release_frees_one_slot() {
        let limiter = InMemoryRateLimiter::new(DomainConfig {
            requests_per_second: 1000.0,
            max_concurrent: 1,
            min_delay_ms: 1,
        });
        limiter.acquire("example.com").await.unwrap();
        limiter.release("example.com").await.unwrap();
        let state = limiter.get_state("example.com").await.unwrap();
        assert_eq!(state.active_count, 0);
    }

    #[test]
    fn window_ms_derivation() {
        let cfg = DomainConfig {
            requests_per_second: 4.0,
            max_concurrent: 1,
            min_delay_ms: 0,
        };
        assert_eq!(cfg.window_ms(), 250);
    }
}
