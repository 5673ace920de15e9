//! Advisory Lock Service (§4.B): cluster-wide mutual exclusion keyed by
//! `(resource, id)`. Acquisitions never block; exclusivity is a lease with
//! an expiry, so long-running workers MUST periodically [`LockHandle::renew`].
//!
//! Backed by a lease row in Postgres rather than `pg_advisory_lock`: a
//! session-scoped advisory lock has no natural "renew" operation, while a
//! lease row (claim, renew, release, expire) maps directly onto the
//! acquire/renew/release/auto-expire contract this component specifies —
//! the same staleness-aware claim pattern used for durable queue jobs
//! elsewhere in this codebase (see `ingest-queue`, grounded on the same
//! `FOR UPDATE SKIP LOCKED` / staleness re-claim idiom).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// A held lock. Releases best-effort on drop via a detached task, since
/// `Drop` cannot `.await`; callers that need a guaranteed release should
/// call [`AdvisoryLockService::release`] explicitly and treat the `Drop`
/// path as a backstop only.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub lock_id: String,
    pub holder_token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait AdvisoryLockService: Send + Sync {
    /// Never blocks: returns `None` immediately if the lock is held and
    /// not expired.
    async fn try_acquire(&self, lock_id: &str, lease: Duration) -> Result<Option<LockHandle>>;
    async fn renew(&self, handle: &LockHandle, lease: Duration) -> Result<bool>;
    async fn release(&self, handle: &LockHandle) -> Result<()>;
}

/// Scoped lock handle: releases on drop via a detached task (`Drop` cannot
/// `.await`), so the lock is freed even if the body between acquire and
/// drop panics — the same scoped-acquisition shape as the Drop-releasing
/// lock guard used elsewhere in this codebase, adapted for an async
/// backend.
pub struct LockGuard {
    handle: Option<LockHandle>,
    service: Arc<dyn AdvisoryLockService>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(err) = service.release(&handle).await {
                    tracing::warn!(lock_id = %handle.lock_id, error = %err, "failed to release lock on drop");
                }
            });
        }
    }
}

/// Run `body` under the lock, releasing on every exit path including panic.
pub async fn with_lock<T, F, Fut>(
    service: Arc<dyn AdvisoryLockService>,
    lock_id: &str,
    lease: Duration,
    body: F,
) -> Result<Option<T>>
where
    F: FnOnce(LockHandle) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let Some(handle) = service.try_acquire(lock_id, lease).await? else {
        return Ok(None);
    };

    let guard = LockGuard {
        handle: Some(handle.clone()),
        service,
    };
    let outcome = body(handle).await;
    drop(guard);
    outcome.map(Some)
}

// ---------------------------------------------------------------------
// Postgres-backed implementation
// ---------------------------------------------------------------------

pub struct PgLockService {
    pool: PgPool,
}

impl PgLockService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `advisory_locks` table if it does not already exist.
    /// Conceptual schema only (`ingest-store` owns the migration set in a
    /// real deployment); kept here so this crate is self-contained for
    /// its own integration tests.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS advisory_locks (
                lock_id TEXT PRIMARY KEY,
                holder_token TEXT NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create advisory_locks table")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdvisoryLockService for PgLockService {
    async fn try_acquire(&self, lock_id: &str, lease: Duration) -> Result<Option<LockHandle>> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let holder_token = uuid::Uuid::new_v4().to_string();

        let row = sqlx::query_as::<_, (String,)>(
            r#"
            INSERT INTO advisory_locks (lock_id, holder_token, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (lock_id) DO UPDATE
                SET holder_token = EXCLUDED.holder_token,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE advisory_locks.expires_at < $3
            RETURNING holder_token
            "#,
        )
        .bind(lock_id)
        .bind(&holder_token)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .context("failed to try-acquire advisory lock")?;

        match row {
            Some((token,)) if token == holder_token => Ok(Some(LockHandle {
                lock_id: lock_id.to_string(),
                holder_token,
                acquired_at: now,
                expires_at,
            })),
            _ => Ok(None),
        }
    }

    async fn renew(&self, handle: &LockHandle, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let new_expiry = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
        let result = sqlx::query(
            r#"UPDATE advisory_locks SET expires_at = $1 WHERE lock_id = $2 AND holder_token = $3"#,
        )
        .bind(new_expiry)
        .bind(&handle.lock_id)
        .bind(&handle.holder_token)
        .execute(&self.pool)
        .await
        .context("failed to renew advisory lock")?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        sqlx::query(r#"DELETE FROM advisory_locks WHERE lock_id = $1 AND holder_token = $2"#)
            .bind(&handle.lock_id)
            .bind(&handle.holder_token)
            .execute(&self.pool)
            .await
            .context("failed to release advisory lock")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// In-memory fake, used by this crate's own tests and by ingest-core's
// integration tests (no live Postgres available to the test harness).
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryLockService {
    leases: Arc<Mutex<HashMap<String, LockHandle>>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AdvisoryLockService for InMemoryLockService {
    async fn try_acquire(&self, lock_id: &str, lease: Duration) -> Result<Option<LockHandle>> {
        let mut leases = self.leases.lock().await;
        let now = Utc::now();

        if let Some(existing) = leases.get(lock_id) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }

        let handle = LockHandle {
            lock_id: lock_id.to_string(),
            holder_token: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60)),
        };
        leases.insert(lock_id.to_string(), handle.clone());
        Ok(Some(handle))
    }

    async fn renew(&self, handle: &LockHandle, lease: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&handle.lock_id) {
            Some(existing) if existing.holder_token == handle.holder_token => {
                existing.expires_at = Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(60));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get(&handle.lock_id) {
            if existing.holder_token == handle.holder_token {
                leases.remove(&handle.lock_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let service = InMemoryLockService::new();
        let first = service.try_acquire("feed-1", DEFAULT_LEASE).await.unwrap();
        assert!(first.is_some());

        let second = service.try_acquire("feed-1", DEFAULT_LEASE).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn release_then_acquire_succeeds() {
        let service = InMemoryLockService::new();
        let handle = service.try_acquire("feed-1", DEFAULT_LEASE).await.unwrap().unwrap();
        service.release(&handle).await.unwrap();

        let reacquired = service.try_acquire("feed-1", DEFAULT_LEASE).await.unwrap();
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let service = InMemoryLockService::new();
        let _first = service
            .try_acquire("feed-1", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = service.try_acquire("feed-1", DEFAULT_LEASE).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn renew_extends_expiry_for_the_same_holder() {
        let service = InMemoryLockService::new();
        let handle = service.try_acquire("feed-1", Duration::from_secs(1)).await.unwrap().unwrap();
        let renewed = service.renew(&handle, Duration::from_secs(60)).await.unwrap();
        assert!(renewed);
    }

    #[tokio::test]
    async fn with_lock_releases_on_success() {
        let service: Arc<dyn AdvisoryLockService> = Arc::new(InMemoryLockService::new());
        let result = with_lock(service.clone(), "feed-1", DEFAULT_LEASE, |_handle| async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(result, Some(42));

        // Give the detached release task a chance to run, then confirm the
        // lock is free again.
        tokio::task::yield_now().await;
        let reacquired = service.try_acquire("feed-1", DEFAULT_LEASE).await.unwrap();
        assert!(reacquired.is_some());
    }

    #[tokio::test]
    async fn with_lock_returns_none_when_already_held() {
        let service: Arc<dyn AdvisoryLockService> = Arc::new(InMemoryLockService::new());
        let _held = service.try_acquire("feed-1", DEFAULT_LEASE).await.unwrap().unwrap();

        let result: Option<i32> = with_lock(service.clone(), "feed-1", DEFAULT_LEASE, |_handle| async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(result, None);
    }
}
