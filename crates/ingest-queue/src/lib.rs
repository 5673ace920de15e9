//! Queue Abstraction (§4.C): named durable job queues with per-queue
//! concurrency limits and per-job retry policy.
//!
//! Job claiming follows the `FOR UPDATE SKIP LOCKED` / staleness-reclaim
//! idiom used for scrape jobs in the wider ecosystem: a job is eligible
//! when `run_at <= now` and it is either unlocked or its lock has expired.
//! Repeatable jobs are a distinguished row per `(queue, repeat_key)` whose
//! `cron_expr` is atomically replaced on re-registration rather than
//! accumulating duplicate schedules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ingest_retry::{calculate_delay, RetryStrategyConfig};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;

/// Lock expiry: a claimed job not completed/retried/exhausted within this
/// window is treated as abandoned (crashed worker) and reclaimable.
pub const LOCK_EXPIRY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: Value,
    pub attempt: u32,
    pub retry: RetryStrategyConfig,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        let unlocked_or_stale = match self.locked_at {
            None => true,
            Some(locked_at) => now - locked_at > chrono::Duration::from_std(LOCK_EXPIRY).unwrap(),
        };
        unlocked_or_stale && self.run_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct RepeatableSpec {
    pub queue: String,
    pub repeat_key: String,
    pub cron_expr: String,
    pub payload: Value,
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job. Re-enqueuing an existing `job_id` is a no-op that
    /// returns the existing job unchanged (idempotent enqueue).
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: Value,
        retry: RetryStrategyConfig,
        delay: Option<Duration>,
    ) -> Result<Job>;

    /// Claims and locks the next eligible job in `queue`, if any.
    async fn lock_next(&self, queue: &str) -> Result<Option<Job>>;

    /// Merges `fields` into a job's payload without losing at-least-once
    /// semantics (e.g. attaching a `runId` after creation).
    async fn patch_payload(&self, job_id: &str, fields: serde_json::Map<String, Value>) -> Result<()>;

    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Re-queues a job for retry with an exponential-backoff delay derived
    /// from its retry policy and current attempt.
    async fn retry(&self, job_id: &str) -> Result<()>;

    /// Permanently removes a job whose attempts are exhausted.
    async fn exhaust(&self, job_id: &str) -> Result<()>;

    /// Registers (or atomically replaces) a repeatable job's cron pattern.
    async fn ensure_repeatable(&self, spec: RepeatableSpec) -> Result<()>;

    /// Removes every pending job in `queue`; used by emergency stop (§4.F)
    /// to purge scraper-related queue keys. Returns the count removed.
    async fn purge_queue(&self, queue: &str) -> Result<u64>;
}

// ---------------------------------------------------------------------
// Postgres-backed implementation
// ---------------------------------------------------------------------

pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                payload JSONB NOT NULL,
                attempt INT NOT NULL DEFAULT 0,
                retry JSONB NOT NULL,
                run_at TIMESTAMPTZ NOT NULL,
                locked_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE TABLE IF NOT EXISTS queue_repeatables (
                queue TEXT NOT NULL,
                repeat_key TEXT NOT NULL,
                cron_expr TEXT NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (queue, repeat_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create queue tables")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: Value,
        retry: RetryStrategyConfig,
        delay: Option<Duration>,
    ) -> Result<Job> {
        let now = Utc::now();
        let run_at = now + delay.map(|d| chrono::Duration::from_std(d).unwrap_or_default()).unwrap_or_default();
        let retry_json = serde_json::to_value(&retry)?;

        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue, payload, attempt, retry, run_at, created_at, updated_at)
            VALUES ($1, $2, $3, 0, $4, $5, $6, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(queue)
        .bind(&payload)
        .bind(&retry_json)
        .bind(run_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to enqueue job")?;

        Ok(Job {
            id: job_id.to_string(),
            queue: queue.to_string(),
            payload,
            attempt: 0,
            retry,
            run_at,
            locked_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn lock_next(&self, queue: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let lock_expiry_secs = LOCK_EXPIRY.as_secs() as f64;

        let row: Option<(String, Value, i32, Value, DateTime<Utc>, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            UPDATE queue_jobs SET locked_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE queue = $1
                  AND run_at <= NOW()
                  AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $2::double precision))
                ORDER BY run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempt, retry, run_at, created_at, updated_at
            "#,
        )
        .bind(queue)
        .bind(lock_expiry_secs)
        .fetch_optional(&self.pool)
        .await
        .context("failed to lock next job")?;

        let Some((id, payload, attempt, retry_json, run_at, created_at, updated_at)) = row else {
            return Ok(None);
        };
        let retry: RetryStrategyConfig = serde_json::from_value(retry_json)?;

        Ok(Some(Job {
            id,
            queue: queue.to_string(),
            payload,
            attempt: attempt as u32,
            retry,
            run_at,
            locked_at: Some(now),
            created_at,
            updated_at,
        }))
    }

    async fn patch_payload(&self, job_id: &str, fields: serde_json::Map<String, Value>) -> Result<()> {
        sqlx::query(
            r#"UPDATE queue_jobs SET payload = payload || $2, updated_at = NOW() WHERE id = $1"#,
        )
        .bind(job_id)
        .bind(Value::Object(fields))
        .execute(&self.pool)
        .await
        .context("failed to patch job payload")?;
        Ok(())
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("failed to complete job")?;
        Ok(())
    }

    async fn retry(&self, job_id: &str) -> Result<()> {
        let row: Option<(i32, Value)> =
            sqlx::query_as("SELECT attempt, retry FROM queue_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to load job for retry")?;
        let Some((attempt, retry_json)) = row else {
            return Ok(());
        };
        let retry: RetryStrategyConfig = serde_json::from_value(retry_json)?;
        let next_attempt = attempt as u32 + 1;
        let delay = calculate_delay(&retry, next_attempt);
        let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        sqlx::query(
            r#"UPDATE queue_jobs SET attempt = $2, locked_at = NULL, run_at = $3, updated_at = NOW() WHERE id = $1"#,
        )
        .bind(job_id)
        .bind(next_attempt as i32)
        .bind(run_at)
        .execute(&self.pool)
        .await
        .context("failed to requeue job for retry")?;
        Ok(())
    }

    async fn exhaust(&self, job_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .context("failed to exhaust job")?;
        Ok(())
    }

    async fn ensure_repeatable(&self, spec: RepeatableSpec) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_repeatables (queue, repeat_key, cron_expr, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (queue, repeat_key) DO UPDATE
                SET cron_expr = EXCLUDED.cron_expr, payload = EXCLUDED.payload
            "#,
        )
        .bind(&spec.queue)
        .bind(&spec.repeat_key)
        .bind(&spec.cron_expr)
        .bind(&spec.payload)
        .execute(&self.pool)
        .await
        .context("failed to upsert repeatable job")?;
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM queue_jobs WHERE queue = $1"#)
            .bind(queue)
            .execute(&self.pool)
            .await
            .context("failed to purge queue")?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------
// In-memory fake, used by this crate's own unit tests and by other
// crates' integration tests (no live Postgres available to the test
// harness).
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    repeatables: Arc<Mutex<HashMap<(String, String), RepeatableSpec>>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: Value,
        retry: RetryStrategyConfig,
        delay: Option<Duration>,
    ) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.get(job_id) {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let run_at = now + delay.map(|d| chrono::Duration::from_std(d).unwrap_or_default()).unwrap_or_default();
        let job = Job {
            id: job_id.to_string(),
            queue: queue.to_string(),
            payload,
            attempt: 0,
            retry,
            run_at,
            locked_at: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(job_id.to_string(), job.clone());
        Ok(job)
    }

    async fn lock_next(&self, queue: &str) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let now = Utc::now();
        let candidate = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_eligible(now))
            .min_by_key(|j| j.run_at)
            .map(|j| j.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).unwrap();
        job.locked_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn patch_payload(&self, job_id: &str, fields: serde_json::Map<String, Value>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            if let Value::Object(ref mut map) = job.payload {
                map.extend(fields);
            }
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        self.jobs.lock().await.remove(job_id);
        Ok(())
    }

    async fn retry(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.attempt += 1;
            let delay = calculate_delay(&job.retry, job.attempt);
            job.run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            job.locked_at = None;
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn exhaust(&self, job_id: &str) -> Result<()> {
        self.jobs.lock().await.remove(job_id);
        Ok(())
    }

    async fn ensure_repeatable(&self, spec: RepeatableSpec) -> Result<()> {
        self.repeatables
            .lock()
            .await
            .insert((spec.queue.clone(), spec.repeat_key.clone()), spec);
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.queue != queue);
        Ok((before - jobs.len()) as u64)
    }
}
