//! Single-instance scheduler (§4.G): a tight periodic loop gated by the
//! global scheduler-enabled flag and an advisory lock, so only one
//! instance runs ticks even when several are deployed for availability.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use ingest_config::SchedulerConfig;
use ingest_lock::{with_lock, AdvisoryLockService, DEFAULT_LEASE};
use ingest_queue::JobQueue;
use ingest_scrape::{AdapterCycleRefusal, ScrapeCycleEngine};
use ingest_feed::FeedJobPayload;
use ingest_store::CatalogStore;
use ingest_types::RunTrigger;

use crate::cron_util::next_occurrence;

/// Repeat key the snapshot tick registers; `ingest-snapshot`'s repeatable
/// worker is enqueued under this key at `config.snapshot_cron`.
pub const SNAPSHOT_QUEUE: &str = "caliber-snapshot";
pub const SNAPSHOT_REPEAT_KEY: &str = "compute-caliber-snapshots";

const SCHEDULER_LOCK: &str = "scheduler-tick";

pub struct Scheduler {
    pub store: Arc<dyn CatalogStore>,
    pub queue: Arc<dyn JobQueue>,
    pub lock: Arc<dyn AdvisoryLockService>,
    pub scrape_engine: Arc<ScrapeCycleEngine>,
    pub config: SchedulerConfig,
}

/// Summary of one tick's work, useful for tests and logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub affiliate_claimed: u32,
    pub adapter_cycles_started: u32,
    pub snapshot_registered: bool,
}

impl Scheduler {
    /// Runs the tick loop until the process is stopped. Each iteration is
    /// its own lock acquisition: a missed tick because another instance
    /// holds the lock is not an error, just a no-op.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            interval.tick().await;
            if let Err(err) = self.tick().await {
                tracing::error!(%err, "scheduler tick failed");
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport> {
        if !self.store.get_scheduler_enabled().await.context("failed to read scheduler-enabled flag")? {
            tracing::debug!("scheduler disabled; skipping tick");
            return Ok(TickReport::default());
        }

        let report = with_lock(self.lock.clone(), SCHEDULER_LOCK, DEFAULT_LEASE, |_handle| async {
            let affiliate_claimed = self.affiliate_tick().await?;
            let adapter_cycles_started = self.adapter_cycle_tick().await?;
            let snapshot_registered = self.snapshot_tick().await?;
            Ok(TickReport { affiliate_claimed, adapter_cycles_started, snapshot_registered })
        })
        .await
        .context("scheduler lock acquisition failed")?;

        Ok(report.unwrap_or_default())
    }

    /// §4.G.1: claim due feeds via CAS and enqueue a run job for each.
    async fn affiliate_tick(&self) -> Result<u32> {
        let now = Utc::now();
        let due = self.store.list_due_affiliate_feeds(now).await.context("failed to list due feeds")?;

        let mut claimed = 0;
        for feed in due {
            let trigger = if feed.manual_run_pending { RunTrigger::ManualPending } else { RunTrigger::Scheduled };
            let mut updated = feed.clone();
            updated.manual_run_pending = false;
            updated.next_run_at = Some(now + chrono::Duration::hours(feed.schedule_hours as i64));

            let claimed_feed = self
                .store
                .cas_update_affiliate_feed(&updated, feed.updated_at)
                .await
                .context("failed to CAS-claim feed")?;
            if !claimed_feed {
                // Lost the race to another scheduler instance or an admin edit; next tick retries.
                continue;
            }

            let payload = serde_json::to_value(FeedJobPayload { feed_id: feed.id, trigger, run_id: None })?;
            self.queue
                .enqueue(
                    ingest_feed::FEED_QUEUE,
                    &format!("{}:{}", feed.id, updated.next_run_at.map(|t| t.timestamp()).unwrap_or_default()),
                    payload,
                    ingest_retry::RetryPolicy::Default.to_config(),
                    None,
                )
                .await
                .context("failed to enqueue feed run")?;
            claimed += 1;
        }
        Ok(claimed)
    }

    /// §4.G.2: gated by the adapter-level scheduling feature flag. Creates
    /// a cycle for every due adapter and dispatches its first batch.
    async fn adapter_cycle_tick(&self) -> Result<u32> {
        if !self.config.adapter_level_scheduling_enabled {
            return Ok(0);
        }

        let now = Utc::now();
        let due = self.store.list_due_adapters(now).await.context("failed to list due adapters")?;

        let mut started = 0;
        for adapter in due {
            match self.scrape_engine.trigger_adapter_cycle(adapter.id).await? {
                Ok(cycle_id) => {
                    self.scrape_engine.dispatch_next_batch(cycle_id, self.batch_size()).await?;
                    started += 1;
                }
                Err(AdapterCycleRefusal::NoEligibleTargets) => {
                    tracing::debug!(adapter_id = %adapter.id, "adapter cron fired with no eligible targets");
                }
                Err(refusal) => {
                    tracing::warn!(adapter_id = %adapter.id, ?refusal, "adapter cycle trigger refused on scheduled tick");
                }
            }
        }
        Ok(started)
    }

    /// §4.G.3: ensures the caliber-snapshot repeatable job exists at the
    /// configured cron, atomically replacing a stale pattern.
    async fn snapshot_tick(&self) -> Result<bool> {
        self.queue
            .ensure_repeatable(ingest_queue::RepeatableSpec {
                queue: SNAPSHOT_QUEUE.to_string(),
                repeat_key: SNAPSHOT_REPEAT_KEY.to_string(),
                cron_expr: self.config.snapshot_cron.clone(),
                payload: serde_json::json!({}),
            })
            .await
            .context("failed to register snapshot repeatable")?;
        Ok(true)
    }

    fn batch_size(&self) -> usize {
        25
    }
}

/// Computes `nextRunAt` for a cron-scheduled entity, parking it (`None`)
/// on a parse failure rather than failing the tick.
pub fn compute_next_run(cron_expr: &str, after: chrono::DateTime<Utc>) -> Option<chrono::DateTime<Utc>> {
    match next_occurrence(cron_expr, after) {
        Some(next) => Some(next),
        None => {
            tracing::warn!(cron_expr, "failed to parse cron expression; parking entity");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_lock::InMemoryLockService;
    use ingest_queue::InMemoryJobQueue;
    use ingest_store::InMemoryCatalogStore;
    use ingest_types::{EntityId, FeedStatus};

    fn scheduler(store: Arc<InMemoryCatalogStore>) -> Scheduler {
        let queue = Arc::new(InMemoryJobQueue::new());
        Scheduler {
            store: store.clone(),
            queue: queue.clone(),
            lock: Arc::new(InMemoryLockService::new()),
            scrape_engine: Arc::new(ScrapeCycleEngine {
                store,
                queue,
                notify_channel: None,
                config: ingest_config::ScrapeConfig::default(),
            }),
            config: SchedulerConfig::default(),
        }
    }

    fn feed(id: EntityId, manual_pending: bool) -> ingest_types::AffiliateFeed {
        ingest_types::AffiliateFeed {
            id,
            source_id: EntityId::new_v4(),
            transport: ingest_types::FeedTransport::Https,
            format: ingest_types::FeedFormat::Csv,
            schedule_hours: 24,
            expiry_hours: 72,
            max_row_count: 100_000,
            last_run_memo: ingest_types::FeedMemo { mtime: None, size: None, content_hash: None },
            consecutive_failures: 0,
            manual_run_pending: manual_pending,
            status: FeedStatus::Active,
            next_run_at: Some(Utc::now() - chrono::Duration::minutes(1)),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn affiliate_tick_claims_due_feed_and_enqueues_scheduled_job() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let id = EntityId::new_v4();
        store.seed_feed(feed(id, false)).await;

        let sched = scheduler(store.clone());
        let claimed = sched.affiliate_tick().await.unwrap();
        assert_eq!(claimed, 1);

        let refreshed = store.get_affiliate_feed(id).await.unwrap().unwrap();
        assert!(!refreshed.manual_run_pending);
        assert!(refreshed.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn affiliate_tick_uses_manual_pending_trigger() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let id = EntityId::new_v4();
        store.seed_feed(feed(id, true)).await;

        let sched = scheduler(store.clone());
        let claimed = sched.affiliate_tick().await.unwrap();
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn disabled_scheduler_skips_tick() {
        let store = Arc::new(InMemoryCatalogStore::new());
        store.set_scheduler_enabled(false, "test").await.unwrap();
        let id = EntityId::new_v4();
        store.seed_feed(feed(id, false)).await;

        let sched = scheduler(store.clone());
        let report = sched.tick().await.unwrap();
        assert_eq!(report, TickReport::default());
    }

    #[test]
    fn compute_next_run_parks_on_bad_cron() {
        assert!(compute_next_run("garbage", Utc::now()).is_none());
    }
}
