//! Per-target fetch worker (§4.F): rate-limit, fetch, then fold the
//! outcome back into the owning cycle's counters and `lastProcessedTargetId`.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use ingest_queue::{Job, JobQueue};
use ingest_ratelimit::RateLimiter;
use ingest_store::CatalogStore;
use ingest_types::{EntityId, ErrorClass, IngestError, LastTargetStatus};
use serde::{Deserialize, Serialize};

use crate::fetch::TargetFetcher;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetJobPayload {
    pub target_id: EntityId,
    pub cycle_id: EntityId,
}

pub enum JobOutcome {
    Completed,
    Retried,
    Exhausted,
}

pub struct TargetWorker {
    pub store: Arc<dyn CatalogStore>,
    pub queue: Arc<dyn JobQueue>,
    pub limiter: Arc<dyn RateLimiter>,
    pub fetcher: Arc<dyn TargetFetcher>,
}

/// A target that fails this many consecutive fetches in a row flips to
/// `status=BROKEN` and drops out of future eligibility until an operator
/// re-enables it.
const MAX_CONSECUTIVE_TARGET_FAILURES: u32 = 5;

impl TargetWorker {
    pub async fn handle_job(&self, job: &Job) -> Result<JobOutcome> {
        match self.execute(job).await {
            Ok(()) => {
                self.queue.complete(&job.id).await?;
                Ok(JobOutcome::Completed)
            }
            Err(err) => {
                let class = err
                    .downcast_ref::<IngestError>()
                    .map(IngestError::classify)
                    .unwrap_or(ErrorClass::Ambiguous);
                match class {
                    ErrorClass::Retryable if job.attempt + 1 < job.retry.max_attempts => {
                        self.queue.retry(&job.id).await?;
                        Ok(JobOutcome::Retried)
                    }
                    _ => {
                        self.queue.exhaust(&job.id).await?;
                        Ok(JobOutcome::Exhausted)
                    }
                }
            }
        }
    }

    async fn execute(&self, job: &Job) -> Result<()> {
        let payload: TargetJobPayload =
            serde_json::from_value(job.payload.clone()).context("malformed target job payload")?;

        let Some(mut target) = self.store.get_target(payload.target_id).await.context("failed to load target")?
        else {
            tracing::warn!(target_id = %payload.target_id, "target job references unknown target; discarding");
            return Ok(());
        };

        self.limiter.acquire(&target.url).await.context("rate limiter acquire failed")?;

        let fetch_result = self.fetcher.fetch(&target).await;
        let mut cycle = self
            .store
            .get_cycle(payload.cycle_id)
            .await
            .context("failed to load cycle")?
            .ok_or_else(|| IngestError::InvariantViolation("cycle vanished mid-dispatch".to_string()))?;

        match &fetch_result {
            Ok(result) => {
                target.last_status = Some(LastTargetStatus::Success);
                target.last_scraped_at = Some(Utc::now());
                target.consecutive_failures = 0;
                cycle.counters.targets_completed += 1;
                cycle.counters.offers_extracted += result.offers_extracted;
                cycle.counters.offers_valid += result.offers_valid;
            }
            Err(err) => {
                let _ = self.limiter.release(&ingest_ratelimit::domain_key(&target.url)).await;
                target.last_status = Some(LastTargetStatus::Failed);
                target.consecutive_failures += 1;
                if target.consecutive_failures >= MAX_CONSECUTIVE_TARGET_FAILURES {
                    target.status = ingest_types::TargetStatus::Broken;
                }
                cycle.counters.targets_failed += 1;
                tracing::debug!(target_id = %target.id, %err, "target fetch failed");
            }
        }

        cycle.last_processed_target_id = Some(target.id);
        self.store.upsert_target(target).await.context("failed to persist target")?;
        self.store.update_cycle(&cycle).await.context("failed to persist cycle counters")?;

        fetch_result.map(|_| ()).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ingest_store::InMemoryCatalogStore;
    use ingest_types::{CycleStatus, RunTrigger, ScrapeCycle, ScrapeTarget, TargetStatus};

    struct AlwaysFails;
    #[async_trait]
    impl TargetFetcher for AlwaysFails {
        async fn fetch(&self, _target: &ScrapeTarget) -> Result<crate::fetch::FetchResult, IngestError> {
            Err(IngestError::TransientNetwork("boom".into()))
        }
    }

    fn sample_target(id: EntityId, adapter_id: EntityId) -> ScrapeTarget {
        ScrapeTarget {
            id,
            url: "https://example.com/p".into(),
            canonical_url: "https://example.com/p".into(),
            source_id: EntityId::new_v4(),
            adapter_id,
            priority: 50,
            schedule_cron: None,
            enabled: true,
            status: TargetStatus::Active,
            last_status: None,
            last_scraped_at: None,
            consecutive_failures: MAX_CONSECUTIVE_TARGET_FAILURES - 1,
            robots_path_blocked: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn repeated_failure_flips_target_to_broken() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let target_id = EntityId::new_v4();
        let adapter_id = EntityId::new_v4();
        store.seed_target(sample_target(target_id, adapter_id)).await;

        let cycle_id = EntityId::new_v4();
        let cycle = ScrapeCycle {
            id: cycle_id,
            adapter_id,
            trigger: RunTrigger::Scheduled,
            status: CycleStatus::Running,
            counters: Default::default(),
            last_processed_target_id: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        store.create_cycle(cycle).await.unwrap();

        let worker = TargetWorker {
            store: store.clone(),
            queue: Arc::new(ingest_queue::InMemoryJobQueue::new()),
            limiter: Arc::new(ingest_ratelimit::InMemoryRateLimiter::new(Default::default())),
            fetcher: Arc::new(AlwaysFails),
        };

        let job = Job {
            id: "job-1".into(),
            queue: "scrape-target".into(),
            payload: serde_json::to_value(TargetJobPayload { target_id, cycle_id }).unwrap(),
            attempt: 0,
            retry: ingest_retry::RetryPolicy::Default.to_config(),
            run_at: Utc::now(),
            locked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let _ = worker.execute(&job).await;

        let target = store.get_target(target_id).await.unwrap().unwrap();
        assert_eq!(target.status, TargetStatus::Broken);

        let cycle = store.get_cycle(cycle_id).await.unwrap().unwrap();
        assert_eq!(cycle.counters.targets_failed, 1);
        assert_eq!(cycle.last_processed_target_id, Some(target_id));
    }
}
