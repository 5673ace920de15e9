//! Scraper cycle engine (§4.F): manual-trigger intake, adapter-level cycle
//! lifecycle, per-target batch dispatch, and emergency stop.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use ingest_config::ScrapeConfig;
use ingest_notify::{adapter_auto_disabled_payload, send_notification, NotificationChannel};
use ingest_queue::JobQueue;
use ingest_retry::RetryPolicy;
use ingest_store::CatalogStore;
use ingest_types::{
    AdapterDisabledReason, CycleStatus, EntityId, IngestError, LastTargetStatus, RunTrigger,
    ScrapeCycle, ScrapeTarget, Source,
};

use crate::eligibility::{
    check_adapter_cycle_trigger, check_manual_trigger_caps, target_eligible, AdapterCycleRefusal,
    ManualTriggerOutcome,
};
use crate::worker::TargetJobPayload;

pub const TARGET_QUEUE: &str = "scrape-target";

pub struct ScrapeCycleEngine {
    pub store: Arc<dyn CatalogStore>,
    pub queue: Arc<dyn JobQueue>,
    pub notify_channel: Option<NotificationChannel>,
    pub config: ScrapeConfig,
}

pub enum ManualScrapeResult {
    Accepted,
    Backpressure { retry_after_ms: u64 },
}

impl ScrapeCycleEngine {
    pub async fn trigger_manual_scrape(&self, target_id: EntityId) -> Result<ManualScrapeResult> {
        let Some(mut target) = self.store.get_target(target_id).await.context("failed to load target")? else {
            return Err(IngestError::InvariantViolation("unknown target".to_string()).into());
        };

        let pending_manual = self
            .store
            .count_targets_by_last_status(target.adapter_id, LastTargetStatus::PendingManual)
            .await
            .context("failed to count pending-manual targets")?;
        let enqueued = self
            .store
            .count_targets_by_last_status(target.adapter_id, LastTargetStatus::Enqueued)
            .await
            .context("failed to count enqueued targets")?;
        let global_pending =
            self.store.count_global_pending().await.context("failed to count global pending targets")?;

        match check_manual_trigger_caps(pending_manual, enqueued, global_pending) {
            ManualTriggerOutcome::Backpressure { retry_after_ms } => {
                Ok(ManualScrapeResult::Backpressure { retry_after_ms })
            }
            ManualTriggerOutcome::Accepted => {
                target.last_status = Some(LastTargetStatus::PendingManual);
                self.store.upsert_target(target).await.context("failed to mark target pending-manual")?;
                Ok(ManualScrapeResult::Accepted)
            }
        }
    }

    /// Adapter-level "Run Now" trigger. Returns the new cycle id on
    /// acceptance.
    pub async fn trigger_adapter_cycle(&self, adapter_id: EntityId) -> Result<Result<EntityId, AdapterCycleRefusal>> {
        let Some(adapter) = self.store.get_adapter(adapter_id).await.context("failed to load adapter")? else {
            return Err(IngestError::InvariantViolation("unknown adapter".to_string()).into());
        };

        let targets = self
            .store
            .list_targets_for_adapter(adapter_id)
            .await
            .context("failed to list targets for adapter")?;
        let eligible_count = self.count_eligible(&targets).await?;

        if let Err(refusal) = check_adapter_cycle_trigger(&adapter, eligible_count) {
            return Ok(Err(refusal));
        }

        let cycle = ScrapeCycle {
            id: EntityId::new_v4(),
            adapter_id,
            trigger: RunTrigger::Manual,
            status: CycleStatus::Running,
            counters: ingest_types::CycleCounters { total_targets: eligible_count as u64, ..Default::default() },
            last_processed_target_id: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.create_cycle(cycle.clone()).await.context("failed to create cycle")?;

        let mut updated = adapter.clone();
        updated.current_cycle_id = Some(cycle.id);
        updated.last_cycle_started_at = Some(cycle.started_at);
        self.store
            .cas_update_adapter(&updated, adapter.updated_at)
            .await
            .context("failed to claim adapter for cycle")?;

        Ok(Ok(cycle.id))
    }

    async fn count_eligible(&self, targets: &[ScrapeTarget]) -> Result<usize> {
        let mut sources: HashMap<EntityId, Source> = HashMap::new();
        let mut count = 0;
        for target in targets {
            if !sources.contains_key(&target.source_id) {
                match self.store.get_source(target.source_id).await.context("failed to load source")? {
                    Some(s) => {
                        sources.insert(target.source_id, s);
                    }
                    None => continue,
                }
            }
            let source = sources.get(&target.source_id).expect("just inserted");

            let Some(adapter) = self.store.get_adapter(target.adapter_id).await.context("failed to load adapter")?
            else {
                continue;
            };
            if target_eligible(target, source, &adapter) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Selects the next batch of eligible targets, ordered by `(status
    /// ASC, priority DESC, createdAt DESC)`, resuming after
    /// `lastProcessedTargetId`, and enqueues a fetch job for each.
    pub async fn dispatch_next_batch(&self, cycle_id: EntityId, batch_size: usize) -> Result<usize> {
        let cycle = self
            .store
            .get_cycle(cycle_id)
            .await
            .context("failed to load cycle")?
            .ok_or_else(|| IngestError::InvariantViolation("unknown cycle".to_string()))?;

        let mut targets = self
            .store
            .list_targets_for_adapter(cycle.adapter_id)
            .await
            .context("failed to list targets for adapter")?;

        targets.sort_by(|a, b| {
            last_status_rank(a.last_status)
                .cmp(&last_status_rank(b.last_status))
                .then(b.priority.cmp(&a.priority))
                .then(b.created_at.cmp(&a.created_at))
        });

        let start = match cycle.last_processed_target_id {
            Some(last_id) => targets.iter().position(|t| t.id == last_id).map(|i| i + 1).unwrap_or(0),
            None => 0,
        };

        let mut dispatched = 0;
        for target in targets.into_iter().skip(start).take(batch_size) {
            let payload = serde_json::to_value(TargetJobPayload { target_id: target.id, cycle_id })?;
            self.queue
                .enqueue(
                    TARGET_QUEUE,
                    &format!("{cycle_id}:{}", target.id),
                    payload,
                    RetryPolicy::Default.to_config(),
                    None,
                )
                .await
                .context("failed to enqueue target fetch job")?;

            let mut enqueued_target = target;
            enqueued_target.last_status = Some(LastTargetStatus::Enqueued);
            self.store.upsert_target(enqueued_target).await.context("failed to mark target enqueued")?;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Finalizes a cycle once its counters fill or `cycleTimeoutMinutes`
    /// elapses: computes duration, clears `currentCycleId`, and rolls
    /// `consecutiveFailedBatches` (auto-disabling the adapter at threshold).
    pub async fn finalize_cycle(&self, cycle_id: EntityId) -> Result<()> {
        let mut cycle = self
            .store
            .get_cycle(cycle_id)
            .await
            .context("failed to load cycle")?
            .ok_or_else(|| IngestError::InvariantViolation("unknown cycle".to_string()))?;
        let Some(adapter) = self.store.get_adapter(cycle.adapter_id).await.context("failed to load adapter")?
        else {
            return Err(IngestError::InvariantViolation("cycle references unknown adapter".to_string()).into());
        };

        let failure_rate = if cycle.counters.total_targets > 0 {
            cycle.counters.targets_failed as f64 / cycle.counters.total_targets as f64
        } else {
            0.0
        };
        let failed = failure_rate > adapter.baselines.failure_rate.max(0.0) + FAILURE_RATE_TOLERANCE;

        cycle.status = if failed { CycleStatus::Failed } else { CycleStatus::Succeeded };
        cycle.finished_at = Some(Utc::now());
        self.store.update_cycle(&cycle).await.context("failed to persist finalized cycle")?;

        let mut updated = adapter.clone();
        updated.current_cycle_id = None;
        updated.consecutive_failed_batches =
            if failed { adapter.consecutive_failed_batches + 1 } else { 0 };
        let auto_disable = updated.consecutive_failed_batches >= self.config.max_consecutive_failed_batches;
        if auto_disable {
            updated.enabled = false;
            updated.disabled_at = Some(Utc::now());
            updated.disabled_reason = Some(AdapterDisabledReason::AutoDisabled);
        }
        self.store
            .cas_update_adapter(&updated, adapter.updated_at)
            .await
            .context("failed to persist adapter after cycle finalization")?;

        if auto_disable {
            if let Some(channel) = &self.notify_channel {
                let payload = adapter_auto_disabled_payload(&adapter.id.to_string());
                let _ = send_notification(channel, &payload).await;
            }
        }

        Ok(())
    }

    /// Requires the literal confirmation token `EMERGENCY_STOP`. Disables
    /// the global scheduler flag, fails every RUNNING run/cycle, and
    /// purges the scraper target queue.
    pub async fn emergency_stop(&self, confirmation_token: &str) -> Result<EmergencyStopOutcome> {
        if confirmation_token != "EMERGENCY_STOP" {
            return Err(IngestError::processing_validation_failure("confirmation token mismatch").into());
        }

        self.store
            .set_scheduler_enabled(false, "emergency_stop")
            .await
            .context("failed to disable scheduler")?;

        let mut runs_aborted = 0;
        for mut run in self.store.list_running_runs().await.context("failed to list running runs")? {
            run.status = ingest_types::RunStatus::Failed;
            run.finished_at = Some(Utc::now());
            run.failure_message = Some("emergency stop".to_string());
            self.store.update_run(&run).await.context("failed to fail running run")?;
            runs_aborted += 1;
        }

        let mut cycles_aborted = 0;
        for mut cycle in self.store.list_running_cycles().await.context("failed to list running cycles")? {
            cycle.status = CycleStatus::Failed;
            cycle.finished_at = Some(Utc::now());
            self.store.update_cycle(&cycle).await.context("failed to fail running cycle")?;
            cycles_aborted += 1;
        }

        let queues_cleared = self.queue.purge_queue(TARGET_QUEUE).await.context("failed to purge target queue")?;

        Ok(EmergencyStopOutcome { runs_aborted, cycles_aborted, queues_cleared })
    }
}

const FAILURE_RATE_TOLERANCE: f64 = 0.05;

/// Dispatch ordering (§4.F "status ASC"): manual triggers and never-run
/// targets are picked up ahead of targets already cycled through.
fn last_status_rank(status: Option<LastTargetStatus>) -> u8 {
    match status {
        Some(LastTargetStatus::PendingManual) => 0,
        None => 1,
        Some(LastTargetStatus::Enqueued) => 2,
        Some(LastTargetStatus::Failed) => 3,
        Some(LastTargetStatus::Success) => 4,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EmergencyStopOutcome {
    pub runs_aborted: u64,
    pub cycles_aborted: u64,
    pub queues_cleared: u64,
}
