//! Admin control surface (§6): target CRUD, manual/adapter-cycle triggers,
//! emergency stop, and the global scheduler flag. No HTTP form is
//! prescribed; this is the plain async API consumed directly by
//! `ingest-cli` and by embedders.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use ingest_scrape::cycle::{EmergencyStopOutcome, ManualScrapeResult, ScrapeCycleEngine};
use ingest_scrape::eligibility::AdapterCycleRefusal;
use ingest_store::CatalogStore;
use ingest_types::{
    AdapterDisabledReason, AffiliateFeed, CycleStatus, EntityId, IngestError, RunStatus,
    ScrapeAdapter, ScrapeTarget, TargetStatus,
};

pub struct AdminApi {
    pub store: Arc<dyn CatalogStore>,
    pub scraper: ScrapeCycleEngine,
}

#[derive(Debug, Clone)]
pub struct CreateTargetInput {
    pub url: String,
    pub source_id: EntityId,
    pub adapter_id: EntityId,
    pub priority: u8,
    pub schedule_cron: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkCreateError {
    pub row: usize,
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkCreateReport {
    pub created: u64,
    pub skipped: u64,
    pub errors: Vec<BulkCreateError>,
}

impl AdminApi {
    pub async fn list_targets(&self) -> Result<Vec<ScrapeTarget>> {
        self.store.list_all_targets().await.context("failed to list targets")
    }

    pub async fn get_target(&self, id: EntityId) -> Result<Option<ScrapeTarget>> {
        self.store.get_target(id).await.context("failed to load target")
    }

    pub async fn create_target(&self, input: CreateTargetInput) -> Result<ScrapeTarget> {
        let canonical_url = ingest_canon::canonicalize(&input.url)
            .ok_or_else(|| IngestError::processing_validation_failure("malformed target url"))?;
        if input.priority > 100 {
            return Err(IngestError::processing_validation_failure("priority out of [0,100] range").into());
        }

        let existing = self.store.list_all_targets().await.context("failed to list targets")?;
        if existing.iter().any(|t| t.source_id == input.source_id && t.canonical_url == canonical_url) {
            return Err(IngestError::processing_validation_failure("duplicate (sourceId, canonicalUrl)").into());
        }

        let target = ScrapeTarget {
            id: EntityId::new_v4(),
            url: input.url,
            canonical_url,
            source_id: input.source_id,
            adapter_id: input.adapter_id,
            priority: input.priority,
            schedule_cron: input.schedule_cron,
            enabled: true,
            status: TargetStatus::Active,
            last_status: None,
            last_scraped_at: None,
            consecutive_failures: 0,
            robots_path_blocked: false,
            created_at: Utc::now(),
        };
        self.store.upsert_target(target.clone()).await.context("failed to create target")?;
        Ok(target)
    }

    pub async fn update_target(&self, target: ScrapeTarget) -> Result<()> {
        self.store.upsert_target(target).await.context("failed to update target")
    }

    pub async fn delete_target(&self, id: EntityId) -> Result<bool> {
        self.store.delete_target(id).await.context("failed to delete target")
    }

    /// §6 CSV import shape: header row with `url, adapterId, priority`
    /// (case-insensitive), rows missing `url`/`adapterId` skipped silently,
    /// priority a base-10 integer in [0,100].
    pub async fn bulk_create_targets(&self, source_id: EntityId, csv: &str) -> Result<BulkCreateReport> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_reader(csv.as_bytes());
        let headers = match reader.headers() {
            Ok(h) => h.iter().map(|c| c.trim().to_lowercase()).collect::<Vec<_>>(),
            Err(_) => return Ok(BulkCreateReport::default()),
        };
        let url_col = headers.iter().position(|c| c == "url");
        let adapter_col = headers.iter().position(|c| c == "adapterid");
        let priority_col = headers.iter().position(|c| c == "priority");

        let existing = self.store.list_all_targets().await.context("failed to list targets")?;
        let mut seen_in_batch: Vec<(EntityId, String)> = Vec::new();
        let mut report = BulkCreateReport::default();

        for (row, record) in reader.records().enumerate() {
            let Ok(cells) = record else { continue };
            let url = url_col.and_then(|i| cells.get(i)).map(|s| s.trim()).unwrap_or("");
            let adapter_raw = adapter_col.and_then(|i| cells.get(i)).map(|s| s.trim()).unwrap_or("");
            if url.is_empty() || adapter_raw.is_empty() {
                continue;
            }

            let Ok(adapter_id) = adapter_raw.parse::<EntityId>() else {
                report.errors.push(BulkCreateError { row, url: url.to_string(), error: "invalid adapterId".into() });
                continue;
            };

            let priority = match priority_col.and_then(|i| cells.get(i)).map(|s| s.trim()) {
                None | Some("") => 50,
                Some(raw) => match raw.parse::<u16>() {
                    Ok(p) if p <= 100 => p as u8,
                    _ => {
                        report.errors.push(BulkCreateError {
                            row,
                            url: url.to_string(),
                            error: "priority out of [0,100] range".into(),
                        });
                        continue;
                    }
                },
            };

            let Some(canonical_url) = ingest_canon::canonicalize(url) else {
                report.errors.push(BulkCreateError { row, url: url.to_string(), error: "malformed url".into() });
                continue;
            };

            if seen_in_batch.contains(&(source_id, canonical_url.clone())) {
                continue;
            }
            if existing.iter().any(|t| t.source_id == source_id && t.canonical_url == canonical_url) {
                report.skipped += 1;
                continue;
            }

            let target = ScrapeTarget {
                id: EntityId::new_v4(),
                url: url.to_string(),
                canonical_url: canonical_url.clone(),
                source_id,
                adapter_id,
                priority,
                schedule_cron: None,
                enabled: true,
                status: TargetStatus::Active,
                last_status: None,
                last_scraped_at: None,
                consecutive_failures: 0,
                robots_path_blocked: false,
                created_at: Utc::now(),
            };
            self.store.upsert_target(target).await.context("failed to create target")?;
            seen_in_batch.push((source_id, canonical_url));
            report.created += 1;
        }

        Ok(report)
    }

    pub async fn list_feeds(&self) -> Result<Vec<AffiliateFeed>> {
        self.store.list_all_affiliate_feeds().await.context("failed to list feeds")
    }

    pub async fn get_feed(&self, id: EntityId) -> Result<Option<AffiliateFeed>> {
        self.store.get_affiliate_feed(id).await.context("failed to load feed")
    }

    /// Sets `manualRunPending` so the next scheduler tick's affiliate-feed
    /// CAS (§4.G.1) picks it up regardless of `nextRunAt`.
    pub async fn trigger_feed(&self, feed_id: EntityId) -> Result<()> {
        let Some(feed) = self.store.get_affiliate_feed(feed_id).await.context("failed to load feed")? else {
            return Err(IngestError::InvariantViolation("unknown feed".to_string()).into());
        };
        let expected = feed.updated_at;
        let mut updated = feed;
        updated.manual_run_pending = true;
        let ok = self.store.cas_update_affiliate_feed(&updated, expected).await.context("failed to trigger feed")?;
        if !ok {
            anyhow::bail!("feed was concurrently modified, retry");
        }
        Ok(())
    }

    pub async fn trigger_manual_scrape(&self, target_id: EntityId) -> Result<ManualScrapeResult> {
        self.scraper.trigger_manual_scrape(target_id).await
    }

    pub async fn trigger_adapter_cycle(&self, adapter_id: EntityId) -> Result<Result<EntityId, AdapterCycleRefusal>> {
        self.scraper.trigger_adapter_cycle(adapter_id).await
    }

    pub async fn cancel_scrape_run(&self, run_id: EntityId) -> Result<bool> {
        let Some(mut run) = self.store.get_run(run_id).await.context("failed to load run")? else {
            return Ok(false);
        };
        if run.status != RunStatus::Running {
            return Ok(false);
        }
        run.status = RunStatus::Failed;
        run.finished_at = Some(Utc::now());
        run.failure_message = Some("cancelled by operator".to_string());
        self.store.update_run(&run).await.context("failed to cancel run")?;
        tracing::info!(run_id = %run_id, "run cancelled by operator");
        Ok(true)
    }

    pub async fn cancel_adapter_cycle(&self, cycle_id: EntityId) -> Result<bool> {
        let Some(mut cycle) = self.store.get_cycle(cycle_id).await.context("failed to load cycle")? else {
            return Ok(false);
        };
        if cycle.status != CycleStatus::Running {
            return Ok(false);
        }
        cycle.status = CycleStatus::Cancelled;
        cycle.finished_at = Some(Utc::now());
        self.store.update_cycle(&cycle).await.context("failed to cancel cycle")?;

        if let Some(mut adapter) = self.store.get_adapter(cycle.adapter_id).await.context("failed to load adapter")? {
            if adapter.current_cycle_id == Some(cycle_id) {
                let expected = adapter.updated_at;
                adapter.current_cycle_id = None;
                self.store.cas_update_adapter(&adapter, expected).await.context("failed to clear adapter cycle")?;
            }
        }
        Ok(true)
    }

    pub async fn toggle_adapter_enabled(&self, adapter_id: EntityId, enabled: bool) -> Result<()> {
        self.mutate_adapter(adapter_id, |adapter| {
            adapter.enabled = enabled;
            if enabled {
                adapter.disabled_at = None;
                adapter.disabled_reason = None;
            } else {
                adapter.disabled_at = Some(Utc::now());
                adapter.disabled_reason = Some(AdapterDisabledReason::Manual);
            }
        })
        .await
    }

    pub async fn toggle_adapter_ingestion_paused(&self, adapter_id: EntityId, paused: bool, by: &str) -> Result<()> {
        self.mutate_adapter(adapter_id, |adapter| {
            adapter.ingestion_paused = paused;
            if paused {
                adapter.ingestion_paused_by = Some(by.to_string());
                adapter.ingestion_paused_at = Some(Utc::now());
            } else {
                adapter.ingestion_paused_by = None;
                adapter.ingestion_paused_at = None;
                adapter.ingestion_paused_reason = None;
            }
        })
        .await
    }

    pub async fn reset_adapter_failures(&self, adapter_id: EntityId) -> Result<()> {
        self.mutate_adapter(adapter_id, |adapter| {
            adapter.consecutive_failed_batches = 0;
        })
        .await
    }

    pub async fn update_adapter_schedule(&self, adapter_id: EntityId, cron: String) -> Result<()> {
        self.mutate_adapter(adapter_id, |adapter| {
            adapter.schedule_cron = cron;
        })
        .await
    }

    pub async fn toggle_adapter_level_scheduling(&self, adapter_id: EntityId, enabled: bool) -> Result<()> {
        self.mutate_adapter(adapter_id, |adapter| {
            adapter.adapter_level_scheduling_enabled = enabled;
        })
        .await
    }

    async fn mutate_adapter(&self, adapter_id: EntityId, f: impl FnOnce(&mut ScrapeAdapter)) -> Result<()> {
        let Some(adapter) = self.store.get_adapter(adapter_id).await.context("failed to load adapter")? else {
            return Err(IngestError::InvariantViolation("unknown adapter".to_string()).into());
        };
        let expected = adapter.updated_at;
        let mut updated = adapter;
        f(&mut updated);
        let ok = self.store.cas_update_adapter(&updated, expected).await.context("failed to update adapter")?;
        if !ok {
            anyhow::bail!("adapter was concurrently modified, retry");
        }
        Ok(())
    }

    pub async fn emergency_stop_scraper(&self, confirmation_code: &str) -> Result<EmergencyStopOutcome> {
        let outcome = self.scraper.emergency_stop(confirmation_code).await?;
        tracing::warn!(
            runs_aborted = outcome.runs_aborted,
            cycles_aborted = outcome.cycles_aborted,
            queues_cleared = outcome.queues_cleared,
            "emergency stop triggered"
        );
        Ok(outcome)
    }

    pub async fn get_scraper_status(&self) -> Result<bool> {
        self.store.get_scheduler_enabled().await.context("failed to read scheduler flag")
    }

    pub async fn enable_scraper_scheduler(&self, enabled: bool, updated_by: &str) -> Result<()> {
        self.store
            .set_scheduler_enabled(enabled, updated_by)
            .await
            .context("failed to update scheduler flag")
    }
}
