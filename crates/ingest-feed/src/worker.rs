//! Affiliate feed worker orchestration (§4.E): lock → download → parse →
//! process → circuit-breaker → finalize, for one `(feedId, trigger)` job.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use ingest_config::FeedConfig;
use ingest_lock::AdvisoryLockService;
use ingest_notify::{
    circuit_breaker_tripped_payload, data_quality_warning_payload, feed_auto_disabled_payload,
    feed_recovery_payload, send_notification, NotificationChannel,
};
use ingest_queue::{Job, JobQueue};
use ingest_store::CatalogStore;
use ingest_trace::{DebugSampler, ItemKeyCandidates, TraceEnvelope};
use ingest_types::{
    AffiliateFeed, AffiliateFeedRun, EntityId, ErrorClass, FeedStatus, IngestError, Price, Product,
    RunStatus, RunTrigger, ScrapeAdapter, SkippedReason, MAX_CONSECUTIVE_FEED_FAILURES,
};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::breaker::{self, BreakerOutcome, BreakerThresholds};
use crate::fetch::{is_unchanged, FeedFetcher};
use crate::parse::{FeedParser, ParsedRow};

/// The durable job payload this worker consumes from `ingest_queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedJobPayload {
    pub feed_id: EntityId,
    pub trigger: RunTrigger,
    #[serde(default)]
    pub run_id: Option<EntityId>,
}

pub enum JobOutcome {
    Completed,
    Retried,
    Exhausted,
}

pub struct FeedWorker {
    pub store: Arc<dyn CatalogStore>,
    pub locks: Arc<dyn AdvisoryLockService>,
    pub queue: Arc<dyn JobQueue>,
    pub fetcher: Arc<dyn FeedFetcher>,
    pub parser: Arc<dyn FeedParser>,
    pub notify_channel: Option<NotificationChannel>,
    pub config: FeedConfig,
}

const ORPHAN_RECOVERY_WINDOW: Duration = Duration::from_secs(10 * 60);
const LOCK_LEASE: Duration = Duration::from_secs(5 * 60);

impl FeedWorker {
    /// Runs one job to completion, translating the result into the
    /// appropriate queue disposition via [`IngestError::classify`].
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
        let payload: FeedJobPayload =
            serde_json::from_value(job.payload.clone()).context("malformed feed job payload")?;

        let lock_id = format!("affiliate-feed:{}", payload.feed_id);
        let Some(lock_handle) = self
            .locks
            .try_acquire(&lock_id, LOCK_LEASE)
            .await
            .context("lock acquisition failed")?
        else {
            return Err(IngestError::LockContention { lock_id }.into());
        };

        let outcome = self.execute_locked(job, &payload).await;
        let _ = self.locks.release(&lock_handle).await;
        outcome
    }

    async fn execute_locked(&self, job: &Job, payload: &FeedJobPayload) -> Result<()> {
        let Some(feed) = self
            .store
            .get_affiliate_feed(payload.feed_id)
            .await
            .context("failed to load feed")?
        else {
            tracing::warn!(feed_id = %payload.feed_id, "feed job references unknown feed; discarding");
            return Ok(());
        };

        let source = self
            .store
            .get_source(feed.source_id)
            .await
            .context("failed to load source")?;
        let adapter = match source.as_ref().and_then(|s| s.adapter_id) {
            Some(adapter_id) => self.store.get_adapter(adapter_id).await.context("failed to load adapter")?,
            None => None,
        };

        if let Some(reason) = eligibility_skip(&feed, adapter.as_ref(), payload.trigger) {
            let mut run = AffiliateFeedRun::new(feed.id, feed.source_id, payload.trigger, job.id.clone());
            run.status = RunStatus::Succeeded;
            run.skipped_reason = Some(reason);
            run.finished_at = Some(Utc::now());
            self.store.create_run(run).await.context("failed to persist skipped run")?;
            return Ok(());
        }

        let run_id = match payload.run_id {
            Some(id) => id,
            None => self.intake_run(job, &feed, payload.trigger).await?,
        };

        let mut run = self
            .store
            .get_run(run_id)
            .await
            .context("failed to reload run")?
            .ok_or_else(|| IngestError::InvariantViolation("run vanished after intake".to_string()))?;

        let trace = TraceEnvelope::new(run.id.to_string(), "affiliate_feed").with_step("execute");
        let _span = trace.span().entered();

        match self.run_phases(&feed, &mut run).await {
            Ok(()) => {
                run.status = RunStatus::Succeeded;
                run.finished_at = Some(Utc::now());
                self.store.update_run(&run).await.context("failed to persist succeeded run")?;
                self.finalize_success(&feed, &run).await?;
                Ok(())
            }
            Err(err) => {
                let ingest_err = err.downcast_ref::<IngestError>();
                run.status = RunStatus::Failed;
                run.finished_at = Some(Utc::now());
                run.failure_kind = ingest_err.map(IngestError::kind);
                run.failure_code = ingest_err.map(|e| e.code().to_string());
                run.failure_message = Some(err.to_string());
                self.store.update_run(&run).await.context("failed to persist failed run")?;
                self.finalize_failure(&feed, &run).await?;
                Err(err)
            }
        }
    }

    /// Job-intake invariant: lock is already held by the caller; this
    /// performs orphan recovery, then creates a fresh run and persists its
    /// id back into the job payload — all before any further I/O that can
    /// throw.
    async fn intake_run(&self, job: &Job, feed: &AffiliateFeed, trigger: RunTrigger) -> Result<EntityId> {
        let since = Utc::now() - chrono::Duration::from_std(ORPHAN_RECOVERY_WINDOW).unwrap();
        let existing = self
            .store
            .find_recent_running_run(feed.id, trigger, since)
            .await
            .context("failed to search for orphaned run")?;

        let run = match existing {
            Some(run) => run,
            None => {
                let run = AffiliateFeedRun::new(feed.id, feed.source_id, trigger, job.id.clone());
                self.store.create_run(run.clone()).await.context("failed to create run")?;
                run
            }
        };

        let mut fields = Map::new();
        fields.insert("run_id".to_string(), serde_json::to_value(run.id)?);
        self.queue
            .patch_payload(&job.id, fields)
            .await
            .context("failed to persist run_id into job payload")?;

        Ok(run.id)
    }

    async fn run_phases(&self, feed: &AffiliateFeed, run: &mut AffiliateFeedRun) -> Result<()> {
        let fetch_outcome = self.fetcher.fetch(feed).await?;
        run.metrics.download_bytes = fetch_outcome.bytes.len() as u64;

        if is_unchanged(&feed.last_run_memo, &fetch_outcome.memo) {
            run.skipped_reason = Some(SkippedReason::UnchangedHash);
            self.carry_forward_seen_rows(feed, run).await?;
            return Ok(());
        }

        let parse_outcome = self.parser.parse(&fetch_outcome.bytes, self.config.max_persisted_parse_errors);
        run.metrics.rows_read = (parse_outcome.rows.len() + parse_outcome.errors.len()) as u64;
        run.metrics.rows_parsed = parse_outcome.rows.len() as u64;
        run.metrics.error_count = parse_outcome.errors.len() as u64;

        if run.metrics.rows_read > feed.max_row_count {
            return Err(IngestError::PermanentNetwork(format!(
                "feed exceeded max row count: {} > {}",
                run.metrics.rows_read, feed.max_row_count
            ))
            .into());
        }

        let seen_product_ids = self.process_rows(feed, run, &parse_outcome.rows).await?;
        self.promote(feed, run, &seen_product_ids).await?;

        Ok(())
    }

    /// UNCHANGED-skip path (§4.E.1): copy `lastSeenAt` forward from the
    /// most recent non-ignored SUCCEEDED run so the breaker's
    /// `activeCountBefore` stays correct on the next real run. The source
    /// id stands in for the retailer id here — this model has no separate
    /// feed-level retailer identifier.
    async fn carry_forward_seen_rows(&self, feed: &AffiliateFeed, run: &AffiliateFeedRun) -> Result<()> {
        if self.store.last_succeeded_run(feed.id).await?.is_none() {
            return Ok(());
        }
        let active = self.store.list_active_products(feed.source_id).await?;
        let ids: Vec<EntityId> = active.iter().map(|p| p.id).collect();
        if !ids.is_empty() {
            self.store.mark_products_seen(&ids, run.run_observed_at).await?;
        }
        Ok(())
    }

    async fn process_rows(
        &self,
        feed: &AffiliateFeed,
        run: &mut AffiliateFeedRun,
        rows: &[ParsedRow],
    ) -> Result<Vec<EntityId>> {
        let sampler = DebugSampler::new(20, 0.01);
        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut seen_product_ids = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            let extracted = match extract_row(row) {
                Ok(extracted) => extracted,
                Err(err) => {
                    run.metrics.products_rejected += 1;
                    run.metrics.error_count += 1;
                    tracing::debug!(row = row.row_number, error = %err, "rejected row");
                    continue;
                }
            };

            let candidates = ItemKeyCandidates {
                source_product_id: extracted.source_product_id.as_deref(),
                url: Some(extracted.url.as_str()),
                ..Default::default()
            };
            let item_key = ingest_trace::derive_item_key(&candidates);
            if sampler.should_log(index as u64, &run.correlation_id, &item_key) {
                tracing::debug!(item_key = %item_key, "processing row");
            }

            let (dedup_id, used_fallback) = match &extracted.source_product_id {
                Some(id) => (id.clone(), false),
                None => {
                    let canonical = ingest_canon::canonicalize(&extracted.url).unwrap_or_else(|| extracted.url.clone());
                    (format!("urlhash:{}", crate::fetch::content_hash(canonical.as_bytes())), true)
                }
            };

            if !seen_keys.insert(dedup_id.clone()) {
                run.metrics.duplicate_key_count += 1;
                continue;
            }
            if used_fallback {
                run.metrics.url_hash_fallback_count += 1;
            }

            let product = Product {
                id: EntityId::new_v4(),
                source_product_id: Some(dedup_id),
                retailer_id: feed.source_id,
                brand: extracted.brand,
                caliber: extracted.caliber,
                round_count: extracted.round_count,
                active: false,
                last_seen_success_at: Some(run.run_observed_at),
            };

            let product_id = self.store.upsert_product(product).await.context("product upsert failed")?;
            seen_product_ids.push(product_id);
            run.metrics.products_upserted += 1;
            if extracted.brand_missing {
                run.metrics.missing_brand_count += 1;
            }
            run.breaker.seen_success_count += 1;

            let price = Price {
                product_id,
                retailer_id: feed.source_id,
                url: extracted.url,
                price_cents: extracted.price_cents,
                in_stock: extracted.in_stock,
                observed_at: run.run_observed_at,
                ingestion_run_type: ingest_types::IngestionRunType::AffiliateFeed,
                ingestion_run_id: run.id,
            };
            if self.store.upsert_price(price).await.context("price upsert failed")? {
                run.metrics.prices_written += 1;
            }
        }

        Ok(seen_product_ids)
    }

    async fn promote(&self, feed: &AffiliateFeed, run: &mut AffiliateFeedRun, seen_product_ids: &[EntityId]) -> Result<()> {
        let active = self.store.list_active_products(feed.source_id).await?;
        run.breaker.active_count_before = active.len() as u64;

        let expiry_cutoff = run.run_observed_at - chrono::Duration::hours(feed.expiry_hours as i64);
        run.breaker.would_expire_count = active
            .iter()
            .filter(|p| p.last_seen_success_at.map(|t| t < expiry_cutoff).unwrap_or(true))
            .count() as u64;

        let thresholds = BreakerThresholds {
            min_active_count: self.config.breaker_min_active_count,
            expire_ratio_threshold: self.config.expire_ratio_threshold,
            url_hash_fallback_ratio_threshold: self.config.url_hash_fallback_ratio_threshold,
            url_hash_fallback_min_upserted: self.config.url_hash_fallback_min_upserted,
        };

        match breaker::evaluate(&run.metrics, &run.breaker, &thresholds, false) {
            BreakerOutcome::Passed => {
                if !seen_product_ids.is_empty() {
                    self.store
                        .activate_products(seen_product_ids)
                        .await
                        .context("failed to activate promoted products")?;
                }
                self.store
                    .expire_products_not_seen_since(feed.source_id, expiry_cutoff)
                    .await
                    .context("failed to expire stale products")?;
                Ok(())
            }
            BreakerOutcome::PassedWithBypassWarning => {
                tracing::warn!(feed_id = %feed.id, "circuit breaker bypassed despite trip condition");
                if !seen_product_ids.is_empty() {
                    self.store
                        .activate_products(seen_product_ids)
                        .await
                        .context("failed to activate promoted products")?;
                }
                Ok(())
            }
            BreakerOutcome::Tripped { reason } => {
                run.expiry_blocked = true;
                run.expiry_blocked_reason = Some(reason.message().to_string());
                if let Some(channel) = &self.notify_channel {
                    let payload = circuit_breaker_tripped_payload(&feed.id.to_string(), reason.message());
                    let _ = send_notification(channel, &payload).await;
                }
                Err(IngestError::CircuitBreakerTripped { reason: reason.message().to_string() }.into())
            }
        }
    }

    async fn finalize_success(&self, feed: &AffiliateFeed, run: &AffiliateFeedRun) -> Result<()> {
        let was_failing = feed.consecutive_failures > 0;
        let mut updated = feed.clone();
        updated.consecutive_failures = 0;
        updated.last_run_memo = feed.last_run_memo.clone();
        updated.updated_at = Utc::now();
        let _ = self.store.cas_update_affiliate_feed(&updated, feed.updated_at).await;

        if was_failing {
            if let Some(channel) = &self.notify_channel {
                let payload = feed_recovery_payload(&feed.id.to_string());
                let _ = send_notification(channel, &payload).await;
            }
        }

        if run.metrics.products_upserted >= self.config.data_quality_min_upserted {
            let previous = self.store.last_succeeded_run(feed.id).await.ok().flatten();
            let crosses = breaker::crosses_data_quality_edge(
                run.metrics.products_upserted,
                run.metrics.missing_brand_count,
                previous.as_ref().map(|r| r.metrics.products_upserted),
                previous.as_ref().map(|r| r.metrics.missing_brand_count),
                self.config.data_quality_min_upserted,
                self.config.data_quality_missing_brand_threshold_pct,
            );
            if crosses {
                if let Some(channel) = &self.notify_channel {
                    let ratio = run.metrics.missing_brand_count as f64 / run.metrics.products_upserted as f64;
                    let payload = data_quality_warning_payload(&feed.id.to_string(), ratio);
                    let _ = send_notification(channel, &payload).await;
                }
            }
        }

        Ok(())
    }

    async fn finalize_failure(&self, feed: &AffiliateFeed, _run: &AffiliateFeedRun) -> Result<()> {
        let mut updated = feed.clone();
        updated.consecutive_failures += 1;
        let auto_disable = updated.consecutive_failures >= MAX_CONSECUTIVE_FEED_FAILURES;
        if auto_disable {
            updated.status = FeedStatus::Disabled;
            updated.next_run_at = None;
        }
        updated.updated_at = Utc::now();
        let _ = self.store.cas_update_affiliate_feed(&updated, feed.updated_at).await;

        if auto_disable {
            if let Some(channel) = &self.notify_channel {
                let payload = feed_auto_disabled_payload(&feed.id.to_string());
                let _ = send_notification(channel, &payload).await;
            }
        }
        Ok(())
    }
}

/// Eligibility checks, pure and testable in isolation (§4.E).
fn eligibility_skip(
    feed: &AffiliateFeed,
    adapter: Option<&ScrapeAdapter>,
    trigger: RunTrigger,
) -> Option<SkippedReason> {
    if feed.status == FeedStatus::Draft {
        return Some(SkippedReason::FeedDraft);
    }
    if feed.status == FeedStatus::Disabled
        && !matches!(trigger, RunTrigger::Manual | RunTrigger::AdminTest)
    {
        return Some(SkippedReason::FeedDisabled);
    }
    if let Some(adapter) = adapter {
        if !adapter.enabled {
            return Some(SkippedReason::AdapterDisabled);
        }
        if adapter.ingestion_paused {
            return Some(SkippedReason::IngestionPaused);
        }
    }
    None
}

struct ExtractedRow {
    source_product_id: Option<String>,
    brand: Option<String>,
    brand_missing: bool,
    caliber: Option<String>,
    round_count: Option<u32>,
    url: String,
    price_cents: i64,
    in_stock: Option<bool>,
}

/// Maps a generic CSV row onto the fields the worker needs, accepting a
/// handful of common header aliases. Real per-retailer column mapping is
/// adapter-specific and out of scope here.
fn extract_row(row: &ParsedRow) -> Result<ExtractedRow, IngestError> {
    let get = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|k| row.fields.get(*k))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let url = get(&["url", "link", "product_url"])
        .ok_or_else(|| IngestError::processing_validation_failure(format!("row {}: missing url", row.row_number)))?;

    let price_raw = get(&["price_cents", "price", "price_usd"])
        .ok_or_else(|| IngestError::processing_validation_failure(format!("row {}: missing price", row.row_number)))?;

    let price_cents = if row.fields.contains_key("price_cents") {
        price_raw
            .parse::<i64>()
            .map_err(|_| IngestError::processing_validation_failure(format!("row {}: bad price_cents", row.row_number)))?
    } else {
        let dollars: f64 = price_raw
            .parse()
            .map_err(|_| IngestError::processing_validation_failure(format!("row {}: bad price", row.row_number)))?;
        (dollars * 100.0).round() as i64
    };

    let in_stock = get(&["in_stock", "instock", "available"]).map(|v| {
        matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "y" | "in stock")
    });

    let source_product_id = get(&["sku", "source_product_id", "product_id"]);
    let brand = get(&["brand", "manufacturer"]);
    let brand_missing = brand.is_none();

    let caliber = get(&["caliber"]).map(|c| c.to_uppercase());
    let round_count = get(&["round_count", "rounds", "count"]).and_then(|v| v.parse::<u32>().ok());

    Ok(ExtractedRow {
        source_product_id,
        brand,
        brand_missing,
        caliber,
        round_count,
        url,
        price_cents,
        in_stock,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_types::{AdapterDisabledReason, FeedMemo, FeedTransport, FeedFormat};
    use serde_json::json;

    fn sample_feed(status: FeedStatus) -> AffiliateFeed {
        AffiliateFeed {
            id: EntityId::new_v4(),
            source_id: EntityId::new_v4(),
            transport: FeedTransport::Https,
            format: FeedFormat::Csv,
            schedule_hours: 24,
            expiry_hours: 72,
            max_row_count: 100_000,
            last_run_memo: FeedMemo { mtime: None, size: None, content_hash: None },
            consecutive_failures: 0,
            manual_run_pending: false,
            status,
            next_run_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn draft_feed_is_skipped_regardless_of_trigger() {
        let feed = sample_feed(FeedStatus::Draft);
        assert_eq!(eligibility_skip(&feed, None, RunTrigger::Scheduled), Some(SkippedReason::FeedDraft));
        assert_eq!(eligibility_skip(&feed, None, RunTrigger::Manual), Some(SkippedReason::FeedDraft));
    }

    #[test]
    fn disabled_feed_allows_manual_and_admin_test_only() {
        let feed = sample_feed(FeedStatus::Disabled);
        assert_eq!(eligibility_skip(&feed, None, RunTrigger::Scheduled), Some(SkippedReason::FeedDisabled));
        assert_eq!(eligibility_skip(&feed, None, RunTrigger::Manual), None);
        assert_eq!(eligibility_skip(&feed, None, RunTrigger::AdminTest), None);
    }

    #[test]
    fn active_feed_with_disabled_adapter_is_skipped() {
        let feed = sample_feed(FeedStatus::Active);
        let adapter = ScrapeAdapter {
            id: EntityId::new_v4(),
            enabled: false,
            ingestion_paused: false,
            ingestion_paused_by: None,
            ingestion_paused_at: None,
            ingestion_paused_reason: None,
            schedule_cron: "0 0 * * *".into(),
            cycle_timeout_minutes: 30,
            current_cycle_id: None,
            last_cycle_started_at: None,
            consecutive_failed_batches: 0,
            disabled_at: Some(Utc::now()),
            disabled_reason: Some(AdapterDisabledReason::Manual),
            baselines: Default::default(),
            adapter_level_scheduling_enabled: false,
            updated_at: Utc::now(),
        };
        assert_eq!(eligibility_skip(&feed, Some(&adapter), RunTrigger::Scheduled), Some(SkippedReason::AdapterDisabled));
    }

    #[test]
    fn extract_row_parses_dollar_price_and_stock_flag() {
        let mut fields = Map::new();
        fields.insert("url".into(), json!("https://example.com/p"));
        fields.insert("price".into(), json!("19.99"));
        fields.insert("in_stock".into(), json!("Yes"));
        fields.insert("sku".into(), json!("ABC-1"));
        let row = ParsedRow { row_number: 1, fields };

        let extracted = extract_row(&row).unwrap();
        assert_eq!(extracted.price_cents, 1999);
        assert_eq!(extracted.in_stock, Some(true));
        assert_eq!(extracted.source_product_id.as_deref(), Some("ABC-1"));
    }

    #[test]
    fn extract_row_rejects_missing_url() {
        let mut fields = Map::new();
        fields.insert("price".into(), json!("5.00"));
        let row = ParsedRow { row_number: 2, fields };
        assert!(extract_row(&row).is_err());
    }
}
