//! Catalog store (§3, §6): the shared persistence layer every pipeline
//! worker writes through. Feed/adapter records are shared state; mutation
//! happens only via compare-and-set keyed on `updated_at`, so two workers
//! racing on the same entity never silently clobber each other.
//!
//! `InMemoryCatalogStore` is a complete, correct re-implementation of the
//! CAS/upsert/dedupe semantics below used by every other crate's test
//! suite — there is no live Postgres available to the test harness.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use ingest_types::{
    AffiliateFeed, AffiliateFeedRun, CaliberMarketSnapshot, DailyBestPrice, EntityId,
    LastTargetStatus, Price, Product, RunStatus, RunTrigger, ScrapeAdapter, ScrapeCycle,
    ScrapeTarget, SnapshotStatus, Source, TargetStatus, WatchlistItem,
};
use sqlx::PgPool;
use tokio::sync::Mutex;

/// Returned by every compare-and-set mutation: `false` means the row's
/// `updated_at` no longer matched the caller's expectation (a concurrent
/// writer won the race) and the caller should re-read and retry.
pub type CasOutcome = bool;

#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_source(&self, id: EntityId) -> Result<Option<Source>>;

    async fn get_affiliate_feed(&self, id: EntityId) -> Result<Option<AffiliateFeed>>;
    /// Feeds eligible for the scheduler's affiliate tick (§4.G.1).
    async fn list_due_affiliate_feeds(&self, now: DateTime<Utc>) -> Result<Vec<AffiliateFeed>>;
    /// Unscoped listing for the admin control surface's `feeds list` (§6);
    /// the scheduler uses `list_due_affiliate_feeds` instead.
    async fn list_all_affiliate_feeds(&self) -> Result<Vec<AffiliateFeed>>;
    async fn cas_update_affiliate_feed(
        &self,
        feed: &AffiliateFeed,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome>;

    async fn get_adapter(&self, id: EntityId) -> Result<Option<ScrapeAdapter>>;
    async fn list_due_adapters(&self, now: DateTime<Utc>) -> Result<Vec<ScrapeAdapter>>;
    async fn cas_update_adapter(
        &self,
        adapter: &ScrapeAdapter,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome>;

    /// Orphan recovery (§4.E): a RUNNING run for `(feed_id, trigger)` begun
    /// within `since`.
    async fn find_recent_running_run(
        &self,
        feed_id: EntityId,
        trigger: RunTrigger,
        since: DateTime<Utc>,
    ) -> Result<Option<AffiliateFeedRun>>;
    async fn create_run(&self, run: AffiliateFeedRun) -> Result<()>;
    async fn get_run(&self, id: EntityId) -> Result<Option<AffiliateFeedRun>>;
    async fn update_run(&self, run: &AffiliateFeedRun) -> Result<()>;
    /// Most recent non-ignored SUCCEEDED run for a feed, used to seed
    /// `lastSeenAt` rows on an UNCHANGED-skip run (§4.E.1).
    async fn last_succeeded_run(&self, feed_id: EntityId) -> Result<Option<AffiliateFeedRun>>;

    async fn list_targets_for_adapter(&self, adapter_id: EntityId) -> Result<Vec<ScrapeTarget>>;
    async fn count_targets_by_last_status(
        &self,
        adapter_id: EntityId,
        status: LastTargetStatus,
    ) -> Result<u64>;
    async fn count_global_pending(&self) -> Result<u64>;
    async fn get_target(&self, id: EntityId) -> Result<Option<ScrapeTarget>>;
    async fn upsert_target(&self, target: ScrapeTarget) -> Result<()>;
    /// Unscoped listing for the admin control surface's `ListTargets` (§6);
    /// per-adapter views use `list_targets_for_adapter` instead.
    async fn list_all_targets(&self) -> Result<Vec<ScrapeTarget>>;
    /// Returns `true` if a target with this id existed and was removed.
    async fn delete_target(&self, id: EntityId) -> Result<bool>;

    async fn create_cycle(&self, cycle: ScrapeCycle) -> Result<()>;
    async fn get_cycle(&self, id: EntityId) -> Result<Option<ScrapeCycle>>;
    async fn update_cycle(&self, cycle: &ScrapeCycle) -> Result<()>;

    /// Upserts by `(retailer_id, source_product_id)`; returns the stable
    /// product id.
    async fn upsert_product(&self, product: Product) -> Result<EntityId>;
    async fn get_product_by_source_id(
        &self,
        retailer_id: EntityId,
        source_product_id: &str,
    ) -> Result<Option<Product>>;
    async fn list_active_products(&self, retailer_id: EntityId) -> Result<Vec<Product>>;
    /// Marks products not seen since `cutoff` as inactive; returns the count expired.
    async fn expire_products_not_seen_since(
        &self,
        retailer_id: EntityId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;
    async fn mark_products_seen(&self, ids: &[EntityId], seen_at: DateTime<Utc>) -> Result<()>;
    /// Flips `active=true` for exactly the given products; called once the
    /// circuit breaker passes and a run's seen products are promoted.
    async fn activate_products(&self, ids: &[EntityId]) -> Result<()>;

    /// Inserts a price row unless `(productId, retailerId, observedAt, url,
    /// price, inStock)` would be a no-op against the most recent price for
    /// that key (§3 uniqueness rule). Returns `true` if a row was written.
    async fn upsert_price(&self, price: Price) -> Result<bool>;
    async fn latest_price(&self, product_id: EntityId, retailer_id: EntityId, url: &str) -> Result<Option<Price>>;

    /// Daily best price-per-round per product within `[window_start,
    /// window_end]` for `caliber` (§4.H.2): the reduction pass the
    /// snapshot computer's percentile math runs over.
    async fn list_daily_best_price_per_round(
        &self,
        caliber: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<DailyBestPrice>>;

    async fn get_current_snapshot(
        &self,
        caliber: &str,
        window_days: u32,
    ) -> Result<Option<CaliberMarketSnapshot>>;
    /// Transactional SUPERSEDE+INSERT (§4.H.3); returns `Err` on a unique
    /// constraint race the caller should treat as "skip this caliber".
    async fn supersede_and_insert_snapshot(&self, snapshot: CaliberMarketSnapshot) -> Result<()>;

    /// Global scheduler-enabled flag (§9 design note: modeled as a row in a
    /// `system_settings` store). Defaults to `true`.
    async fn get_scheduler_enabled(&self) -> Result<bool>;
    async fn set_scheduler_enabled(&self, enabled: bool, updated_by: &str) -> Result<()>;

    /// RUNNING runs/cycles, used by emergency stop (§4.F) to transition
    /// everything in-flight to a terminal state.
    async fn list_running_runs(&self) -> Result<Vec<AffiliateFeedRun>>;
    async fn list_running_cycles(&self) -> Result<Vec<ScrapeCycle>>;

    /// Scheduling-glue lookups for the alert dispatcher (§4.I); rule
    /// evaluation itself happens upstream, this is only the timestamp
    /// bookkeeping the dispatcher reads and writes.
    async fn get_watchlist_item(&self, id: EntityId) -> Result<Option<WatchlistItem>>;
    async fn update_watchlist_item(&self, item: &WatchlistItem) -> Result<()>;
}

// ---------------------------------------------------------------------
// Postgres-backed implementation
// ---------------------------------------------------------------------

pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl CatalogStore for PgCatalogStore {
    async fn get_source(&self, id: EntityId) -> Result<Option<Source>> {
        let row: Option<(
            EntityId,
            String,
            String,
            bool,
            bool,
            Option<DateTime<Utc>>,
            Option<String>,
            Option<EntityId>,
            Option<String>,
        )> = sqlx::query_as(
            r#"SELECT id, name, retailer_ref, scrape_enabled, robots_compliant,
                      tos_reviewed_at, tos_approver_id, adapter_id, feed_hash_memo
               FROM sources WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load source")?;

        Ok(row.map(
            |(id, name, retailer_ref, scrape_enabled, robots_compliant, tos_reviewed_at, tos_approver_id, adapter_id, feed_hash_memo)| {
                Source {
                    id,
                    name,
                    retailer_ref,
                    scrape_enabled,
                    robots_compliant,
                    tos_reviewed_at,
                    tos_approver_id,
                    adapter_id,
                    feed_hash_memo,
                }
            },
        ))
    }

    async fn get_affiliate_feed(&self, _id: EntityId) -> Result<Option<AffiliateFeed>> {
        anyhow::bail!("ingest-store: Postgres row mapping for affiliate_feeds is deployment-specific; wire up in the admin service")
    }

    async fn list_due_affiliate_feeds(&self, _now: DateTime<Utc>) -> Result<Vec<AffiliateFeed>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn list_all_affiliate_feeds(&self) -> Result<Vec<AffiliateFeed>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn cas_update_affiliate_feed(
        &self,
        feed: &AffiliateFeed,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        let result = sqlx::query(
            r#"UPDATE affiliate_feeds SET status = $2, consecutive_failures = $3,
                   manual_run_pending = $4, next_run_at = $5, updated_at = NOW()
               WHERE id = $1 AND updated_at = $6"#,
        )
        .bind(feed.id)
        .bind(format!("{:?}", feed.status))
        .bind(feed.consecutive_failures as i32)
        .bind(feed.manual_run_pending)
        .bind(feed.next_run_at)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .context("failed to CAS-update affiliate feed")?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_adapter(&self, _id: EntityId) -> Result<Option<ScrapeAdapter>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn list_due_adapters(&self, _now: DateTime<Utc>) -> Result<Vec<ScrapeAdapter>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn cas_update_adapter(
        &self,
        adapter: &ScrapeAdapter,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        let result = sqlx::query(
            r#"UPDATE scrape_adapters SET enabled = $2, ingestion_paused = $3,
                   current_cycle_id = $4, consecutive_failed_batches = $5, updated_at = NOW()
               WHERE id = $1 AND updated_at = $6"#,
        )
        .bind(adapter.id)
        .bind(adapter.enabled)
        .bind(adapter.ingestion_paused)
        .bind(adapter.current_cycle_id)
        .bind(adapter.consecutive_failed_batches as i32)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .context("failed to CAS-update adapter")?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_recent_running_run(
        &self,
        feed_id: EntityId,
        trigger: RunTrigger,
        since: DateTime<Utc>,
    ) -> Result<Option<AffiliateFeedRun>> {
        let id: Option<(EntityId,)> = sqlx::query_as(
            r#"SELECT id FROM affiliate_feed_runs
               WHERE feed_id = $1 AND trigger = $2 AND status = 'RUNNING' AND started_at >= $3
               ORDER BY started_at DESC LIMIT 1"#,
        )
        .bind(feed_id)
        .bind(format!("{:?}", trigger))
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up recent running run")?;

        match id {
            Some((id,)) => self.get_run(id).await,
            None => Ok(None),
        }
    }

    async fn create_run(&self, run: AffiliateFeedRun) -> Result<()> {
        let metrics = serde_json::to_value(&run.metrics)?;
        let breaker = serde_json::to_value(&run.breaker)?;
        sqlx::query(
            r#"INSERT INTO affiliate_feed_runs
                 (id, feed_id, source_id, trigger, status, started_at, run_observed_at,
                  metrics, breaker, correlation_id, is_partial, expiry_blocked)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(run.id)
        .bind(run.feed_id)
        .bind(run.source_id)
        .bind(format!("{:?}", run.trigger))
        .bind(format!("{:?}", run.status))
        .bind(run.started_at)
        .bind(run.run_observed_at)
        .bind(metrics)
        .bind(breaker)
        .bind(run.correlation_id)
        .bind(run.is_partial)
        .bind(run.expiry_blocked)
        .execute(&self.pool)
        .await
        .context("failed to create affiliate feed run")?;
        Ok(())
    }

    async fn get_run(&self, _id: EntityId) -> Result<Option<AffiliateFeedRun>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn update_run(&self, run: &AffiliateFeedRun) -> Result<()> {
        let metrics = serde_json::to_value(&run.metrics)?;
        let breaker = serde_json::to_value(&run.breaker)?;
        sqlx::query(
            r#"UPDATE affiliate_feed_runs SET status = $2, finished_at = $3, metrics = $4,
                   breaker = $5, skipped_reason = $6, failure_kind = $7, failure_code = $8,
                   failure_message = $9, is_partial = $10, expiry_blocked = $11,
                   expiry_blocked_reason = $12
               WHERE id = $1"#,
        )
        .bind(run.id)
        .bind(format!("{:?}", run.status))
        .bind(run.finished_at)
        .bind(metrics)
        .bind(breaker)
        .bind(run.skipped_reason.map(|s| format!("{s:?}")))
        .bind(run.failure_kind.map(|k| format!("{k:?}")))
        .bind(&run.failure_code)
        .bind(&run.failure_message)
        .bind(run.is_partial)
        .bind(run.expiry_blocked)
        .bind(&run.expiry_blocked_reason)
        .execute(&self.pool)
        .await
        .context("failed to update affiliate feed run")?;
        Ok(())
    }

    async fn last_succeeded_run(&self, _feed_id: EntityId) -> Result<Option<AffiliateFeedRun>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn list_targets_for_adapter(&self, _adapter_id: EntityId) -> Result<Vec<ScrapeTarget>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn count_targets_by_last_status(
        &self,
        adapter_id: EntityId,
        status: LastTargetStatus,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scrape_targets WHERE adapter_id = $1 AND last_status = $2"#,
        )
        .bind(adapter_id)
        .bind(format!("{status:?}"))
        .fetch_one(&self.pool)
        .await
        .context("failed to count targets by last status")?;
        Ok(count as u64)
    }

    async fn count_global_pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scrape_targets WHERE last_status IN ('PENDING_MANUAL', 'ENQUEUED')"#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to count global pending targets")?;
        Ok(count as u64)
    }

    async fn get_target(&self, _id: EntityId) -> Result<Option<ScrapeTarget>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn upsert_target(&self, _target: ScrapeTarget) -> Result<()> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn list_all_targets(&self) -> Result<Vec<ScrapeTarget>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn delete_target(&self, _id: EntityId) -> Result<bool> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn create_cycle(&self, cycle: ScrapeCycle) -> Result<()> {
        let counters = serde_json::to_value(&cycle.counters)?;
        sqlx::query(
            r#"INSERT INTO scrape_cycles (id, adapter_id, trigger, status, counters, started_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(cycle.id)
        .bind(cycle.adapter_id)
        .bind(format!("{:?}", cycle.trigger))
        .bind(format!("{:?}", cycle.status))
        .bind(counters)
        .bind(cycle.started_at)
        .execute(&self.pool)
        .await
        .context("failed to create scrape cycle")?;
        Ok(())
    }

    async fn get_cycle(&self, _id: EntityId) -> Result<Option<ScrapeCycle>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn update_cycle(&self, cycle: &ScrapeCycle) -> Result<()> {
        let counters = serde_json::to_value(&cycle.counters)?;
        sqlx::query(
            r#"UPDATE scrape_cycles SET status = $2, counters = $3, last_processed_target_id = $4,
                   finished_at = $5 WHERE id = $1"#,
        )
        .bind(cycle.id)
        .bind(format!("{:?}", cycle.status))
        .bind(counters)
        .bind(cycle.last_processed_target_id)
        .bind(cycle.finished_at)
        .execute(&self.pool)
        .await
        .context("failed to update scrape cycle")?;
        Ok(())
    }

    async fn upsert_product(&self, product: Product) -> Result<EntityId> {
        // `active` is intentionally left untouched on conflict: a product
        // already promoted stays active until a later run's circuit
        // breaker pass or expiry sweep says otherwise, never as a side
        // effect of being re-seen mid-run.
        let row: (EntityId,) = sqlx::query_as(
            r#"INSERT INTO products
                 (id, source_product_id, retailer_id, brand, caliber, round_count, active, last_seen_success_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (retailer_id, source_product_id) DO UPDATE
                   SET brand = EXCLUDED.brand, caliber = EXCLUDED.caliber, round_count = EXCLUDED.round_count
               RETURNING id"#,
        )
        .bind(product.id)
        .bind(&product.source_product_id)
        .bind(product.retailer_id)
        .bind(&product.brand)
        .bind(&product.caliber)
        .bind(product.round_count.map(|n| n as i64))
        .bind(product.active)
        .bind(product.last_seen_success_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert product")?;
        Ok(row.0)
    }

    async fn get_product_by_source_id(
        &self,
        _retailer_id: EntityId,
        _source_product_id: &str,
    ) -> Result<Option<Product>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn list_active_products(&self, _retailer_id: EntityId) -> Result<Vec<Product>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn expire_products_not_seen_since(
        &self,
        retailer_id: EntityId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE products SET active = false
               WHERE retailer_id = $1 AND active = true
                 AND (last_seen_success_at IS NULL OR last_seen_success_at < $2)"#,
        )
        .bind(retailer_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("failed to expire stale products")?;
        Ok(result.rows_affected())
    }

    async fn mark_products_seen(&self, ids: &[EntityId], seen_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(r#"UPDATE products SET last_seen_success_at = $2 WHERE id = ANY($1)"#)
            .bind(ids)
            .bind(seen_at)
            .execute(&self.pool)
            .await
            .context("failed to mark products seen")?;
        Ok(())
    }

    async fn activate_products(&self, ids: &[EntityId]) -> Result<()> {
        sqlx::query(r#"UPDATE products SET active = true WHERE id = ANY($1)"#)
            .bind(ids)
            .execute(&self.pool)
            .await
            .context("failed to activate products")?;
        Ok(())
    }

    async fn upsert_price(&self, price: Price) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO prices
                 (product_id, retailer_id, url, price_cents, in_stock, observed_at,
                  ingestion_run_type, ingestion_run_id)
               SELECT $1, $2, $3, $4, $5, $6, $7, $8
               WHERE NOT EXISTS (
                   SELECT 1 FROM prices
                   WHERE product_id = $1 AND retailer_id = $2 AND url = $3
                   ORDER BY observed_at DESC LIMIT 1
                   HAVING price_cents = $4 AND in_stock IS NOT DISTINCT FROM $5
               )"#,
        )
        .bind(price.product_id)
        .bind(price.retailer_id)
        .bind(&price.url)
        .bind(price.price_cents)
        .bind(price.in_stock)
        .bind(price.observed_at)
        .bind(format!("{:?}", price.ingestion_run_type))
        .bind(price.ingestion_run_id)
        .execute(&self.pool)
        .await
        .context("failed to upsert price")?;
        Ok(result.rows_affected() == 1)
    }

    async fn latest_price(&self, _product_id: EntityId, _retailer_id: EntityId, _url: &str) -> Result<Option<Price>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn list_daily_best_price_per_round(
        &self,
        _caliber: &str,
        _window_start: DateTime<Utc>,
        _window_end: DateTime<Utc>,
    ) -> Result<Vec<DailyBestPrice>> {
        // The real query is a shared, version-pinned SQL template (§4.H.2):
        // daily best price-per-round per product, window-bounded, joined
        // against `products.caliber`/`products.round_count`. Not written
        // out until this crate is wired to a live schema.
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn get_current_snapshot(
        &self,
        _caliber: &str,
        _window_days: u32,
    ) -> Result<Option<CaliberMarketSnapshot>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn supersede_and_insert_snapshot(&self, snapshot: CaliberMarketSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to open snapshot transaction")?;

        sqlx::query(
            r#"UPDATE caliber_market_snapshots SET status = 'SUPERSEDED'
               WHERE caliber = $1 AND window_days = $2 AND status = 'CURRENT'"#,
        )
        .bind(&snapshot.caliber)
        .bind(snapshot.window_days as i32)
        .execute(&mut *tx)
        .await
        .context("failed to supersede prior snapshot")?;

        sqlx::query(
            r#"INSERT INTO caliber_market_snapshots
                 (caliber, window_days, status, window_end, sample_count, min_cents, max_cents,
                  p25_cents, median_cents, p75_cents, days_with_data, product_count,
                  retailer_count, dropped_by_bounds, computation_version, duration_ms, computed_at)
               VALUES ($1, $2, 'CURRENT', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"#,
        )
        .bind(&snapshot.caliber)
        .bind(snapshot.window_days as i32)
        .bind(snapshot.window_end)
        .bind(snapshot.sample_count as i64)
        .bind(snapshot.min_cents)
        .bind(snapshot.max_cents)
        .bind(snapshot.p25_cents)
        .bind(snapshot.median_cents)
        .bind(snapshot.p75_cents)
        .bind(snapshot.days_with_data as i32)
        .bind(snapshot.product_count as i64)
        .bind(snapshot.retailer_count as i64)
        .bind(snapshot.dropped_by_bounds as i64)
        .bind(snapshot.computation_version as i32)
        .bind(snapshot.duration_ms as i64)
        .bind(snapshot.computed_at)
        .execute(&mut *tx)
        .await
        .context("failed to insert new snapshot")?;

        tx.commit().await.context("failed to commit snapshot transaction")?;
        Ok(())
    }

    async fn get_scheduler_enabled(&self) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as(r#"SELECT value FROM system_settings WHERE key = 'scheduler_enabled'"#)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read scheduler_enabled setting")?;
        Ok(row.map(|(v,)| v == "true").unwrap_or(true))
    }

    async fn set_scheduler_enabled(&self, enabled: bool, updated_by: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO system_settings (key, value, updated_by, updated_at)
               VALUES ('scheduler_enabled', $1, $2, NOW())
               ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value,
                   updated_by = EXCLUDED.updated_by, updated_at = NOW()"#,
        )
        .bind(if enabled { "true" } else { "false" })
        .bind(updated_by)
        .execute(&self.pool)
        .await
        .context("failed to write scheduler_enabled setting")?;
        Ok(())
    }

    async fn list_running_runs(&self) -> Result<Vec<AffiliateFeedRun>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn list_running_cycles(&self) -> Result<Vec<ScrapeCycle>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn get_watchlist_item(&self, _id: EntityId) -> Result<Option<WatchlistItem>> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }

    async fn update_watchlist_item(&self, _item: &WatchlistItem) -> Result<()> {
        anyhow::bail!("not implemented against a live schema in this crate")
    }
}

// ---------------------------------------------------------------------
// In-memory fake, used by every crate's own test suite (no live Postgres
// available to the test harness).
// ---------------------------------------------------------------------

#[derive(Default)]
struct State {
    sources: HashMap<EntityId, Source>,
    feeds: HashMap<EntityId, AffiliateFeed>,
    adapters: HashMap<EntityId, ScrapeAdapter>,
    runs: HashMap<EntityId, AffiliateFeedRun>,
    targets: HashMap<EntityId, ScrapeTarget>,
    cycles: HashMap<EntityId, ScrapeCycle>,
    products_by_key: HashMap<(EntityId, String), EntityId>,
    products: HashMap<EntityId, Product>,
    prices: Vec<Price>,
    snapshots: HashMap<(String, u32), Vec<CaliberMarketSnapshot>>,
    scheduler_enabled: bool,
    watchlist_items: HashMap<EntityId, WatchlistItem>,
}

#[derive(Default)]
pub struct InMemoryCatalogStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.state.try_lock().expect("uncontended at construction").scheduler_enabled = true;
        store
    }

    pub async fn seed_source(&self, source: Source) {
        self.state.lock().await.sources.insert(source.id, source);
    }

    pub async fn seed_feed(&self, feed: AffiliateFeed) {
        self.state.lock().await.feeds.insert(feed.id, feed);
    }

    pub async fn seed_adapter(&self, adapter: ScrapeAdapter) {
        self.state.lock().await.adapters.insert(adapter.id, adapter);
    }

    pub async fn seed_target(&self, target: ScrapeTarget) {
        self.state.lock().await.targets.insert(target.id, target);
    }

    pub async fn seed_watchlist_item(&self, item: WatchlistItem) {
        self.state.lock().await.watchlist_items.insert(item.id, item);
    }
}

#[async_trait::async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn get_source(&self, id: EntityId) -> Result<Option<Source>> {
        Ok(self.state.lock().await.sources.get(&id).cloned())
    }

    async fn get_affiliate_feed(&self, id: EntityId) -> Result<Option<AffiliateFeed>> {
        Ok(self.state.lock().await.feeds.get(&id).cloned())
    }

    async fn list_due_affiliate_feeds(&self, now: DateTime<Utc>) -> Result<Vec<AffiliateFeed>> {
        Ok(self
            .state
            .lock()
            .await
            .feeds
            .values()
            .filter(|f| {
                f.status == ingest_types::FeedStatus::Active
                    && (f.manual_run_pending || f.next_run_at.map(|t| t <= now).unwrap_or(false))
            })
            .cloned()
            .collect())
    }

    async fn list_all_affiliate_feeds(&self) -> Result<Vec<AffiliateFeed>> {
        Ok(self.state.lock().await.feeds.values().cloned().collect())
    }

    async fn cas_update_affiliate_feed(
        &self,
        feed: &AffiliateFeed,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        let mut state = self.state.lock().await;
        let Some(existing) = state.feeds.get(&feed.id) else {
            return Ok(false);
        };
        if existing.updated_at != expected_updated_at {
            return Ok(false);
        }
        let mut updated = feed.clone();
        updated.updated_at = Utc::now();
        state.feeds.insert(feed.id, updated);
        Ok(true)
    }

    async fn get_adapter(&self, id: EntityId) -> Result<Option<ScrapeAdapter>> {
        Ok(self.state.lock().await.adapters.get(&id).cloned())
    }

    async fn list_due_adapters(&self, now: DateTime<Utc>) -> Result<Vec<ScrapeAdapter>> {
        use std::str::FromStr;
        Ok(self
            .state
            .lock()
            .await
            .adapters
            .values()
            .filter(|a| {
                a.adapter_level_scheduling_enabled
                    && a.enabled
                    && !a.ingestion_paused
                    && a.current_cycle_id.is_none()
                    && cron::Schedule::from_str(&a.schedule_cron)
                        .ok()
                        .and_then(|s| s.after(&(now - chrono::Duration::minutes(1))).next())
                        .map(|next| next <= now)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn cas_update_adapter(
        &self,
        adapter: &ScrapeAdapter,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<CasOutcome> {
        let mut state = self.state.lock().await;
        let Some(existing) = state.adapters.get(&adapter.id) else {
            return Ok(false);
        };
        if existing.updated_at != expected_updated_at {
            return Ok(false);
        }
        let mut updated = adapter.clone();
        updated.updated_at = Utc::now();
        state.adapters.insert(adapter.id, updated);
        Ok(true)
    }

    async fn find_recent_running_run(
        &self,
        feed_id: EntityId,
        trigger: RunTrigger,
        since: DateTime<Utc>,
    ) -> Result<Option<AffiliateFeedRun>> {
        Ok(self
            .state
            .lock()
            .await
            .runs
            .values()
            .filter(|r| {
                r.feed_id == feed_id
                    && r.trigger == trigger
                    && r.status == RunStatus::Running
                    && r.started_at >= since
            })
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn create_run(&self, run: AffiliateFeedRun) -> Result<()> {
        self.state.lock().await.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: EntityId) -> Result<Option<AffiliateFeedRun>> {
        Ok(self.state.lock().await.runs.get(&id).cloned())
    }

    async fn update_run(&self, run: &AffiliateFeedRun) -> Result<()> {
        self.state.lock().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn last_succeeded_run(&self, feed_id: EntityId) -> Result<Option<AffiliateFeedRun>> {
        Ok(self
            .state
            .lock()
            .await
            .runs
            .values()
            .filter(|r| {
                r.feed_id == feed_id && r.status == RunStatus::Succeeded && r.ignored_at.is_none()
            })
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn list_targets_for_adapter(&self, adapter_id: EntityId) -> Result<Vec<ScrapeTarget>> {
        Ok(self
            .state
            .lock()
            .await
            .targets
            .values()
            .filter(|t| t.adapter_id == adapter_id)
            .cloned()
            .collect())
    }

    async fn count_targets_by_last_status(
        &self,
        adapter_id: EntityId,
        status: LastTargetStatus,
    ) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .await
            .targets
            .values()
            .filter(|t| t.adapter_id == adapter_id && t.last_status == Some(status))
            .count() as u64)
    }

    async fn count_global_pending(&self) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .await
            .targets
            .values()
            .filter(|t| {
                matches!(
                    t.last_status,
                    Some(LastTargetStatus::PendingManual) | Some(LastTargetStatus::Enqueued)
                )
            })
            .count() as u64)
    }

    async fn get_target(&self, id: EntityId) -> Result<Option<ScrapeTarget>> {
        Ok(self.state.lock().await.targets.get(&id).cloned())
    }

    async fn upsert_target(&self, target: ScrapeTarget) -> Result<()> {
        self.state.lock().await.targets.insert(target.id, target);
        Ok(())
    }

    async fn list_all_targets(&self) -> Result<Vec<ScrapeTarget>> {
        Ok(self.state.lock().await.targets.values().cloned().collect())
    }

    async fn delete_target(&self, id: EntityId) -> Result<bool> {
        Ok(self.state.lock().await.targets.remove(&id).is_some())
    }

    async fn create_cycle(&self, cycle: ScrapeCycle) -> Result<()> {
        self.state.lock().await.cycles.insert(cycle.id, cycle);
        Ok(())
    }

    async fn get_cycle(&self, id: EntityId) -> Result<Option<ScrapeCycle>> {
        Ok(self.state.lock().await.cycles.get(&id).cloned())
    }

    async fn update_cycle(&self, cycle: &ScrapeCycle) -> Result<()> {
        self.state.lock().await.cycles.insert(cycle.id, cycle.clone());
        Ok(())
    }

    async fn upsert_product(&self, product: Product) -> Result<EntityId> {
        let mut state = self.state.lock().await;
        let Some(source_product_id) = product.source_product_id.clone() else {
            let id = product.id;
            state.products.insert(id, product);
            return Ok(id);
        };
        let key = (product.retailer_id, source_product_id);
        if let Some(existing_id) = state.products_by_key.get(&key).copied() {
            let preserved_active = state.products.get(&existing_id).map(|p| p.active).unwrap_or(product.active);
            let mut updated = product;
            updated.id = existing_id;
            updated.active = preserved_active;
            state.products.insert(existing_id, updated);
            return Ok(existing_id);
        }
        let id = product.id;
        state.products_by_key.insert(key, id);
        state.products.insert(id, product);
        Ok(id)
    }

    async fn get_product_by_source_id(
        &self,
        retailer_id: EntityId,
        source_product_id: &str,
    ) -> Result<Option<Product>> {
        let state = self.state.lock().await;
        let Some(id) = state
            .products_by_key
            .get(&(retailer_id, source_product_id.to_string()))
            .copied()
        else {
            return Ok(None);
        };
        Ok(state.products.get(&id).cloned())
    }

    async fn list_active_products(&self, retailer_id: EntityId) -> Result<Vec<Product>> {
        Ok(self
            .state
            .lock()
            .await
            .products
            .values()
            .filter(|p| p.retailer_id == retailer_id && p.active)
            .cloned()
            .collect())
    }

    async fn expire_products_not_seen_since(
        &self,
        retailer_id: EntityId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut expired = 0u64;
        for product in state.products.values_mut() {
            if product.retailer_id == retailer_id
                && product.active
                && product.last_seen_success_at.map(|t| t < cutoff).unwrap_or(true)
            {
                product.active = false;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn mark_products_seen(&self, ids: &[EntityId], seen_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(product) = state.products.get_mut(id) {
                product.last_seen_success_at = Some(seen_at);
            }
        }
        Ok(())
    }

    async fn activate_products(&self, ids: &[EntityId]) -> Result<()> {
        let mut state = self.state.lock().await;
        for id in ids {
            if let Some(product) = state.products.get_mut(id) {
                product.active = true;
            }
        }
        Ok(())
    }

    async fn upsert_price(&self, price: Price) -> Result<bool> {
        let mut state = self.state.lock().await;
        let most_recent = state
            .prices
            .iter()
            .filter(|p| {
                p.product_id == price.product_id && p.retailer_id == price.retailer_id && p.url == price.url
            })
            .max_by_key(|p| p.observed_at);

        if let Some(prev) = most_recent {
            if prev.price_cents == price.price_cents && prev.in_stock == price.in_stock {
                return Ok(false);
            }
        }
        state.prices.push(price);
        Ok(true)
    }

    async fn latest_price(&self, product_id: EntityId, retailer_id: EntityId, url: &str) -> Result<Option<Price>> {
        Ok(self
            .state
            .lock()
            .await
            .prices
            .iter()
            .filter(|p| p.product_id == product_id && p.retailer_id == retailer_id && p.url == url)
            .max_by_key(|p| p.observed_at)
            .cloned())
    }

    async fn list_daily_best_price_per_round(
        &self,
        caliber: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<DailyBestPrice>> {
        let state = self.state.lock().await;

        let round_counts: HashMap<EntityId, (EntityId, u32)> = state
            .products
            .iter()
            .filter(|p| p.caliber.as_deref() == Some(caliber))
            .filter_map(|p| p.round_count.map(|rc| (p.id, (p.retailer_id, rc))))
            .filter(|(_, (_, rc))| *rc > 0)
            .collect();

        let mut best: HashMap<(NaiveDate, EntityId), DailyBestPrice> = HashMap::new();
        for price in state
            .prices
            .iter()
            .filter(|p| p.observed_at >= window_start && p.observed_at <= window_end)
        {
            let Some((retailer_id, round_count)) = round_counts.get(&price.product_id).copied() else {
                continue;
            };
            let price_per_round_cents = price.price_cents / round_count as i64;
            let day = price.observed_at.date_naive();
            let key = (day, price.product_id);
            let entry = best.entry(key).or_insert(DailyBestPrice {
                day,
                product_id: price.product_id,
                retailer_id,
                price_per_round_cents,
            });
            if price_per_round_cents < entry.price_per_round_cents {
                *entry = DailyBestPrice { day, product_id: price.product_id, retailer_id, price_per_round_cents };
            }
        }

        Ok(best.into_values().collect())
    }

    async fn get_current_snapshot(
        &self,
        caliber: &str,
        window_days: u32,
    ) -> Result<Option<CaliberMarketSnapshot>> {
        Ok(self
            .state
            .lock()
            .await
            .snapshots
            .get(&(caliber.to_string(), window_days))
            .and_then(|versions| versions.iter().find(|s| s.status == SnapshotStatus::Current))
            .cloned())
    }

    async fn supersede_and_insert_snapshot(&self, snapshot: CaliberMarketSnapshot) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = (snapshot.caliber.clone(), snapshot.window_days);
        let versions = state.snapshots.entry(key).or_default();
        for existing in versions.iter_mut() {
            if existing.status == SnapshotStatus::Current {
                existing.status = SnapshotStatus::Superseded;
            }
        }
        versions.push(snapshot);
        Ok(())
    }

    async fn get_scheduler_enabled(&self) -> Result<bool> {
        Ok(self.state.lock().await.scheduler_enabled)
    }

    async fn set_scheduler_enabled(&self, enabled: bool, _updated_by: &str) -> Result<()> {
        self.state.lock().await.scheduler_enabled = enabled;
        Ok(())
    }

    async fn list_running_runs(&self) -> Result<Vec<AffiliateFeedRun>> {
        Ok(self
            .state
            .lock()
            .await
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .cloned()
            .collect())
    }

    async fn list_running_cycles(&self) -> Result<Vec<ScrapeCycle>> {
        Ok(self
            .state
            .lock()
            .await
            .cycles
            .values()
            .filter(|c| c.status == ingest_types::CycleStatus::Running)
            .cloned()
            .collect())
    }

    async fn get_watchlist_item(&self, id: EntityId) -> Result<Option<WatchlistItem>> {
        Ok(self.state.lock().await.watchlist_items.get(&id).cloned())
    }

    async fn update_watchlist_item(&self, item: &WatchlistItem) -> Result<()> {
        self.state.lock().await.watchlist_items.insert(item.id, item.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_types::{FeedFormat, FeedMemo, FeedStatus, FeedTransport, IngestionRunType};

    fn feed(status: FeedStatus, next_run_at: Option<DateTime<Utc>>) -> AffiliateFeed {
        AffiliateFeed {
            id: EntityId::new_v4(),
            source_id: EntityId::new_v4(),
            transport: FeedTransport::Https,
            format: FeedFormat::Csv,
            schedule_hours: 6,
            expiry_hours: 72,
            max_row_count: 100_000,
            last_run_memo: FeedMemo { mtime: None, size: None, content_hash: None },
            consecutive_failures: 0,
            manual_run_pending: false,
            status,
            next_run_at,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn list_due_affiliate_feeds_filters_by_status_and_next_run_at() {
        let store = InMemoryCatalogStore::new();
        let due = feed(FeedStatus::Active, Some(Utc::now() - chrono::Duration::minutes(1)));
        let not_due = feed(FeedStatus::Active, Some(Utc::now() + chrono::Duration::hours(1)));
        let disabled = feed(FeedStatus::Disabled, Some(Utc::now() - chrono::Duration::minutes(1)));
        store.seed_feed(due.clone()).await;
        store.seed_feed(not_due).await;
        store.seed_feed(disabled).await;

        let results = store.list_due_affiliate_feeds(Utc::now()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, due.id);
    }

    #[tokio::test]
    async fn list_all_affiliate_feeds_ignores_due_filter() {
        let store = InMemoryCatalogStore::new();
        store.seed_feed(feed(FeedStatus::Active, Some(Utc::now() + chrono::Duration::hours(1)))).await;
        store.seed_feed(feed(FeedStatus::Draft, None)).await;

        let results = store.list_all_affiliate_feeds().await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn cas_update_affiliate_feed_rejects_stale_expected_updated_at() {
        let store = InMemoryCatalogStore::new();
        let f = feed(FeedStatus::Active, None);
        store.seed_feed(f.clone()).await;

        let stale = f.updated_at - chrono::Duration::seconds(1);
        let ok = store.cas_update_affiliate_feed(&f, stale).await.unwrap();
        assert!(!ok);

        let ok = store.cas_update_affiliate_feed(&f, f.updated_at).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn upsert_product_dedupes_on_retailer_and_source_product_id() {
        let store = InMemoryCatalogStore::new();
        let retailer_id = EntityId::new_v4();
        let p1 = Product {
            id: EntityId::new_v4(),
            source_product_id: Some("sku-1".into()),
            retailer_id,
            brand: Some("Acme".into()),
            caliber: None,
            round_count: None,
            active: true,
            last_seen_success_at: None,
        };
        let first_id = store.upsert_product(p1.clone()).await.unwrap();

        let p2 = Product { id: EntityId::new_v4(), brand: Some("Acme Updated".into()), ..p1 };
        let second_id = store.upsert_product(p2).await.unwrap();

        assert_eq!(first_id, second_id);
    }

    #[tokio::test]
    async fn upsert_product_preserves_active_flag_on_conflict() {
        let store = InMemoryCatalogStore::new();
        let retailer_id = EntityId::new_v4();
        let promoted = Product {
            id: EntityId::new_v4(),
            source_product_id: Some("sku-1".into()),
            retailer_id,
            brand: Some("Acme".into()),
            caliber: None,
            round_count: None,
            active: true,
            last_seen_success_at: None,
        };
        let id = store.upsert_product(promoted.clone()).await.unwrap();
        store.activate_products(&[id]).await.unwrap();

        // Re-seen next run with a provisional `active: false` — must not
        // demote a product that was already promoted.
        let reseen = Product { id: EntityId::new_v4(), active: false, ..promoted };
        let second_id = store.upsert_product(reseen).await.unwrap();
        assert_eq!(id, second_id);

        let active = store.list_active_products(retailer_id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].active);
    }

    fn target(adapter_id: EntityId) -> ScrapeTarget {
        ScrapeTarget {
            id: EntityId::new_v4(),
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
            consecutive_failures: 0,
            robots_path_blocked: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn list_all_targets_spans_every_adapter() {
        let store = InMemoryCatalogStore::new();
        let a1 = target(EntityId::new_v4());
        let a2 = target(EntityId::new_v4());
        store.seed_target(a1.clone()).await;
        store.seed_target(a2.clone()).await;

        let mut ids: Vec<_> = store.list_all_targets().await.unwrap().into_iter().map(|t| t.id).collect();
        ids.sort();
        let mut expected = vec![a1.id, a2.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn delete_target_reports_whether_it_existed() {
        let store = InMemoryCatalogStore::new();
        let t = target(EntityId::new_v4());
        store.seed_target(t.clone()).await;

        assert!(store.delete_target(t.id).await.unwrap());
        assert!(store.get_target(t.id).await.unwrap().is_none());
        assert!(!store.delete_target(t.id).await.unwrap());
    }

    #[tokio::test]
    async fn activate_products_flips_flag_for_given_ids_only() {
        let store = InMemoryCatalogStore::new();
        let retailer_id = EntityId::new_v4();
        let make = |sku: &str| Product {
            id: EntityId::new_v4(),
            source_product_id: Some(sku.into()),
            retailer_id,
            brand: None,
            caliber: None,
            round_count: None,
            active: false,
            last_seen_success_at: None,
        };

        let a = store.upsert_product(make("a")).await.unwrap();
        let b = store.upsert_product(make("b")).await.unwrap();

        store.activate_products(&[a]).await.unwrap();

        let active = store.list_active_products(retailer_id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a);
        assert_ne!(active[0].id, b);
    }

    #[tokio::test]
    async fn upsert_price_skips_no_op_duplicate() {
        let store = InMemoryCatalogStore::new();
        let product_id = EntityId::new_v4();
        let retailer_id = EntityId::new_v4();
        let price = |cents: i64, observed: DateTime<Utc>| Price {
            product_id,
            retailer_id,
            url: "https://example.com/p".into(),
            price_cents: cents,
            in_stock: Some(true),
            observed_at: observed,
            ingestion_run_type: IngestionRunType::AffiliateFeed,
            ingestion_run_id: EntityId::new_v4(),
        };

        let now = Utc::now();
        assert!(store.upsert_price(price(1999, now)).await.unwrap());
        assert!(!store.upsert_price(price(1999, now + chrono::Duration::seconds(1))).await.unwrap());
        assert!(store.upsert_price(price(1899, now + chrono::Duration::seconds(2))).await.unwrap());
    }

    #[tokio::test]
    async fn list_daily_best_price_per_round_reduces_to_lowest_per_product_per_day() {
        let store = InMemoryCatalogStore::new();
        let retailer_id = EntityId::new_v4();

        let box_of_50 = Product {
            id: EntityId::new_v4(),
            source_product_id: Some("sku-50".into()),
            retailer_id,
            brand: Some("Acme".into()),
            caliber: Some("9MM".into()),
            round_count: Some(50),
            active: true,
            last_seen_success_at: None,
        };
        let other_caliber = Product {
            id: EntityId::new_v4(),
            source_product_id: Some("sku-other".into()),
            retailer_id,
            brand: Some("Acme".into()),
            caliber: Some("308_WIN".into()),
            round_count: Some(20),
            active: true,
            last_seen_success_at: None,
        };
        let box_id = store.upsert_product(box_of_50.clone()).await.unwrap();
        store.upsert_product(other_caliber.clone()).await.unwrap();

        let day1 = Utc::now() - chrono::Duration::days(1);
        let day2 = Utc::now();
        let price = |product_id: EntityId, cents: i64, observed: DateTime<Utc>| Price {
            product_id,
            retailer_id,
            url: "https://example.com/p".into(),
            price_cents: cents,
            in_stock: Some(true),
            observed_at: observed,
            ingestion_run_type: IngestionRunType::AffiliateFeed,
            ingestion_run_id: EntityId::new_v4(),
        };

        // Same day, two observations: only the lower price-per-round survives.
        store.upsert_price(price(box_id, 2500, day1)).await.unwrap();
        store.upsert_price(price(box_id, 2000, day1 + chrono::Duration::hours(1))).await.unwrap();
        store.upsert_price(price(box_id, 3000, day2)).await.unwrap();
        // Different caliber entirely, must not leak into the "9MM" window.
        store.upsert_price(price(other_caliber.id, 1000, day1)).await.unwrap();

        let rows = store
            .list_daily_best_price_per_round(
                "9MM",
                day1 - chrono::Duration::hours(1),
                day2 + chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        let on_day1 = rows.iter().find(|r| r.day == day1.date_naive()).unwrap();
        assert_eq!(on_day1.price_per_round_cents, 2000 / 50);
        let on_day2 = rows.iter().find(|r| r.day == day2.date_naive()).unwrap();
        assert_eq!(on_day2.price_per_round_cents, 3000 / 50);
    }

    #[tokio::test]
    async fn supersede_and_insert_snapshot_keeps_exactly_one_current() {
        let store = InMemoryCatalogStore::new();
        let mk = |version: u32| CaliberMarketSnapshot {
            caliber: "9mm".into(),
            window_days: 30,
            status: SnapshotStatus::Current,
            window_end: Utc::now(),
            sample_count: 42,
            min_cents: Some(1000),
            max_cents: Some(5000),
            p25_cents: Some(1500),
            median_cents: Some(2000),
            p75_cents: Some(3000),
            days_with_data: 30,
            product_count: 10,
            retailer_count: 4,
            dropped_by_bounds: 2,
            computation_version: version,
            duration_ms: 120,
            computed_at: Utc::now(),
        };

        store.supersede_and_insert_snapshot(mk(1)).await.unwrap();
        store.supersede_and_insert_snapshot(mk(2)).await.unwrap();

        let current = store.get_current_snapshot("9mm", 30).await.unwrap().unwrap();
        assert_eq!(current.computation_version, 2);
    }
}
