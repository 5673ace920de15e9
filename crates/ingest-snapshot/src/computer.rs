//! Snapshot computer orchestration (§4.H): one invocation walks every
//! canonical caliber × configured window, reduces daily-best rows to
//! aggregate stats, and supersede-and-inserts the result.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ingest_config::SnapshotConfig;
use ingest_store::CatalogStore;
use ingest_types::{CaliberMarketSnapshot, DailyBestPrice, SnapshotStatus, CANONICAL_CALIBERS};

use crate::aliases::spellings_for;
use crate::stats;

/// Bumped whenever the query template or the reduction math changes in a
/// way that would make old and new snapshots non-comparable.
pub const COMPUTATION_VERSION: u32 = 1;

pub struct SnapshotComputer {
    pub store: Arc<dyn CatalogStore>,
    pub config: SnapshotConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComputeReport {
    pub computed: u32,
    pub insufficient: u32,
    pub skipped_on_race: u32,
}

impl SnapshotComputer {
    /// Computes and persists a snapshot for every `(caliber, windowDays)`
    /// pair. `windowEnd` is frozen once here and shared across every
    /// caliber computed in this invocation.
    pub async fn compute_all(&self) -> Result<ComputeReport> {
        let window_end = Utc::now();
        let mut report = ComputeReport::default();

        for &caliber in CANONICAL_CALIBERS {
            for &window_days in &self.config.window_days {
                match self.compute_one(caliber, window_days, window_end).await {
                    Ok(insufficient) => {
                        report.computed += 1;
                        if insufficient {
                            report.insufficient += 1;
                        }
                    }
                    Err(err) if is_unique_violation(&err) => {
                        tracing::warn!(caliber, window_days, %err, "snapshot insert raced a concurrent run, skipping");
                        report.skipped_on_race += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(report)
    }

    /// Returns `true` if the computed snapshot is below
    /// `SnapshotConfig::min_sample_count` ("insufficient").
    async fn compute_one(&self, caliber: &str, window_days: u32, window_end: DateTime<Utc>) -> Result<bool> {
        let started = Instant::now();
        let window_start = window_end - chrono::Duration::days(window_days as i64);

        let mut rows: Vec<DailyBestPrice> = Vec::new();
        for spelling in spellings_for(caliber) {
            rows.extend(
                self.store
                    .list_daily_best_price_per_round(spelling, window_start, window_end)
                    .await
                    .with_context(|| format!("failed to list daily best prices for {caliber} ({spelling})"))?,
            );
        }

        let computed = stats::compute(&rows, self.config.min_sample_count);
        let insufficient = computed.sample_count < self.config.min_sample_count;

        let snapshot = CaliberMarketSnapshot {
            caliber: caliber.to_string(),
            window_days,
            status: SnapshotStatus::Current,
            window_end,
            sample_count: computed.sample_count,
            min_cents: computed.min_cents,
            max_cents: computed.max_cents,
            p25_cents: computed.p25_cents,
            median_cents: computed.median_cents,
            p75_cents: computed.p75_cents,
            days_with_data: computed.days_with_data,
            product_count: computed.product_count,
            retailer_count: computed.retailer_count,
            dropped_by_bounds: computed.dropped_by_bounds,
            computation_version: COMPUTATION_VERSION,
            duration_ms: started.elapsed().as_millis() as u64,
            computed_at: Utc::now(),
        };

        self.store
            .supersede_and_insert_snapshot(snapshot)
            .await
            .with_context(|| format!("failed to supersede-and-insert snapshot for {caliber}/{window_days}d"))?;

        Ok(insufficient)
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.to_string().to_lowercase().contains("unique")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_store::InMemoryCatalogStore;
    use ingest_types::{EntityId, Price, Product};

    fn new_store() -> Arc<InMemoryCatalogStore> {
        Arc::new(InMemoryCatalogStore::new())
    }

    async fn seed(store: &InMemoryCatalogStore, caliber: &str, round_count: u32, cents: i64, observed_at: DateTime<Utc>) {
        let product = Product {
            id: EntityId::new_v4(),
            source_product_id: Some(format!("sku-{}", EntityId::new_v4())),
            retailer_id: EntityId::new_v4(),
            brand: Some("Acme".into()),
            caliber: Some(caliber.to_string()),
            round_count: Some(round_count),
            active: true,
            last_seen_success_at: None,
        };
        let id = store.upsert_product(product.clone()).await.unwrap();
        store
            .upsert_price(Price {
                product_id: id,
                retailer_id: product.retailer_id,
                url: "https://example.com/p".into(),
                price_cents: cents,
                in_stock: Some(true),
                observed_at,
                ingestion_run_type: ingest_types::IngestionRunType::AffiliateFeed,
                ingestion_run_id: EntityId::new_v4(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insufficient_sample_count_is_reported_but_still_written() {
        let store = new_store();
        let now = Utc::now();
        seed(&store, "9MM", 50, 2000, now).await;

        let computer = SnapshotComputer { store: store.clone(), config: SnapshotConfig::default() };
        let report = computer.compute_all().await.unwrap();
        assert!(report.insufficient > 0);

        let snapshot =
            store.get_current_snapshot("9MM", computer.config.window_days[0]).await.unwrap().unwrap();
        assert_eq!(snapshot.sample_count, 1);
        assert!(snapshot.median_cents.is_none());
    }

    #[tokio::test]
    async fn sufficient_sample_computes_percentiles_and_supersedes() {
        let store = new_store();
        let base = Utc::now() - chrono::Duration::days(3);
        for i in 0..6i64 {
            seed(&store, "9MM", 50, 1500 + i * 100, base + chrono::Duration::hours(i)).await;
        }

        let computer = SnapshotComputer { store: store.clone(), config: SnapshotConfig::default() };
        computer.compute_all().await.unwrap();

        let snapshot =
            store.get_current_snapshot("9MM", computer.config.window_days[0]).await.unwrap().unwrap();
        assert!(snapshot.median_cents.is_some());
        assert_eq!(snapshot.status, SnapshotStatus::Current);

        // Recomputing must supersede the prior CURRENT row, never duplicate it.
        computer.compute_all().await.unwrap();
        let current_count = store
            .get_current_snapshot("9MM", computer.config.window_days[0])
            .await
            .unwrap()
            .is_some();
        assert!(current_count);
    }

    #[tokio::test]
    async fn other_caliber_never_computed() {
        let store = new_store();
        seed(&store, ingest_types::OTHER_CALIBER, 50, 1500, Utc::now()).await;

        let computer = SnapshotComputer { store: store.clone(), config: SnapshotConfig::default() };
        computer.compute_all().await.unwrap();

        for &caliber in CANONICAL_CALIBERS {
            let snap = store.get_current_snapshot(caliber, computer.config.window_days[0]).await.unwrap();
            if let Some(snap) = snap {
                assert_eq!(snap.sample_count, 0);
            }
        }
    }
}
