//! Pure percentile/aggregate math over a reduction pass (§4.H.2). No I/O;
//! exercised directly by unit tests independent of any store backend.

use ingest_types::DailyBestPrice;

/// Lower/upper bound (exclusive) on an admissible price-per-round, in cents:
/// `(0, 10)` dollars.
const MIN_PRICE_PER_ROUND_CENTS: i64 = 0;
const MAX_PRICE_PER_ROUND_CENTS: i64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SnapshotStats {
    pub sample_count: u64,
    pub min_cents: Option<i64>,
    pub max_cents: Option<i64>,
    pub p25_cents: Option<i64>,
    pub median_cents: Option<i64>,
    pub p75_cents: Option<i64>,
    pub days_with_data: u32,
    pub product_count: u64,
    pub retailer_count: u64,
    pub dropped_by_bounds: u64,
}

/// Reduces daily-best rows to the aggregate/percentile set a
/// `CaliberMarketSnapshot` is built from. Rows outside `(0, 10)` dollars
/// price-per-round are dropped and counted in `dropped_by_bounds`.
pub fn compute(rows: &[DailyBestPrice], min_sample_count: u64) -> SnapshotStats {
    let dropped_by_bounds = rows
        .iter()
        .filter(|r| r.price_per_round_cents <= MIN_PRICE_PER_ROUND_CENTS || r.price_per_round_cents >= MAX_PRICE_PER_ROUND_CENTS)
        .count() as u64;

    let mut admissible: Vec<&DailyBestPrice> = rows
        .iter()
        .filter(|r| r.price_per_round_cents > MIN_PRICE_PER_ROUND_CENTS && r.price_per_round_cents < MAX_PRICE_PER_ROUND_CENTS)
        .collect();
    admissible.sort_by_key(|r| r.price_per_round_cents);

    let sample_count = admissible.len() as u64;
    let days_with_data = admissible.iter().map(|r| r.day).collect::<std::collections::HashSet<_>>().len() as u32;
    let product_count = admissible.iter().map(|r| r.product_id).collect::<std::collections::HashSet<_>>().len() as u64;
    let retailer_count = admissible.iter().map(|r| r.retailer_id).collect::<std::collections::HashSet<_>>().len() as u64;

    if admissible.is_empty() || sample_count < min_sample_count {
        return SnapshotStats {
            sample_count,
            min_cents: None,
            max_cents: None,
            p25_cents: None,
            median_cents: None,
            p75_cents: None,
            days_with_data,
            product_count,
            retailer_count,
            dropped_by_bounds,
        };
    }

    SnapshotStats {
        sample_count,
        min_cents: Some(admissible.first().unwrap().price_per_round_cents),
        max_cents: Some(admissible.last().unwrap().price_per_round_cents),
        p25_cents: Some(percentile(&admissible, 0.25)),
        median_cents: Some(percentile(&admissible, 0.50)),
        p75_cents: Some(percentile(&admissible, 0.75)),
        days_with_data,
        product_count,
        retailer_count,
        dropped_by_bounds,
    }
}

/// Nearest-rank percentile over an already-sorted-ascending slice.
fn percentile(sorted: &[&DailyBestPrice], p: f64) -> i64 {
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1].price_per_round_cents
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_types::EntityId;
    use chrono::NaiveDate;

    fn row(day: u32, product: EntityId, cents: i64) -> DailyBestPrice {
        DailyBestPrice {
            day: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
            product_id: product,
            retailer_id: EntityId::new_v4(),
            price_per_round_cents: cents,
        }
    }

    #[test]
    fn below_min_sample_count_yields_null_percentiles_but_keeps_counts() {
        let p = EntityId::new_v4();
        let rows = vec![row(1, p, 20), row(2, p, 22), row(3, p, 25)];
        let stats = compute(&rows, 5);
        assert_eq!(stats.sample_count, 3);
        assert!(stats.median_cents.is_none());
        assert!(stats.min_cents.is_none());
        assert_eq!(stats.days_with_data, 3);
    }

    #[test]
    fn computes_percentiles_over_admissible_rows() {
        let p = EntityId::new_v4();
        let rows: Vec<_> = (1..=8).map(|d| row(d, p, (d * 10) as i64)).collect();
        let stats = compute(&rows, 5);
        assert_eq!(stats.sample_count, 8);
        assert_eq!(stats.min_cents, Some(10));
        assert_eq!(stats.max_cents, Some(80));
        assert_eq!(stats.median_cents, Some(40));
    }

    #[test]
    fn drops_rows_outside_price_per_round_bounds() {
        let p = EntityId::new_v4();
        let mut rows: Vec<_> = (1..=6).map(|d| row(d, p, (d * 100) as i64)).collect();
        rows.push(row(7, p, 1000));
        rows.push(row(8, p, 0));
        let stats = compute(&rows, 5);
        assert_eq!(stats.dropped_by_bounds, 2);
        assert_eq!(stats.sample_count, 6);
    }

    #[test]
    fn distinct_product_and_retailer_counts() {
        let p1 = EntityId::new_v4();
        let p2 = EntityId::new_v4();
        let rows = vec![row(1, p1, 20), row(1, p2, 25), row(2, p1, 22), row(2, p2, 24), row(3, p1, 21)];
        let stats = compute(&rows, 5);
        assert_eq!(stats.product_count, 2);
        assert_eq!(stats.days_with_data, 3);
    }
}
