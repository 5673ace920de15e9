//! Circuit breaker math (§4.E Phase 2): pure functions over a run's
//! metrics, kept free of I/O so the trip conditions are trivially unit
//! testable against the exact thresholds in the spec.

use ingest_types::{CircuitBreakerMetrics, RunMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    Passed,
    /// Breaker would have tripped, but a global bypass forced `passed=true`.
    PassedWithBypassWarning,
    Tripped { reason: BreakerTripReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTripReason {
    WouldExpireRatio,
    UrlHashFallbackRatio,
    PromotionMismatch,
}

impl BreakerTripReason {
    pub fn message(self) -> &'static str {
        match self {
            BreakerTripReason::WouldExpireRatio => "would-expire ratio exceeds threshold",
            BreakerTripReason::UrlHashFallbackRatio => "url-hash-fallback ratio exceeds threshold",
            BreakerTripReason::PromotionMismatch => "zero products seen but products were upserted",
        }
    }
}

pub struct BreakerThresholds {
    pub min_active_count: u64,
    pub expire_ratio_threshold: f64,
    pub url_hash_fallback_ratio_threshold: f64,
    pub url_hash_fallback_min_upserted: u64,
}

/// Evaluates the breaker per §4.E Phase 2. `bypass` mirrors the global
/// `bypassCircuitBreaker` override: a would-be trip still surfaces as
/// `PassedWithBypassWarning` so callers can log the near-miss.
pub fn evaluate(
    metrics: &RunMetrics,
    breaker: &CircuitBreakerMetrics,
    thresholds: &BreakerThresholds,
    bypass: bool,
) -> BreakerOutcome {
    let trip_reason = trip_reason(metrics, breaker, thresholds);

    match trip_reason {
        Some(_) if bypass => BreakerOutcome::PassedWithBypassWarning,
        Some(reason) => BreakerOutcome::Tripped { reason },
        None => BreakerOutcome::Passed,
    }
}

fn trip_reason(
    metrics: &RunMetrics,
    breaker: &CircuitBreakerMetrics,
    thresholds: &BreakerThresholds,
) -> Option<BreakerTripReason> {
    if breaker.active_count_before < thresholds.min_active_count {
        return None;
    }

    let would_expire_ratio = ratio(breaker.would_expire_count, breaker.active_count_before);
    if would_expire_ratio > thresholds.expire_ratio_threshold {
        return Some(BreakerTripReason::WouldExpireRatio);
    }

    if metrics.products_upserted >= thresholds.url_hash_fallback_min_upserted {
        let fallback_ratio = ratio(metrics.url_hash_fallback_count, metrics.products_upserted);
        if fallback_ratio > thresholds.url_hash_fallback_ratio_threshold {
            return Some(BreakerTripReason::UrlHashFallbackRatio);
        }
    }

    if breaker.seen_success_count == 0 && metrics.products_upserted > 0 {
        return Some(BreakerTripReason::PromotionMismatch);
    }

    None
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Data-quality crossing-edge check (§4.E): fires only when the current
/// run crosses from below-threshold to at-or-above-threshold relative to
/// the previous SUCCEEDED run.
pub fn crosses_data_quality_edge(
    current_upserted: u64,
    current_missing_brand: u64,
    previous_upserted: Option<u64>,
    previous_missing_brand: Option<u64>,
    min_upserted: u64,
    threshold_pct: f64,
) -> bool {
    if current_upserted < min_upserted {
        return false;
    }
    let current_ratio_pct = ratio(current_missing_brand, current_upserted) * 100.0;
    if current_ratio_pct < threshold_pct {
        return false;
    }

    let previous_ratio_pct = match (previous_upserted, previous_missing_brand) {
        (Some(prev_upserted), Some(prev_missing)) if prev_upserted > 0 => {
            ratio(prev_missing, prev_upserted) * 100.0
        }
        _ => 0.0,
    };

    previous_ratio_pct < threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> BreakerThresholds {
        BreakerThresholds {
            min_active_count: 50,
            expire_ratio_threshold: 0.30,
            url_hash_fallback_ratio_threshold: 0.20,
            url_hash_fallback_min_upserted: 20,
        }
    }

    #[test]
    fn passes_below_min_active_count_regardless_of_ratios() {
        let metrics = RunMetrics { products_upserted: 100, url_hash_fallback_count: 90, ..Default::default() };
        let breaker = CircuitBreakerMetrics { active_count_before: 49, would_expire_count: 40, seen_success_count: 0 };
        assert_eq!(evaluate(&metrics, &breaker, &thresholds(), false), BreakerOutcome::Passed);
    }

    #[test]
    fn trips_on_would_expire_ratio() {
        let metrics = RunMetrics::default();
        let breaker = CircuitBreakerMetrics { active_count_before: 100, would_expire_count: 31, seen_success_count: 5 };
        assert_eq!(
            evaluate(&metrics, &breaker, &thresholds(), false),
            BreakerOutcome::Tripped { reason: BreakerTripReason::WouldExpireRatio }
        );
    }

    #[test]
    fn would_expire_ratio_at_exactly_threshold_does_not_trip() {
        let metrics = RunMetrics::default();
        let breaker = CircuitBreakerMetrics { active_count_before: 100, would_expire_count: 30, seen_success_count: 5 };
        assert_eq!(evaluate(&metrics, &breaker, &thresholds(), false), BreakerOutcome::Passed);
    }

    #[test]
    fn trips_on_url_hash_fallback_ratio_only_above_min_upserted() {
        let metrics = RunMetrics { products_upserted: 19, url_hash_fallback_count: 18, ..Default::default() };
        let breaker = CircuitBreakerMetrics { active_count_before: 60, would_expire_count: 0, seen_success_count: 19 };
        assert_eq!(evaluate(&metrics, &breaker, &thresholds(), false), BreakerOutcome::Passed);

        let metrics = RunMetrics { products_upserted: 20, url_hash_fallback_count: 18, ..Default::default() };
        assert_eq!(
            evaluate(&metrics, &breaker, &thresholds(), false),
            BreakerOutcome::Tripped { reason: BreakerTripReason::UrlHashFallbackRatio }
        );
    }

    #[test]
    fn trips_on_promotion_mismatch() {
        let metrics = RunMetrics { products_upserted: 5, ..Default::default() };
        let breaker = CircuitBreakerMetrics { active_count_before: 60, would_expire_count: 0, seen_success_count: 0 };
        assert_eq!(
            evaluate(&metrics, &breaker, &thresholds(), false),
            BreakerOutcome::Tripped { reason: BreakerTripReason::PromotionMismatch }
        );
    }

    #[test]
    fn bypass_forces_pass_with_warning() {
        let metrics = RunMetrics::default();
        let breaker = CircuitBreakerMetrics { active_count_before: 100, would_expire_count: 31, seen_success_count: 5 };
        assert_eq!(
            evaluate(&metrics, &breaker, &thresholds(), true),
            BreakerOutcome::PassedWithBypassWarning
        );
    }

    #[test]
    fn data_quality_fires_only_on_crossing_edge() {
        assert!(crosses_data_quality_edge(60, 10, Some(60), Some(2), 50, 10.0));
        // Already above threshold last run too: not a crossing edge.
        assert!(!crosses_data_quality_edge(60, 10, Some(60), Some(8), 50, 10.0));
        // Below min_upserted: never fires.
        assert!(!crosses_data_quality_edge(30, 10, None, None, 50, 10.0));
    }
}
