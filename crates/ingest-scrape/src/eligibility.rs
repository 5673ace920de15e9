//! Pure eligibility and cap-enforcement math (§4.F), kept free of I/O so
//! the exact thresholds are unit testable in isolation.

use ingest_types::{ScrapeAdapter, ScrapeTarget, Source, TargetStatus};

pub fn target_eligible(target: &ScrapeTarget, source: &Source, adapter: &ScrapeAdapter) -> bool {
    target.enabled
        && target.status == TargetStatus::Active
        && !target.robots_path_blocked
        && source.scrape_enabled
        && source.robots_compliant
        && adapter.enabled
        && !adapter.ingestion_paused
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualTriggerOutcome {
    Accepted,
    Backpressure { retry_after_ms: u64 },
}

const MANUAL_BACKOFF_PER_ITEM_MS: u64 = 30_000;
const MANUAL_BACKOFF_CAP_MS: u64 = 5 * 60 * 1000;

/// Manual-trigger intake caps (§4.F): at most 10 `PENDING_MANUAL` per
/// adapter, 1000 `ENQUEUED` per adapter, 10,000 pending globally.
pub fn check_manual_trigger_caps(
    pending_manual_count: u64,
    enqueued_count: u64,
    global_pending_count: u64,
) -> ManualTriggerOutcome {
    let backlog = if pending_manual_count >= ingest_types::MAX_PENDING_MANUAL_PER_ADAPTER {
        Some(pending_manual_count)
    } else if enqueued_count >= ingest_types::MAX_ENQUEUED_PER_ADAPTER {
        Some(enqueued_count)
    } else if global_pending_count >= ingest_types::MAX_PENDING_GLOBAL {
        Some(global_pending_count)
    } else {
        None
    };

    match backlog {
        Some(backlog) => ManualTriggerOutcome::Backpressure {
            retry_after_ms: (backlog * MANUAL_BACKOFF_PER_ITEM_MS).min(MANUAL_BACKOFF_CAP_MS),
        },
        None => ManualTriggerOutcome::Accepted,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCycleRefusal {
    AlreadyRunning,
    AdapterUnavailable,
    NoEligibleTargets,
}

/// Adapter-level cycle trigger refusal conditions (§4.F): a non-null
/// `currentCycleId`, a disabled/paused adapter, or zero eligible targets.
pub fn check_adapter_cycle_trigger(
    adapter: &ScrapeAdapter,
    eligible_target_count: usize,
) -> Result<(), AdapterCycleRefusal> {
    if adapter.current_cycle_id.is_some() {
        return Err(AdapterCycleRefusal::AlreadyRunning);
    }
    if !adapter.enabled || adapter.ingestion_paused {
        return Err(AdapterCycleRefusal::AdapterUnavailable);
    }
    if eligible_target_count == 0 {
        return Err(AdapterCycleRefusal::NoEligibleTargets);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ingest_types::{EntityId, LastTargetStatus};

    fn target() -> ScrapeTarget {
        ScrapeTarget {
            id: EntityId::new_v4(),
            url: "https://example.com/p".into(),
            canonical_url: "https://example.com/p".into(),
            source_id: EntityId::new_v4(),
            adapter_id: EntityId::new_v4(),
            priority: 50,
            schedule_cron: None,
            enabled: true,
            status: TargetStatus::Active,
            last_status: Some(LastTargetStatus::Success),
            last_scraped_at: None,
            consecutive_failures: 0,
            robots_path_blocked: false,
            created_at: Utc::now(),
        }
    }

    fn source() -> Source {
        Source {
            id: EntityId::new_v4(),
            name: "Acme".into(),
            retailer_ref: "acme".into(),
            scrape_enabled: true,
            robots_compliant: true,
            tos_reviewed_at: Some(Utc::now()),
            tos_approver_id: Some("admin".into()),
            adapter_id: Some(EntityId::new_v4()),
            feed_hash_memo: None,
        }
    }

    fn adapter() -> ScrapeAdapter {
        ScrapeAdapter {
            id: EntityId::new_v4(),
            enabled: true,
            ingestion_paused: false,
            ingestion_paused_by: None,
            ingestion_paused_at: None,
            ingestion_paused_reason: None,
            schedule_cron: ingest_types::DEFAULT_ADAPTER_CRON.to_string(),
            cycle_timeout_minutes: 30,
            current_cycle_id: None,
            last_cycle_started_at: None,
            consecutive_failed_batches: 0,
            disabled_at: None,
            disabled_reason: None,
            baselines: Default::default(),
            adapter_level_scheduling_enabled: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn eligible_target_passes_all_gates() {
        assert!(target_eligible(&target(), &source(), &adapter()));
    }

    #[test]
    fn robots_path_blocked_target_is_ineligible() {
        let t = ScrapeTarget { robots_path_blocked: true, ..target() };
        assert!(!target_eligible(&t, &source(), &adapter()));
    }

    #[test]
    fn scrape_disabled_source_is_ineligible() {
        let s = Source { scrape_enabled: false, ..source() };
        assert!(!target_eligible(&target(), &s, &adapter()));
    }

    #[test]
    fn paused_adapter_is_ineligible() {
        let a = ScrapeAdapter { ingestion_paused: true, ..adapter() };
        assert!(!target_eligible(&target(), &source(), &a));
    }

    #[test]
    fn manual_trigger_backpressure_matches_spec_example() {
        let outcome = check_manual_trigger_caps(10, 5, 100);
        assert_eq!(outcome, ManualTriggerOutcome::Backpressure { retry_after_ms: 300_000 });
    }

    #[test]
    fn manual_trigger_under_caps_is_accepted() {
        let outcome = check_manual_trigger_caps(9, 500, 1000);
        assert_eq!(outcome, ManualTriggerOutcome::Accepted);
    }

    #[test]
    fn manual_trigger_small_backlog_is_proportional() {
        let outcome = check_manual_trigger_caps(0, 1000, 0);
        assert_eq!(outcome, ManualTriggerOutcome::Backpressure { retry_after_ms: 30_000_000u64.min(300_000) });
    }

    #[test]
    fn adapter_cycle_refuses_when_already_running() {
        let a = ScrapeAdapter { current_cycle_id: Some(EntityId::new_v4()), ..adapter() };
        assert_eq!(check_adapter_cycle_trigger(&a, 5), Err(AdapterCycleRefusal::AlreadyRunning));
    }

    #[test]
    fn adapter_cycle_refuses_on_zero_eligible_targets() {
        assert_eq!(check_adapter_cycle_trigger(&adapter(), 0), Err(AdapterCycleRefusal::NoEligibleTargets));
    }

    #[test]
    fn adapter_cycle_accepts_when_clear() {
        assert_eq!(check_adapter_cycle_trigger(&adapter(), 3), Ok(()));
    }
}
