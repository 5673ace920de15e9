//! Scraper Cycle Engine (§4.F): per-adapter cycle lifecycle over a
//! population of target URLs, rate limited per registrable domain, with
//! consecutive-failure tracking and auto-disable.

pub mod cycle;
pub mod eligibility;
pub mod fetch;
pub mod worker;

pub use cycle::{EmergencyStopOutcome, ManualScrapeResult, ScrapeCycleEngine, TARGET_QUEUE};
pub use eligibility::{
    check_adapter_cycle_trigger, check_manual_trigger_caps, target_eligible, AdapterCycleRefusal,
    ManualTriggerOutcome,
};
pub use fetch::{FetchResult, HttpTargetFetcher, TargetFetcher};
pub use worker::{JobOutcome, TargetJobPayload, TargetWorker};
