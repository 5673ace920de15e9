//! Core domain types shared by every crate in the ingestion platform.
//!
//! This crate has no I/O and no async dependency: it is pure data plus the
//! error taxonomy (`IngestError`) that every other crate classifies against.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stable opaque identifier, collision-resistant, used for every entity id
/// in this crate (feeds, runs, adapters, targets, cycles).
pub type EntityId = uuid::Uuid;

// ---------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: EntityId,
    pub name: String,
    pub retailer_ref: String,
    pub scrape_enabled: bool,
    pub robots_compliant: bool,
    pub tos_reviewed_at: Option<DateTime<Utc>>,
    pub tos_approver_id: Option<String>,
    pub adapter_id: Option<EntityId>,
    pub feed_hash_memo: Option<String>,
}

impl Source {
    /// `scrapeEnabled=true` implies `robotsCompliant=true` AND a non-null ToS approver.
    pub fn invariant_holds(&self) -> bool {
        !self.scrape_enabled || (self.robots_compliant && self.tos_approver_id.is_some())
    }
}

// ---------------------------------------------------------------------
// Affiliate feed
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedTransport {
    Sftp,
    Https,
    AuthUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedFormat {
    Csv,
    Xml,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedStatus {
    Draft,
    Active,
    Disabled,
}

pub const MAX_CONSECUTIVE_FEED_FAILURES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedMemo {
    pub mtime: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateFeed {
    pub id: EntityId,
    pub source_id: EntityId,
    pub transport: FeedTransport,
    pub format: FeedFormat,
    pub schedule_hours: u32,
    pub expiry_hours: u32,
    pub max_row_count: u64,
    pub last_run_memo: FeedMemo,
    pub consecutive_failures: u32,
    pub manual_run_pending: bool,
    pub status: FeedStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Affiliate feed run
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    ManualPending,
    AdminTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkippedReason {
    UnchangedMtime,
    UnchangedHash,
    FileNotFound,
    FeedDraft,
    FeedDisabled,
    AdapterDisabled,
    IngestionPaused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    TransientNetwork,
    PermanentNetwork,
    ParseError,
    ProcessingError,
    CircuitBreakerTripped,
    LockContention,
    InvariantViolation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    pub download_bytes: u64,
    pub rows_read: u64,
    pub rows_parsed: u64,
    pub products_upserted: u64,
    pub prices_written: u64,
    pub products_rejected: u64,
    pub duplicate_key_count: u64,
    pub url_hash_fallback_count: u64,
    pub error_count: u64,
    pub missing_brand_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub active_count_before: u64,
    pub seen_success_count: u64,
    pub would_expire_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateFeedRun {
    pub id: EntityId,
    pub feed_id: EntityId,
    pub source_id: EntityId,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Stable across retries; the dedupe key for every Price row this run writes.
    pub run_observed_at: DateTime<Utc>,
    pub metrics: RunMetrics,
    pub breaker: CircuitBreakerMetrics,
    pub skipped_reason: Option<SkippedReason>,
    pub failure_kind: Option<FailureKind>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub correlation_id: String,
    pub is_partial: bool,
    pub expiry_blocked: bool,
    pub expiry_blocked_reason: Option<String>,
    pub ignored_at: Option<DateTime<Utc>>,
}

impl AffiliateFeedRun {
    pub fn new(feed_id: EntityId, source_id: EntityId, trigger: RunTrigger, correlation_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new_v4(),
            feed_id,
            source_id,
            trigger,
            status: RunStatus::Running,
            started_at: now,
            finished_at: None,
            run_observed_at: now,
            metrics: RunMetrics::default(),
            breaker: CircuitBreakerMetrics::default(),
            skipped_reason: None,
            failure_kind: None,
            failure_code: None,
            failure_message: None,
            correlation_id,
            is_partial: false,
            expiry_blocked: false,
            expiry_blocked_reason: None,
            ignored_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseRowError {
    pub row: u64,
    pub message: String,
}

// ---------------------------------------------------------------------
// Scrape adapter
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterDisabledReason {
    Manual,
    AutoDisabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterBaselines {
    pub failure_rate: f64,
    pub yield_rate: f64,
    pub sample_size: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for AdapterBaselines {
    fn default() -> Self {
        Self {
            failure_rate: 0.0,
            yield_rate: 0.0,
            sample_size: 0,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeAdapter {
    pub id: EntityId,
    pub enabled: bool,
    pub ingestion_paused: bool,
    pub ingestion_paused_by: Option<String>,
    pub ingestion_paused_at: Option<DateTime<Utc>>,
    pub ingestion_paused_reason: Option<String>,
    pub schedule_cron: String,
    pub cycle_timeout_minutes: u32,
    pub current_cycle_id: Option<EntityId>,
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    /// Single counter serving both scrape-cycle failure tracking and general
    /// adapter-health signal; see DESIGN.md open-question decision.
    pub consecutive_failed_batches: u32,
    pub disabled_at: Option<DateTime<Utc>>,
    pub disabled_reason: Option<AdapterDisabledReason>,
    pub baselines: AdapterBaselines,
    pub adapter_level_scheduling_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_ADAPTER_CRON: &str = "0 0,4,8,12,16,20 * * *";
pub const MAX_CONSECUTIVE_FAILED_BATCHES: u32 = 3;

// ---------------------------------------------------------------------
// Scrape target
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    Active,
    Broken,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LastTargetStatus {
    PendingManual,
    Enqueued,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub id: EntityId,
    pub url: String,
    pub canonical_url: String,
    pub source_id: EntityId,
    pub adapter_id: EntityId,
    pub priority: u8,
    pub schedule_cron: Option<String>,
    pub enabled: bool,
    pub status: TargetStatus,
    pub last_status: Option<LastTargetStatus>,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub robots_path_blocked: bool,
    pub created_at: DateTime<Utc>,
}

pub const MAX_PENDING_MANUAL_PER_ADAPTER: u64 = 10;
pub const MAX_ENQUEUED_PER_ADAPTER: u64 = 1000;
pub const MAX_PENDING_GLOBAL: u64 = 10_000;

// ---------------------------------------------------------------------
// Scrape cycle
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleCounters {
    pub total_targets: u64,
    pub targets_completed: u64,
    pub targets_failed: u64,
    pub targets_skipped: u64,
    pub offers_extracted: u64,
    pub offers_valid: u64,
}

impl CycleCounters {
    pub fn invariant_holds(&self) -> bool {
        self.targets_completed + self.targets_failed + self.targets_skipped <= self.total_targets
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeCycle {
    pub id: EntityId,
    pub adapter_id: EntityId,
    pub trigger: RunTrigger,
    pub status: CycleStatus,
    pub counters: CycleCounters,
    pub last_processed_target_id: Option<EntityId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------
// Catalog: Product / Price
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionRunType {
    AffiliateFeed,
    Scrape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: EntityId,
    pub source_product_id: Option<String>,
    pub retailer_id: EntityId,
    pub brand: Option<String>,
    /// Canonical caliber key (e.g. `"9MM"`), resolved from feed/scrape data
    /// via alias lookup. `None` until classified.
    pub caliber: Option<String>,
    /// Rounds per unit sold, used to derive price-per-round for the
    /// caliber snapshot computer (§4.H).
    pub round_count: Option<u32>,
    pub active: bool,
    pub last_seen_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub product_id: EntityId,
    pub retailer_id: EntityId,
    pub url: String,
    pub price_cents: i64,
    pub in_stock: Option<bool>,
    pub observed_at: DateTime<Utc>,
    pub ingestion_run_type: IngestionRunType,
    pub ingestion_run_id: EntityId,
}

impl Price {
    /// Dedupe key: identical (price, inStock) within the same observation
    /// MUST NOT produce a duplicate row.
    pub fn dedupe_key(&self) -> (EntityId, EntityId, DateTime<Utc>, String) {
        (
            self.product_id,
            self.retailer_id,
            self.observed_at,
            self.url.clone(),
        )
    }
}

// ---------------------------------------------------------------------
// Caliber market snapshot
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotStatus {
    Current,
    Superseded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaliberMarketSnapshot {
    pub caliber: String,
    pub window_days: u32,
    pub status: SnapshotStatus,
    pub window_end: DateTime<Utc>,
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
    pub computation_version: u32,
    pub duration_ms: u64,
    pub computed_at: DateTime<Utc>,
}

/// One row of the snapshot computer's reduction pass (§4.H): the best
/// (lowest) price-per-round a product was observed at on a given UTC day,
/// already joined against its caliber and round count. The real backend
/// computes this with a windowed SQL template; the in-memory store
/// derives it directly from `prices`/`products`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBestPrice {
    pub day: NaiveDate,
    pub product_id: EntityId,
    pub retailer_id: EntityId,
    pub price_per_round_cents: i64,
}

pub const MIN_SNAPSHOT_SAMPLE_COUNT: u64 = 5;
pub const DEFAULT_SNAPSHOT_CRON: &str = "0 */6 * * *";

/// Catch-all bucket for products whose caliber hasn't been classified, or
/// doesn't fit a tracked canonical key. Excluded from snapshot computation.
pub const OTHER_CALIBER: &str = "OTHER";

/// Canonical caliber keys the snapshot computer iterates (§4.H), excluding
/// [`OTHER_CALIBER`].
pub const CANONICAL_CALIBERS: &[&str] =
    &["9MM", "223_REM", "308_WIN", "556_NATO", "40SW", "45ACP", "380ACP", "22LR", "12GA", "20GA"];

// ---------------------------------------------------------------------
// Alerts / watchlists (glue only — evaluation itself is out of scope)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertRuleType {
    PriceDrop,
    BackInStock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionTier {
    Free,
    Premium,
}

impl SubscriptionTier {
    /// FREE = 1h delay, PREMIUM = immediate.
    pub fn notification_delay(self) -> Duration {
        match self {
            SubscriptionTier::Free => Duration::from_secs(3600),
            SubscriptionTier::Premium => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceChangeEvent {
    pub product_id: EntityId,
    pub old_price_cents: Option<i64>,
    pub new_price_cents: i64,
    pub in_stock: Option<bool>,
    pub observed_at: DateTime<Utc>,
    pub has_visible_dealer_price: bool,
}

/// A subscriber's watch on a product. Rule matching (min-drop thresholds,
/// cooldown comparison) is external/out of scope; this carries only what
/// the dispatcher's scheduling glue needs: the tier that picks the delay,
/// and the per-rule-type timestamps it writes back after a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistItem {
    pub id: EntityId,
    pub product_id: EntityId,
    pub user_id: EntityId,
    pub tier: SubscriptionTier,
    pub last_price_notified_at: Option<DateTime<Utc>>,
    pub last_back_in_stock_notified_at: Option<DateTime<Utc>>,
}

/// An already-evaluated alert ready for dispatch: the rule fired, the
/// dispatcher's job is only to pick immediate-vs-delayed and send.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TriggeredAlert {
    pub watchlist_item_id: EntityId,
    pub rule_type: AlertRuleType,
}

// ---------------------------------------------------------------------
// Error taxonomy (§7)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Ambiguous,
    Permanent,
}

/// Stable error taxonomy shared by the affiliate feed worker and the
/// scraper cycle engine. Every variant carries (or derives) a stable code
/// used in run-level failure reporting.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("permanent network error: {0}")]
    PermanentNetwork(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("processing error ({code}): {0}", code = .code)]
    ProcessingError { code: &'static str, message: String },

    #[error("circuit breaker tripped: {reason}")]
    CircuitBreakerTripped { reason: String },

    #[error("lock contention on {lock_id}")]
    LockContention { lock_id: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl IngestError {
    pub fn processing_validation_failure(message: impl Into<String>) -> Self {
        IngestError::ProcessingError {
            code: "VALIDATION_FAILURE",
            message: message.into(),
        }
    }

    pub fn processing_upsert_failure(message: impl Into<String>) -> Self {
        IngestError::ProcessingError {
            code: "UPSERT_FAILURE",
            message: message.into(),
        }
    }

    /// Stable code surfaced in `AffiliateFeedRun::failure_code`.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::TransientNetwork(_) => "TRANSIENT_NETWORK",
            IngestError::PermanentNetwork(_) => "PERMANENT_NETWORK",
            IngestError::ParseError(_) => "PARSE_ERROR",
            IngestError::ProcessingError { code, .. } => code,
            IngestError::CircuitBreakerTripped { .. } => "CIRCUIT_BREAKER_TRIPPED",
            IngestError::LockContention { .. } => "LOCK_CONTENTION",
            IngestError::InvariantViolation(_) => "INVARIANT_VIOLATION",
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            IngestError::TransientNetwork(_) => FailureKind::TransientNetwork,
            IngestError::PermanentNetwork(_) => FailureKind::PermanentNetwork,
            IngestError::ParseError(_) => FailureKind::ParseError,
            IngestError::ProcessingError { .. } => FailureKind::ProcessingError,
            IngestError::CircuitBreakerTripped { .. } => FailureKind::CircuitBreakerTripped,
            IngestError::LockContention { .. } => FailureKind::LockContention,
            IngestError::InvariantViolation(_) => FailureKind::InvariantViolation,
        }
    }

    /// Classification consumed by `ingest_retry::RetryExecutor`.
    pub fn classify(&self) -> ErrorClass {
        match self {
            IngestError::TransientNetwork(_) => ErrorClass::Retryable,
            IngestError::PermanentNetwork(_)
            | IngestError::ParseError(_)
            | IngestError::ProcessingError { .. }
            | IngestError::CircuitBreakerTripped { .. }
            | IngestError::LockContention { .. }
            | IngestError::InvariantViolation(_) => ErrorClass::Permanent,
        }
    }
}

/// Arbitrary structured metadata attached to log/notification payloads.
pub type MetadataMap = BTreeMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_invariant_requires_robots_and_approver_when_scrape_enabled() {
        let mut s = Source {
            id: EntityId::new_v4(),
            name: "acme".into(),
            retailer_ref: "acme".into(),
            scrape_enabled: true,
            robots_compliant: false,
            tos_reviewed_at: None,
            tos_approver_id: None,
            adapter_id: None,
            feed_hash_memo: None,
        };
        assert!(!s.invariant_holds());
        s.robots_compliant = true;
        assert!(!s.invariant_holds());
        s.tos_approver_id = Some("alice".into());
        assert!(s.invariant_holds());
    }

    #[test]
    fn cycle_counters_invariant() {
        let mut c = CycleCounters {
            total_targets: 10,
            targets_completed: 4,
            targets_failed: 3,
            targets_skipped: 2,
            ..Default::default()
        };
        assert!(c.invariant_holds());
        c.targets_skipped = 4;
        assert!(!c.invariant_holds());
    }

    #[test]
    fn tier_delay() {
        assert_eq!(SubscriptionTier::Free.notification_delay(), Duration::from_secs(3600));
        assert_eq!(SubscriptionTier::Premium.notification_delay(), Duration::ZERO);
    }

    #[test]
    fn error_classification_matches_taxonomy() {
        assert_eq!(
            IngestError::TransientNetwork("reset".into()).classify(),
            ErrorClass::Retryable
        );
        assert_eq!(
            IngestError::PermanentNetwork("404".into()).classify(),
            ErrorClass::Permanent
        );
        assert_eq!(
            IngestError::CircuitBreakerTripped { reason: "x".into() }.classify(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            IngestError::processing_validation_failure("no rows").code(),
            "VALIDATION_FAILURE"
        );
        assert_eq!(
            IngestError::processing_upsert_failure("all failed").code(),
            "UPSERT_FAILURE"
        );
    }

    #[test]
    fn price_dedupe_key_is_stable_across_identical_observation() {
        let now = Utc::now();
        let p1 = Price {
            product_id: EntityId::new_v4(),
            retailer_id: EntityId::new_v4(),
            url: "https://example.com/p".into(),
            price_cents: 1999,
            in_stock: Some(true),
            observed_at: now,
            ingestion_run_type: IngestionRunType::AffiliateFeed,
            ingestion_run_id: EntityId::new_v4(),
        };
        let mut p2 = p1.clone();
        p2.price_cents = 1999;
        assert_eq!(p1.dedupe_key(), p2.dedupe_key());
    }
}
