//! Affiliate Feed Worker (§4.E): per-job pipeline that downloads, parses,
//! and processes a partner feed, then runs it through a circuit breaker
//! before promoting newly-seen products to active.

pub mod breaker;
pub mod fetch;
pub mod parse;
pub mod worker;

pub use breaker::{evaluate as evaluate_breaker, BreakerOutcome, BreakerThresholds, BreakerTripReason};
pub use fetch::{content_hash, is_unchanged, FeedFetcher, FetchOutcome, HttpFeedFetcher};
pub use parse::{CsvFeedParser, FeedParser, ParseOutcome, ParsedRow};
pub use worker::{FeedJobPayload, FeedWorker, JobOutcome};

/// Queue name the scheduler enqueues affiliate feed runs onto and
/// [`FeedWorker`] consumes from.
pub const FEED_QUEUE: &str = "affiliate-feed";
