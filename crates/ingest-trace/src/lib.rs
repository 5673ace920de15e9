//! Structured log envelope, sensitive-key redaction, debug sampling, and
//! the durable append-only run event log (§4.D).
//!
//! The hot-path per-line structured logging itself rides on `tracing`
//! spans/events (see [`init_subscriber`] and [`TraceEnvelope::span`]); the
//! event log here is the durable, JSONL, run-level history, generalized
//! from the append-only event log used elsewhere in this lineage for
//! publish-run history.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sensitive-key patterns that MUST redact to the literal `[REDACTED]` in
/// every emitted log record and notification payload.
pub const SENSITIVE_KEY_PATTERNS: &[&str] = &[
    "authorization",
    "cookie",
    "token",
    "secret",
    "password",
    "api-key",
    "api_key",
    "credential",
];

pub const REDACTED: &str = "[REDACTED]";

/// True if `key` matches one of the sensitive-key patterns (case-insensitive
/// substring match, since real field names vary: `x-api-key`, `auth_token`).
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_PATTERNS.iter().any(|pat| lower.contains(pat))
}

/// Redact sensitive keys in a JSON object, recursively. Non-object/array
/// leaves are returned unchanged.
pub fn redact_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), serde_json::Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), redact_json(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_json).collect())
        }
        other => other.clone(),
    }
}

/// The per-stage trace envelope propagated through every phase of a feed
/// run or scrape cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEnvelope {
    pub trace_id: String,
    pub execution_id: String,
    pub stage: String,
    pub step: String,
    pub attempt: u32,
    pub retry_count: u32,
    pub item_key: Option<String>,
}

impl TraceEnvelope {
    pub fn new(execution_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            stage: stage.into(),
            step: String::new(),
            attempt: 1,
            retry_count: 0,
            item_key: None,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = step.into();
        self
    }

    pub fn with_item_key(mut self, item_key: impl Into<String>) -> Self {
        self.item_key = Some(item_key.into());
        self
    }

    /// Open a `tracing` span carrying this envelope's fields. Any field
    /// matching [`is_sensitive_key`] written onto this span via
    /// `tracing::field::display`/`debug` is NOT auto-redacted by `tracing`
    /// itself — callers MUST route user-controlled payload fields through
    /// [`redact_json`] before attaching them as span fields.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "pipeline_stage",
            trace_id = %self.trace_id,
            execution_id = %self.execution_id,
            stage = %self.stage,
            step = %self.step,
            attempt = self.attempt,
            retry_count = self.retry_count,
            item_key = self.item_key.as_deref().unwrap_or(""),
        )
    }
}

/// Derive the per-item log key in the order specified by §4.D:
/// `sourceProductId -> identityKey -> impactItemId -> sku -> upc -> hash(url) -> hash(json)`.
#[derive(Debug, Default, Clone)]
pub struct ItemKeyCandidates<'a> {
    pub source_product_id: Option<&'a str>,
    pub identity_key: Option<&'a str>,
    pub impact_item_id: Option<&'a str>,
    pub sku: Option<&'a str>,
    pub upc: Option<&'a str>,
    pub url: Option<&'a str>,
    pub json: Option<&'a str>,
}

pub fn derive_item_key(candidates: &ItemKeyCandidates<'_>) -> String {
    if let Some(v) = candidates.source_product_id {
        return v.to_string();
    }
    if let Some(v) = candidates.identity_key {
        return v.to_string();
    }
    if let Some(v) = candidates.impact_item_id {
        return v.to_string();
    }
    if let Some(v) = candidates.sku {
        return v.to_string();
    }
    if let Some(v) = candidates.upc {
        return v.to_string();
    }
    if let Some(v) = candidates.url {
        return format!("urlhash:{:x}", sha256_bytes(v.as_bytes()));
    }
    if let Some(v) = candidates.json {
        return format!("jsonhash:{:x}", sha256_bytes(v.as_bytes()));
    }
    format!("jsonhash:{:x}", sha256_bytes(b""))
}

fn sha256_bytes(bytes: &[u8]) -> impl std::fmt::LowerHex {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    u128::from_be_bytes(digest[0..16].try_into().expect("sha256 digest is >=16 bytes"))
}

/// Deterministic debug-log sampling: the first `always_log_first` items in
/// a run are always logged; beyond that, `should_sample` is a deterministic
/// function of `sha256(traceId:itemKey)` so that repeated runs over the same
/// trace/item pair sample identically.
#[derive(Debug, Clone, Copy)]
pub struct DebugSampler {
    pub always_log_first: u64,
    pub rate: f64,
}

impl DebugSampler {
    pub fn new(always_log_first: u64, rate: f64) -> Self {
        Self {
            always_log_first,
            rate: rate.clamp(0.0, 1.0),
        }
    }

    pub fn should_log(&self, item_index: u64, trace_id: &str, item_key: &str) -> bool {
        if item_index < self.always_log_first {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        if self.rate >= 1.0 {
            return true;
        }
        let key = format!("{trace_id}:{item_key}");
        let hashed = sha256_bytes(key.as_bytes());
        let bucket = (hashed % 1_000_000) as f64 / 1_000_000.0;
        bucket < self.rate
    }
}

/// Initialize the global `tracing` subscriber. `json` selects the JSON
/// formatter (production) over the pretty formatter (local dev), matching
/// the ambient-stack choice documented in SPEC_FULL.md §10.3.
pub fn init_subscriber(json: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        let _ = registry.with(fmt::layer().json()).try_init();
    } else {
        let _ = registry.with(fmt::layer().pretty()).try_init();
    }
}

// ---------------------------------------------------------------------
// Durable run event log
// ---------------------------------------------------------------------

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// A single durable milestone in a run's lifecycle (not a hot-path
/// per-item log line — those go through `tracing`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
    pub event_type: RunEventType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventType {
    Started { trigger: String },
    PhaseCompleted { phase: String, duration_ms: u64 },
    CircuitBreakerTripped { reason: String },
    Finalized { status: String },
}

/// Append-only JSONL event log, generalized from this lineage's
/// publish-event log shape.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RunEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.with_context(|| format!("failed to read line from {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }
        Ok(Self { events })
    }

    pub fn events_for_execution(&self, execution_id: &str) -> Vec<&RunEvent> {
        self.events.iter().filter(|e| e.execution_id == execution_id).collect()
    }

    pub fn all_events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
