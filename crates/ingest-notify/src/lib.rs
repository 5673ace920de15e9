//! Outbound notification transport for the alert dispatcher (§4.I) and for
//! feed/adapter health events (§4.E auto-disable/recovery/data-quality,
//! §4.F auto-disable).
//!
//! Generalizes the webhook payload-builder shape used elsewhere in this
//! lineage for publish notifications: the same `{Generic, Slack, Discord}`
//! channel types and flattened-extra-fields payload shape, renamed to a
//! domain-neutral `NotificationChannel`/`NotificationPayload` pair so both
//! producers (alert dispatcher, health events) share one transport.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationChannelType {
    #[default]
    Generic,
    Slack,
    Discord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub url: String,
    #[serde(default)]
    pub channel_type: NotificationChannelType,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self {
            url: String::new(),
            channel_type: NotificationChannelType::default(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for NotificationPayload {
    fn default() -> Self {
        Self {
            message: String::new(),
            title: None,
            severity: Severity::Info,
            subject: None,
            code: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Send a notification, redacting sensitive keys in `extra` first.
pub async fn send_notification(channel: &NotificationChannel, payload: &NotificationPayload) -> Result<()> {
    let mut payload = payload.clone();
    payload.extra = payload
        .extra
        .into_iter()
        .map(|(k, v)| {
            let redacted = ingest_trace::redact_json(&v);
            (k, redacted)
        })
        .collect();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(channel.timeout_secs))
        .build()
        .context("failed to create HTTP client")?;

    let body = match channel.channel_type {
        NotificationChannelType::Generic => serde_json::to_string(&payload)?,
        NotificationChannelType::Slack => slack_payload(&payload)?,
        NotificationChannelType::Discord => discord_payload(&payload)?,
    };

    let response = client
        .post(&channel.url)
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .context("failed to send notification request")?;

    if !response.status().is_success() {
        anyhow::bail!(
            "notification request failed with status {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
    }
    Ok(())
}

fn severity_color_slack(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "good",
        Severity::Warning => "warning",
        Severity::Critical => "danger",
    }
}

fn severity_color_discord(severity: Severity) -> u32 {
    match severity {
        Severity::Info => 65280,
        Severity::Warning => 16_761_600,
        Severity::Critical => 16_711_680,
    }
}

fn slack_payload(payload: &NotificationPayload) -> Result<String> {
    let slack_json = json!({
        "attachments": [{
            "color": severity_color_slack(payload.severity),
            "title": payload.title.clone().unwrap_or_else(|| "Ingestion Notification".to_string()),
            "text": payload.message,
            "fields": [
                {"title": "Subject", "value": payload.subject.clone().unwrap_or_default(), "short": true},
                {"title": "Code", "value": payload.code.clone().unwrap_or_default(), "short": true},
            ]
        }]
    });
    Ok(serde_json::to_string(&slack_json)?)
}

fn discord_payload(payload: &NotificationPayload) -> Result<String> {
    let discord_json = json!({
        "embeds": [{
            "title": payload.title.clone().unwrap_or_else(|| "Ingestion Notification".to_string()),
            "description": payload.message,
            "color": severity_color_discord(payload.severity),
            "fields": [
                {"name": "Subject", "value": payload.subject.clone().unwrap_or_default(), "inline": true},
                {"name": "Code", "value": payload.code.clone().unwrap_or_default(), "inline": true},
            ]
        }]
    });
    Ok(serde_json::to_string(&discord_json)?)
}

/// §4.E: feed auto-disabled after reaching MAX_CONSECUTIVE_FEED_FAILURES.
pub fn feed_auto_disabled_payload(feed_id: &str) -> NotificationPayload {
    NotificationPayload {
        message: format!("Feed {feed_id} auto-disabled after consecutive failures"),
        title: Some("Feed Auto-Disabled".to_string()),
        severity: Severity::Critical,
        subject: Some(feed_id.to_string()),
        code: Some("FEED_AUTO_DISABLED".to_string()),
        ..Default::default()
    }
}

/// §4.E: feed recovered (previous consecutiveFailures > 0, current run succeeded).
pub fn feed_recovery_payload(feed_id: &str) -> NotificationPayload {
    NotificationPayload {
        message: format!("Feed {feed_id} recovered"),
        title: Some("Feed Recovered".to_string()),
        severity: Severity::Info,
        subject: Some(feed_id.to_string()),
        code: Some("FEED_RECOVERED".to_string()),
        ..Default::default()
    }
}

/// §4.E: data-quality crossing-edge warning (missingBrand ratio crossed threshold).
pub fn data_quality_warning_payload(feed_id: &str, missing_brand_ratio: f64) -> NotificationPayload {
    NotificationPayload {
        message: format!("Feed {feed_id} missing-brand ratio {:.1}% crossed threshold", missing_brand_ratio * 100.0),
        title: Some("Data Quality Warning".to_string()),
        severity: Severity::Warning,
        subject: Some(feed_id.to_string()),
        code: Some("DATA_QUALITY_WARNING".to_string()),
        ..Default::default()
    }
}

/// §4.E Phase 2: circuit breaker tripped, no promotions applied this run.
pub fn circuit_breaker_tripped_payload(feed_id: &str, reason: &str) -> NotificationPayload {
    NotificationPayload {
        message: format!("Feed {feed_id} circuit breaker tripped: {reason}"),
        title: Some("Circuit Breaker Tripped".to_string()),
        severity: Severity::Critical,
        subject: Some(feed_id.to_string()),
        code: Some("CIRCUIT_BREAKER_TRIPPED".to_string()),
        ..Default::default()
    }
}

/// §4.F: adapter auto-disabled after consecutive failed batches.
pub fn adapter_auto_disabled_payload(adapter_id: &str) -> NotificationPayload {
    NotificationPayload {
        message: format!("Adapter {adapter_id} auto-disabled after consecutive failed cycles"),
        title: Some("Adapter Auto-Disabled".to_string()),
        severity: Severity::Critical,
        subject: Some(adapter_id.to_string()),
        code: Some("ADAPTER_AUTO_DISABLED".to_string()),
        ..Default::default()
    }
}

/// §4.I: PRICE_DROP alert.
pub fn price_drop_alert_payload(product_id: &str, old_price_cents: i64, new_price_cents: i64) -> NotificationPayload {
    NotificationPayload {
        message: format!("Price dropped for {product_id}: {old_price_cents} -> {new_price_cents} cents"),
        title: Some("Price Drop".to_string()),
        severity: Severity::Info,
        subject: Some(product_id.to_string()),
        code: Some("PRICE_DROP".to_string()),
        ..Default::default()
    }
}

/// §4.I: BACK_IN_STOCK alert.
pub fn back_in_stock_alert_payload(product_id: &str) -> NotificationPayload {
    NotificationPayload {
        message: format!("{product_id} is back in stock"),
        title: Some("Back In Stock".to_string()),
        severity: Severity::Info,
        subject: Some(product_id.to_string()),
        code: Some("BACK_IN_STOCK".to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_default_is_generic_with_30s_timeout() {
        let channel = NotificationChannel::default();
        assert_eq!(channel.channel_type, NotificationChannelType::Generic);
        assert_eq!(channel.timeout_secs, 30);
    }

    #[test]
    fn slack_payload_uses_severity_color() {
        let payload = feed_auto_disabled_payload("feed-1");
        let json = slack_payload(&payload).expect("format");
        assert!(json.contains("\"color\":\"danger\""));
    }

    #[test]
    fn discord_payload_uses_severity_color() {
        let payload = feed_recovery_payload("feed-1");
        let json = discord_payload(&payload).expect("format");
        assert!(json.contains("\"color\":65280"));
    }

    #[test]
    fn price_drop_payload_carries_product_and_code() {
        let payload = price_drop_alert_payload("prod-1", 1999, 1499);
        assert_eq!(payload.subject.as_deref(), Some("prod-1"));
        assert_eq!(payload.code.as_deref(), Some("PRICE_DROP"));
        assert!(payload.message.contains("1999"));
    }

    #[tokio::test]
    async fn send_notification_redacts_extra_fields() {
        let mut payload = feed_auto_disabled_payload("feed-1");
        payload.extra.insert("api_key".to_string(), serde_json::json!("super-secret"));

        // Use an unroutable URL so the request fails fast without a real
        // server; we only assert that redaction ran before serialization
        // by inspecting the outbound body indirectly is not possible here,
        // so this exercises the redaction function directly instead.
        let redacted: serde_json::Value = ingest_trace::redact_json(&serde_json::to_value(&payload).unwrap());
        assert_eq!(redacted["api_key"], "[REDACTED]");
        let _ = payload;
    }
}
