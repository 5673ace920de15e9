//! Download step (§4.E Phase 1.1): streams remote feed content and derives
//! the mtime/size/content-hash memo used for change detection.

use chrono::{DateTime, Utc};
use ingest_types::{AffiliateFeed, FeedMemo, IngestError};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bytes: Vec<u8>,
    pub memo: FeedMemo,
}

#[async_trait::async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, feed: &AffiliateFeed) -> Result<FetchOutcome, IngestError>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// `true` when the newly fetched memo is identical to the feed's memo from
/// its last successful run (§4.E.1 change detection).
pub fn is_unchanged(prev: &FeedMemo, current: &FeedMemo) -> bool {
    match (&prev.content_hash, &current.content_hash) {
        (Some(a), Some(b)) => a == b,
        _ => prev.mtime == current.mtime && prev.size == current.size && prev.mtime.is_some(),
    }
}

/// HTTPS transport fetcher backed by `reqwest`. SFTP/AUTH_URL transports
/// are out of scope for v1 (spec requires only CSV over HTTPS to be
/// functional); they return a permanent error until implemented.
pub struct HttpFeedFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpFeedFetcher {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait::async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, feed: &AffiliateFeed) -> Result<FetchOutcome, IngestError> {
        if feed.transport != ingest_types::FeedTransport::Https {
            return Err(IngestError::PermanentNetwork(format!(
                "transport {:?} not supported by HttpFeedFetcher",
                feed.transport
            )));
        }

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| IngestError::TransientNetwork(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Err(IngestError::PermanentNetwork("file not found".to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
                return Err(IngestError::TransientNetwork(format!("http {status}")));
            }
            return Err(IngestError::PermanentNetwork(format!("http {status}")));
        }

        let last_modified: Option<DateTime<Utc>> = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|d| d.with_timezone(&Utc));

        let bytes = response
            .bytes()
            .await
            .map_err(|e| IngestError::TransientNetwork(e.to_string()))?
            .to_vec();

        let memo = FeedMemo {
            mtime: last_modified,
            size: Some(bytes.len() as u64),
            content_hash: Some(content_hash(&bytes)),
        };

        Ok(FetchOutcome { bytes, memo })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_memo_detected_by_content_hash() {
        let prev = FeedMemo { mtime: None, size: Some(10), content_hash: Some("abc".into()) };
        let current = FeedMemo { mtime: None, size: Some(10), content_hash: Some("abc".into()) };
        assert!(is_unchanged(&prev, &current));
    }

    #[test]
    fn changed_content_hash_is_detected() {
        let prev = FeedMemo { mtime: None, size: Some(10), content_hash: Some("abc".into()) };
        let current = FeedMemo { mtime: None, size: Some(11), content_hash: Some("def".into()) };
        assert!(!is_unchanged(&prev, &current));
    }

    #[test]
    fn first_run_with_no_prior_memo_is_not_unchanged() {
        let prev = FeedMemo { mtime: None, size: None, content_hash: None };
        let current = FeedMemo { mtime: None, size: Some(11), content_hash: Some("def".into()) };
        assert!(!is_unchanged(&prev, &current));
    }
}
