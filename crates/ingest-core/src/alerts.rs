//! Alert dispatcher (§4.I) scheduling glue. Rule evaluation (threshold
//! matching, cooldown comparison) happens upstream and is out of scope
//! here; this module only decides immediate-vs-delayed delivery for an
//! already-fired alert and records the notification timestamp.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use ingest_notify::{back_in_stock_alert_payload, price_drop_alert_payload, send_notification, NotificationChannel};
use ingest_queue::JobQueue;
use ingest_retry::RetryPolicy;
use ingest_store::CatalogStore;
use ingest_types::{AlertRuleType, EntityId, PriceChangeEvent, TriggeredAlert};
use serde::{Deserialize, Serialize};

pub const ALERT_QUEUE: &str = "alert-dispatch";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertJobPayload {
    pub watchlist_item_id: EntityId,
    pub rule_type: AlertRuleType,
    pub product_id: EntityId,
    pub old_price_cents: Option<i64>,
    pub new_price_cents: i64,
}

pub struct AlertDispatcher {
    pub store: Arc<dyn CatalogStore>,
    pub queue: Arc<dyn JobQueue>,
    pub notify_channel: Option<NotificationChannel>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent_immediately: u64,
    pub queued_delayed: u64,
    pub skipped: u64,
}

enum DispatchOutcome {
    SentImmediately,
    QueuedDelayed,
    UnknownWatchlistItem,
}

impl AlertDispatcher {
    /// Dispatches every already-triggered alert for a price-change event.
    /// Never evaluates whether an alert *should* fire — `triggered` is
    /// assumed to already reflect that decision.
    pub async fn dispatch(&self, event: &PriceChangeEvent, triggered: &[TriggeredAlert]) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        if !event.has_visible_dealer_price {
            tracing::debug!(product_id = %event.product_id, "no visible dealer price, skipping alert dispatch");
            report.skipped = triggered.len() as u64;
            return Ok(report);
        }

        for alert in triggered {
            match self.dispatch_one(event, *alert).await? {
                DispatchOutcome::SentImmediately => report.sent_immediately += 1,
                DispatchOutcome::QueuedDelayed => report.queued_delayed += 1,
                DispatchOutcome::UnknownWatchlistItem => report.skipped += 1,
            }
        }
        Ok(report)
    }

    async fn dispatch_one(&self, event: &PriceChangeEvent, alert: TriggeredAlert) -> Result<DispatchOutcome> {
        let Some(mut item) = self
            .store
            .get_watchlist_item(alert.watchlist_item_id)
            .await
            .context("failed to load watchlist item")?
        else {
            return Ok(DispatchOutcome::UnknownWatchlistItem);
        };

        let delay = item.tier.notification_delay();
        let payload = AlertJobPayload {
            watchlist_item_id: item.id,
            rule_type: alert.rule_type,
            product_id: event.product_id,
            old_price_cents: event.old_price_cents,
            new_price_cents: event.new_price_cents,
        };

        if delay.is_zero() {
            self.send_now(&payload).await?;
        } else {
            let job_payload = serde_json::to_value(&payload)?;
            self.queue
                .enqueue(
                    ALERT_QUEUE,
                    &format!("{}:{:?}:{}", item.id, alert.rule_type, event.observed_at),
                    job_payload,
                    RetryPolicy::Default.to_config(),
                    Some(delay),
                )
                .await
                .context("failed to enqueue delayed alert")?;
        }

        let now = Utc::now();
        match alert.rule_type {
            AlertRuleType::PriceDrop => item.last_price_notified_at = Some(now),
            AlertRuleType::BackInStock => item.last_back_in_stock_notified_at = Some(now),
        }
        self.store.update_watchlist_item(&item).await.context("failed to record notification timestamp")?;
        Ok(if delay.is_zero() { DispatchOutcome::SentImmediately } else { DispatchOutcome::QueuedDelayed })
    }

    /// Sends a job payload's alert immediately (used both for zero-delay
    /// tiers and by the worker that drains `ALERT_QUEUE` after a delay).
    pub async fn send_now(&self, payload: &AlertJobPayload) -> Result<()> {
        let Some(channel) = &self.notify_channel else { return Ok(()) };
        let notification = match payload.rule_type {
            AlertRuleType::PriceDrop => {
                let Some(old) = payload.old_price_cents else { return Ok(()) };
                price_drop_alert_payload(&payload.product_id.to_string(), old, payload.new_price_cents)
            }
            AlertRuleType::BackInStock => back_in_stock_alert_payload(&payload.product_id.to_string()),
        };
        send_notification(channel, &notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_queue::InMemoryJobQueue;
    use ingest_store::InMemoryCatalogStore;
    use ingest_types::{SubscriptionTier, WatchlistItem};

    fn event(has_visible_dealer_price: bool) -> PriceChangeEvent {
        PriceChangeEvent {
            product_id: EntityId::new_v4(),
            old_price_cents: Some(2000),
            new_price_cents: 1500,
            in_stock: Some(true),
            observed_at: Utc::now(),
            has_visible_dealer_price,
        }
    }

    fn dispatcher(store: Arc<InMemoryCatalogStore>, queue: Arc<InMemoryJobQueue>) -> AlertDispatcher {
        AlertDispatcher { store, queue, notify_channel: None }
    }

    #[tokio::test]
    async fn skips_every_alert_when_no_visible_dealer_price() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let item_id = EntityId::new_v4();
        store
            .seed_watchlist_item(WatchlistItem {
                id: item_id,
                product_id: EntityId::new_v4(),
                user_id: EntityId::new_v4(),
                tier: SubscriptionTier::Free,
                last_price_notified_at: None,
                last_back_in_stock_notified_at: None,
            })
            .await;
        let d = dispatcher(store, queue);

        let report = d
            .dispatch(&event(false), &[TriggeredAlert { watchlist_item_id: item_id, rule_type: AlertRuleType::PriceDrop }])
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.sent_immediately, 0);
    }

    #[tokio::test]
    async fn free_tier_price_drop_is_queued_with_delay_and_timestamp_recorded() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let item_id = EntityId::new_v4();
        store
            .seed_watchlist_item(WatchlistItem {
                id: item_id,
                product_id: EntityId::new_v4(),
                user_id: EntityId::new_v4(),
                tier: SubscriptionTier::Free,
                last_price_notified_at: None,
                last_back_in_stock_notified_at: None,
            })
            .await;
        let d = dispatcher(store.clone(), queue.clone());

        let report = d
            .dispatch(&event(true), &[TriggeredAlert { watchlist_item_id: item_id, rule_type: AlertRuleType::PriceDrop }])
            .await
            .unwrap();
        assert_eq!(report.queued_delayed, 1);
        assert_eq!(report.sent_immediately, 0);

        let item = store.get_watchlist_item(item_id).await.unwrap().unwrap();
        assert!(item.last_price_notified_at.is_some());
        assert!(item.last_back_in_stock_notified_at.is_none());
    }

    #[tokio::test]
    async fn premium_tier_back_in_stock_dispatches_immediately() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let item_id = EntityId::new_v4();
        store
            .seed_watchlist_item(WatchlistItem {
                id: item_id,
                product_id: EntityId::new_v4(),
                user_id: EntityId::new_v4(),
                tier: SubscriptionTier::Premium,
                last_price_notified_at: None,
                last_back_in_stock_notified_at: None,
            })
            .await;
        let d = dispatcher(store.clone(), queue);

        let report = d
            .dispatch(
                &event(true),
                &[TriggeredAlert { watchlist_item_id: item_id, rule_type: AlertRuleType::BackInStock }],
            )
            .await
            .unwrap();
        assert_eq!(report.sent_immediately, 1);
        assert_eq!(report.queued_delayed, 0);

        let item = store.get_watchlist_item(item_id).await.unwrap().unwrap();
        assert!(item.last_back_in_stock_notified_at.is_some());
    }

    #[tokio::test]
    async fn unknown_watchlist_item_is_skipped_not_sent() {
        let store = Arc::new(InMemoryCatalogStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let d = dispatcher(store, queue);

        let report = d
            .dispatch(
                &event(true),
                &[TriggeredAlert { watchlist_item_id: EntityId::new_v4(), rule_type: AlertRuleType::PriceDrop }],
            )
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.sent_immediately, 0);
    }
}
