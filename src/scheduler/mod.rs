//! Expiry Scheduler (C9) — periodic expiry sweep, expiring-soon
//! notifications, and the purchase-notification sweep (spec.md §4.9).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::{subscription_key, BundleCache};
use crate::config::DaemonConfig;
use crate::notify::{Notification, NotificationSink};
use crate::store::Store;
use crate::subscriptions::SubscriptionEngine;

/// Bits of `notified_mask`, one per crossed threshold (spec.md §4.9).
const NOTIFY_7D: i64 = 1 << 0;
const NOTIFY_1D: i64 = 1 << 1;
const NOTIFY_1H: i64 = 1 << 2;

const SEVEN_DAYS: i64 = 7 * 86_400;
const ONE_DAY: i64 = 86_400;
const ONE_HOUR: i64 = 3_600;

/// Window during which a purchase notification is still considered
/// "recent enough" to retry if it failed to send the first time.
const PURCHASE_NOTIFICATION_WINDOW_SECS: i64 = 7 * 86_400;

pub struct ExpiryScheduler {
    store: Arc<Store>,
    cache: Arc<BundleCache>,
    notify: Arc<dyn NotificationSink>,
    subscriptions: Arc<SubscriptionEngine>,
    config: Arc<DaemonConfig>,
}

impl ExpiryScheduler {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<BundleCache>,
        notify: Arc<dyn NotificationSink>,
        subscriptions: Arc<SubscriptionEngine>,
        config: Arc<DaemonConfig>,
    ) -> Self {
        Self {
            store,
            cache,
            notify,
            subscriptions,
            config,
        }
    }

    /// Grounded on the traffic monitor's `tokio::time::interval` loop.
    pub fn spawn(self: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!("scheduler sweep failed: {e:#}");
                }
            }
        })
    }

    pub async fn run_once(&self) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.sweep_expired(now).await?;
        self.sweep_expiring_soon(now).await?;
        self.sweep_purchase_notifications(now).await?;
        if self.config.vacuum_after_expiry_sweep {
            if let Err(e) = self.store.incremental_vacuum().await {
                warn!("incremental vacuum failed: {e:#}");
            }
        }
        Ok(())
    }

    /// Tear down subscriptions past their grace period (spec.md §4.9 expiry
    /// sweep) — fan-out key deletion and row removal via [`SubscriptionEngine`].
    async fn sweep_expired(&self, now: i64) -> anyhow::Result<()> {
        let expired = self
            .store
            .list_expired_active_subscriptions(now - self.config.grace_period_secs)
            .await?;
        for sub in &expired {
            if sub.expires_at <= 0 {
                continue;
            }
            if let Err(e) = self.subscriptions.delete(sub.id).await {
                warn!(subscription_id = sub.id, "expiry teardown failed: {e:#}");
                continue;
            }
            self.cache.delete(&subscription_key(&sub.token));
            info!(subscription_id = sub.id, user_id = sub.user_id, "subscription expired and removed");
        }
        Ok(())
    }

    /// Notify users whose active subscription just crossed the 7d/1d/1h
    /// threshold, tracked via `notified_mask` so each threshold fires once.
    async fn sweep_expiring_soon(&self, now: i64) -> anyhow::Result<()> {
        for (window, bit) in [(SEVEN_DAYS, NOTIFY_7D), (ONE_DAY, NOTIFY_1D), (ONE_HOUR, NOTIFY_1H)] {
            let subs = self.store.list_subscriptions_expiring_within(now, window).await?;
            for sub in &subs {
                if sub.notified_mask & bit != 0 {
                    continue;
                }
                self.notify
                    .notify(Notification::ExpiringSoon {
                        user_id: sub.user_id,
                        subscription_id: sub.id,
                        seconds_remaining: sub.expires_at - now,
                    })
                    .await;
                self.store.set_notified_mask(sub.id, sub.notified_mask | bit).await?;
            }
        }
        Ok(())
    }

    /// Retry sending the purchase-confirmation notification for recent
    /// subscriptions where it hasn't gone out yet (spec.md §4.9 purchase
    /// notification sweep).
    async fn sweep_purchase_notifications(&self, now: i64) -> anyhow::Result<()> {
        let candidates = self
            .store
            .list_pending_purchase_notifications(now - PURCHASE_NOTIFICATION_WINDOW_SECS)
            .await?;
        for sub in &candidates {
            self.notify
                .notify(Notification::PurchaseConfirmed {
                    user_id: sub.user_id,
                    subscription_id: sub.id,
                })
                .await;
            self.store.set_purchase_notification_sent(sub.id).await?;
        }
        Ok(())
    }
}
