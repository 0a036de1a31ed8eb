//! Traffic Monitor (C6) — periodic bulk traffic poll, rollup, and
//! over-limit notification (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::cache::{subscription_key, BundleCache};
use crate::notify::{Notification, NotificationSink};
use crate::store::{KeyRecord, Store};

pub struct TrafficMonitor {
    store: Arc<Store>,
    cache: Arc<BundleCache>,
    backends: Arc<dyn BackendRegistry>,
    notify: Arc<dyn NotificationSink>,
}

impl TrafficMonitor {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<BundleCache>,
        backends: Arc<dyn BackendRegistry>,
        notify: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            cache,
            backends,
            notify,
        }
    }

    /// Spawn the periodic poll loop (grounded on the teacher's connectivity
    /// monitor's `tokio::time::interval` pattern).
    pub fn spawn(self: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                if let Err(e) = self.run_once().await {
                    warn!("traffic poll failed: {e:#}");
                }
            }
        })
    }

    /// One pass of spec.md §4.6 steps 1-7.
    pub async fn run_once(&self) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        let subs = self.store.get_subscriptions_with_traffic_limits().await?;
        if subs.is_empty() {
            return Ok(());
        }

        // Gather every key for every subscription, grouped by server, so
        // each server is polled exactly once regardless of how many
        // subscriptions have keys there (spec.md §4.6 step 3).
        let mut keys_by_server: HashMap<i64, Vec<KeyRecord>> = HashMap::new();
        let mut keys_by_subscription: HashMap<i64, Vec<KeyRecord>> = HashMap::new();
        for sub in &subs {
            let keys = self.store.list_keys_for_subscription(sub.id).await?;
            for key in keys {
                keys_by_server.entry(key.server_id).or_default().push(key.clone());
                keys_by_subscription
                    .entry(sub.id)
                    .or_default()
                    .push(key);
            }
        }

        // One task per server, awaited as a group (spec.md §5 fan-out policy).
        let mut tasks = tokio::task::JoinSet::new();
        for server_id in keys_by_server.keys().copied() {
            let store = self.store.clone();
            let backends = self.backends.clone();
            tasks.spawn(async move {
                let server = store.get_server(server_id).await.ok().flatten();
                let Some(server) = server else { return (server_id, HashMap::new()) };
                match backends.backend_for(server.id, &server.protocol, &server.api_url) {
                    Ok(backend) => match backend.get_traffic_history().await {
                        Ok(history) => (server_id, history.by_remote_id),
                        Err(e) => {
                            warn!(server_id, "bulk traffic fetch failed: {e:#}");
                            (server_id, HashMap::new())
                        }
                    },
                    Err(e) => {
                        warn!(server_id, "backend build failed: {e:#}");
                        (server_id, HashMap::new())
                    }
                }
            });
        }
        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }

        let mut key_updates: Vec<(String, i64, i64)> = Vec::new(); // (backend, key_id, bytes)
        for (server_id, traffic_by_remote_id) in results {
            let Some(keys) = keys_by_server.get(&server_id) else { continue };
            for key in keys {
                let Some(remote_id) = &key.backend_id else { continue };
                if let Some(stats) = traffic_by_remote_id.get(remote_id) {
                    key_updates.push((key.backend.clone(), key.id, stats.bytes_used));
                }
            }
        }

        for (backend, key_id, bytes) in &key_updates {
            self.store.update_key_traffic(backend, *key_id, *bytes).await?;
        }

        // Roll up per-subscription totals from whatever was just fetched,
        // falling back to each key's last-known value when unreachable.
        let mut sub_updates = Vec::new();
        for sub in &subs {
            let Some(keys) = keys_by_subscription.get(&sub.id) else { continue };
            let total: i64 = keys
                .iter()
                .map(|k| {
                    key_updates
                        .iter()
                        .find(|(b, id, _)| *b == k.backend && *id == k.id)
                        .map(|(_, _, bytes)| *bytes)
                        .unwrap_or(k.traffic_usage_bytes)
                })
                .sum();
            sub_updates.push((sub.id, total));
        }
        self.store.batch_update_subscriptions_traffic(&sub_updates).await?;

        for sub in &subs {
            let total = sub_updates
                .iter()
                .find(|(id, _)| *id == sub.id)
                .map(|(_, t)| *t)
                .unwrap_or(sub.traffic_usage_bytes);
            let limit = self.store.effective_limit_bytes(sub).await?;
            if limit > 0 && total > limit {
                if sub.traffic_over_limit_at.is_none() {
                    self.store.mark_traffic_over_limit(sub.id).await?;
                }
                if !sub.traffic_over_limit_notified {
                    self.notify
                        .notify(Notification::TrafficOverLimit {
                            user_id: sub.user_id,
                            subscription_id: sub.id,
                        })
                        .await;
                    self.store.mark_traffic_over_limit_notified(sub.id).await?;
                    self.cache.delete(&subscription_key(&sub.token));
                }
            }
        }

        info!(subscriptions = subs.len(), now, "traffic poll complete");
        Ok(())
    }

    /// Traffic reset on extension/purchase (spec.md §4.6 "Traffic reset on
    /// extension / purchase").
    pub async fn reset_subscription_traffic(&self, subscription_id: i64) -> anyhow::Result<()> {
        let keys = self.store.list_keys_for_subscription(subscription_id).await?;
        let mut any_succeeded = false;
        for key in &keys {
            if let Some(server) = self.store.get_server(key.server_id).await? {
                if let Ok(backend) = self.backends.backend_for(server.id, &server.protocol, &server.api_url) {
                    if let Some(remote_id) = &key.backend_id {
                        match backend.reset_key_traffic(remote_id).await {
                            Ok(()) => any_succeeded = true,
                            Err(e) => warn!(key_id = key.id, "remote traffic reset failed: {e:#}"),
                        }
                    }
                }
            }
            // Zero the stored counter regardless of remote success — the
            // next poll reconciles to the true value (spec.md §4.6 step 2).
            self.store.reset_key_traffic(&key.backend, key.id).await?;
        }

        if any_succeeded || keys.is_empty() {
            self.store.update_subscription_traffic(subscription_id, 0).await?;
        }
        self.store.reset_traffic_on_extension(subscription_id).await?;
        Ok(())
    }
}
