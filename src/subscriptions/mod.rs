//! Subscription Engine (C4) — create/extend/deactivate/delete with fan-out
//! key provisioning across the active V2Ray server fleet (spec.md §4.4).

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::backend::BackendRegistry;
use crate::cache::{subscription_key, BundleCache};
use crate::config::DaemonConfig;
use crate::notify::{Notification, NotificationSink};
use crate::store::{ServerRow, Store, SubscriptionRow};
use crate::traffic::TrafficMonitor;

const MAX_TOKEN_COLLISION_RETRIES: u32 = 10;
const MAX_SUBSCRIPTION_DURATION_SECS: i64 = 10 * 365 * 86_400;

/// Outcome of [`SubscriptionEngine::create_or_extend`].
#[derive(Debug)]
pub struct CreateOutcome {
    pub subscription: SubscriptionRow,
    pub extended: bool,
    pub created_keys: usize,
    pub failed_servers: Vec<i64>,
}

pub struct SubscriptionEngine {
    store: Arc<Store>,
    cache: Arc<BundleCache>,
    notify: Arc<dyn NotificationSink>,
    backends: Arc<dyn BackendRegistry>,
    config: Arc<DaemonConfig>,
    traffic: Arc<TrafficMonitor>,
}

impl SubscriptionEngine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<BundleCache>,
        notify: Arc<dyn NotificationSink>,
        backends: Arc<dyn BackendRegistry>,
        config: Arc<DaemonConfig>,
        traffic: Arc<TrafficMonitor>,
    ) -> Self {
        Self {
            store,
            cache,
            notify,
            backends,
            config,
            traffic,
        }
    }

    /// Entry point for a purchase: extends an existing active subscription
    /// if one exists, otherwise creates a new one (spec.md §4.4 step 1).
    pub async fn create_or_extend(
        &self,
        user_id: i64,
        tariff_id: i64,
        duration_sec: i64,
    ) -> Result<CreateOutcome> {
        if let Some(existing) = self.store.get_active_subscription(user_id).await? {
            let extended = self.extend(existing.id, duration_sec).await?;
            return Ok(CreateOutcome {
                subscription: extended,
                extended: true,
                created_keys: 0,
                failed_servers: Vec::new(),
            });
        }
        self.create(user_id, tariff_id, duration_sec).await
    }

    async fn create(&self, user_id: i64, tariff_id: i64, duration_sec: i64) -> Result<CreateOutcome> {
        anyhow::ensure!(duration_sec > 0, "duration_sec must be positive");
        anyhow::ensure!(
            duration_sec <= MAX_SUBSCRIPTION_DURATION_SECS,
            "duration_sec exceeds the 10-year ceiling"
        );

        // Existence check only — the tariff's own fields are consulted
        // later via `effective_limit_bytes`, not duplicated here.
        self.store
            .get_tariff(tariff_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("tariff {tariff_id} not found"))?;

        let subscription = self
            .insert_with_unique_token(user_id, tariff_id, duration_sec)
            .await?;

        let servers = self.store.list_active_v2ray_servers().await?;
        let mut created_keys = 0usize;
        let mut failed_servers = Vec::new();

        for server in &servers {
            match self.provision_one(&subscription, server, user_id).await {
                Ok(()) => created_keys += 1,
                Err(e) => {
                    warn!(server_id = server.id, subscription_id = subscription.id, "provisioning failed: {e:#}");
                    failed_servers.push(server.id);
                }
            }
        }

        if !failed_servers.is_empty() {
            self.notify
                .notify(Notification::PartialProvisioning {
                    user_id,
                    subscription_id: subscription.id,
                    failed_servers: failed_servers.clone(),
                })
                .await;
        }

        Ok(CreateOutcome {
            subscription,
            extended: false,
            created_keys,
            failed_servers,
        })
    }

    async fn insert_with_unique_token(
        &self,
        user_id: i64,
        tariff_id: i64,
        duration_sec: i64,
    ) -> Result<SubscriptionRow> {
        // `create_subscription` generates its own token internally; retry
        // on the vanishingly unlikely UUIDv4 collision (spec.md §4.4 step 2).
        let mut last_err = None;
        for _ in 0..MAX_TOKEN_COLLISION_RETRIES {
            match self
                .store
                .create_subscription(user_id, tariff_id, duration_sec, None)
                .await
            {
                Ok(sub) => return Ok(sub),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("token generation exhausted retries")))
    }

    /// Provision a single server for a newly-created subscription: create
    /// the remote key, obtain its client config, persist the row. Attempts
    /// a compensating delete if the remote key was created but the local
    /// write failed.
    async fn provision_one(&self, sub: &SubscriptionRow, server: &ServerRow, user_id: i64) -> Result<()> {
        let email = format!(
            "{}_subscription_{}@{}",
            user_id, sub.id, self.config.email_domain
        );
        let backend = self
            .backends
            .backend_for(server.id, &server.protocol, &server.api_url)?;

        let remote = backend.create_user(&email, None).await?;

        let persisted = self
            .store
            .create_v2ray_key(
                server.id,
                user_id,
                Some(sub.id),
                &email,
                None,
                &remote.remote_id,
                0,
                remote.access_url.as_deref(),
            )
            .await;

        if let Err(e) = persisted {
            error!(server_id = server.id, "key created remotely but not persisted — compensating delete");
            if let Err(delete_err) = backend.delete_user(&remote.remote_id).await {
                error!(server_id = server.id, "compensating delete also failed: {delete_err:#}");
            }
            return Err(e);
        }

        Ok(())
    }

    /// Extend a subscription's expiry by `delta_sec`, added to its current
    /// stored value (spec.md §4.4 Extend — never `now + delta`).
    pub async fn extend(&self, subscription_id: i64, delta_sec: i64) -> Result<SubscriptionRow> {
        let updated = self.store.extend_subscription(subscription_id, delta_sec).await?;
        self.traffic.reset_subscription_traffic(subscription_id).await?;
        // Re-arm the purchase notification so the collaborator fires again
        // for this renewal (spec.md §4.4 Extend).
        self.clear_purchase_notification(subscription_id).await?;
        self.cache.delete(&subscription_key(&updated.token));
        info!(subscription_id, new_expires_at = updated.expires_at, "subscription extended");
        Ok(updated)
    }

    async fn clear_purchase_notification(&self, subscription_id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET purchase_notification_sent = 0 WHERE id = ?")
            .bind(subscription_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Deactivate a subscription: best-effort remote key teardown, delete
    /// key rows, flip `is_active`, invalidate the bundle cache. Never
    /// deletes the subscription row (spec.md §4.4 Deactivate).
    pub async fn deactivate(&self, subscription_id: i64) -> Result<()> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("subscription {subscription_id} not found"))?;

        let keys = self.store.list_keys_for_subscription(subscription_id).await?;
        for key in &keys {
            if let Some(server) = self.store.get_server(key.server_id).await? {
                if let Ok(backend) = self.backends.backend_for(server.id, &server.protocol, &server.api_url) {
                    if let Some(remote_id) = &key.backend_id {
                        if let Err(e) = backend.delete_user(remote_id).await {
                            warn!(key_id = key.id, "best-effort delete_user failed: {e:#}");
                        }
                    }
                }
            }
            self.store.delete_key(&key.backend, key.id).await?;
        }

        self.store.deactivate_subscription(subscription_id).await?;
        self.cache.delete(&subscription_key(&sub.token));
        Ok(())
    }

    /// Admin deletion: deactivate, then physically remove the subscription
    /// row under the foreign-key escape hatch (spec.md §4.4 Deletion).
    pub async fn delete(&self, subscription_id: i64) -> Result<()> {
        self.deactivate(subscription_id).await?;
        self.store
            .with_foreign_keys_off("DELETE FROM subscriptions WHERE id = ?", subscription_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RemoteKey, TrafficHistory, TrafficStats, VpnBackend};
    use crate::error::CoreResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        created: AtomicUsize,
        deleted: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl VpnBackend for FakeBackend {
        async fn create_user(&self, email: &str, _limit: Option<i64>) -> CoreResult<RemoteKey> {
            if self.fail {
                return Err(crate::error::CoreError::BackendUnavailable {
                    server_id: 0,
                    reason: "simulated outage".to_string(),
                });
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteKey {
                remote_id: format!("remote-{email}"),
                email: Some(email.to_string()),
                access_url: Some("vless://uuid@host:443?sni=x.com&sid=ab#frag".to_string()),
                traffic_limit_bytes: None,
            })
        }
        async fn delete_user(&self, _remote_id: &str) -> CoreResult<()> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn get_user_config(&self, remote_id: &str) -> CoreResult<RemoteKey> {
            Ok(RemoteKey {
                remote_id: remote_id.to_string(),
                email: None,
                access_url: None,
                traffic_limit_bytes: None,
            })
        }
        async fn get_key_traffic_stats(&self, _remote_id: &str) -> CoreResult<TrafficStats> {
            Ok(TrafficStats::default())
        }
        async fn get_traffic_history(&self) -> CoreResult<TrafficHistory> {
            Ok(TrafficHistory::default())
        }
        async fn reset_key_traffic(&self, _remote_id: &str) -> CoreResult<()> {
            Ok(())
        }
        async fn get_all_keys(&self) -> CoreResult<Vec<RemoteKey>> {
            Ok(Vec::new())
        }
    }

    struct FakeRegistry {
        fail_server_id: Option<i64>,
    }

    impl BackendRegistry for FakeRegistry {
        fn backend_for(
            &self,
            server_id: i64,
            _protocol: &str,
            _api_url: &str,
        ) -> anyhow::Result<Arc<dyn VpnBackend>> {
            Ok(Arc::new(FakeBackend {
                created: AtomicUsize::new(0),
                deleted: AtomicUsize::new(0),
                fail: self.fail_server_id == Some(server_id),
            }))
        }
    }

    struct NoopSink;
    #[async_trait]
    impl NotificationSink for NoopSink {
        async fn notify(&self, _n: Notification) {}
    }

    async fn engine(fail_server_id: Option<i64>) -> (SubscriptionEngine, Arc<Store>) {
        let store = Arc::new(Store::new_in_memory().await.unwrap());
        store.get_or_create_user(42, "user42").await.unwrap();
        store.create_tariff("Monthly", 2_592_000, 500, 10_240).await.unwrap();
        store
            .create_server("fra-1", "DE", "v2ray", "https://fra-1.example", "cred", "fra-1.example")
            .await
            .unwrap();
        store
            .create_server("ams-1", "NL", "v2ray", "https://ams-1.example", "cred", "ams-1.example")
            .await
            .unwrap();

        let cache = Arc::new(BundleCache::new());
        let notify: Arc<dyn NotificationSink> = Arc::new(NoopSink);
        let backends: Arc<dyn BackendRegistry> = Arc::new(FakeRegistry { fail_server_id });
        let config = Arc::new(DaemonConfig::new(Some(std::path::PathBuf::from("/tmp/veectl-test")), None, None));
        let traffic = Arc::new(TrafficMonitor::new(
            store.clone(),
            cache.clone(),
            backends.clone(),
            notify.clone(),
        ));

        (
            SubscriptionEngine::new(store.clone(), cache, notify, backends, config, traffic),
            store,
        )
    }

    #[tokio::test]
    async fn create_provisions_across_all_active_servers() {
        let (engine, store) = engine(None).await;
        let outcome = engine.create_or_extend(42, 1, 2_592_000).await.unwrap();
        assert!(!outcome.extended);
        assert_eq!(outcome.created_keys, 2);
        assert!(outcome.failed_servers.is_empty());

        let keys = store.list_keys_for_subscription(outcome.subscription.id).await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn create_then_extend_reuses_existing_subscription() {
        let (engine, _store) = engine(None).await;
        let first = engine.create_or_extend(42, 1, 1_000).await.unwrap();
        let second = engine.create_or_extend(42, 1, 500).await.unwrap();
        assert!(second.extended);
        assert_eq!(second.subscription.id, first.subscription.id);
        assert_eq!(
            second.subscription.expires_at,
            first.subscription.expires_at + 500
        );
    }

    #[tokio::test]
    async fn create_records_failed_servers_but_succeeds_with_one_key() {
        let (engine, _store) = engine(Some(1)).await;
        let outcome = engine.create_or_extend(42, 1, 2_592_000).await.unwrap();
        assert_eq!(outcome.created_keys, 1);
        assert_eq!(outcome.failed_servers, vec![1]);
    }

    #[tokio::test]
    async fn deactivate_removes_keys_and_clears_active_flag() {
        let (engine, store) = engine(None).await;
        let outcome = engine.create_or_extend(42, 1, 2_592_000).await.unwrap();
        engine.deactivate(outcome.subscription.id).await.unwrap();

        let keys = store.list_keys_for_subscription(outcome.subscription.id).await.unwrap();
        assert!(keys.is_empty());
        let sub = store.get_subscription(outcome.subscription.id).await.unwrap().unwrap();
        assert!(!sub.is_active);
    }
}
