//! Shared scaffolding for the integration-test suite: a real on-disk
//! (tempdir) SQLite store, a `wiremock`-backed VPN server standing in for
//! Outline/V2Ray, and the full set of core collaborators wired the way
//! `AppContext::new` wires them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::net::TcpListener;
use veectl::backend::{BackendRegistry, HttpBackendRegistry};
use veectl::bundle::{self, BundleServer};
use veectl::cache::BundleCache;
use veectl::config::DaemonConfig;
use veectl::notify::{Notification, NotificationSink};
use veectl::reconcile::Reconciler;
use veectl::store::{ServerRow, Store};
use veectl::subscriptions::SubscriptionEngine;
use veectl::traffic::TrafficMonitor;

/// A minimal, complete V2Ray `create_user` response: one id, no nested
/// envelope, matching the plainest shape the client tolerates.
pub static V2RAY_CREATE_RESPONSE: Lazy<serde_json::Value> =
    Lazy::new(|| serde_json::json!({ "id": "remote-key-1" }));

/// Records every notification handed to it, for assertions on
/// notify-exactly-once behavior.
#[derive(Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, notification: Notification) {
        self.events.lock().unwrap().push(notification);
    }
}

pub struct Harness {
    pub _tempdir: tempfile::TempDir,
    pub backend: wiremock::MockServer,
    pub config: DaemonConfig,
    pub store: Arc<Store>,
    pub cache: Arc<BundleCache>,
    pub notify: RecordingSink,
    pub backend_registry: Arc<dyn BackendRegistry>,
    pub traffic: Arc<TrafficMonitor>,
    pub subscriptions: Arc<SubscriptionEngine>,
    pub reconciler: Arc<Reconciler>,
    pub user_id: i64,
    pub tariff_id: i64,
}

impl Harness {
    pub async fn new() -> Self {
        let tempdir = tempfile::tempdir().unwrap();
        let backend = wiremock::MockServer::start().await;
        let config = DaemonConfig::new(Some(tempdir.path().to_path_buf()), Some("warn".to_string()), None);

        let store = Arc::new(Store::new(&config.data_dir, config.pool_size).await.unwrap());
        let cache = Arc::new(BundleCache::new());
        let notify = RecordingSink::default();
        let sink: Arc<dyn NotificationSink> = Arc::new(notify.clone());
        let backends = Arc::new(HttpBackendRegistry::new(
            config.backend_timeout_secs,
            config.backend_connect_timeout_secs,
        ));
        let backend_registry: Arc<dyn BackendRegistry> = backends;

        let traffic = Arc::new(TrafficMonitor::new(
            store.clone(),
            cache.clone(),
            backend_registry.clone(),
            sink.clone(),
        ));

        let config_arc = Arc::new(config.clone());
        let subscriptions = Arc::new(SubscriptionEngine::new(
            store.clone(),
            cache.clone(),
            sink.clone(),
            backend_registry.clone(),
            config_arc,
            traffic.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(store.clone(), backend_registry.clone()));

        let user = store.get_or_create_user(1, "alice").await.unwrap();
        let tariff = store.create_tariff("Monthly", 2_592_000, 500, 0).await.unwrap();

        Self {
            _tempdir: tempdir,
            backend,
            config,
            store,
            cache,
            notify,
            backend_registry,
            traffic,
            subscriptions,
            reconciler,
            user_id: user.id,
            tariff_id: tariff.id,
        }
    }

    pub async fn add_v2ray_server(&self, name: &str, country: &str) -> ServerRow {
        self.store
            .create_server(name, country, "v2ray", &self.backend.uri(), "cred", &format!("{name}.example"))
            .await
            .unwrap()
    }

    pub async fn add_outline_server(&self, name: &str, country: &str) -> ServerRow {
        self.store
            .create_server(name, country, "outline", &self.backend.uri(), "cred", &format!("{name}.example"))
            .await
            .unwrap()
    }

    /// Start a real bundle server bound to an ephemeral port, built from
    /// the harness's *current* config (read after the caller has had a
    /// chance to tweak it, e.g. `bundle_rate_limit_per_min`).
    pub async fn serve_bundle(&self) -> SocketAddr {
        let bundle = Arc::new(BundleServer::new(
            self.store.clone(),
            self.cache.clone(),
            self.backend_registry.clone(),
            Arc::new(self.config.clone()),
        ));
        let router = bundle::router(bundle);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}
