//! Vee VPN subscription control plane — catalog, fleet sync, bundle server.

pub mod backend;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod error;
pub mod normalize;
pub mod notify;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod subscriptions;
pub mod traffic;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use backend::HttpBackendRegistry;
use bundle::BundleServer;
use cache::BundleCache;
use config::DaemonConfig;
use notify::LoggingSink;
use reconcile::Reconciler;
use scheduler::ExpiryScheduler;
use store::Store;
use subscriptions::SubscriptionEngine;
use traffic::TrafficMonitor;

/// Everything the daemon wires together at startup — store, fleet registry,
/// bundle server, and the three background collaborators (traffic monitor,
/// reconciler, expiry scheduler).
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub store: Arc<Store>,
    pub cache: Arc<BundleCache>,
    pub backends: Arc<HttpBackendRegistry>,
    pub subscriptions: Arc<SubscriptionEngine>,
    pub traffic: Arc<TrafficMonitor>,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Arc<ExpiryScheduler>,
    pub bundle: Arc<BundleServer>,
}

impl AppContext {
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(Store::new(&config.data_dir, config.pool_size).await?);

        let cache = Arc::new(BundleCache::new());
        let notify: Arc<dyn notify::NotificationSink> = Arc::new(LoggingSink);
        let backends = Arc::new(HttpBackendRegistry::new(
            config.backend_timeout_secs,
            config.backend_connect_timeout_secs,
        ));
        let backend_registry: Arc<dyn backend::BackendRegistry> = backends.clone();

        let traffic = Arc::new(TrafficMonitor::new(
            store.clone(),
            cache.clone(),
            backend_registry.clone(),
            notify.clone(),
        ));

        let subscriptions = Arc::new(SubscriptionEngine::new(
            store.clone(),
            cache.clone(),
            notify.clone(),
            backend_registry.clone(),
            config.clone(),
            traffic.clone(),
        ));

        let reconciler = Arc::new(Reconciler::new(store.clone(), backend_registry.clone()));

        let scheduler = Arc::new(ExpiryScheduler::new(
            store.clone(),
            cache.clone(),
            notify.clone(),
            subscriptions.clone(),
            config.clone(),
        ));

        let bundle = Arc::new(BundleServer::new(
            store.clone(),
            cache.clone(),
            backend_registry,
            config.clone(),
        ));

        Ok(Self {
            config,
            store,
            cache,
            backends,
            subscriptions,
            traffic,
            reconciler,
            scheduler,
            bundle,
        })
    }

    /// Spawn the background collaborators (traffic poll, expiry sweep) and
    /// serve the bundle HTTP endpoint until the process is killed.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.traffic.clone().spawn(self.config.traffic_poll_interval_secs);
        self.scheduler.clone().spawn(self.config.expiry_sweep_interval_secs);

        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.rest_port).parse()?;
        let router = bundle::router(self.bundle.clone());

        info!(%addr, "bundle server listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;
        Ok(())
    }
}
