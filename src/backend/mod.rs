//! VPN backend clients (C2) — the `VpnBackend` trait abstracts the two
//! protocol-specific REST APIs (Outline's management API, V2Ray/Xray's
//! custom sync endpoints) behind one shape the rest of the daemon talks to.

pub mod outline;
pub mod v2ray;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// A key as reported by a backend server, normalized from whatever shape
/// that server's API happens to use (see [`outline`] and [`v2ray`] for the
/// documented shape variance each one tolerates).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteKey {
    pub remote_id: String,
    pub email: Option<String>,
    pub access_url: Option<String>,
    pub traffic_limit_bytes: Option<i64>,
}

/// Traffic counters for a single key, as returned by a backend's stats
/// endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrafficStats {
    pub bytes_used: i64,
}

/// Per-server bulk traffic history, keyed by remote key id — the shape
/// the traffic monitor (C6) pulls in one call per server rather than one
/// call per key.
#[derive(Debug, Clone, Default)]
pub struct TrafficHistory {
    pub by_remote_id: std::collections::HashMap<String, TrafficStats>,
}

/// Builds (and caches) the right [`VpnBackend`] implementation for a
/// server's stored protocol. Kept behind a trait so tests can substitute a
/// mock registry instead of issuing real HTTP calls.
pub trait BackendRegistry: Send + Sync {
    fn backend_for(
        &self,
        server_id: i64,
        protocol: &str,
        api_url: &str,
    ) -> anyhow::Result<std::sync::Arc<dyn VpnBackend>>;
}

/// Default registry: constructs a fresh `reqwest` client per server, cached
/// for the lifetime of the daemon (spec.md §5 — "Protocol clients hold
/// per-server HTTP sessions and must be explicitly closed").
pub struct HttpBackendRegistry {
    cache: std::sync::Mutex<std::collections::HashMap<i64, std::sync::Arc<dyn VpnBackend>>>,
    timeout_secs: u64,
    connect_timeout_secs: u64,
}

impl Default for HttpBackendRegistry {
    fn default() -> Self {
        Self::new(30, 5)
    }
}

impl HttpBackendRegistry {
    pub fn new(timeout_secs: u64, connect_timeout_secs: u64) -> Self {
        Self {
            cache: std::sync::Mutex::new(std::collections::HashMap::new()),
            timeout_secs,
            connect_timeout_secs,
        }
    }
}

impl BackendRegistry for HttpBackendRegistry {
    fn backend_for(
        &self,
        server_id: i64,
        protocol: &str,
        api_url: &str,
    ) -> anyhow::Result<std::sync::Arc<dyn VpnBackend>> {
        let mut cache = self.cache.lock().expect("backend registry mutex poisoned");
        if let Some(existing) = cache.get(&server_id) {
            return Ok(existing.clone());
        }
        let built: std::sync::Arc<dyn VpnBackend> = match protocol {
            "outline" => std::sync::Arc::new(outline::OutlineClient::new(
                server_id,
                api_url,
                false,
                self.timeout_secs,
                self.connect_timeout_secs,
            )?),
            "v2ray" => std::sync::Arc::new(v2ray::V2RayClient::new(
                server_id,
                api_url,
                false,
                self.timeout_secs,
                self.connect_timeout_secs,
            )?),
            other => anyhow::bail!("unknown backend protocol: {other}"),
        };
        cache.insert(server_id, built.clone());
        Ok(built)
    }
}

/// Abstraction over a single backend server's management API.
///
/// Implementations must not fabricate fields they cannot obtain from the
/// remote API — a V2Ray key created but not yet linked has an absent
/// `access_url` rather than a placeholder.
#[async_trait]
pub trait VpnBackend: Send + Sync {
    /// Provision a new user/key on the backend. `email` is a stable label
    /// (not necessarily a real address) used to identify the key across
    /// calls.
    async fn create_user(&self, email: &str, traffic_limit_bytes: Option<i64>) -> CoreResult<RemoteKey>;

    async fn delete_user(&self, remote_id: &str) -> CoreResult<()>;

    /// Fetch (or re-fetch) the client-facing config/access URL for an
    /// existing key.
    async fn get_user_config(&self, remote_id: &str) -> CoreResult<RemoteKey>;

    async fn get_key_traffic_stats(&self, remote_id: &str) -> CoreResult<TrafficStats>;

    /// Bulk-fetch traffic for every key on this server in one call —
    /// preferred over per-key polling when the backend supports it.
    async fn get_traffic_history(&self) -> CoreResult<TrafficHistory>;

    async fn reset_key_traffic(&self, remote_id: &str) -> CoreResult<()>;

    async fn get_all_keys(&self) -> CoreResult<Vec<RemoteKey>>;

    /// No-op for Outline; for V2Ray, pushes the updated Xray config to the
    /// server after a key create/delete so the inbound actually sees it.
    async fn sync_config(&self) -> CoreResult<()> {
        Ok(())
    }

    /// Release any held resources (connection pools, etc). Most
    /// implementations have nothing to do here.
    async fn close(&self) {}
}
