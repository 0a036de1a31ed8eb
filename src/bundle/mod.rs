//! Bundle Server (C5) — `GET /api/subscription/{token}` (spec.md §4.5).

pub mod rate_limit;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::warn;

use crate::backend::BackendRegistry;
use crate::cache::{subscription_key, BundleCache};
use crate::config::DaemonConfig;
use crate::normalize;
use crate::store::Store;
use rate_limit::BundleRateLimiter;

pub struct BundleServer {
    store: Arc<Store>,
    cache: Arc<BundleCache>,
    backends: Arc<dyn BackendRegistry>,
    rate_limiter: BundleRateLimiter,
    config: Arc<DaemonConfig>,
}

impl BundleServer {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<BundleCache>,
        backends: Arc<dyn BackendRegistry>,
        config: Arc<DaemonConfig>,
    ) -> Self {
        let rate_limiter = BundleRateLimiter::new(config.bundle_rate_limit_per_min);
        Self {
            store,
            cache,
            backends,
            rate_limiter,
            config,
        }
    }
}

pub fn router(server: Arc<BundleServer>) -> Router {
    Router::new()
        .route("/api/subscription/{token}", get(get_subscription_bundle))
        .with_state(server)
}

/// Token must look UUID-shaped: at least 32 characters, alphanumeric with
/// `-` separators only (spec.md §4.5 step 1, §8 boundary: length < 32 → 400).
fn is_valid_token(token: &str) -> bool {
    token.len() >= 32 && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

async fn get_subscription_bundle(
    State(server): State<Arc<BundleServer>>,
    Path(token): Path<String>,
) -> Response {
    if !is_valid_token(&token) {
        return (StatusCode::BAD_REQUEST, "malformed token").into_response();
    }

    let now = chrono::Utc::now().timestamp();
    if server.rate_limiter.is_limited(&token, now).await {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }

    // Always invalidate before generating — guarantees fresh server-name
    // fragments even if a stale entry is still within its TTL.
    server.cache.delete(&subscription_key(&token));

    let subscription = match server.store.get_subscription_by_token(&token).await {
        Ok(Some(sub)) if sub.is_active && sub.expires_at > now => sub,
        Ok(_) => return (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => {
            warn!("bundle lookup failed: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    let mut keys = match server.store.list_subscription_keys_with_servers(subscription.id).await {
        Ok(k) => k,
        Err(e) => {
            warn!("bundle key lookup failed: {e:#}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };
    keys.retain(|kws| kws.server.active);
    keys.sort_by(|a, b| {
        (&a.server.country, &a.server.name).cmp(&(&b.server.country, &b.server.name))
    });

    let mut lines = Vec::with_capacity(keys.len());
    for kws in &keys {
        let raw_config = match &kws.key.client_config {
            Some(cfg) if cfg.contains("vless://") => cfg.clone(),
            _ => {
                let Ok(backend) =
                    server
                        .backends
                        .backend_for(kws.server.id, &kws.server.protocol, &kws.server.api_url)
                else {
                    continue;
                };
                let Some(remote_id) = &kws.key.backend_id else {
                    continue;
                };
                match backend.get_user_config(remote_id).await {
                    Ok(remote) => match remote.access_url {
                        Some(cfg) => {
                            if let Err(e) = server
                                .store
                                .set_key_client_config(&kws.key.backend, kws.key.id, &cfg)
                                .await
                            {
                                warn!("client_config writeback failed: {e:#}");
                            }
                            cfg
                        }
                        None => continue,
                    },
                    Err(e) => {
                        warn!(server_id = kws.server.id, "get_user_config failed: {e:#}");
                        continue;
                    }
                }
            }
        };

        let normalized = normalize::normalize_host(&raw_config, &kws.server.domain, &kws.server.api_url);
        let stripped = normalize::strip_fragment(&normalized);
        let with_fragment = normalize::set_fragment(&stripped, &kws.server.name);
        lines.push(with_fragment);
    }

    if lines.is_empty() {
        return (StatusCode::NOT_FOUND, "no keys available").into_response();
    }

    let body = STANDARD.encode(lines.join("\n"));

    server.cache.set(
        &subscription_key(&token),
        body.clone(),
        std::time::Duration::from_secs(server.config.bundle_ttl_secs),
    );
    if let Err(e) = server.store.touch_subscription(subscription.id).await {
        warn!("failed to touch subscription: {e:#}");
    }

    let limit_bytes = server
        .store
        .effective_limit_bytes(&subscription)
        .await
        .unwrap_or(0);
    let title = subscription
        .bundle_title
        .clone()
        .unwrap_or_else(|| server.config.bundle_title_default.clone());

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        "text/plain; charset=utf-8".parse().unwrap(),
    );
    headers.insert(
        "Subscription-Userinfo",
        format!(
            "upload=0; download={}; total={}; expire={}",
            subscription.traffic_usage_bytes, limit_bytes, subscription.expires_at
        )
        .parse()
        .unwrap(),
    );
    headers.insert(
        "Profile-Title",
        utf8_percent_encode(&title, NON_ALPHANUMERIC)
            .to_string()
            .parse()
            .unwrap(),
    );
    headers.insert(
        header::CACHE_CONTROL,
        "no-cache, no-store, must-revalidate".parse().unwrap(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_validation_rejects_short_tokens() {
        assert!(!is_valid_token("short"));
    }

    #[test]
    fn token_validation_accepts_uuid_shaped_tokens() {
        assert!(is_valid_token("0b1d6e2a-4c3a-4a5e-9f0a-1234567890ab"));
    }

    #[test]
    fn token_validation_rejects_special_characters() {
        assert!(!is_valid_token("0b1d6e2a-4c3a-4a5e-9f0a-1234567890ab;drop"));
    }
}
