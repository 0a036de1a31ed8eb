//! Outline management-API client.
//!
//! Outline's REST surface is the simpler of the two: a single `POST /access-keys`
//! call returns everything needed, and traffic is reported per-key via
//! `/access-keys/{id}/transfer` plus a bulk `/metrics/transfer` endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use super::{RemoteKey, TrafficHistory, TrafficStats, VpnBackend};
use crate::error::{CoreError, CoreResult};
use crate::retry::{retry_with_backoff, RetryConfig};

pub struct OutlineClient {
    api_url: String,
    client: reqwest::Client,
    server_id: i64,
}

impl OutlineClient {
    pub fn new(
        server_id: i64,
        api_url: &str,
        accept_invalid_certs: bool,
        timeout_secs: u64,
        connect_timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
            server_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn do_request(
        &self,
        req: reqwest::RequestBuilder,
    ) -> CoreResult<reqwest::Response> {
        let resp = req.send().await.map_err(|e| CoreError::BackendUnavailable {
            server_id: self.server_id,
            reason: e.to_string(),
        })?;
        if resp.status().is_success() {
            Ok(resp)
        } else if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // Caller decides whether a 404 is acceptable (idempotent deletes).
            Ok(resp)
        } else {
            Err(CoreError::BackendRejected {
                server_id: self.server_id,
                reason: format!("status {}", resp.status()),
            })
        }
    }
}

/// Outline's `POST /access-keys` response, tolerating `id` vs `key_id` and a
/// bare-UUID vs nested-object shape for robustness (spec §4.2).
#[derive(Debug, Deserialize)]
struct RawKey {
    #[serde(alias = "key_id")]
    id: Option<Value>,
    #[serde(alias = "accessUrl")]
    access_url: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn normalize_id(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string().trim_matches('"').to_string(),
    }
}

fn parse_key(body: &Value) -> Option<RemoteKey> {
    // Tolerate `{keys: [...]}` envelopes being handed to single-key parsing by
    // unwrapping the first element when present.
    let body = body.get("key").unwrap_or(body);
    let raw: RawKey = serde_json::from_value(body.clone()).ok()?;
    let id = raw.id.as_ref().map(normalize_id)?;
    Some(RemoteKey {
        remote_id: id,
        email: raw.name,
        access_url: raw.access_url,
        traffic_limit_bytes: None,
    })
}

#[async_trait]
impl VpnBackend for OutlineClient {
    async fn create_user(&self, email: &str, traffic_limit_bytes: Option<i64>) -> CoreResult<RemoteKey> {
        let create = || async {
            let resp = self
                .do_request(self.client.post(self.url("/access-keys")).json(&serde_json::json!({
                    "name": email,
                })))
                .await?;
            let body: Value = resp.json().await.map_err(|e| CoreError::BackendRejected {
                server_id: self.server_id,
                reason: format!("invalid JSON from create_user: {e}"),
            })?;
            parse_key(&body).ok_or_else(|| CoreError::BackendRejected {
                server_id: self.server_id,
                reason: "create_user response missing key id".to_string(),
            })
        };

        // "Backend returns {keys: []} on provisioning" — retry once with the
        // same call before declaring failure (spec §8 boundary behavior).
        let key = retry_with_backoff(&RetryConfig::no_retry(), create).await;
        let mut key = match key {
            Ok(k) => k,
            Err(_) => create().await?,
        };

        if let Some(limit) = traffic_limit_bytes {
            if limit > 0 {
                let limit_url = self.url(&format!("/access-keys/{}/data-limit", key.remote_id));
                let _ = self
                    .do_request(self.client.put(limit_url).json(&serde_json::json!({
                        "limit": { "bytes": limit }
                    })))
                    .await;
                key.traffic_limit_bytes = Some(limit);
            }
        }

        Ok(key)
    }

    async fn delete_user(&self, remote_id: &str) -> CoreResult<()> {
        let resp = self
            .do_request(self.client.delete(self.url(&format!("/access-keys/{remote_id}"))))
            .await?;
        // Deleting an already-gone key is success (spec §4.2, §8 idempotence).
        let _ = resp.status();
        Ok(())
    }

    async fn get_user_config(&self, remote_id: &str) -> CoreResult<RemoteKey> {
        let resp = self
            .do_request(self.client.get(self.url(&format!("/access-keys/{remote_id}"))))
            .await?;
        let body: Value = resp.json().await.map_err(|e| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: format!("invalid JSON from get_user_config: {e}"),
        })?;
        parse_key(&body).ok_or_else(|| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: "get_user_config response missing key id".to_string(),
        })
    }

    async fn get_key_traffic_stats(&self, remote_id: &str) -> CoreResult<TrafficStats> {
        let history = self.get_traffic_history().await?;
        Ok(history
            .by_remote_id
            .get(remote_id)
            .copied()
            .unwrap_or_default())
    }

    async fn get_traffic_history(&self) -> CoreResult<TrafficHistory> {
        let resp = self
            .do_request(self.client.get(self.url("/metrics/transfer")))
            .await?;
        let body: Value = resp.json().await.map_err(|e| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: format!("invalid JSON from metrics/transfer: {e}"),
        })?;
        let mut by_remote_id = std::collections::HashMap::new();
        if let Some(map) = body.get("bytesTransferredByUserId").and_then(Value::as_object) {
            for (id, bytes) in map {
                let bytes_used = bytes.as_i64().unwrap_or(0);
                by_remote_id.insert(id.clone(), TrafficStats { bytes_used });
            }
        }
        Ok(TrafficHistory { by_remote_id })
    }

    async fn reset_key_traffic(&self, _remote_id: &str) -> CoreResult<()> {
        // Outline has no traffic-reset endpoint; the store-side counter is
        // zeroed by the caller and reconciled on the next poll.
        Ok(())
    }

    async fn get_all_keys(&self) -> CoreResult<Vec<RemoteKey>> {
        let resp = self
            .do_request(self.client.get(self.url("/access-keys")))
            .await?;
        let body: Value = resp.json().await.map_err(|e| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: format!("invalid JSON from get_all_keys: {e}"),
        })?;
        // Tolerate both a bare array and `{accessKeys: [...]}` envelopes.
        let items = body
            .get("accessKeys")
            .or_else(|| body.get("keys"))
            .cloned()
            .unwrap_or(body);
        let items = items.as_array().cloned().unwrap_or_default();
        Ok(items.iter().filter_map(parse_key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_tolerates_id_alias() {
        let body = serde_json::json!({"key_id": "abc", "accessUrl": "ss://x", "name": "u1"});
        let key = parse_key(&body).unwrap();
        assert_eq!(key.remote_id, "abc");
        assert_eq!(key.access_url.as_deref(), Some("ss://x"));
    }

    #[test]
    fn parse_key_tolerates_nested_key_envelope() {
        let body = serde_json::json!({"key": {"id": "xyz", "accessUrl": "ss://y"}});
        let key = parse_key(&body).unwrap();
        assert_eq!(key.remote_id, "xyz");
    }

    #[test]
    fn parse_key_returns_none_without_id() {
        let body = serde_json::json!({"accessUrl": "ss://z"});
        assert!(parse_key(&body).is_none());
    }
}
