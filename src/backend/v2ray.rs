//! V2Ray/Xray management-API client.
//!
//! Key creation is a multi-step dance (spec §4.2): create the user, fetch
//! the server-generated VLESS link, and if the link is missing required
//! reality parameters, nudge the backend to sync its Xray config and retry
//! once. Never fabricates `short_id`/`sni`/`pbk` — those are only ever
//! accepted from the backend's own response.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use super::{RemoteKey, TrafficHistory, TrafficStats, VpnBackend};
use crate::error::{CoreError, CoreResult};

pub struct V2RayClient {
    api_url: String,
    client: reqwest::Client,
    server_id: i64,
}

impl V2RayClient {
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

    async fn do_request(&self, req: reqwest::RequestBuilder) -> CoreResult<reqwest::Response> {
        let resp = req.send().await.map_err(|e| CoreError::BackendUnavailable {
            server_id: self.server_id,
            reason: e.to_string(),
        })?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(resp)
        } else {
            Err(CoreError::BackendRejected {
                server_id: self.server_id,
                reason: format!("status {}", resp.status()),
            })
        }
    }
}

/// Tolerates `id`/`key_id` and a top-level/nested `uuid` (spec §4.2
/// response-shape robustness).
#[derive(Debug, Deserialize, Default)]
struct CreateKeyResponse {
    #[serde(alias = "key_id")]
    id: Option<Value>,
    uuid: Option<String>,
    #[serde(default)]
    key: Option<Box<CreateKeyResponse>>,
    port: Option<u16>,
    short_id: Option<String>,
    sni: Option<String>,
}

impl CreateKeyResponse {
    fn key_id(&self) -> Option<String> {
        self.id
            .as_ref()
            .map(normalize_id)
            .or_else(|| self.key.as_ref().and_then(|k| k.key_id()))
    }

    fn uuid(&self) -> Option<String> {
        self.uuid
            .clone()
            .or_else(|| self.key.as_ref().and_then(|k| k.uuid()))
    }
}

fn normalize_id(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string().trim_matches('"').to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct LinkResponse {
    vless_link: Option<String>,
}

#[async_trait]
impl VpnBackend for V2RayClient {
    async fn create_user(&self, email: &str, traffic_limit_bytes: Option<i64>) -> CoreResult<RemoteKey> {
        let resp = self
            .do_request(self.client.post(self.url("/keys")).json(&serde_json::json!({
                "name": email,
            })))
            .await?;
        let created: CreateKeyResponse = resp.json().await.map_err(|e| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: format!("invalid JSON from create_user: {e}"),
        })?;
        let key_id = created.key_id().ok_or_else(|| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: "create_user response missing key id".to_string(),
        })?;

        // Step 2: fetch the ready link. If it's missing reality parameters,
        // nudge a config sync and retry exactly once.
        let mut client_config = self.fetch_link(&key_id).await?;
        if !has_required_params(client_config.as_deref()) {
            let _ = self.sync_config().await;
            client_config = self.fetch_link(&key_id).await?;
        }

        // Step 3: fall back to get_user_config; if that also fails, keep the
        // remotely-created key and return a partial record rather than
        // fabricating parameters.
        if client_config.is_none() {
            match self.get_user_config(&key_id).await {
                Ok(full) => {
                    return Ok(RemoteKey {
                        traffic_limit_bytes,
                        ..full
                    })
                }
                Err(e) => {
                    warn!(server_id = self.server_id, key_id, "v2ray link and config both unavailable: {e}");
                }
            }
        }

        Ok(RemoteKey {
            remote_id: key_id,
            email: Some(email.to_string()),
            access_url: client_config,
            traffic_limit_bytes,
        })
    }

    async fn delete_user(&self, remote_id: &str) -> CoreResult<()> {
        let _ = self
            .do_request(self.client.delete(self.url(&format!("/keys/{remote_id}"))))
            .await?;
        Ok(())
    }

    async fn get_user_config(&self, remote_id: &str) -> CoreResult<RemoteKey> {
        if let Some(link) = self.fetch_link(remote_id).await? {
            return Ok(RemoteKey {
                remote_id: remote_id.to_string(),
                email: None,
                access_url: Some(link),
                traffic_limit_bytes: None,
            });
        }
        let resp = self
            .do_request(self.client.get(self.url(&format!("/keys/{remote_id}"))))
            .await?;
        let body: CreateKeyResponse = resp.json().await.map_err(|e| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: format!("invalid JSON from get_user_config: {e}"),
        })?;
        Ok(RemoteKey {
            remote_id: remote_id.to_string(),
            email: None,
            access_url: None,
            traffic_limit_bytes: None,
        }
        .with_uuid(body.uuid()))
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
            .do_request(self.client.get(self.url("/traffic")))
            .await?;
        let body: Value = resp.json().await.map_err(|e| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: format!("invalid JSON from get_traffic_history: {e}"),
        })?;
        let mut by_remote_id = std::collections::HashMap::new();
        if let Some(map) = body.as_object() {
            for (uuid, bytes) in map {
                let bytes_used = bytes
                    .get("total")
                    .and_then(Value::as_i64)
                    .or_else(|| bytes.as_i64())
                    .unwrap_or(0);
                by_remote_id.insert(uuid.clone(), TrafficStats { bytes_used });
            }
        }
        Ok(TrafficHistory { by_remote_id })
    }

    async fn reset_key_traffic(&self, remote_id: &str) -> CoreResult<()> {
        let _ = self
            .do_request(
                self.client
                    .post(self.url(&format!("/keys/{remote_id}/traffic/reset"))),
            )
            .await?;
        Ok(())
    }

    async fn get_all_keys(&self) -> CoreResult<Vec<RemoteKey>> {
        let resp = self.do_request(self.client.get(self.url("/keys"))).await?;
        let body: Value = resp.json().await.map_err(|e| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: format!("invalid JSON from get_all_keys: {e}"),
        })?;
        let items = body.get("keys").cloned().unwrap_or(body);
        let items = items.as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|v| serde_json::from_value::<CreateKeyResponse>(v.clone()).ok())
            .filter_map(|k| {
                let remote_id = k.key_id()?;
                Some(RemoteKey {
                    remote_id,
                    email: None,
                    access_url: None,
                    traffic_limit_bytes: None,
                }
                .with_uuid(k.uuid()))
            })
            .collect())
    }

    async fn sync_config(&self) -> CoreResult<()> {
        let _ = self
            .do_request(self.client.post(self.url("/sync")))
            .await?;
        Ok(())
    }
}

impl V2RayClient {
    async fn fetch_link(&self, key_id: &str) -> CoreResult<Option<String>> {
        let resp = self
            .do_request(self.client.get(self.url(&format!("/keys/{key_id}/link"))))
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: LinkResponse = resp.json().await.map_err(|e| CoreError::BackendRejected {
            server_id: self.server_id,
            reason: format!("invalid JSON from link endpoint: {e}"),
        })?;
        Ok(body.vless_link)
    }
}

trait WithUuid {
    fn with_uuid(self, uuid: Option<String>) -> Self;
}

impl WithUuid for RemoteKey {
    fn with_uuid(mut self, uuid: Option<String>) -> Self {
        if let Some(uuid) = uuid {
            self.remote_id = uuid;
        }
        self
    }
}

/// A VLESS link only counts as "ready" once it carries the reality
/// parameters the backend generates (`sni`, `sid`) — never synthesized
/// client-side (spec §4.2, §9 "hard-coded cryptographic parameters").
fn has_required_params(link: Option<&str>) -> bool {
    match link {
        Some(l) => l.contains("sni=") && l.contains("sid="),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_required_params_detects_missing_sid() {
        assert!(!has_required_params(Some("vless://x@host:443?sni=example.com")));
    }

    #[test]
    fn has_required_params_accepts_complete_link() {
        assert!(has_required_params(Some(
            "vless://x@host:443?sni=example.com&sid=abcd"
        )));
    }

    #[test]
    fn has_required_params_rejects_missing_link() {
        assert!(!has_required_params(None));
    }

    #[test]
    fn create_key_response_key_id_falls_back_to_nested_key() {
        let body = serde_json::json!({"key": {"id": "inner-id", "uuid": "u-1"}});
        let parsed: CreateKeyResponse = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.key_id().as_deref(), Some("inner-id"));
        assert_eq!(parsed.uuid().as_deref(), Some("u-1"));
    }
}
