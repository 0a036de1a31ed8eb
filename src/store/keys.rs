//! Unified key storage (spec.md §9 design notes) — `keys` (Outline) and
//! `v2ray_keys` (V2Ray) are separate physical tables for historical reasons;
//! every read here returns the unified [`KeyRecord`] shape via `UNION ALL`.

use anyhow::Result;

use super::{KeyRecord, KeyWithServer, ServerRow, Store};

const UNION_SELECT: &str = "
    SELECT id, 'outline' AS backend, server_id, user_id, subscription_id, email, created_at,
           traffic_limit_mb, traffic_usage_bytes, client_config,
           key_id AS backend_id, access_url, NULL AS v2ray_uuid, 0 AS level
    FROM keys
    UNION ALL
    SELECT id, 'v2ray' AS backend, server_id, user_id, subscription_id, email, created_at,
           traffic_limit_mb, traffic_usage_bytes, client_config,
           v2ray_uuid AS backend_id, NULL AS access_url, v2ray_uuid, level
    FROM v2ray_keys
";

impl Store {
    pub async fn list_keys_for_subscription(&self, subscription_id: i64) -> Result<Vec<KeyRecord>> {
        let sql = format!("SELECT * FROM ({UNION_SELECT}) WHERE subscription_id = ?");
        Ok(sqlx::query_as(&sql)
            .bind(subscription_id)
            .fetch_all(self.pool())
            .await?)
    }

    /// Subscription keys joined with their server — the shape the bundle
    /// server (C5) needs to build each client's VLESS/Outline entry.
    pub async fn list_subscription_keys_with_servers(
        &self,
        subscription_id: i64,
    ) -> Result<Vec<KeyWithServer>> {
        let keys = self.list_keys_for_subscription(subscription_id).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let server: Option<ServerRow> =
                sqlx::query_as("SELECT * FROM servers WHERE id = ?")
                    .bind(key.server_id)
                    .fetch_optional(self.pool())
                    .await?;
            if let Some(server) = server {
                out.push(KeyWithServer { key, server });
            }
        }
        Ok(out)
    }

    pub async fn list_keys_for_server(&self, server_id: i64) -> Result<Vec<KeyRecord>> {
        let sql = format!("SELECT * FROM ({UNION_SELECT}) WHERE server_id = ?");
        Ok(sqlx::query_as(&sql)
            .bind(server_id)
            .fetch_all(self.pool())
            .await?)
    }

    /// Subscription rows with zero rows in either key table — left behind
    /// once every key under them has been torn down without the
    /// subscription row itself ever being physically deleted (spec.md §4.8
    /// reconciliation, step 4's orphan-subscription clause).
    pub async fn list_subscriptions_with_no_keys(&self) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT id FROM subscriptions WHERE id NOT IN \
             (SELECT subscription_id FROM ({UNION_SELECT}) WHERE subscription_id IS NOT NULL)"
        );
        Ok(sqlx::query_scalar(&sql).fetch_all(self.pool()).await?)
    }

    pub async fn get_key(&self, backend: &str, id: i64) -> Result<Option<KeyRecord>> {
        let sql = format!("SELECT * FROM ({UNION_SELECT}) WHERE backend = ? AND id = ?");
        Ok(sqlx::query_as(&sql)
            .bind(backend)
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }

    pub async fn create_outline_key(
        &self,
        server_id: i64,
        user_id: i64,
        subscription_id: Option<i64>,
        email: &str,
        traffic_limit_mb: Option<i64>,
        key_id: &str,
        access_url: &str,
    ) -> Result<KeyRecord> {
        let now = chrono::Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO keys
                (server_id, user_id, subscription_id, email, created_at,
                 traffic_limit_mb, traffic_usage_bytes, key_id, access_url)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
             RETURNING id",
        )
        .bind(server_id)
        .bind(user_id)
        .bind(subscription_id)
        .bind(email)
        .bind(now)
        .bind(traffic_limit_mb)
        .bind(key_id)
        .bind(access_url)
        .fetch_one(self.pool())
        .await?;
        self.get_key("outline", id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("outline key not found after insert"))
    }

    pub async fn create_v2ray_key(
        &self,
        server_id: i64,
        user_id: i64,
        subscription_id: Option<i64>,
        email: &str,
        traffic_limit_mb: Option<i64>,
        v2ray_uuid: &str,
        level: i64,
        client_config: Option<&str>,
    ) -> Result<KeyRecord> {
        let now = chrono::Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO v2ray_keys
                (server_id, user_id, subscription_id, email, created_at,
                 traffic_limit_mb, traffic_usage_bytes, client_config, v2ray_uuid, level)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
             RETURNING id",
        )
        .bind(server_id)
        .bind(user_id)
        .bind(subscription_id)
        .bind(email)
        .bind(now)
        .bind(traffic_limit_mb)
        .bind(client_config)
        .bind(v2ray_uuid)
        .bind(level)
        .fetch_one(self.pool())
        .await?;
        self.get_key("v2ray", id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("v2ray key not found after insert"))
    }

    /// Record the client config fetched from `get_user_config` after the
    /// create/link/sync sequence completes (or partially completes).
    pub async fn set_v2ray_client_config(&self, id: i64, client_config: &str) -> Result<()> {
        sqlx::query("UPDATE v2ray_keys SET client_config = ? WHERE id = ?")
            .bind(client_config)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Writeback the normalized `client_config` after the bundle server
    /// fetches it fresh from the backend (spec.md §4.5 step 5).
    pub async fn set_key_client_config(&self, backend: &str, id: i64, client_config: &str) -> Result<()> {
        let table = table_for(backend)?;
        let sql = format!("UPDATE {table} SET client_config = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(client_config)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_key_traffic(&self, backend: &str, id: i64, bytes: i64) -> Result<()> {
        let table = table_for(backend)?;
        let sql = format!("UPDATE {table} SET traffic_usage_bytes = ? WHERE id = ?");
        sqlx::query(&sql).bind(bytes).bind(id).execute(self.pool()).await?;
        Ok(())
    }

    pub async fn reset_key_traffic(&self, backend: &str, id: i64) -> Result<()> {
        self.update_key_traffic(backend, id, 0).await
    }

    pub async fn delete_key(&self, backend: &str, id: i64) -> Result<()> {
        let table = table_for(backend)?;
        let sql = format!("DELETE FROM {table} WHERE id = ?");
        sqlx::query(&sql).bind(id).execute(self.pool()).await?;
        Ok(())
    }
}

fn table_for(backend: &str) -> Result<&'static str> {
    match backend {
        "outline" => Ok("keys"),
        "v2ray" => Ok("v2ray_keys"),
        other => Err(anyhow::anyhow!("unknown key backend: {other}")),
    }
}
