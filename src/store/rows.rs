//! Row types returned by [`super::Store`] queries.

use serde::Serialize;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: i64,
    pub display_name: String,
    pub is_vip: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServerRow {
    pub id: i64,
    pub name: String,
    pub country: String,
    pub protocol: String,
    pub api_url: String,
    pub api_credential: String,
    pub domain: String,
    pub active: bool,
    pub access_level: i64,
}

impl ServerRow {
    pub fn is_v2ray(&self) -> bool {
        self.protocol == "v2ray"
    }
    pub fn is_outline(&self) -> bool {
        self.protocol == "outline"
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TariffRow {
    pub id: i64,
    pub name: String,
    pub duration_sec: i64,
    pub price: i64,
    pub traffic_limit_mb: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SubscriptionRow {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub tariff_id: i64,
    pub is_active: bool,
    pub traffic_limit_mb: Option<i64>,
    pub traffic_usage_bytes: i64,
    pub traffic_over_limit_at: Option<i64>,
    pub traffic_over_limit_notified: bool,
    pub last_updated_at: i64,
    pub purchase_notification_sent: bool,
    pub notified_mask: i64,
    pub bundle_title: Option<String>,
}

/// Unified view over `keys` (Outline) and `v2ray_keys` (V2Ray) rows,
/// produced by `UNION ALL` queries (see design notes: the two physical
/// tables exist for historical reasons; callers see one shape).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyRecord {
    pub id: i64,
    pub backend: String, // "outline" | "v2ray"
    pub server_id: i64,
    pub user_id: i64,
    pub subscription_id: Option<i64>,
    pub email: String,
    pub created_at: i64,
    pub traffic_limit_mb: Option<i64>,
    pub traffic_usage_bytes: i64,
    pub client_config: Option<String>,
    /// Remote backend identifier: Outline `key_id`, or the V2Ray UUID.
    pub backend_id: Option<String>,
    pub access_url: Option<String>,
    pub v2ray_uuid: Option<String>,
    pub level: i64,
}

/// A key joined with the server it lives on — used by the bundle server
/// (C5) and traffic monitor (C6).
#[derive(Debug, Clone)]
pub struct KeyWithServer {
    pub key: KeyRecord,
    pub server: ServerRow,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FreeKeyUsageRow {
    pub user_id: i64,
    pub protocol: String,
    pub country: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRow {
    pub id: i64,
    pub payment_id: String,
    pub user_id: i64,
    pub subscription_id: Option<i64>,
    pub status: String,
    pub amount: i64,
    pub created_at: i64,
}
