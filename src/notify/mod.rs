//! Notification collaborator (spec.md §1 out-of-scope: "chat-bot UI" is an
//! external collaborator; the core only emits machine-readable events to
//! whatever implements this trait). The chat-bot's Russian-language
//! translation of these events is entirely the collaborator's concern.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub enum Notification {
    /// A purchase or renewal completed — sent once per subscription
    /// (spec.md §4.9 purchase-notification sweep).
    PurchaseConfirmed { user_id: i64, subscription_id: i64 },
    /// One of the 7d/1d/1h expiry thresholds was just crossed.
    ExpiringSoon {
        user_id: i64,
        subscription_id: i64,
        seconds_remaining: i64,
    },
    /// Traffic usage crossed the subscription's effective limit. Emitted
    /// exactly once per over-limit episode (spec.md §4.6).
    TrafficOverLimit { user_id: i64, subscription_id: i64 },
    /// A provisioning attempt left some servers unprovisioned.
    PartialProvisioning {
        user_id: i64,
        subscription_id: i64,
        failed_servers: Vec<i64>,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Structured-log sink — used when no external collaborator is wired up
/// (e.g. local development, or before the chat-bot integration is
/// configured).
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn notify(&self, notification: Notification) {
        tracing::info!(?notification, "notification");
    }
}
