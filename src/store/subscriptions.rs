//! Subscription lifecycle queries (spec.md §4.1) — creation, renewal,
//! traffic accounting, and the effective traffic-limit resolution chain.

use anyhow::Result;
use uuid::Uuid;

use super::{with_lock_retry, Store, SubscriptionRow};

const BYTES_PER_MIB: i64 = 1024 * 1024;

impl Store {
    /// Create a new subscription for `user_id` on tariff `tariff_id`,
    /// expiring `duration_sec` seconds from now. Generates the bundle
    /// token. A single transaction — there is no separate "recompute
    /// expiry" step, which is what keeps [`Self::extend_subscription`]
    /// safe to call repeatedly without double-counting (see design notes).
    pub async fn create_subscription(
        &self,
        user_id: i64,
        tariff_id: i64,
        duration_sec: i64,
        traffic_limit_mb: Option<i64>,
    ) -> Result<SubscriptionRow> {
        let token = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + duration_sec;

        let id: i64 = with_lock_retry(|| async {
            sqlx::query_scalar(
                "INSERT INTO subscriptions
                    (user_id, token, created_at, expires_at, tariff_id, is_active,
                     traffic_limit_mb, traffic_usage_bytes, last_updated_at)
                 VALUES (?, ?, ?, ?, ?, 1, ?, 0, ?)
                 RETURNING id",
            )
            .bind(user_id)
            .bind(&token)
            .bind(now)
            .bind(expires_at)
            .bind(tariff_id)
            .bind(traffic_limit_mb)
            .bind(now)
            .fetch_one(self.pool())
            .await
        })
        .await?;

        self.get_subscription(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("subscription not found after insert"))
    }

    /// Extend an existing subscription by `delta_sec`, added to its
    /// currently stored `expires_at` (never to `now()`), so repeated
    /// extensions compound correctly regardless of how much time is left.
    pub async fn extend_subscription(&self, subscription_id: i64, delta_sec: i64) -> Result<SubscriptionRow> {
        let now = chrono::Utc::now().timestamp();
        with_lock_retry(|| async {
            sqlx::query(
                "UPDATE subscriptions
                 SET expires_at = expires_at + ?, is_active = 1, last_updated_at = ?
                 WHERE id = ?",
            )
            .bind(delta_sec)
            .bind(now)
            .bind(subscription_id)
            .execute(self.pool())
            .await
        })
        .await?;

        self.get_subscription(subscription_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("subscription {subscription_id} not found"))
    }

    pub async fn get_subscription(&self, id: i64) -> Result<Option<SubscriptionRow>> {
        Ok(sqlx::query_as("SELECT * FROM subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }

    pub async fn get_subscription_by_token(&self, token: &str) -> Result<Option<SubscriptionRow>> {
        Ok(sqlx::query_as("SELECT * FROM subscriptions WHERE token = ?")
            .bind(token)
            .fetch_optional(self.pool())
            .await?)
    }

    pub async fn get_active_subscription(&self, user_id: i64) -> Result<Option<SubscriptionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM subscriptions
             WHERE user_id = ? AND is_active = 1
             ORDER BY expires_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?)
    }

    pub async fn deactivate_subscription(&self, subscription_id: i64) -> Result<()> {
        with_lock_retry(|| async {
            sqlx::query("UPDATE subscriptions SET is_active = 0 WHERE id = ?")
                .bind(subscription_id)
                .execute(self.pool())
                .await
        })
        .await?;
        Ok(())
    }

    /// All subscriptions past expiry, regardless of `is_active` — input to
    /// the expiry sweeper (C9). A subscription deactivated (e.g. by an
    /// admin or the deletion guard) before it expired must still be swept
    /// so its row and any remaining key rows get physically torn down;
    /// filtering on `is_active` would leak those permanently.
    pub async fn list_expired_active_subscriptions(&self, now: i64) -> Result<Vec<SubscriptionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM subscriptions WHERE expires_at <= ? AND expires_at > 0",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await?)
    }

    /// Active subscriptions expiring within `window_sec`, for the
    /// 7d/1d/1h notification sweep (C9). Callers filter by `notified_mask`
    /// bit to avoid repeat notifications.
    pub async fn list_subscriptions_expiring_within(
        &self,
        now: i64,
        window_sec: i64,
    ) -> Result<Vec<SubscriptionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM subscriptions
             WHERE is_active = 1 AND expires_at > ? AND expires_at <= ?",
        )
        .bind(now)
        .bind(now + window_sec)
        .fetch_all(self.pool())
        .await?)
    }

    /// Active subscriptions whose purchase confirmation hasn't gone out yet
    /// and are still within the retry window — input to the
    /// purchase-notification sweep (C9).
    pub async fn list_pending_purchase_notifications(&self, cutoff: i64) -> Result<Vec<SubscriptionRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM subscriptions
             WHERE is_active = 1 AND purchase_notification_sent = 0
               AND (created_at > ? OR last_updated_at > ?)",
        )
        .bind(cutoff)
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn set_notified_mask(&self, subscription_id: i64, mask: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET notified_mask = ? WHERE id = ?")
            .bind(mask)
            .bind(subscription_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_purchase_notification_sent(&self, subscription_id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET purchase_notification_sent = 1 WHERE id = ?")
            .bind(subscription_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Bumps `last_updated_at` after a bundle is (re)generated (spec.md §4.5
    /// step 8).
    pub async fn touch_subscription(&self, subscription_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE subscriptions SET last_updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(subscription_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_bundle_title(&self, subscription_id: i64, title: &str) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET bundle_title = ? WHERE id = ?")
            .bind(title)
            .bind(subscription_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // ─── Traffic accounting ─────────────────────────────────────────────────

    /// All subscriptions with a positive effective limit, used by the
    /// traffic monitor (C6) to decide which subscriptions to check for
    /// over-limit.
    pub async fn get_subscriptions_with_traffic_limits(&self) -> Result<Vec<SubscriptionRow>> {
        Ok(sqlx::query_as(
            "SELECT s.* FROM subscriptions s
             JOIN tariffs t ON t.id = s.tariff_id
             WHERE s.is_active = 1
               AND (s.traffic_limit_mb IS NOT NULL OR t.traffic_limit_mb > 0)",
        )
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn update_subscription_traffic(&self, subscription_id: i64, total_bytes: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        with_lock_retry(|| async {
            sqlx::query(
                "UPDATE subscriptions SET traffic_usage_bytes = ?, last_updated_at = ? WHERE id = ?",
            )
            .bind(total_bytes)
            .bind(now)
            .bind(subscription_id)
            .execute(self.pool())
            .await
        })
        .await?;
        Ok(())
    }

    /// Apply a batch of `(subscription_id, total_bytes)` usage updates in a
    /// single transaction, for the periodic traffic poll (C6 §4.6).
    pub async fn batch_update_subscriptions_traffic(&self, updates: &[(i64, i64)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool().begin().await?;
        for (subscription_id, total_bytes) in updates {
            sqlx::query(
                "UPDATE subscriptions SET traffic_usage_bytes = ?, last_updated_at = ? WHERE id = ?",
            )
            .bind(total_bytes)
            .bind(now)
            .bind(subscription_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_traffic_over_limit(&self, subscription_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE subscriptions SET traffic_over_limit_at = ?
             WHERE id = ? AND traffic_over_limit_at IS NULL",
        )
        .bind(now)
        .bind(subscription_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_traffic_over_limit_notified(&self, subscription_id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET traffic_over_limit_notified = 1 WHERE id = ?")
            .bind(subscription_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Clear the over-limit bookkeeping on renewal/extension so usage
    /// tracking restarts clean for the new billing period.
    pub async fn reset_traffic_on_extension(&self, subscription_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions
             SET traffic_usage_bytes = 0, traffic_over_limit_at = NULL, traffic_over_limit_notified = 0
             WHERE id = ?",
        )
        .bind(subscription_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Resolve the effective traffic limit for a subscription, in bytes,
    /// per spec.md §4.1:
    ///
    /// 1. `subscription.traffic_limit_mb` if set (including `0` = unlimited).
    /// 2. Else the tariff's `traffic_limit_mb`, if positive.
    /// 3. Else the legacy fallback: if every key under this subscription
    ///    shares one distinct positive `traffic_limit_mb`, use that.
    /// 4. Else unlimited (`0`).
    pub async fn effective_limit_bytes(&self, sub: &SubscriptionRow) -> Result<i64> {
        if let Some(mb) = sub.traffic_limit_mb {
            return Ok(mb * BYTES_PER_MIB);
        }

        if let Some(tariff) = self.get_tariff(sub.tariff_id).await? {
            if tariff.traffic_limit_mb > 0 {
                return Ok(tariff.traffic_limit_mb * BYTES_PER_MIB);
            }
        }

        let distinct_limits: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT traffic_limit_mb FROM (
                SELECT traffic_limit_mb FROM keys WHERE subscription_id = ? AND traffic_limit_mb > 0
                UNION
                SELECT traffic_limit_mb FROM v2ray_keys WHERE subscription_id = ? AND traffic_limit_mb > 0
             )",
        )
        .bind(sub.id)
        .bind(sub.id)
        .fetch_all(self.pool())
        .await?;

        if distinct_limits.len() == 1 {
            return Ok(distinct_limits[0] * BYTES_PER_MIB);
        }

        Ok(0)
    }
}
