//! Store (C1) — persistent catalog of users, subscriptions, keys, servers,
//! tariffs, and payments. Single-file embedded SQLite in WAL mode, accessed
//! through a bounded connection pool.

pub mod keys;
pub mod rows;
pub mod subscriptions;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::{path::Path, str::FromStr};

pub use rows::*;

use crate::retry::RetryConfig;

/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// One violated condition behind a refused user deletion (spec.md §4.1).
/// Carries the count so callers don't have to re-derive it from the
/// `Display` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardReason {
    ActiveSubscriptions(i64),
    PaidPayments(i64),
    ActiveKeys(i64),
}

impl std::fmt::Display for GuardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardReason::ActiveSubscriptions(n) => write!(f, "user has {n} active subscription(s)"),
            GuardReason::PaidPayments(n) => write!(f, "user has {n} paid payment(s)"),
            GuardReason::ActiveKeys(n) => write!(f, "user has {n} active key(s)"),
        }
    }
}

/// Execute a future with the standard query timeout.
pub(crate) async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "store query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// Retry a write operation on "database is locked", per spec.md §4.1:
/// 100ms * 2^k backoff, up to 3 attempts. Any other error is returned on
/// the first try without retrying.
pub(crate) async fn with_lock_retry<F, Fut, T>(f: F) -> Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let config = RetryConfig::store_lock();
    let mut delay = config.initial_delay;
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if is_locked(&e) && attempt < config.max_attempts => {
                tracing::warn!(attempt, delay_ms = delay.as_millis(), "store locked — retrying");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay.mul_f64(config.multiplier), config.max_delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_locked(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db
            .message()
            .to_lowercase()
            .contains("database is locked"),
        _ => false,
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(data_dir: &Path, pool_size: u32) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("veectl.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .foreign_keys(true)
                .busy_timeout(std::time::Duration::from_secs(30))
                .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Incremental)
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .connect_with(opts)
            .await
            .context("connecting to catalog database")?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .foreign_keys(true)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Light store-hygiene pass, run by the Expiry Scheduler (C9) after a
    /// sweep when `vacuum_after_expiry_sweep` is enabled. `auto_vacuum` is
    /// set to `INCREMENTAL` at connection time (see [`Self::new`]), so this
    /// just reclaims the freed pages; it changes no observable row data.
    pub async fn incremental_vacuum(&self) -> Result<()> {
        sqlx::query("PRAGMA incremental_vacuum")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for stmt in include_str!("migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Run a closure with foreign-key enforcement temporarily disabled on a
    /// dedicated connection, for cascade-delete paths that cross the
    /// legacy `users`/`keys` referential mismatch (spec.md §9 — "Foreign-key
    /// escape"). The escape is scoped to a single connection and its
    /// enforcement setting is restored before the connection returns to the
    /// pool.
    pub async fn with_foreign_keys_off(&self, sql: &str, bind: i64) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await?;
        let result = sqlx::query(sql).bind(bind).execute(&mut *conn).await;
        // Best-effort restore; the connection is returned to the pool either way.
        let _ = sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await;
        result?;
        Ok(())
    }

    // ─── Users ──────────────────────────────────────────────────────────────

    pub async fn get_or_create_user(&self, user_id: i64, display_name: &str) -> Result<UserRow> {
        if let Some(u) = self.get_user(user_id).await? {
            return Ok(u);
        }
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO users (id, display_name, is_vip, created_at) VALUES (?, ?, 0, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(user_id)
        .bind(display_name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_user(user_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user not found after insert"))
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<UserRow>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Structured form of the same guard: lets admin tooling branch on
    /// reason kind (and count) instead of string-matching `can_delete_user`'s
    /// rendered messages.
    pub async fn guard_reasons_for_user(&self, user_id: i64) -> Result<Vec<GuardReason>> {
        let mut reasons = Vec::new();

        let active_subs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE user_id = ? AND is_active = 1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        if active_subs > 0 {
            reasons.push(GuardReason::ActiveSubscriptions(active_subs));
        }

        let paid_payments: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM payments WHERE user_id = ? AND status IN ('paid', 'completed')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        if paid_payments > 0 {
            reasons.push(GuardReason::PaidPayments(paid_payments));
        }

        let active_keys: i64 = sqlx::query_scalar(
            "SELECT
                (SELECT COUNT(*) FROM keys k JOIN subscriptions s ON k.subscription_id = s.id
                    WHERE k.user_id = ? AND s.is_active = 1)
              + (SELECT COUNT(*) FROM v2ray_keys k JOIN subscriptions s ON k.subscription_id = s.id
                    WHERE k.user_id = ? AND s.is_active = 1)",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        if active_keys > 0 {
            reasons.push(GuardReason::ActiveKeys(active_keys));
        }

        Ok(reasons)
    }

    /// `can_delete_user` — refuses when the user has an active subscription,
    /// a paid/completed payment, or an active key (spec.md §4.1). Rendered
    /// strings come from [`GuardReason`]'s `Display`.
    pub async fn can_delete_user(&self, user_id: i64) -> Result<(bool, Vec<String>)> {
        let reasons = self.guard_reasons_for_user(user_id).await?;
        let is_ok = reasons.is_empty();
        Ok((is_ok, reasons.into_iter().map(|r| r.to_string()).collect()))
    }

    /// Paid/completed payments are never deletable (spec.md §3 invariant 8).
    pub async fn can_delete_payment(&self, payment_id: &str) -> Result<(bool, Option<String>)> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM payments WHERE payment_id = ?")
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await?;
        match status.as_deref() {
            Some("paid") | Some("completed") => Ok((
                false,
                Some(format!("payment {payment_id} is {} and cannot be deleted", status.unwrap())),
            )),
            _ => Ok((true, None)),
        }
    }

    // ─── Servers ────────────────────────────────────────────────────────────

    pub async fn list_active_servers(&self) -> Result<Vec<ServerRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM servers WHERE active = 1 ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn list_active_v2ray_servers(&self) -> Result<Vec<ServerRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM servers WHERE active = 1 AND protocol = 'v2ray' ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get_server(&self, server_id: i64) -> Result<Option<ServerRow>> {
        Ok(sqlx::query_as("SELECT * FROM servers WHERE id = ?")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn create_server(
        &self,
        name: &str,
        country: &str,
        protocol: &str,
        api_url: &str,
        api_credential: &str,
        domain: &str,
    ) -> Result<ServerRow> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO servers (name, country, protocol, api_url, api_credential, domain, active)
             VALUES (?, ?, ?, ?, ?, ?, 1) RETURNING id",
        )
        .bind(name)
        .bind(country)
        .bind(protocol)
        .bind(api_url)
        .bind(api_credential)
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;
        self.get_server(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("server not found after insert"))
    }

    pub async fn set_server_active(&self, server_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE servers SET active = ? WHERE id = ?")
            .bind(active)
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Tariffs ────────────────────────────────────────────────────────────

    pub async fn get_tariff(&self, tariff_id: i64) -> Result<Option<TariffRow>> {
        Ok(sqlx::query_as("SELECT * FROM tariffs WHERE id = ?")
            .bind(tariff_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn create_tariff(
        &self,
        name: &str,
        duration_sec: i64,
        price: i64,
        traffic_limit_mb: i64,
    ) -> Result<TariffRow> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO tariffs (name, duration_sec, price, traffic_limit_mb)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(duration_sec)
        .bind(price)
        .bind(traffic_limit_mb)
        .fetch_one(&self.pool)
        .await?;
        self.get_tariff(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("tariff not found after insert"))
    }

    // ─── Free-key usage ─────────────────────────────────────────────────────

    /// Record that `user_id` has ever received a free-tier key. Once set,
    /// never cleared by core operations (spec.md §3 invariant 7).
    pub async fn mark_free_key_used(&self, user_id: i64, protocol: &str, country: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO free_key_usage (user_id, protocol, country, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, protocol, country) DO NOTHING",
        )
        .bind(user_id)
        .bind(protocol)
        .bind(country)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn has_used_free_key(&self, user_id: i64, protocol: &str, country: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM free_key_usage WHERE user_id = ? AND protocol = ? AND country = ?",
        )
        .bind(user_id)
        .bind(protocol)
        .bind(country)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // ─── Payments ───────────────────────────────────────────────────────────

    pub async fn get_payment(&self, payment_id: &str) -> Result<Option<PaymentRow>> {
        Ok(sqlx::query_as("SELECT * FROM payments WHERE payment_id = ?")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn record_payment(
        &self,
        payment_id: &str,
        user_id: i64,
        subscription_id: Option<i64>,
        status: &str,
        amount: i64,
    ) -> Result<PaymentRow> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO payments (payment_id, user_id, subscription_id, status, amount, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(payment_id) DO UPDATE SET status = excluded.status",
        )
        .bind(payment_id)
        .bind(user_id)
        .bind(subscription_id)
        .bind(status)
        .bind(amount)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.get_payment(payment_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("payment not found after insert"))
    }
}
