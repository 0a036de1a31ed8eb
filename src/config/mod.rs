//! Daemon configuration: CLI/env overrides > TOML file > built-in defaults.
//!
//! Mirrors the teacher's `config::DaemonConfig::new` priority chain.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_REST_PORT: u16 = 8080;
const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_BUNDLE_TTL_SECS: u64 = 300;
const DEFAULT_BUNDLE_RATE_LIMIT_PER_MIN: u64 = 60;
const DEFAULT_GRACE_PERIOD_SECS: i64 = 86_400;
const DEFAULT_TRAFFIC_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_SESSION_MAX_AGE_SECS: u64 = 86_400 * 7;
const DEFAULT_SUPPORT_USERNAME: &str = "Vee VPN Support";
const DEFAULT_BUNDLE_TITLE: &str = "Vee VPN";
const DEFAULT_EMAIL_DOMAIN: &str = "vee.vpn";

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var > TOML > built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    rest_port: Option<u16>,
    pool_size: Option<u32>,
    backend_timeout_secs: Option<u64>,
    bundle_ttl_secs: Option<u64>,
    bundle_rate_limit_per_min: Option<u64>,
    grace_period_secs: Option<i64>,
    traffic_poll_interval_secs: Option<u64>,
    expiry_sweep_interval_secs: Option<u64>,
    session_max_age_secs: Option<u64>,
    support_username: Option<String>,
    bundle_title_default: Option<String>,
    email_domain: Option<String>,
    log: Option<String>,
    vacuum_after_expiry_sweep: Option<bool>,
    /// Symmetric key for at-rest encryption of sensitive columns. The core
    /// never reads this value itself — it is handed to the encryption
    /// collaborator named in spec.md §1 (out of scope for the core).
    db_encryption_key: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// `GET /api/subscription/{token}` listens on this port.
    pub rest_port: u16,
    /// Bounded SQLite connection pool size.
    pub pool_size: u32,
    /// Total request timeout for backend protocol-client HTTP calls.
    pub backend_timeout_secs: u64,
    /// Connect timeout for backend protocol-client HTTP calls.
    pub backend_connect_timeout_secs: u64,
    /// Bundle cache TTL (C7).
    pub bundle_ttl_secs: u64,
    /// Per-token rate limit on the bundle endpoint (C5).
    pub bundle_rate_limit_per_min: u64,
    /// Grace period after expiry before the Expiry Scheduler (C9) cleans up.
    pub grace_period_secs: i64,
    /// Traffic Monitor (C6) poll interval.
    pub traffic_poll_interval_secs: u64,
    /// Expiry Scheduler (C9) sweep interval.
    pub expiry_sweep_interval_secs: u64,
    /// Admin-session TTL, seconds (consumed by the out-of-core admin UI).
    pub session_max_age_secs: u64,
    /// Display name surfaced to end users.
    pub support_username: String,
    /// Default `Profile-Title` header value, overridable per subscription.
    pub bundle_title_default: String,
    /// Domain used when synthesizing per-server key emails
    /// (`{user_id}_subscription_{subscription_id}@domain`).
    pub email_domain: String,
    /// Symmetric key handed to the encryption-at-rest collaborator, if configured.
    pub db_encryption_key: Option<String>,
    /// Run a light `PRAGMA incremental_vacuum` after the Expiry Scheduler
    /// (C9) clears a batch of expired subscriptions. Pure store hygiene,
    /// off by default.
    pub vacuum_after_expiry_sweep: bool,
}

impl DaemonConfig {
    /// Build config from CLI/env args plus an optional TOML file.
    pub fn new(data_dir: Option<PathBuf>, log: Option<String>, rest_port: Option<u16>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let rest_port = rest_port.or(toml.rest_port).unwrap_or(DEFAULT_REST_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let db_encryption_key = std::env::var("DB_ENCRYPTION_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .or(toml.db_encryption_key);

        let support_username = std::env::var("SUPPORT_USERNAME")
            .ok()
            .or(toml.support_username)
            .unwrap_or_else(|| DEFAULT_SUPPORT_USERNAME.to_string());

        let session_max_age_secs = std::env::var("SESSION_MAX_AGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(toml.session_max_age_secs)
            .unwrap_or(DEFAULT_SESSION_MAX_AGE_SECS);

        Self {
            data_dir,
            log,
            rest_port,
            pool_size: toml.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            backend_timeout_secs: toml
                .backend_timeout_secs
                .unwrap_or(DEFAULT_BACKEND_TIMEOUT_SECS),
            backend_connect_timeout_secs: DEFAULT_BACKEND_CONNECT_TIMEOUT_SECS,
            bundle_ttl_secs: toml.bundle_ttl_secs.unwrap_or(DEFAULT_BUNDLE_TTL_SECS),
            bundle_rate_limit_per_min: toml
                .bundle_rate_limit_per_min
                .unwrap_or(DEFAULT_BUNDLE_RATE_LIMIT_PER_MIN),
            grace_period_secs: toml.grace_period_secs.unwrap_or(DEFAULT_GRACE_PERIOD_SECS),
            traffic_poll_interval_secs: toml
                .traffic_poll_interval_secs
                .unwrap_or(DEFAULT_TRAFFIC_POLL_INTERVAL_SECS),
            expiry_sweep_interval_secs: toml
                .expiry_sweep_interval_secs
                .unwrap_or(DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS),
            session_max_age_secs,
            support_username,
            bundle_title_default: toml
                .bundle_title_default
                .unwrap_or_else(|| DEFAULT_BUNDLE_TITLE.to_string()),
            email_domain: toml
                .email_domain
                .unwrap_or_else(|| DEFAULT_EMAIL_DOMAIN.to_string()),
            db_encryption_key,
            vacuum_after_expiry_sweep: toml.vacuum_after_expiry_sweep.unwrap_or(false),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs_data_dir().join("veectl")
}

/// Minimal stand-in for a `dirs`-style data-dir lookup, following the
/// platform conventions without pulling in the `dirs` crate for one call.
fn dirs_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share");
    }
    PathBuf::from(".")
}
