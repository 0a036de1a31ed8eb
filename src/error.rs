//! Typed error taxonomy for the core.
//!
//! The core surfaces machine-readable error types at every component
//! boundary; translating them into user-facing text is the bot/HTTP
//! collaborator's job (see spec.md §7).

use thiserror::Error;

/// Errors the core can return from any subscription/fleet/bundle operation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The store reported "database is locked" and all retries were exhausted.
    #[error("store is locked (all retries exhausted)")]
    StoreLocked,

    /// A referential/integrity constraint was violated.
    #[error("store integrity violation: {0}")]
    StoreIntegrity(String),

    /// A backend VPN server could not be reached (transport failure).
    #[error("backend {server_id} unavailable: {reason}")]
    BackendUnavailable { server_id: i64, reason: String },

    /// A backend VPN server responded with a non-2xx status.
    #[error("backend {server_id} rejected request: {reason}")]
    BackendRejected { server_id: i64, reason: String },

    /// The subscription token in a bundle request is malformed.
    #[error("subscription token is malformed")]
    TokenInvalid,

    /// The subscription lookup succeeded but it is expired or inactive.
    #[error("subscription is expired or inactive")]
    SubscriptionExpired,

    /// The caller exceeded the per-token request rate limit.
    #[error("rate limit exceeded")]
    RateLimited,

    /// A guarded mutation (e.g. user deletion) was refused.
    #[error("operation refused: {0:?}")]
    GuardViolation(Vec<String>),

    /// Catch-all for unexpected failures that don't fit the taxonomy above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// `true` for errors that are safe to retry at the job level
    /// (transient store contention, backend transport hiccups).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StoreLocked | CoreError::BackendUnavailable { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
