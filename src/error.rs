//! # Error Handling
//!
//! Unified error taxonomy for the sync core. Expected outcomes (not found,
//! conflicts, validation failures) are ordinary variants returned through
//! `Result`; only genuinely unexpected failures use the `Internal` path.

use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::models::record::EntityType;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type covering every failure class callers branch on.
#[derive(Debug, Error)]
pub enum Error {
    /// Expired or invalid credentials. Never retried; halts the owning job
    /// and the connection is marked `expired` or `error`.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider rate limit. Handled internally by waiting; surfaced only
    /// when the wait cannot complete within the job's budget.
    #[error("rate limited{}", retry_after_secs.map(|s| format!(" (retry after: {s}s)")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    /// Per-entity mapping failure. Aborts that entity only, never the batch.
    #[error("validation failed for {entity_type}: missing or invalid fields {fields:?}")]
    Validation {
        entity_type: EntityType,
        fields: Vec<String>,
    },

    /// Retryable network or upstream failure (timeout, reset, 5xx).
    #[error("transient network error: {0}")]
    Transient(String),

    /// Field-level disagreement in a state the requested operation cannot
    /// act on, e.g. resolving a conflict that is already settled.
    #[error("conflict on {entity_type} field '{field}'")]
    Conflict {
        entity_type: EntityType,
        field: String,
    },

    /// Missing record. A create signal during push, "locally missing"
    /// during reconciliation.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unknown, expired, or already-consumed OAuth state token.
    #[error("invalid or expired oauth state")]
    InvalidState,

    /// A sync job is already running for this organization.
    #[error("a sync job is already running for organization {0}")]
    SyncInProgress(Uuid),

    /// Job aborted at a suspension point by an explicit cancel.
    #[error("job cancelled")]
    Cancelled,

    /// Job exceeded its overall timeout.
    #[error("job timed out")]
    Timeout,

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the client may retry the failed call with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Connection-level failures stop the whole job; everything else is
    /// recorded per entity and the batch continues.
    pub fn halts_job(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::Cancelled | Error::Timeout | Error::SyncInProgress(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Error::Transient(err.to_string())
        } else {
            Error::Internal(err.to_string())
        }
    }
}

/// Classification of token refresh failures, used to decide whether a
/// connection is disabled or the refresh is retried later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailure {
    /// Refresh token is dead (e.g. `invalid_grant`); connection disabled.
    Permanent,
    /// Temporary failure; the connection stays active and retries later.
    Transient,
    /// Provider throttled the refresh endpoint.
    RateLimited,
}

/// Classify a token-endpoint error body or message by its OAuth error codes.
pub fn classify_refresh_failure(error_str: &str) -> RefreshFailure {
    let error_lower = error_str.to_lowercase();

    if error_lower.contains("invalid_grant")
        || error_lower.contains("invalid_client")
        || error_lower.contains("unauthorized_client")
        || error_lower.contains("revoked")
        || error_lower.contains("access_denied")
        || error_lower.contains("unsupported_grant_type")
    {
        return RefreshFailure::Permanent;
    }

    if error_lower.contains("rate_limit")
        || error_lower.contains("too_many_requests")
        || error_lower.contains("temporarily_unavailable")
        || error_lower.contains("quota_exceeded")
    {
        return RefreshFailure::RateLimited;
    }

    RefreshFailure::Transient
}
