//! Engine-wide error taxonomy.
//!
//! Every public operation in this crate returns `Result<T, EngineError>`.
//! The kinds map 1:1 onto what an HTTP edge (not part of this crate) would
//! translate into status codes; this type carries no transport knowledge.

use std::time::Duration;

/// The error kind returned by every core operation.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Missing/invalid input, a malformed connection string, or an illegal
    /// rule condition (e.g. invalid regex).
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A namespace, queue, topic, subscription, or tracked message does not
    /// exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate namespace name or rule name collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A credential payload was corrupted or the master key no longer
    /// matches it. Fatal for that namespace; the caller must not cache a
    /// wrapper built from it.
    #[error("failed to decrypt credential: {0}")]
    DecryptFailed(String),

    /// The rule's per-hour replay budget is exhausted.
    #[error("rate limited")]
    RateLimited,

    /// A broker failure the SDK marks retryable (busy, timeout,
    /// communication problem).
    #[error("transient broker error: {0}")]
    Transient(String),

    /// A non-transient broker error, or a transient one that exhausted its
    /// retries.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// The wrapper was disposed mid-call; the caller must re-acquire it from
    /// `BrokerClientCache`.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// An unexpected failure. Logged with a correlation id; surfaced as a
    /// sanitized message.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the broker boundary should retry this error (with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether this error means the caller must re-acquire the wrapper.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_))
    }

    /// Suggested retry delay, when known. `EngineError` carries no built-in
    /// backoff state — the retry layer (`resilience::RetryExecutor`) owns
    /// the schedule; this is only populated when the broker itself supplied
    /// a hint.
    pub fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Construct a `NotFound` for a named entity kind.
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} '{id}' not found"))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                Self::NotFound("row not found".to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}
