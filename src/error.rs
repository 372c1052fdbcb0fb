//! Error types.
//!
//! [`MonitorError`] covers everything the monitoring core and the mutation
//! API can fail with. [`ChannelError`] is the per-attempt failure of one
//! outbound delivery; it never escapes notification fanout.

use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by stores, evaluators and the lifecycle API.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Malformed input rejected at the mutation boundary.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// A lifecycle action that the current state does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Persisted data that violates an invariant (e.g. a trip ending before it starts).
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// Optimistic-concurrency mismatch on save; the caller must re-read.
    #[error("trip {trip_id} was modified concurrently (expected version {expected})")]
    ConcurrencyConflict { trip_id: Uuid, expected: i64 },

    /// Caller broke a contract (e.g. fanout for an alert with no message).
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MonitorError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        MonitorError::NotFound { entity, id }
    }
}

/// Outcome of a single failed channel attempt.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Timeout, provider 5xx or other retryable failure.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The contact has nothing this channel can deliver to.
    #[error("no {0} target for contact")]
    NoTarget(&'static str),

    /// Every push token for the contact was rejected as invalid.
    #[error("push tokens rejected: {0}")]
    PermanentToken(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
