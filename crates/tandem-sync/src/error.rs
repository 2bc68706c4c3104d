//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur while talking to the remote data service.
#[derive(Debug, Error)]
pub enum SyncError {
    /// HTTP request failed (connection, timeout, etc.).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote service rejected the payload. Non-retryable; the
    /// message is surfaced verbatim to the user.
    #[error("remote rejected payload: {0}")]
    Validation(String),

    /// The remote service returned a non-success status.
    #[error("remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// WebSocket error on the push channel.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The push subscription closed or could not be established.
    #[error("subscription dropped: {0}")]
    Subscription(String),
}

impl SyncError {
    /// Compact classification stored on cache entries and used to
    /// decide whether a caller may sensibly retry.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Http(_) | SyncError::Remote { .. } => ErrorKind::Network,
            SyncError::Json(_) => ErrorKind::Decode,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::WebSocket(_) | SyncError::Subscription(_) => ErrorKind::Subscription,
        }
    }

    /// Whether a caller-initiated retry could succeed. The engine
    /// itself never retries.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Subscription)
    }
}

/// Compact error classification, cheap to clone onto a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient network failure; a later refetch can recover.
    Network,
    /// Payload rejected by the remote service.
    Validation,
    /// Remote payload failed to decode at the boundary.
    Decode,
    /// Push channel closed; cache possibly stale until resubscribed.
    Subscription,
}

/// A mutation failure together with whether the optimistic apply was
/// rolled back.
///
/// When `rolled_back` is false the key had already advanced past this
/// mutation, so the rollback was withheld and the cache kept the
/// newer state. The underlying remote error is surfaced either way.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct MutationError {
    #[source]
    pub source: SyncError,
    pub rolled_back: bool,
}
