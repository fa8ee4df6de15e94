use thiserror::Error;

/// Why a single delivery call failed.
///
/// The `Display` text is stored verbatim as the diagnostic of a failed
/// [`Attempt`](crate::types::Attempt).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The mail server refused the message or the session.
    #[error("{0}")]
    Rejected(String),

    /// A sender or recipient address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The delivery call did not finish within the configured bound.
    #[error("delivery timed out after {secs}s")]
    Timeout { secs: u64 },

    /// No transport is configured or the server could not be reached.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur within the dispatch subsystem.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The mailing cannot be dispatched as stored (no message, no recipients).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A stored value (timestamp, enum) could not be decoded.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// The store lock was poisoned by a panicking thread.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        DispatchError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
