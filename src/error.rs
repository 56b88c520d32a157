//! Error types for the categorizer.

/// Retryable failure while handling one event.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Event source error: {0}")]
    Source(#[from] SourceError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Errors raised by an upstream event source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source {name} I/O failed: {reason}")]
    Io { name: String, reason: String },

    #[error("Corrupt cursor for source {name}: {reason}")]
    Cursor { name: String, reason: String },

    #[error("Commit for offset {offset} does not match in-flight record {inflight:?}")]
    CommitMismatch { offset: u64, inflight: Option<u64> },
}

/// Payload could not be turned into a `TransactionEvent`.
///
/// Never retryable: the same bytes will fail the same way on redelivery.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Failures from the classification stages.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Fallback classifier {name} failed: {reason}")]
    Fallback { name: String, reason: String },
}
