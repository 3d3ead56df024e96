//! Error types for the sync client and its store adapters

use thiserror::Error;

/// Errors raised by a coordination store adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or the connection dropped mid-operation
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command
    #[error("Command error: {0}")]
    Command(String),

    /// A reader could not be re-established after repeated attempts
    #[error("Reconnect failed after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
}

impl StoreError {
    /// Check if this error means the connection is gone (as opposed to a bad command)
    pub fn is_connection_error(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::ReconnectExhausted { .. })
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Errors surfaced to callers of the sync client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Sync client is closed")]
    ClientClosed,

    #[error("Type mismatch on topic {topic}: expected {expected}, found {found}")]
    TypeMismatch {
        topic: String,
        expected: String,
        found: String,
    },

    #[error("No run identity bound to this client")]
    MissingRunIdentity,

    #[error("Failed to encode payload for {key}: {message}")]
    Encode { key: String, message: String },

    #[error("Failed to decode record {record} on {key}: {message}")]
    Decode {
        key: String,
        record: String,
        message: String,
    },
}

impl SyncError {
    /// Check if this is a caller-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// Check if this error came from losing the store connection
    pub fn is_connection_error(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_connection_error(),
            _ => false,
        }
    }

    /// Check if retrying the whole operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_connection_error(),
            SyncError::Cancelled => false,
            SyncError::ClientClosed => false,
            SyncError::TypeMismatch { .. } => false,
            SyncError::MissingRunIdentity => false,
            SyncError::Encode { .. } => false,
            SyncError::Decode { .. } => false,
        }
    }
}

/// Result alias for sync client operations
pub type SyncResult<T> = Result<T, SyncError>;
