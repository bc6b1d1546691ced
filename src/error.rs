//! Error types for the local store, the remote backend and the workflows
//! built on top of them.

use thiserror::Error;

use crate::models::OrderStatus;

/// Failures of the on-device store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: String },

    #[error("{table} row {id} already exists")]
    AlreadyExists { table: &'static str, id: String },

    #[error("a daily closing already exists for {0}")]
    DuplicateClosing(String),

    #[error("invalid stored data: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("data layer unavailable: {0}")]
    Unavailable(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub fn not_found(table: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            table,
            id: id.into(),
        }
    }
}

/// Failures talking to the remote backend.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("{0}")]
    Network(String),

    /// The request reached the backend but the response could not be read.
    #[error("response body unreadable: {0}")]
    Transport(String),

    #[error("remote call timed out after {0}s")]
    Timeout(u64),

    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid response from backend: {0}")]
    Decode(String),

    #[error("remote backend is not configured")]
    NotConfigured,
}

impl RemoteError {
    /// Transient failures are retried by the next sync cycle; everything
    /// else needs a human to look at the row.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Transport(_) | RemoteError::Timeout(_) => true,
            RemoteError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            RemoteError::Conflict(_) | RemoteError::Decode(_) | RemoteError::NotConfigured => false,
        }
    }
}

/// Failures of the order / admin workflows invoked by the UI.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("an order needs at least one item")]
    EmptyOrder,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cycle-level sync failures. Per-row push failures never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("waiting for {0} to be pushed first")]
    Deferred(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration value: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failures while assembling the core at startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        assert!(RemoteError::Network("Cannot reach backend".into()).is_transient());
        assert!(RemoteError::Timeout(8).is_transient());
        assert!(RemoteError::Http {
            status: 503,
            message: "server error".into()
        }
        .is_transient());
        assert!(!RemoteError::Http {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!RemoteError::Conflict("duplicate key".into()).is_transient());
    }
}
