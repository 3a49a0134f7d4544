//! Index backend abstraction.
//!
//! The delivery pipeline needs exactly two operations from a search backend:
//! a bulk write of identified documents and a "clear is-latest" update over a
//! set of case groups. [`IndexBackend`] captures both so the pipeline can run
//! against Elasticsearch in production and [`memory::InMemoryBackend`] in
//! tests.
//!
//! Implementations must be `Send + Sync` to be shared by the flush task.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// One document of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub id: String,
    pub body: Value,
}

/// Result of a bulk write that reached the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub indexed: usize,
    /// Items the backend refused individually; never retried.
    pub rejected: usize,
    /// First few per-item error reasons, for logging.
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Rate limiting or overload; the same request may succeed later.
    #[error("backend unavailable (HTTP {status}): {message}")]
    Transient { status: u16, message: String },
    #[error("backend rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    /// Timed out before a response arrived; retried like [`BackendError::Transient`].
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Transient { .. } | BackendError::Timeout(_)
        )
    }

    /// Classify an HTTP error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 | 503 => BackendError::Transient { status, message },
            _ => BackendError::Rejected { status, message },
        }
    }
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Write `items` into `index`, replacing documents with the same id.
    async fn bulk_index(&self, index: &str, items: &[BulkItem])
        -> Result<BulkOutcome, BackendError>;

    /// Set `is_latest = false` on every document of `index` whose
    /// `group_id` is one of `group_ids`. Concurrent-modification conflicts
    /// are ignored.
    async fn clear_latest(&self, index: &str, group_ids: &[String]) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(BackendError::from_status(429, "slow down").is_transient());
        assert!(BackendError::from_status(503, "overloaded").is_transient());
        assert!(!BackendError::from_status(400, "bad request").is_transient());
        assert!(BackendError::Timeout("120s".into()).is_transient());
        assert!(!BackendError::Transport("connection refused".into()).is_transient());
    }
}
