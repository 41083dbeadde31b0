//! Error taxonomy for the memory engine.

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Configuration failed schema validation. Fatal at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Memory id is unknown. Returned to the caller, not logged as an error.
    #[error("memory not found: {0}")]
    NotFound(i64),
    /// Cross-index inconsistency after a failed multi-step mutation.
    /// The dense index and the document table disagree for these ids.
    #[error("cross-index inconsistency for ids {ids:?}; run `lmem sparse_rebuild` and restore the vector index from a consistent snapshot")]
    StorageConflict {
        /// Ids whose dense/document state may disagree
        ids: Vec<i64>,
    },
    /// Embedder, LLM, or disk failure. Recoverable; callers may retry.
    #[error("external capability failure: {0}")]
    External(String),
    /// A serialized operation is already in progress.
    #[error("operation already in progress: {0}")]
    Busy(String),
    /// Bad admin command or out-of-range parameter.
    #[error("{0}")]
    Validation(String),
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Vector index error
    #[error("vector index error: {0}")]
    Index(String),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MemoryError {
    /// Whether the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoryError::External(_))
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, MemoryError>;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MemoryError::External("timeout".into()).is_retryable());
        assert!(!MemoryError::NotFound(7).is_retryable());
        assert!(!MemoryError::Busy("prune".into()).is_retryable());
    }

    #[test]
    fn test_storage_conflict_message_mentions_rebuild() {
        let err = MemoryError::StorageConflict { ids: vec![1, 2] };
        assert!(err.to_string().contains("sparse_rebuild"));
    }
}
