//! Error taxonomy for the memory store.

use crate::model::timestamp::TimestampError;
use crate::store::StorageError;

/// Errors produced by memory store operations.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("validation failed on `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("duplicate of existing memory {existing_id}")]
    Duplicate { existing_id: String },

    #[error("memory not found: {id}")]
    NotFound { id: String },

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("index references memory absent from the store: {id}")]
    InconsistentIndex { id: String },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(#[from] TimestampError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported import: {0}")]
    UnsupportedImport(String),
}

impl MemoryError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for MemoryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { id } => MemoryError::NotFound { id },
            other => MemoryError::Storage(other),
        }
    }
}

/// Result type for memory store operations.
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// A record a bulk operation could not process. Bulk operations keep going
/// and report these instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FailedRecord {
    pub id: String,
    pub error: String,
}

impl FailedRecord {
    pub fn new(id: impl Into<String>, error: &dyn std::fmt::Display) -> Self {
        Self {
            id: id.into(),
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_not_found_maps_to_not_found() {
        let err: MemoryError = StorageError::NotFound { id: "mem_x".into() }.into();
        assert!(matches!(err, MemoryError::NotFound { ref id } if id == "mem_x"));
    }

    #[test]
    fn test_validation_display() {
        let err = MemoryError::validation("summary", "must not be empty");
        let msg = err.to_string();
        assert!(msg.contains("summary"));
        assert!(msg.contains("must not be empty"));
    }

    #[test]
    fn test_duplicate_display_names_existing_id() {
        let err = MemoryError::Duplicate {
            existing_id: "mem_abc".to_string(),
        };
        assert!(err.to_string().contains("mem_abc"));
    }
}
