//! Record Store: durable persistence of one memory per addressable unit.
//!
//! - `RecordStore`: backend-agnostic async trait
//! - `FsRecordStore`: one JSON file per memory plus index/stats cache files
//! - `fakes::InMemoryRecordStore`: test double with failure injection

pub mod fakes;
pub mod fs;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::index::PersistedIndex;
use crate::model::Memory;
use crate::stats::MemoryStats;

/// Errors from record persistence.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("memory not found: {id}")]
    NotFound { id: String },

    #[error("invalid memory id: {id}")]
    InvalidId { id: String },

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Outcome of reading every record: good records plus the ones that failed.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub records: Vec<Memory>,
    pub failed: Vec<(String, StorageError)>,
}

/// Per-record persistence plus the two shared cache documents.
///
/// Guarantees:
/// - `put` replaces the whole record atomically; readers never see a partial write.
/// - `remove` is idempotent and reports whether the record existed.
/// - the index and stats documents are caches; losing them loses no data.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a record under its id, replacing any previous version.
    async fn put(&self, memory: &Memory) -> StorageResult<()>;

    /// Read a record. Returns `StorageError::NotFound` if absent.
    async fn get(&self, id: &str) -> StorageResult<Memory>;

    /// Hard-delete a record. No-op (returns `false`) if absent.
    async fn remove(&self, id: &str) -> StorageResult<bool>;

    async fn contains(&self, id: &str) -> StorageResult<bool>;

    /// Ids of every stored record, sorted.
    async fn list_ids(&self) -> StorageResult<Vec<String>>;

    /// Read every record; unreadable ones are reported, not fatal.
    async fn load_all(&self) -> StorageResult<LoadedRecords>;

    async fn load_index(&self) -> StorageResult<Option<PersistedIndex>>;

    async fn save_index(&self, index: &PersistedIndex) -> StorageResult<()>;

    async fn load_stats(&self) -> StorageResult<Option<MemoryStats>>;

    async fn save_stats(&self, stats: &MemoryStats) -> StorageResult<()>;
}

/// Deterministic ordering for bulk loads: creation time, then id.
pub(crate) fn sort_records(records: &mut [Memory]) {
    records.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
}
