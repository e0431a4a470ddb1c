//! Mnemo Core Library
//!
//! Persistent memory store for autonomous agents: per-record storage, derived
//! indexes, lexical similarity, relevance decay, consolidation and retrieval.

pub mod config;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod model;
pub mod obs;
pub mod query;
pub mod service;
pub mod similarity;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod transfer;

pub use config::StoreConfig;
pub use error::{FailedRecord, MemoryError, MemoryResult};
pub use index::{MemoryIndex, PersistedIndex};
pub use lifecycle::{build_chain, ArchivePolicy, ChainLink, ConsolidationPlan};
pub use model::{Memory, MemoryPatch, MemoryType, NewMemory};
pub use query::{ArchivedFilter, QuerySpec, SortKey};
pub use service::{ConsolidationReport, MaintenanceOp, MaintenanceReport, MemoryStore};
pub use similarity::{extract_entities, text_similarity, weighted_similarity, SimilarityResult};
pub use stats::MemoryStats;
pub use telemetry::init_tracing;
pub use store::fakes::InMemoryRecordStore;
pub use store::fs::FsRecordStore;
pub use store::{RecordStore, StorageError};
pub use transfer::{ExportBundle, ExportFormat, ImportReport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
