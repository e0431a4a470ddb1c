//! In-memory record store (testing only)
//!
//! Records are kept as serialized JSON so every read exercises the same
//! timestamp parsing path as the filesystem backend. Writes can be made to
//! fail on demand to exercise partial-failure handling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{sort_records, LoadedRecords, RecordStore, StorageError, StorageResult};
use crate::index::PersistedIndex;
use crate::model::Memory;
use crate::stats::MemoryStats;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn injected(what: &str) -> StorageError {
    StorageError::Io {
        path: format!("memory://{what}").into(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
    }
}

/// `RecordStore` backed by maps of serialized documents.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<String, String>>,
    index: Mutex<Option<String>>,
    stats: Mutex<Option<String>>,
    fail_index_writes: AtomicBool,
    fail_puts: Mutex<BTreeSet<String>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save_index` fail (or succeed again).
    pub fn fail_index_writes(&self, fail: bool) {
        self.fail_index_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `put` fail for one record id.
    pub fn fail_puts_for(&self, id: &str) {
        lock(&self.fail_puts).insert(id.to_string());
    }

    /// Store raw text under an id, bypassing serialization.
    pub fn insert_raw(&self, id: &str, document: &str) {
        lock(&self.records).insert(id.to_string(), document.to_string());
    }

    /// Delete a record behind the index's back.
    pub fn remove_silently(&self, id: &str) {
        lock(&self.records).remove(id);
    }

    pub fn record_count(&self) -> usize {
        lock(&self.records).len()
    }

    fn decode(id: &str, document: &str) -> StorageResult<Memory> {
        serde_json::from_str(document).map_err(|e| StorageError::Corrupt {
            path: format!("memory://{id}").into(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put(&self, memory: &Memory) -> StorageResult<()> {
        if lock(&self.fail_puts).contains(&memory.id) {
            return Err(injected(&memory.id));
        }
        let document = serde_json::to_string(memory)?;
        lock(&self.records).insert(memory.id.clone(), document);
        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<Memory> {
        let records = lock(&self.records);
        let document = records
            .get(id)
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })?;
        Self::decode(id, document)
    }

    async fn remove(&self, id: &str) -> StorageResult<bool> {
        Ok(lock(&self.records).remove(id).is_some())
    }

    async fn contains(&self, id: &str) -> StorageResult<bool> {
        Ok(lock(&self.records).contains_key(id))
    }

    async fn list_ids(&self) -> StorageResult<Vec<String>> {
        Ok(lock(&self.records).keys().cloned().collect())
    }

    async fn load_all(&self) -> StorageResult<LoadedRecords> {
        let records = lock(&self.records);
        let mut loaded = LoadedRecords::default();
        for (id, document) in records.iter() {
            match Self::decode(id, document) {
                Ok(memory) => loaded.records.push(memory),
                Err(e) => loaded.failed.push((id.clone(), e)),
            }
        }
        sort_records(&mut loaded.records);
        Ok(loaded)
    }

    async fn load_index(&self) -> StorageResult<Option<PersistedIndex>> {
        match lock(&self.index).as_deref() {
            Some(document) => Ok(Some(serde_json::from_str(document)?)),
            None => Ok(None),
        }
    }

    async fn save_index(&self, index: &PersistedIndex) -> StorageResult<()> {
        if self.fail_index_writes.load(Ordering::SeqCst) {
            return Err(injected("index"));
        }
        *lock(&self.index) = Some(serde_json::to_string(index)?);
        Ok(())
    }

    async fn load_stats(&self) -> StorageResult<Option<MemoryStats>> {
        match lock(&self.stats).as_deref() {
            Some(document) => Ok(Some(serde_json::from_str(document)?)),
            None => Ok(None),
        }
    }

    async fn save_stats(&self, stats: &MemoryStats) -> StorageResult<()> {
        *lock(&self.stats) = Some(serde_json::to_string(stats)?);
        Ok(())
    }
}
