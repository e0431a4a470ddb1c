//! Filesystem record store: one JSON file per memory under `memories/`,
//! plus the index and stats caches at the root.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use super::{sort_records, LoadedRecords, RecordStore, StorageError, StorageResult};
use crate::index::PersistedIndex;
use crate::model::{is_valid_id, Memory};
use crate::stats::MemoryStats;

const MEMORIES_DIR: &str = "memories";
const INDEX_FILE: &str = "index.json";
const STATS_FILE: &str = "stats.json";
const RECORD_EXT: &str = "json";
const LOAD_CONCURRENCY: usize = 16;

/// Filesystem-backed record store.
///
/// Layout:
/// ```text
/// <root>/memories/<id>.json
/// <root>/index.json
/// <root>/stats.json
/// ```
/// Every write lands in a temp file in the target directory and is renamed
/// into place, so concurrent readers see either the old or the new document.
#[derive(Debug, Clone)]
pub struct FsRecordStore {
    root: PathBuf,
    memories_dir: PathBuf,
}

impl FsRecordStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let memories_dir = root.join(MEMORIES_DIR);
        tokio::fs::create_dir_all(&memories_dir)
            .await
            .map_err(|source| StorageError::Io {
                path: memories_dir.clone(),
                source,
            })?;
        Ok(Self { root, memories_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> Option<PathBuf> {
        is_valid_id(id).then(|| self.memories_dir.join(format!("{id}.{RECORD_EXT}")))
    }

    async fn read_document<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StorageError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    async fn write_document<T: Serialize>(path: PathBuf, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| StorageError::Io {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
            .map_err(|source| StorageError::Io { path, source })
    }
}

/// Atomic write: temp file in the same directory, fsync, then rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn put(&self, memory: &Memory) -> StorageResult<()> {
        let path = self
            .record_path(&memory.id)
            .ok_or_else(|| StorageError::InvalidId {
                id: memory.id.clone(),
            })?;
        Self::write_document(path, memory).await
    }

    async fn get(&self, id: &str) -> StorageResult<Memory> {
        let not_found = || StorageError::NotFound { id: id.to_string() };
        let path = self.record_path(id).ok_or_else(not_found)?;
        Self::read_document(&path).await?.ok_or_else(not_found)
    }

    async fn remove(&self, id: &str) -> StorageResult<bool> {
        let Some(path) = self.record_path(id) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    async fn contains(&self, id: &str) -> StorageResult<bool> {
        match self.record_path(id) {
            Some(path) => tokio::fs::try_exists(&path)
                .await
                .map_err(|source| StorageError::Io { path, source }),
            None => Ok(false),
        }
    }

    async fn list_ids(&self) -> StorageResult<Vec<String>> {
        let io_err = |source| StorageError::Io {
            path: self.memories_dir.clone(),
            source,
        };
        let mut dir = tokio::fs::read_dir(&self.memories_dir)
            .await
            .map_err(io_err)?;
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn load_all(&self) -> StorageResult<LoadedRecords> {
        let ids = self.list_ids().await?;
        let results: Vec<(String, StorageResult<Memory>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.get(&id).await;
                (id, result)
            })
            .buffer_unordered(LOAD_CONCURRENCY)
            .collect()
            .await;

        let mut loaded = LoadedRecords::default();
        for (id, result) in results {
            match result {
                Ok(memory) => loaded.records.push(memory),
                Err(e) => {
                    tracing::warn!(event = "store.record_unreadable", id = %id, error = %e);
                    loaded.failed.push((id, e));
                }
            }
        }
        sort_records(&mut loaded.records);
        loaded.failed.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(loaded)
    }

    async fn load_index(&self) -> StorageResult<Option<PersistedIndex>> {
        Self::read_document(&self.root.join(INDEX_FILE)).await
    }

    async fn save_index(&self, index: &PersistedIndex) -> StorageResult<()> {
        Self::write_document(self.root.join(INDEX_FILE), index).await
    }

    async fn load_stats(&self) -> StorageResult<Option<MemoryStats>> {
        Self::read_document(&self.root.join(STATS_FILE)).await
    }

    async fn save_stats(&self, stats: &MemoryStats) -> StorageResult<()> {
        Self::write_document(self.root.join(STATS_FILE), stats).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MemoryType, NewMemory};
    use chrono::Utc;

    async fn make_store() -> (tempfile::TempDir, FsRecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn memory(summary: &str) -> Memory {
        Memory::from_new(
            NewMemory::new("body text", summary, MemoryType::Pattern),
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let (_dir, store) = make_store().await;
        let m = memory("first");
        store.put(&m).await.unwrap();
        assert_eq!(store.get(&m.id).await.unwrap(), m);
        assert!(store.contains(&m.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_one_file_per_record() {
        let (dir, store) = make_store().await;
        let a = memory("a");
        let b = memory("b");
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();
        store.put(&a).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join(MEMORIES_DIR))
            .unwrap()
            .collect();
        assert_eq!(files.len(), 2);
        assert!(dir
            .path()
            .join(MEMORIES_DIR)
            .join(format!("{}.json", a.id))
            .exists());
    }

    #[tokio::test]
    async fn test_get_missing_returns_not_found() {
        let (_dir, store) = make_store().await;
        match store.get("mem_missing").await {
            Err(StorageError::NotFound { id }) => assert_eq!(id, "mem_missing"),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(matches!(
            store.get("../escape").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_dir, store) = make_store().await;
        let m = memory("gone");
        store.put(&m).await.unwrap();
        assert!(store.remove(&m.id).await.unwrap());
        assert!(!store.remove(&m.id).await.unwrap());
        assert!(!store.contains(&m.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_rejects_unsafe_id() {
        let (_dir, store) = make_store().await;
        let mut m = memory("bad");
        m.id = "../../outside".to_string();
        assert!(matches!(
            store.put(&m).await,
            Err(StorageError::InvalidId { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_all_reports_corrupt_files() {
        let (dir, store) = make_store().await;
        let m = memory("good");
        store.put(&m).await.unwrap();
        std::fs::write(
            dir.path().join(MEMORIES_DIR).join("mem_broken.json"),
            r#"{"id": "mem_broken", "created": "last tuesday"}"#,
        )
        .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.failed.len(), 1);
        assert_eq!(loaded.failed[0].0, "mem_broken");
        assert!(matches!(loaded.failed[0].1, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_missing_caches_load_as_none() {
        let (_dir, store) = make_store().await;
        assert!(store.load_index().await.unwrap().is_none());
        assert!(store.load_stats().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_ids_ignores_foreign_files() {
        let (dir, store) = make_store().await;
        let m = memory("listed");
        store.put(&m).await.unwrap();
        std::fs::write(dir.path().join(MEMORIES_DIR).join("notes.txt"), "x").unwrap();
        assert_eq!(store.list_ids().await.unwrap(), vec![m.id]);
    }
}
