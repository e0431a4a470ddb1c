//! `MemoryStore`: the operation surface consumed by agents and the CLI.
//!
//! A single writer lock serializes every operation that writes records
//! (including reads, which bump access statistics). Record writes are the
//! durable fact; the index is a cache updated strictly afterwards, and a
//! failure to persist it never rolls a record write back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::Instrument;

use crate::config::StoreConfig;
use crate::error::{FailedRecord, MemoryError, MemoryResult};
use crate::index::MemoryIndex;
use crate::lifecycle::{self, ArchivePolicy, LifecycleChanges};
use crate::model::{content_digest, is_valid_id, new_memory_id, Memory, MemoryPatch, NewMemory};
use crate::obs;
use crate::query::{self, QuerySpec};
use crate::similarity::{find_consolidation_candidates, find_duplicate_candidate, SimilarityResult};
use crate::stats::MemoryStats;
use crate::store::fs::FsRecordStore;
use crate::store::{RecordStore, StorageError};
use crate::transfer::{self, ExportFormat, ImportReport};

const LOAD_CONCURRENCY: usize = 16;

/// A lifecycle maintenance request. `None` parameters fall back to config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum MaintenanceOp {
    Decay {
        half_life_days: Option<f64>,
    },
    Archive {
        age_days: Option<u64>,
        relevance_floor: Option<f64>,
    },
    Stats,
    RebuildIndex,
}

impl MaintenanceOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Decay { .. } => "decay",
            Self::Archive { .. } => "archive",
            Self::Stats => "stats",
            Self::RebuildIndex => "rebuild_index",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub operation: String,
    pub processed: usize,
    pub changed: usize,
    pub failed: Vec<FailedRecord>,
    pub stats: Option<MemoryStats>,
    /// The on-disk index could not be refreshed; it self-heals on the next write or open.
    pub index_stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Survivor records written.
    pub groups: usize,
    /// Records absorbed into a survivor and deleted.
    pub merged: usize,
    pub removed_ids: Vec<String>,
    pub remaining: usize,
    pub failed: Vec<FailedRecord>,
}

/// Persistent memory store over a [`RecordStore`] backend.
pub struct MemoryStore<S: RecordStore> {
    store: Arc<S>,
    config: StoreConfig,
    index: RwLock<MemoryIndex>,
    writer: Mutex<()>,
    index_stale: AtomicBool,
}

impl MemoryStore<FsRecordStore> {
    /// Open the filesystem store at `config.root`.
    pub async fn open_dir(config: StoreConfig) -> MemoryResult<Self> {
        let backend = FsRecordStore::open(&config.root).await?;
        Self::open(Arc::new(backend), config).await
    }
}

impl<S: RecordStore> MemoryStore<S> {
    /// Open a store, loading the index cache or rebuilding it when it is
    /// missing, unreadable or out of step with the stored records.
    pub async fn open(store: Arc<S>, config: StoreConfig) -> MemoryResult<Self> {
        config.validate()?;
        let this = Self {
            store,
            config,
            index: RwLock::new(MemoryIndex::new()),
            writer: Mutex::new(()),
            index_stale: AtomicBool::new(false),
        };

        let _guard = this.writer.lock().await;
        match this.load_cached_index().await {
            Ok(index) => *this.index.write().await = index,
            Err(reason) => {
                this.rebuild_index_locked(&reason).await?;
            }
        }
        drop(_guard);
        Ok(this)
    }

    async fn load_cached_index(&self) -> Result<MemoryIndex, String> {
        let persisted = match self.store.load_index().await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return Err("missing".to_string()),
            Err(e) => return Err(format!("unreadable: {e}")),
        };
        let index = MemoryIndex::from_persisted(persisted).map_err(|e| e.to_string())?;
        let stored: BTreeSet<String> = self
            .store
            .list_ids()
            .await
            .map_err(|e| e.to_string())?
            .into_iter()
            .collect();
        index.verify(&stored).map_err(|e| e.to_string())?;

        // Same ids with different labels means a record write outlived its
        // index write (failed persist or crash in between).
        let loaded = self.store.load_all().await.map_err(|e| e.to_string())?;
        if index != MemoryIndex::from_records(&loaded.records) {
            return Err("out of date with stored records".to_string());
        }
        Ok(index)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether the persisted index is known to lag the records.
    pub fn is_index_stale(&self) -> bool {
        self.index_stale.load(Ordering::SeqCst)
    }

    /// Copy of the in-memory index.
    pub async fn index_snapshot(&self) -> MemoryIndex {
        self.index.read().await.clone()
    }

    // -- writes -------------------------------------------------------------

    /// Record a new memory.
    ///
    /// Rejects with [`MemoryError::Duplicate`] when a near-identical memory of
    /// the same type was recorded within the dedup window, unless `force` is set.
    pub async fn record(&self, new: NewMemory) -> MemoryResult<Memory> {
        let _guard = self.writer.lock().await;
        let now = Utc::now();
        let forced = new.force;
        let mut memory = Memory::from_new(new, now)?;

        if !forced {
            if let Some(existing_id) = self.find_recent_duplicate(&memory, now).await? {
                obs::emit_duplicate_rejected(&existing_id);
                return Err(MemoryError::Duplicate { existing_id });
            }
        }

        while self.store.contains(&memory.id).await? {
            memory.id = new_memory_id(now);
        }
        self.store.put(&memory).await?;
        self.index.write().await.on_insert(&memory);
        self.persist_index().await;

        obs::emit_memory_recorded(&memory.id, memory.memory_type.as_str(), forced);
        Ok(memory)
    }

    async fn find_recent_duplicate(
        &self,
        memory: &Memory,
        now: DateTime<Utc>,
    ) -> MemoryResult<Option<String>> {
        let window = self.config.dedup_window_secs;
        let since = Duration::try_seconds(window).and_then(|w| now.checked_sub_signed(w));
        let ids = self.index.read().await.created_between(since, None);
        if ids.is_empty() {
            return Ok(None);
        }
        let (recent, _missing) = self.load_many(ids).await?;
        Ok(find_duplicate_candidate(
            memory,
            &recent,
            window,
            self.config.duplicate_threshold,
        ))
    }

    /// Apply a partial edit. Bumps `version` by exactly one.
    pub async fn update(&self, id: &str, patch: MemoryPatch) -> MemoryResult<Memory> {
        let _guard = self.writer.lock().await;
        let old = self.store.get(id).await?;
        let mut updated = old.clone();
        updated.apply_patch(patch, Utc::now())?;

        self.store.put(&updated).await?;
        self.index.write().await.on_update(&old, &updated);
        self.persist_index().await;

        obs::emit_memory_updated(&updated.id, updated.version);
        Ok(updated)
    }

    /// Explicit `archived -> active` transition.
    pub async fn reactivate(&self, id: &str) -> MemoryResult<Memory> {
        self.update(id, MemoryPatch::default().with_archived(false))
            .await
    }

    /// Hard-delete a memory. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> MemoryResult<bool> {
        let _guard = self.writer.lock().await;
        let existed = self.store.remove(id).await?;
        let indexed = {
            let mut index = self.index.write().await;
            let indexed = index.contains(id);
            index.on_remove(id);
            indexed
        };
        if existed || indexed {
            self.persist_index().await;
        }
        obs::emit_memory_deleted(id, existed);
        Ok(existed)
    }

    // -- reads --------------------------------------------------------------

    /// Caller-facing read: applies the access hook before returning.
    pub async fn get(&self, id: &str) -> MemoryResult<Memory> {
        let _guard = self.writer.lock().await;
        let mut memory = self.store.get(id).await?;
        self.touch(&mut memory, Utc::now()).await?;
        Ok(memory)
    }

    /// Read without touching access statistics.
    pub async fn peek(&self, id: &str) -> MemoryResult<Memory> {
        Ok(self.store.get(id).await?)
    }

    async fn touch(&self, memory: &mut Memory, now: DateTime<Utc>) -> MemoryResult<()> {
        lifecycle::access(memory, now, self.config.access_boost);
        self.store.put(memory).await?;
        Ok(())
    }

    /// Run a query. Every returned memory goes through the access hook.
    pub async fn query(&self, spec: &QuerySpec) -> MemoryResult<Vec<Memory>> {
        let _guard = self.writer.lock().await;

        let mut candidates = self.index.read().await.candidates(spec);
        let (mut records, missing) = self.load_many(candidates.iter().cloned().collect()).await?;
        if let Some(id) = missing.first() {
            let reason = MemoryError::InconsistentIndex { id: id.clone() }.to_string();
            self.rebuild_index_locked(&reason).await?;
            candidates = self.index.read().await.candidates(spec);
            records = self.load_many(candidates.iter().cloned().collect()).await?.0;
        }

        let hits = query::execute(spec, records, self.config.default_limit);
        let mut results = match spec.expand_chains {
            Some(depth) => self.expand_chains(hits, depth).await?,
            None => hits,
        };

        let now = Utc::now();
        for memory in &mut results {
            self.touch(memory, now).await?;
        }
        obs::emit_query_served(candidates.len(), results.len());
        Ok(results)
    }

    async fn expand_chains(&self, hits: Vec<Memory>, depth: usize) -> MemoryResult<Vec<Memory>> {
        let depth = depth.min(self.config.max_chain_depth);
        let all = self.load_all_records().await?.0;
        let by_id: BTreeMap<&str, &Memory> = all.iter().map(|m| (m.id.as_str(), m)).collect();

        let mut seen: BTreeSet<String> = hits.iter().map(|m| m.id.clone()).collect();
        let mut expanded = Vec::with_capacity(hits.len());
        for hit in hits {
            let links = lifecycle::build_chain(&hit.id, depth, &all);
            expanded.push(hit);
            for link in links.into_iter().skip(1) {
                if let Some(m) = by_id.get(link.id.as_str()) {
                    if seen.insert(link.id.clone()) {
                        expanded.push((*m).clone());
                    }
                }
            }
        }
        Ok(expanded)
    }

    /// Memories reachable from `id` over relationship edges, root first.
    ///
    /// Depth is capped by config. Every returned memory counts as accessed.
    /// With `include_content = false` the returned copies have empty content.
    pub async fn get_chain(
        &self,
        id: &str,
        depth: usize,
        include_content: bool,
    ) -> MemoryResult<Vec<Memory>> {
        let _guard = self.writer.lock().await;
        if !self.store.contains(id).await? {
            return Err(MemoryError::NotFound { id: id.to_string() });
        }
        let depth = depth.min(self.config.max_chain_depth);
        let all = self.load_all_records().await?.0;
        let links = lifecycle::build_chain(id, depth, &all);
        let mut by_id: BTreeMap<String, Memory> =
            all.into_iter().map(|m| (m.id.clone(), m)).collect();

        let now = Utc::now();
        let mut chain = Vec::with_capacity(links.len());
        for link in links {
            let Some(mut memory) = by_id.remove(&link.id) else {
                continue;
            };
            self.touch(&mut memory, now).await?;
            if !include_content {
                memory.content.clear();
            }
            chain.push(memory);
        }
        Ok(chain)
    }

    /// Current aggregate counters, recomputed from the records.
    pub async fn stats(&self) -> MemoryResult<MemoryStats> {
        let _guard = self.writer.lock().await;
        let records = self.load_all_records().await?.0;
        Ok(self.refresh_stats(&records).await)
    }

    async fn refresh_stats(&self, records: &[Memory]) -> MemoryStats {
        let stats = MemoryStats::compute(records, Utc::now());
        if let Err(e) = self.store.save_stats(&stats).await {
            tracing::warn!(event = "stats.persist_failed", error = %e);
        }
        stats
    }

    // -- lifecycle ----------------------------------------------------------

    pub async fn maintenance(&self, op: MaintenanceOp) -> MemoryResult<MaintenanceReport> {
        let span = obs::maintenance_span(op.name());
        self.run_maintenance(op).instrument(span).await
    }

    async fn run_maintenance(&self, op: MaintenanceOp) -> MemoryResult<MaintenanceReport> {
        let _guard = self.writer.lock().await;

        let report = match &op {
            MaintenanceOp::Decay { half_life_days } => {
                let half_life = half_life_days.unwrap_or(self.config.half_life_days);
                let (records, failed) = self.load_all_records().await?;
                let changes = lifecycle::decay(&records, half_life, Utc::now())?;
                self.apply_changes(op.name(), records, changes, failed).await
            }
            MaintenanceOp::Archive {
                age_days,
                relevance_floor,
            } => {
                let defaults = self.config.archive_policy();
                let policy = ArchivePolicy {
                    age_days: age_days.unwrap_or(defaults.age_days),
                    relevance_floor: relevance_floor.unwrap_or(defaults.relevance_floor),
                };
                policy.validate()?;
                let (records, failed) = self.load_all_records().await?;
                let changes = lifecycle::archive(&records, &policy, Utc::now())?;
                self.apply_changes(op.name(), records, changes, failed).await
            }
            MaintenanceOp::Stats => {
                let (records, failed) = self.load_all_records().await?;
                let stats = self.refresh_stats(&records).await;
                MaintenanceReport {
                    operation: op.name().to_string(),
                    processed: records.len(),
                    changed: 0,
                    failed,
                    stats: Some(stats),
                    index_stale: self.is_index_stale(),
                }
            }
            MaintenanceOp::RebuildIndex => {
                let (processed, failed) = self.rebuild_index_locked("requested").await?;
                MaintenanceReport {
                    operation: op.name().to_string(),
                    processed,
                    changed: processed,
                    failed,
                    stats: None,
                    index_stale: self.is_index_stale(),
                }
            }
        };

        obs::emit_maintenance_finished(
            &report.operation,
            report.processed,
            report.changed,
            report.failed.len(),
        );
        Ok(report)
    }

    /// Write back a lifecycle pass record by record; failures are collected.
    async fn apply_changes(
        &self,
        operation: &str,
        records: Vec<Memory>,
        changes: LifecycleChanges,
        mut failed: Vec<FailedRecord>,
    ) -> MaintenanceReport {
        let mut current: BTreeMap<String, Memory> =
            records.into_iter().map(|m| (m.id.clone(), m)).collect();
        let mut changed = 0;
        for memory in changes.updated {
            match self.store.put(&memory).await {
                Ok(()) => {
                    changed += 1;
                    current.insert(memory.id.clone(), memory);
                }
                Err(e) => {
                    obs::emit_record_failed(&memory.id, operation, &e);
                    failed.push(FailedRecord::new(memory.id, &e));
                }
            }
        }
        let records: Vec<Memory> = current.into_values().collect();
        let stats = self.refresh_stats(&records).await;
        MaintenanceReport {
            operation: operation.to_string(),
            processed: changes.processed,
            changed,
            failed,
            stats: Some(stats),
            index_stale: self.is_index_stale(),
        }
    }

    /// Advisory pairs; nothing is changed.
    pub async fn consolidation_candidates(&self) -> MemoryResult<Vec<SimilarityResult>> {
        let records = self.load_all_records().await?.0;
        Ok(find_consolidation_candidates(
            &records,
            self.config.consolidation_threshold,
        ))
    }

    /// Merge near-duplicates into their newest member and delete the rest.
    ///
    /// Survivors are written before anything is deleted, so an interrupted run
    /// leaves absorbed records that the next run recognizes and removes.
    pub async fn consolidate(&self) -> MemoryResult<ConsolidationReport> {
        self.run_consolidation()
            .instrument(obs::maintenance_span("consolidate"))
            .await
    }

    async fn run_consolidation(&self) -> MemoryResult<ConsolidationReport> {
        let _guard = self.writer.lock().await;

        let (records, failed) = self.load_all_records().await?;
        let plan =
            lifecycle::plan_consolidation(&records, self.config.consolidation_threshold, Utc::now());
        let mut report = ConsolidationReport {
            failed,
            ..ConsolidationReport::default()
        };
        let total = records.len();
        let before: BTreeMap<String, Memory> =
            records.into_iter().map(|m| (m.id.clone(), m)).collect();

        for group in &plan.groups {
            if let Err(e) = self.store.put(&group.survivor).await {
                obs::emit_record_failed(&group.survivor.id, "consolidate", &e);
                report
                    .failed
                    .push(FailedRecord::new(group.survivor.id.clone(), &e));
                continue;
            }
            report.groups += 1;
            if let Some(old) = before.get(&group.survivor.id) {
                self.index.write().await.on_update(old, &group.survivor);
            }
            for id in &group.absorbed {
                if self.remove_for_consolidation(id, &mut report).await {
                    report.merged += 1;
                }
            }
        }
        for memory in &plan.redirected {
            if let Err(e) = self.store.put(memory).await {
                report.failed.push(FailedRecord::new(memory.id.clone(), &e));
            }
        }
        for id in &plan.stale {
            self.remove_for_consolidation(id, &mut report).await;
        }

        if !plan.is_empty() {
            self.persist_index().await;
        }
        report.remaining = total - report.removed_ids.len();
        obs::emit_consolidated(report.merged, report.removed_ids.len(), report.remaining);
        Ok(report)
    }

    async fn remove_for_consolidation(&self, id: &str, report: &mut ConsolidationReport) -> bool {
        match self.store.remove(id).await {
            Ok(_) => {
                self.index.write().await.on_remove(id);
                report.removed_ids.push(id.to_string());
                true
            }
            Err(e) => {
                obs::emit_record_failed(id, "consolidate", &e);
                report.failed.push(FailedRecord::new(id, &e));
                false
            }
        }
    }

    // -- transfer -----------------------------------------------------------

    /// Export memories matching `spec`, oldest first. No access hook; the
    /// spec's limit applies only when set.
    pub async fn export(&self, spec: &QuerySpec, format: ExportFormat) -> MemoryResult<Vec<u8>> {
        let records = self.load_all_records().await?.0;
        let mut selected: Vec<Memory> = records.into_iter().filter(|m| spec.matches(m)).collect();
        if let Some(limit) = spec.limit {
            selected.truncate(limit);
        }
        let now = Utc::now();
        match format {
            ExportFormat::Structured => transfer::export_structured(selected, now),
            ExportFormat::Narrative => Ok(transfer::export_narrative(&selected, now)),
        }
    }

    /// Import a structured export. Incoming ids are kept when free; taken ids
    /// are skipped unless `overwrite`. Ids listed in any `consolidated_from`
    /// are always skipped.
    pub async fn import(&self, bytes: &[u8], overwrite: bool) -> MemoryResult<ImportReport> {
        let memories = transfer::parse_import(bytes)?;
        let _guard = self.writer.lock().await;
        let mut report = ImportReport::default();

        // Ids merged into a survivor (stored or incoming) stay merged.
        let (stored, _) = self.load_all_records().await?;
        let absorbed: BTreeMap<String, String> = stored
            .iter()
            .chain(memories.iter())
            .flat_map(|m| m.consolidated_from.iter().map(move |old| (old.clone(), m.id.clone())))
            .collect();

        for mut memory in memories {
            if let Err(e) = memory.validate() {
                report.failed.push(FailedRecord::new(memory.id, &e));
                continue;
            }
            if let Some(survivor) = absorbed.get(&memory.id) {
                obs::emit_import_absorbed_skipped(&memory.id, survivor);
                report.skipped += 1;
                continue;
            }
            if !is_valid_id(&memory.id) {
                memory.id = new_memory_id(memory.created);
            }
            memory.content_digest = content_digest(&memory.content);

            match self.import_one(&memory, overwrite).await {
                Ok(ImportOutcome::Imported) => report.imported += 1,
                Ok(ImportOutcome::Overwritten) => report.overwritten += 1,
                Ok(ImportOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    obs::emit_record_failed(&memory.id, "import", &e);
                    report.failed.push(FailedRecord::new(memory.id, &e));
                }
            }
        }

        if report.imported + report.overwritten > 0 {
            self.persist_index().await;
        }
        Ok(report)
    }

    async fn import_one(&self, memory: &Memory, overwrite: bool) -> MemoryResult<ImportOutcome> {
        let existing = match self.store.get(&memory.id).await {
            Ok(existing) => Some(existing),
            Err(StorageError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        match existing {
            Some(_) if !overwrite => Ok(ImportOutcome::Skipped),
            Some(old) => {
                let mut memory = memory.clone();
                memory.absorb_ids(old.consolidated_from.iter().cloned());
                self.store.put(&memory).await?;
                self.index.write().await.on_update(&old, &memory);
                Ok(ImportOutcome::Overwritten)
            }
            None => {
                self.store.put(memory).await?;
                self.index.write().await.on_insert(memory);
                Ok(ImportOutcome::Imported)
            }
        }
    }

    // -- index maintenance --------------------------------------------------

    /// Rebuild the index from the stored records.
    pub async fn rebuild_index(&self) -> MemoryResult<usize> {
        let _guard = self.writer.lock().await;
        Ok(self.rebuild_index_locked("requested").await?.0)
    }

    /// Caller must hold the writer lock.
    async fn rebuild_index_locked(&self, reason: &str) -> MemoryResult<(usize, Vec<FailedRecord>)> {
        let (records, failed) = self.load_all_records().await?;
        *self.index.write().await = MemoryIndex::from_records(&records);
        obs::emit_index_rebuilt(records.len(), reason);
        self.persist_index().await;
        Ok((records.len(), failed))
    }

    /// Write the index cache. Failure marks the index stale instead of failing
    /// the operation that triggered it.
    async fn persist_index(&self) {
        let persisted = self.index.read().await.to_persisted(Utc::now());
        match self.store.save_index(&persisted).await {
            Ok(()) => self.index_stale.store(false, Ordering::SeqCst),
            Err(e) => {
                obs::emit_index_persist_failed(&e);
                self.index_stale.store(true, Ordering::SeqCst);
            }
        }
    }

    // -- loading ------------------------------------------------------------

    async fn load_all_records(&self) -> MemoryResult<(Vec<Memory>, Vec<FailedRecord>)> {
        let loaded = self.store.load_all().await?;
        let failed = loaded
            .failed
            .iter()
            .map(|(id, e)| FailedRecord::new(id.clone(), e))
            .collect();
        Ok((loaded.records, failed))
    }

    /// Load records by id; ids with no stored record are returned separately.
    async fn load_many(&self, ids: Vec<String>) -> MemoryResult<(Vec<Memory>, Vec<String>)> {
        let results: Vec<(String, Result<Memory, StorageError>)> = stream::iter(ids)
            .map(|id| async move {
                let result = self.store.get(&id).await;
                (id, result)
            })
            .buffered(LOAD_CONCURRENCY)
            .collect()
            .await;

        let mut records = Vec::with_capacity(results.len());
        let mut missing = Vec::new();
        for (id, result) in results {
            match result {
                Ok(memory) => records.push(memory),
                Err(StorageError::NotFound { .. }) => missing.push(id),
                Err(e) => return Err(e.into()),
            }
        }
        Ok((records, missing))
    }
}

enum ImportOutcome {
    Imported,
    Overwritten,
    Skipped,
}
