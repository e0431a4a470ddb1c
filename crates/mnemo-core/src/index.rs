//! Index Manager: derived lookup structures over the record set.
//!
//! Four bucket maps (project, type, tag, entity) and a creation-ordered
//! timeline. Buckets are ordered sets, so two indexes compare equal exactly
//! when they hold the same ids per bucket. Tag and entity keys are lowercased.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::model::{timestamp, Memory, MemoryType};
use crate::query::QuerySpec;

/// On-disk format revision of [`PersistedIndex`].
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// One position in the creation-ordered timeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub id: String,
}

/// In-memory index over every stored memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryIndex {
    by_project: BTreeMap<String, BTreeSet<String>>,
    by_type: BTreeMap<MemoryType, BTreeSet<String>>,
    by_tag: BTreeMap<String, BTreeSet<String>>,
    by_entity: BTreeMap<String, BTreeSet<String>>,
    timeline: BTreeSet<TimelineEntry>,
    created: BTreeMap<String, DateTime<Utc>>,
}

pub(crate) fn label_key(label: &str) -> String {
    label.trim().to_lowercase()
}

fn label_keys(labels: &BTreeSet<String>) -> BTreeSet<String> {
    labels.iter().map(|l| label_key(l)).collect()
}

fn attach<K: Ord>(map: &mut BTreeMap<K, BTreeSet<String>>, key: K, id: &str) {
    map.entry(key).or_default().insert(id.to_string());
}

fn detach<K: Ord>(map: &mut BTreeMap<K, BTreeSet<String>>, key: &K, id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

fn detach_everywhere<K: Ord>(map: &mut BTreeMap<K, BTreeSet<String>>, id: &str) {
    map.retain(|_, ids| {
        ids.remove(id);
        !ids.is_empty()
    });
}

fn sync_labels(
    map: &mut BTreeMap<String, BTreeSet<String>>,
    old: &BTreeSet<String>,
    new: &BTreeSet<String>,
    id: &str,
) {
    let old_keys = label_keys(old);
    let new_keys = label_keys(new);
    for gone in old_keys.difference(&new_keys) {
        detach(map, gone, id);
    }
    for added in new_keys.difference(&old_keys) {
        attach(map, added.clone(), id);
    }
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a complete index from a record set.
    pub fn from_records(records: &[Memory]) -> Self {
        let mut index = Self::new();
        for memory in records {
            index.link(memory);
        }
        index
    }

    /// Replace all structures with ones derived from `records`.
    pub fn rebuild(&mut self, records: &[Memory]) {
        *self = Self::from_records(records);
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.created.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.created.keys()
    }

    pub fn project(&self, project_id: &str) -> Option<&BTreeSet<String>> {
        self.by_project.get(project_id)
    }

    pub fn memory_type(&self, memory_type: MemoryType) -> Option<&BTreeSet<String>> {
        self.by_type.get(&memory_type)
    }

    pub fn tag(&self, tag: &str) -> Option<&BTreeSet<String>> {
        self.by_tag.get(&label_key(tag))
    }

    pub fn entity(&self, entity: &str) -> Option<&BTreeSet<String>> {
        self.by_entity.get(&label_key(entity))
    }

    pub fn timeline(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.timeline.iter()
    }

    fn link(&mut self, memory: &Memory) {
        let id = memory.id.as_str();
        if let Some(project) = &memory.project_id {
            attach(&mut self.by_project, project.clone(), id);
        }
        attach(&mut self.by_type, memory.memory_type, id);
        for key in label_keys(&memory.tags) {
            attach(&mut self.by_tag, key, id);
        }
        for key in label_keys(&memory.entities) {
            attach(&mut self.by_entity, key, id);
        }
        self.timeline.insert(TimelineEntry {
            at: memory.created,
            id: id.to_string(),
        });
        self.created.insert(id.to_string(), memory.created);
    }

    pub fn on_insert(&mut self, memory: &Memory) {
        if self.contains(&memory.id) {
            self.on_remove(&memory.id);
        }
        self.link(memory);
    }

    /// Move the id between exactly the buckets whose membership changed.
    pub fn on_update(&mut self, old: &Memory, new: &Memory) {
        if old.id != new.id || !self.contains(&old.id) {
            self.on_remove(&old.id);
            self.on_insert(new);
            return;
        }
        let id = new.id.as_str();

        if old.project_id != new.project_id {
            if let Some(project) = &old.project_id {
                detach(&mut self.by_project, project, id);
            }
            if let Some(project) = &new.project_id {
                attach(&mut self.by_project, project.clone(), id);
            }
        }
        if old.memory_type != new.memory_type {
            detach(&mut self.by_type, &old.memory_type, id);
            attach(&mut self.by_type, new.memory_type, id);
        }
        sync_labels(&mut self.by_tag, &old.tags, &new.tags, id);
        sync_labels(&mut self.by_entity, &old.entities, &new.entities, id);

        if old.created != new.created {
            self.timeline.remove(&TimelineEntry {
                at: old.created,
                id: id.to_string(),
            });
            self.timeline.insert(TimelineEntry {
                at: new.created,
                id: id.to_string(),
            });
            self.created.insert(id.to_string(), new.created);
        }
    }

    pub fn on_remove(&mut self, id: &str) {
        if let Some(at) = self.created.remove(id) {
            self.timeline.remove(&TimelineEntry {
                at,
                id: id.to_string(),
            });
        }
        detach_everywhere(&mut self.by_project, id);
        detach_everywhere(&mut self.by_type, id);
        detach_everywhere(&mut self.by_tag, id);
        detach_everywhere(&mut self.by_entity, id);
    }

    /// Ids created within `[since, until]`, oldest first.
    pub fn created_between(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<String> {
        let lower = match since {
            Some(at) => Bound::Included(TimelineEntry {
                at,
                id: String::new(),
            }),
            None => Bound::Unbounded,
        };
        self.timeline
            .range((lower, Bound::Unbounded))
            .take_while(|e| until.map_or(true, |u| e.at <= u))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Narrow a query to candidate ids using the structural filters.
    ///
    /// Values within one dimension are OR-ed; dimensions are AND-ed.
    pub fn candidates(&self, spec: &QuerySpec) -> BTreeSet<String> {
        let mut result: Option<BTreeSet<String>> = None;
        let mut narrow = |set: BTreeSet<String>| {
            result = Some(match result.take() {
                Some(current) => current.intersection(&set).cloned().collect(),
                None => set,
            });
        };

        if let Some(project) = &spec.project_id {
            narrow(self.by_project.get(project).cloned().unwrap_or_default());
        }
        if !spec.types.is_empty() {
            narrow(union_of(spec.types.iter().filter_map(|t| self.by_type.get(t))));
        }
        if !spec.tags.is_empty() {
            narrow(union_of(
                spec.tags.iter().filter_map(|t| self.by_tag.get(&label_key(t))),
            ));
        }
        if !spec.entities.is_empty() {
            narrow(union_of(
                spec.entities
                    .iter()
                    .filter_map(|e| self.by_entity.get(&label_key(e))),
            ));
        }
        if spec.since.is_some() || spec.until.is_some() {
            narrow(self.created_between(spec.since, spec.until).into_iter().collect());
        }

        result.unwrap_or_else(|| self.created.keys().cloned().collect())
    }

    /// Check the index against the ids actually present in the store.
    pub fn verify(&self, stored: &BTreeSet<String>) -> MemoryResult<()> {
        if let Some(id) = self.created.keys().find(|id| !stored.contains(*id)) {
            return Err(MemoryError::InconsistentIndex { id: id.clone() });
        }
        if let Some(id) = stored.iter().find(|id| !self.created.contains_key(*id)) {
            return Err(MemoryError::InconsistentIndex { id: id.clone() });
        }
        Ok(())
    }

    pub fn to_persisted(&self, now: DateTime<Utc>) -> PersistedIndex {
        let flatten = |map: &BTreeMap<String, BTreeSet<String>>| {
            map.iter()
                .map(|(k, ids)| (k.clone(), ids.iter().cloned().collect()))
                .collect()
        };
        PersistedIndex {
            format_version: INDEX_FORMAT_VERSION,
            updated_at: timestamp::format(&now),
            by_project: flatten(&self.by_project),
            by_type: self
                .by_type
                .iter()
                .map(|(t, ids)| (t.to_string(), ids.iter().cloned().collect()))
                .collect(),
            by_tag: flatten(&self.by_tag),
            by_entity: flatten(&self.by_entity),
            timeline: self
                .timeline
                .iter()
                .map(|e| PersistedTimelineEntry {
                    id: e.id.clone(),
                    at: timestamp::format(&e.at),
                })
                .collect(),
        }
    }

    /// Rebuild the in-memory index from its persisted form.
    ///
    /// Every timeline instant is parsed back into a time value here; a bucket
    /// naming an id absent from the timeline is reported as inconsistent.
    pub fn from_persisted(persisted: PersistedIndex) -> MemoryResult<Self> {
        if persisted.format_version != INDEX_FORMAT_VERSION {
            return Err(MemoryError::validation(
                "format_version",
                format!("unsupported index format {}", persisted.format_version),
            ));
        }

        let mut index = Self::new();
        for entry in persisted.timeline {
            let at = timestamp::parse(&entry.at)?;
            index.created.insert(entry.id.clone(), at);
            index.timeline.insert(TimelineEntry { at, id: entry.id });
        }

        let known = |ids: Vec<String>, index: &Self| -> MemoryResult<BTreeSet<String>> {
            match ids.iter().find(|id| !index.created.contains_key(*id)) {
                Some(id) => Err(MemoryError::InconsistentIndex { id: id.clone() }),
                None => Ok(ids.into_iter().collect()),
            }
        };

        for (project, ids) in persisted.by_project {
            let ids = known(ids, &index)?;
            index.by_project.insert(project, ids);
        }
        for (type_name, ids) in persisted.by_type {
            let memory_type: MemoryType = type_name.parse()?;
            let ids = known(ids, &index)?;
            index.by_type.insert(memory_type, ids);
        }
        for (tag, ids) in persisted.by_tag {
            let ids = known(ids, &index)?;
            index.by_tag.insert(tag, ids);
        }
        for (entity, ids) in persisted.by_entity {
            let ids = known(ids, &index)?;
            index.by_entity.insert(entity, ids);
        }
        Ok(index)
    }
}

fn union_of<'a>(sets: impl Iterator<Item = &'a BTreeSet<String>>) -> BTreeSet<String> {
    sets.flat_map(|s| s.iter().cloned()).collect()
}

/// Human-inspectable index document. Timestamps stay text until parsed by
/// [`MemoryIndex::from_persisted`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub format_version: u32,
    pub updated_at: String,
    #[serde(default)]
    pub by_project: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub by_type: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub by_tag: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub by_entity: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub timeline: Vec<PersistedTimelineEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTimelineEntry {
    pub id: String,
    pub at: String,
}
