//! Memory data model: the persisted record, its classification, and the
//! request/patch shapes used to create and edit it.

pub mod timestamp;

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{MemoryError, MemoryResult};
use crate::similarity::extract_entities;

/// Classification of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryType {
    Breakthrough,
    Decision,
    Feedback,
    ErrorRecovery,
    Pattern,
    UserPreference,
}

impl MemoryType {
    pub const ALL: [MemoryType; 6] = [
        MemoryType::Breakthrough,
        MemoryType::Decision,
        MemoryType::Feedback,
        MemoryType::ErrorRecovery,
        MemoryType::Pattern,
        MemoryType::UserPreference,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Breakthrough => "breakthrough",
            Self::Decision => "decision",
            Self::Feedback => "feedback",
            Self::ErrorRecovery => "error-recovery",
            Self::Pattern => "pattern",
            Self::UserPreference => "user-preference",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| MemoryError::validation("type", format!("unknown memory type `{s}`")))
    }
}

/// A single persisted memory.
///
/// Content and classification are edited only through [`MemoryPatch`]; access
/// bookkeeping and lifecycle fields are maintained by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub version: u64,
    pub content: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    #[serde(with = "timestamp")]
    pub created: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub last_accessed: DateTime<Utc>,
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    /// When decay was last applied; later decay runs only count time after it.
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub last_decayed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u64,
    pub relevance_score: f64,
    pub confidence: f64,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub consolidated_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub related_memories: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub entities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// SHA-256 hex of `content`.
    #[serde(default)]
    pub content_digest: String,
}

impl Memory {
    /// Build a fresh record from a validated request.
    pub fn from_new(new: NewMemory, now: DateTime<Utc>) -> MemoryResult<Self> {
        let memory_type = new.validate()?;

        let entities: BTreeSet<String> = if new.entities.is_empty() {
            extract_entities(&format!("{}\n{}", new.summary, new.content))
        } else {
            clean_labels(new.entities)
        };

        Ok(Self {
            id: new_memory_id(now),
            version: 1,
            content_digest: content_digest(&new.content),
            content: new.content,
            summary: new.summary.trim().to_string(),
            memory_type,
            created: now,
            last_accessed: now,
            last_updated: None,
            last_decayed: None,
            access_count: 0,
            relevance_score: 1.0,
            confidence: new.confidence.unwrap_or(1.0),
            archived: false,
            consolidated_from: Vec::new(),
            supersedes: new.supersedes,
            project_id: new.project_id,
            task_id: new.task_id,
            related_memories: dedup_ids(new.related_memories),
            tags: clean_labels(new.tags),
            entities,
            context_snapshot: new.context_snapshot,
            author: new.author,
            metadata: new.metadata,
        })
    }

    /// Apply a caller edit. Bumps `version` by one and stamps `last_updated`.
    pub fn apply_patch(&mut self, patch: MemoryPatch, now: DateTime<Utc>) -> MemoryResult<()> {
        if patch.is_empty() {
            return Err(MemoryError::validation("patch", "no fields to update"));
        }

        let mut content_changed = false;
        if let Some(content) = patch.content {
            require_text("content", &content)?;
            content_changed = content != self.content;
            self.content_digest = content_digest(&content);
            self.content = content;
        }
        if let Some(summary) = patch.summary {
            require_text("summary", &summary)?;
            self.summary = summary.trim().to_string();
        }
        if let Some(memory_type) = patch.memory_type {
            self.memory_type = memory_type;
        }
        if let Some(confidence) = patch.confidence {
            check_unit_interval("confidence", confidence)?;
            self.confidence = confidence;
        }
        if let Some(tags) = patch.tags {
            self.tags = clean_labels(tags);
        }
        match patch.entities {
            Some(entities) => self.entities = clean_labels(entities),
            None if content_changed => {
                self.entities = extract_entities(&format!("{}\n{}", self.summary, self.content));
            }
            None => {}
        }
        if let Some(project_id) = patch.project_id {
            self.project_id = Some(project_id);
        }
        if let Some(task_id) = patch.task_id {
            self.task_id = Some(task_id);
        }
        if let Some(related) = patch.related_memories {
            let own_id = self.id.clone();
            self.related_memories = dedup_ids(related)
                .into_iter()
                .filter(|id| *id != own_id)
                .collect();
        }
        if let Some(supersedes) = patch.supersedes {
            self.supersedes = Some(supersedes);
        }
        if let Some(snapshot) = patch.context_snapshot {
            self.context_snapshot = Some(snapshot);
        }
        if let Some(author) = patch.author {
            self.author = Some(author);
        }
        if let Some(metadata) = patch.metadata {
            self.metadata.extend(metadata);
        }
        if let Some(archived) = patch.archived {
            self.archived = archived;
        }

        self.version += 1;
        self.last_updated = Some(now);
        Ok(())
    }

    /// Record a lifecycle-driven metadata change (merge, edge redirect).
    pub fn bump_version(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.last_updated = Some(now);
    }

    /// Append ids to the consolidation provenance trail, keeping it duplicate-free.
    pub fn absorb_ids<I: IntoIterator<Item = String>>(&mut self, ids: I) {
        for id in ids {
            if id != self.id && !self.consolidated_from.contains(&id) {
                self.consolidated_from.push(id);
            }
        }
    }

    /// Structural checks applied to records arriving from outside (imports).
    pub fn validate(&self) -> MemoryResult<()> {
        require_text("content", &self.content)?;
        require_text("summary", &self.summary)?;
        check_unit_interval("relevance_score", self.relevance_score)?;
        check_unit_interval("confidence", self.confidence)?;
        if self.version == 0 {
            return Err(MemoryError::validation("version", "must start at 1"));
        }
        Ok(())
    }
}

/// Request to record a new memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewMemory {
    pub content: String,
    pub summary: String,
    #[serde(rename = "type")]
    pub memory_type: Option<MemoryType>,
    pub tags: Vec<String>,
    pub entities: Vec<String>,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub confidence: Option<f64>,
    pub related_memories: Vec<String>,
    pub supersedes: Option<String>,
    pub context_snapshot: Option<serde_json::Value>,
    pub author: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Skip the duplicate-window check.
    pub force: bool,
}

impl NewMemory {
    pub fn new(content: &str, summary: &str, memory_type: MemoryType) -> Self {
        Self {
            content: content.to_string(),
            summary: summary.to_string(),
            memory_type: Some(memory_type),
            ..Default::default()
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_entities(mut self, entities: &[&str]) -> Self {
        self.entities = entities.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn related_to(mut self, ids: &[&str]) -> Self {
        self.related_memories = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Check required fields; returns the memory type on success.
    pub fn validate(&self) -> MemoryResult<MemoryType> {
        require_text("content", &self.content)?;
        require_text("summary", &self.summary)?;
        let memory_type = self
            .memory_type
            .ok_or_else(|| MemoryError::validation("type", "is required"))?;
        if let Some(confidence) = self.confidence {
            check_unit_interval("confidence", confidence)?;
        }
        Ok(memory_type)
    }
}

/// Partial edit of an existing memory. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub summary: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: Option<MemoryType>,
    pub tags: Option<Vec<String>>,
    pub entities: Option<Vec<String>>,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub confidence: Option<f64>,
    pub related_memories: Option<Vec<String>>,
    pub supersedes: Option<String>,
    pub context_snapshot: Option<serde_json::Value>,
    pub author: Option<String>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub archived: Option<bool>,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = Some(tags.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    pub fn with_content(mut self, content: &str) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn with_archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn related_to(mut self, ids: &[&str]) -> Self {
        self.related_memories = Some(ids.iter().map(|id| id.to_string()).collect());
        self
    }
}

/// Timestamp-derived identifier: `mem_<UTC instant>_<8 hex>`.
///
/// Ids sort chronologically, which keeps the per-record files ordered on disk.
pub fn new_memory_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("mem_{}_{}", now.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

/// Whether an id is safe to use as a file stem.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// SHA-256 hex digest of memory content.
pub fn content_digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn require_text(field: &str, value: &str) -> MemoryResult<()> {
    if value.trim().is_empty() {
        return Err(MemoryError::validation(field, "must not be empty"));
    }
    Ok(())
}

fn check_unit_interval(field: &str, value: f64) -> MemoryResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(MemoryError::validation(field, "must be within [0, 1]"));
    }
    Ok(())
}

fn clean_labels(labels: Vec<String>) -> BTreeSet<String> {
    labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> Memory {
        let new = NewMemory::new(
            "Switched auth to JWT in src/auth/token.rs",
            "Use JWT for auth",
            MemoryType::Decision,
        )
        .with_tags(&["auth", "jwt", " "])
        .with_confidence(0.85);
        Memory::from_new(new, Utc::now()).unwrap()
    }

    #[test]
    fn test_from_new_initial_state() {
        let m = sample();
        assert!(m.id.starts_with("mem_"));
        assert!(is_valid_id(&m.id));
        assert_eq!(m.version, 1);
        assert_eq!(m.relevance_score, 1.0);
        assert_eq!(m.access_count, 0);
        assert_eq!(m.created, m.last_accessed);
        assert!(m.last_updated.is_none());
        assert_eq!(m.tags.len(), 2);
        assert!(m.entities.contains("src/auth/token.rs"));
        assert_eq!(m.content_digest, content_digest(&m.content));
    }

    #[test]
    fn test_new_memory_requires_fields() {
        let missing_type = NewMemory {
            content: "c".into(),
            summary: "s".into(),
            ..Default::default()
        };
        assert!(matches!(
            missing_type.validate(),
            Err(MemoryError::Validation { ref field, .. }) if field == "type"
        ));

        let blank_summary = NewMemory::new("content", "  ", MemoryType::Pattern);
        assert!(blank_summary.validate().is_err());

        let bad_confidence = NewMemory::new("c", "s", MemoryType::Pattern).with_confidence(1.5);
        assert!(bad_confidence.validate().is_err());
    }

    #[test]
    fn test_apply_patch_bumps_version_and_keeps_identity() {
        let mut m = sample();
        let id = m.id.clone();
        let created = m.created;
        let later = created + Duration::minutes(5);

        m.apply_patch(MemoryPatch::default().with_tags(&["auth"]), later)
            .unwrap();
        assert_eq!(m.version, 2);
        assert_eq!(m.id, id);
        assert_eq!(m.created, created);
        assert_eq!(m.last_updated, Some(later));

        m.apply_patch(MemoryPatch::default().with_summary("JWT auth"), later)
            .unwrap();
        assert_eq!(m.version, 3);
    }

    #[test]
    fn test_empty_patch_rejected_without_version_change() {
        let mut m = sample();
        assert!(m.apply_patch(MemoryPatch::default(), Utc::now()).is_err());
        assert_eq!(m.version, 1);
    }

    #[test]
    fn test_content_patch_refreshes_digest_and_entities() {
        let mut m = sample();
        m.apply_patch(
            MemoryPatch::default().with_content("Now handled in lib/session.ts"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(m.content_digest, content_digest("Now handled in lib/session.ts"));
        assert!(m.entities.contains("lib/session.ts"));
        assert!(!m.entities.contains("src/auth/token.rs"));
    }

    #[test]
    fn test_memory_type_parse_and_display() {
        assert_eq!("error-recovery".parse::<MemoryType>().unwrap(), MemoryType::ErrorRecovery);
        assert_eq!("user_preference".parse::<MemoryType>().unwrap(), MemoryType::UserPreference);
        assert!("nonsense".parse::<MemoryType>().is_err());
        for t in MemoryType::ALL {
            assert_eq!(t.to_string().parse::<MemoryType>().unwrap(), t);
        }
    }

    #[test]
    fn test_serde_roundtrip_restores_time_values() {
        let m = sample();
        let json = serde_json::to_string_pretty(&m).unwrap();
        assert!(json.contains("\"type\": \"decision\""));
        let back: Memory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert!(back.last_accessed >= back.created);
    }

    #[test]
    fn test_absorb_ids_is_duplicate_free() {
        let mut m = sample();
        let own = m.id.clone();
        m.absorb_ids(vec!["a".to_string(), "b".to_string(), "a".to_string(), own]);
        assert_eq!(m.consolidated_from, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_id_validation() {
        assert!(is_valid_id("mem_20260101T000000000Z_abcdef12"));
        assert!(!is_valid_id("../etc/passwd"));
        assert!(!is_valid_id(""));
    }
}
