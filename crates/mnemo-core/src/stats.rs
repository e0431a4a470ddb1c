//! Aggregate counters over the record set. Always recomputable; the persisted
//! copy is a cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{timestamp, Memory, MemoryType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: usize,
    pub active: usize,
    pub archived: usize,
    #[serde(default)]
    pub by_type: BTreeMap<MemoryType, usize>,
    #[serde(default)]
    pub by_project: BTreeMap<String, usize>,
    /// Mean relevance over active records; 0 when there are none.
    pub mean_relevance: f64,
    /// Latest `created` or `last_updated` instant across all records.
    #[serde(default, with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub computed_at: DateTime<Utc>,
}

impl MemoryStats {
    pub fn compute(records: &[Memory], now: DateTime<Utc>) -> Self {
        let mut by_type = BTreeMap::new();
        let mut by_project = BTreeMap::new();
        let mut archived = 0;
        let mut relevance_sum = 0.0;
        let mut last_updated: Option<DateTime<Utc>> = None;

        for m in records {
            *by_type.entry(m.memory_type).or_insert(0) += 1;
            if let Some(project) = &m.project_id {
                *by_project.entry(project.clone()).or_insert(0) += 1;
            }
            if m.archived {
                archived += 1;
            } else {
                relevance_sum += m.relevance_score;
            }
            let touched = m.last_updated.map_or(m.created, |u| u.max(m.created));
            last_updated = Some(last_updated.map_or(touched, |l| l.max(touched)));
        }

        let active = records.len() - archived;
        Self {
            total: records.len(),
            active,
            archived,
            by_type,
            by_project,
            mean_relevance: if active == 0 {
                0.0
            } else {
                relevance_sum / active as f64
            },
            last_updated,
            computed_at: now,
        }
    }
}
