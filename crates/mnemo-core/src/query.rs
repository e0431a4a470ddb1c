//! Query Engine: structural filters, free-text match, sort and limit.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::index::label_key;
use crate::model::{timestamp, Memory, MemoryType};
use crate::similarity::meaningful_tokens;

/// How archived records are treated by a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivedFilter {
    #[default]
    Exclude,
    Include,
    Only,
}

impl ArchivedFilter {
    pub fn admits(self, archived: bool) -> bool {
        match self {
            Self::Exclude => !archived,
            Self::Include => true,
            Self::Only => archived,
        }
    }
}

/// Result ordering; always descending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Relevance,
    Recency,
    AccessCount,
}

/// Query parameters for searching memories.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub types: Vec<MemoryType>,
    /// Match any of these tags (case-insensitive).
    pub tags: Vec<String>,
    /// Match any of these entities (case-insensitive).
    pub entities: Vec<String>,
    #[serde(with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    pub min_relevance: Option<f64>,
    pub archived: ArchivedFilter,
    pub text: Option<String>,
    pub sort: SortKey,
    pub limit: Option<usize>,
    /// Expand each hit into its relationship chain, to this depth.
    pub expand_chains: Option<usize>,
}

impl QuerySpec {
    /// Query that matches all active memories.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        if !self.types.contains(&memory_type) {
            self.types.push(memory_type);
        }
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn with_entity(mut self, entity: &str) -> Self {
        self.entities.push(entity.to_string());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_min_relevance(mut self, min: f64) -> Self {
        self.min_relevance = Some(min);
        self
    }

    pub fn include_archived(mut self) -> Self {
        self.archived = ArchivedFilter::Include;
        self
    }

    pub fn only_archived(mut self) -> Self {
        self.archived = ArchivedFilter::Only;
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn expand_chains(mut self, depth: usize) -> Self {
        self.expand_chains = Some(depth);
        self
    }

    /// Whether a record passes every filter of this query.
    pub fn matches(&self, memory: &Memory) -> bool {
        if !self.archived.admits(memory.archived) {
            return false;
        }
        if let Some(project) = &self.project_id {
            if memory.project_id.as_ref() != Some(project) {
                return false;
            }
        }
        if let Some(task) = &self.task_id {
            if memory.task_id.as_ref() != Some(task) {
                return false;
            }
        }
        if !self.types.is_empty() && !self.types.contains(&memory.memory_type) {
            return false;
        }
        if !self.tags.is_empty() && !any_label(&self.tags, memory.tags.iter()) {
            return false;
        }
        if !self.entities.is_empty() && !any_label(&self.entities, memory.entities.iter()) {
            return false;
        }
        if self.since.is_some_and(|since| memory.created < since) {
            return false;
        }
        if self.until.is_some_and(|until| memory.created > until) {
            return false;
        }
        if self
            .min_relevance
            .is_some_and(|min| memory.relevance_score < min)
        {
            return false;
        }
        match self.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => text_matches(text, memory),
            _ => true,
        }
    }
}

fn any_label<'a>(wanted: &[String], have: impl Iterator<Item = &'a String>) -> bool {
    let have: Vec<String> = have.map(|l| label_key(l)).collect();
    wanted.iter().any(|w| have.contains(&label_key(w)))
}

/// Free-text match against content, summary and tags.
///
/// A record matches when the text appears verbatim (ignoring case), or when at
/// least half of the query's meaningful words occur in the record.
pub fn text_matches(text: &str, memory: &Memory) -> bool {
    let needle = text.to_lowercase();
    let haystacks = [memory.content.to_lowercase(), memory.summary.to_lowercase()];
    if haystacks.iter().any(|h| h.contains(&needle))
        || memory.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    {
        return true;
    }

    let wanted = meaningful_tokens(text);
    if wanted.is_empty() {
        return false;
    }
    let mut present = meaningful_tokens(&memory.content);
    present.extend(meaningful_tokens(&memory.summary));
    for tag in &memory.tags {
        present.extend(meaningful_tokens(tag));
    }
    let hits = wanted.iter().filter(|t| present.contains(*t)).count();
    hits * 2 >= wanted.len()
}

fn compare(sort: SortKey, a: &Memory, b: &Memory) -> Ordering {
    let primary = match sort {
        SortKey::Relevance => b.relevance_score.total_cmp(&a.relevance_score),
        SortKey::Recency => b.created.cmp(&a.created),
        SortKey::AccessCount => b.access_count.cmp(&a.access_count),
    };
    primary
        .then_with(|| b.created.cmp(&a.created))
        .then_with(|| a.id.cmp(&b.id))
}

/// Filter, sort and bound `records` per `spec`.
pub fn execute(spec: &QuerySpec, records: Vec<Memory>, default_limit: usize) -> Vec<Memory> {
    let mut hits: Vec<Memory> = records.into_iter().filter(|m| spec.matches(m)).collect();
    hits.sort_by(|a, b| compare(spec.sort, a, b));
    hits.truncate(spec.limit.unwrap_or(default_limit));
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewMemory;
    use chrono::Duration;

    fn memory(content: &str, summary: &str, t: MemoryType, tags: &[&str]) -> Memory {
        Memory::from_new(
            NewMemory::new(content, summary, t).with_tags(tags),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_archived_excluded_by_default() {
        let active = memory("a", "a", MemoryType::Decision, &[]);
        let mut archived = memory("b", "b", MemoryType::Decision, &[]);
        archived.archived = true;

        assert!(QuerySpec::all().matches(&active));
        assert!(!QuerySpec::all().matches(&archived));
        assert!(QuerySpec::all().include_archived().matches(&archived));
        assert!(!QuerySpec::all().only_archived().matches(&active));
    }

    #[test]
    fn test_tags_match_any_case_insensitive() {
        let m = memory("c", "s", MemoryType::Decision, &["Auth", "jwt"]);
        assert!(QuerySpec::all().with_tag("auth").matches(&m));
        assert!(QuerySpec::all().with_tag("nope").with_tag("JWT").matches(&m));
        assert!(!QuerySpec::all().with_tag("nope").matches(&m));
    }

    #[test]
    fn test_text_substring_and_token_overlap() {
        let m = memory(
            "Refresh the OAuth token before it expires",
            "Token refresh",
            MemoryType::Pattern,
            &["oauth"],
        );
        assert!(text_matches("oauth token", &m));
        assert!(text_matches("TOKEN REFRESH", &m));
        assert!(text_matches("expires token unrelated", &m));
        assert!(!text_matches("database migration rollback", &m));
        assert!(!text_matches("the of and", &m));
    }

    #[test]
    fn test_date_range_and_min_relevance() {
        let mut old = memory("a", "a", MemoryType::Feedback, &[]);
        old.created = Utc::now() - Duration::days(10);
        old.relevance_score = 0.4;
        let spec = QuerySpec::all().since(Utc::now() - Duration::days(5));
        assert!(!spec.matches(&old));
        assert!(QuerySpec::all().until(Utc::now()).matches(&old));
        assert!(!QuerySpec::all().with_min_relevance(0.5).matches(&old));
    }

    #[test]
    fn test_execute_sorts_and_limits() {
        let mut a = memory("a", "a", MemoryType::Decision, &[]);
        let mut b = memory("b", "b", MemoryType::Decision, &[]);
        let mut c = memory("c", "c", MemoryType::Decision, &[]);
        a.relevance_score = 0.3;
        b.relevance_score = 0.9;
        c.relevance_score = 0.6;
        a.access_count = 10;
        c.created = Utc::now() + Duration::seconds(5);

        let by_relevance = execute(&QuerySpec::all(), vec![a.clone(), b.clone(), c.clone()], 10);
        let ids: Vec<_> = by_relevance.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![b.id.clone(), c.id.clone(), a.id.clone()]);

        let by_access = execute(
            &QuerySpec::all().sorted_by(SortKey::AccessCount).with_limit(1),
            vec![a.clone(), b.clone(), c.clone()],
            10,
        );
        assert_eq!(by_access[0].id, a.id);
        assert_eq!(by_access.len(), 1);

        let by_recency = execute(&QuerySpec::all().sorted_by(SortKey::Recency), vec![a, b, c.clone()], 2);
        assert_eq!(by_recency.len(), 2);
        assert_eq!(by_recency[0].id, c.id);
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: QuerySpec = serde_json::from_str(r#"{"tags": ["auth"], "archived": "include"}"#).unwrap();
        assert_eq!(spec.tags, vec!["auth".to_string()]);
        assert_eq!(spec.archived, ArchivedFilter::Include);
        assert_eq!(spec.sort, SortKey::Relevance);
        assert!(spec.limit.is_none());
    }
}
