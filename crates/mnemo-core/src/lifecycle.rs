//! Lifecycle policies: access boosting, relevance decay, archival,
//! consolidation planning and relationship chains.
//!
//! Everything here is pure over in-memory records; persisting the outcome is
//! the caller's job, one record at a time.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::model::Memory;
use crate::similarity::find_consolidation_candidates;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Upper bound for age thresholds; keeps cutoff arithmetic in range.
pub const MAX_AGE_DAYS: u64 = 36_500;

/// Access hook applied on every caller-facing read.
///
/// Bumps `access_count`, stamps `last_accessed` and adds `boost` to relevance
/// (clamped to 1). Does not count as an edit, so `version` is unchanged.
pub fn access(memory: &mut Memory, now: DateTime<Utc>, boost: f64) {
    memory.access_count += 1;
    memory.last_accessed = now;
    memory.relevance_score = (memory.relevance_score + boost.max(0.0)).clamp(0.0, 1.0);
}

/// Multiplier for `elapsed` under exponential decay with the given half-life.
pub fn decay_factor(elapsed: Duration, half_life_days: f64) -> f64 {
    let days = elapsed.num_milliseconds().max(0) as f64 / 1000.0 / SECONDS_PER_DAY;
    0.5_f64.powf(days / half_life_days)
}

/// Records touched by a lifecycle pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecycleChanges {
    /// Records the pass looked at.
    pub processed: usize,
    /// Records whose state changed and must be written back.
    pub updated: Vec<Memory>,
}

/// Decay relevance of every active record.
///
/// Elapsed time runs from the later of `last_accessed` and the previous decay,
/// so running twice in a row does not decay the same interval twice.
pub fn decay(
    records: &[Memory],
    half_life_days: f64,
    now: DateTime<Utc>,
) -> MemoryResult<LifecycleChanges> {
    if !(half_life_days.is_finite() && half_life_days > 0.0) {
        return Err(MemoryError::validation(
            "half_life_days",
            "must be a positive number of days",
        ));
    }

    let mut changes = LifecycleChanges::default();
    for memory in records.iter().filter(|m| !m.archived) {
        changes.processed += 1;
        let since = memory
            .last_decayed
            .map_or(memory.last_accessed, |d| d.max(memory.last_accessed));
        let factor = decay_factor(now - since, half_life_days);
        let decayed = (memory.relevance_score * factor)
            .max(0.0)
            .min(memory.relevance_score);
        if decayed < memory.relevance_score {
            let mut updated = memory.clone();
            updated.relevance_score = decayed;
            updated.last_decayed = Some(now);
            changes.updated.push(updated);
        }
    }
    Ok(changes)
}

/// Archive eligibility: older than `age_days` and less relevant than the floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivePolicy {
    pub age_days: u64,
    pub relevance_floor: f64,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            age_days: 90,
            relevance_floor: 0.3,
        }
    }
}

impl ArchivePolicy {
    pub fn validate(&self) -> MemoryResult<()> {
        if self.age_days > MAX_AGE_DAYS {
            return Err(MemoryError::validation(
                "age_days",
                format!("must not exceed {MAX_AGE_DAYS}"),
            ));
        }
        if !(0.0..=1.0).contains(&self.relevance_floor) {
            return Err(MemoryError::validation("relevance_floor", "must be within [0, 1]"));
        }
        Ok(())
    }

    fn cutoff(&self, now: DateTime<Utc>) -> MemoryResult<DateTime<Utc>> {
        i64::try_from(self.age_days)
            .ok()
            .and_then(Duration::try_days)
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| MemoryError::validation("age_days", "cutoff is out of range"))
    }
}

/// Archive records older than the policy age whose relevance is below the floor.
pub fn archive(
    records: &[Memory],
    policy: &ArchivePolicy,
    now: DateTime<Utc>,
) -> MemoryResult<LifecycleChanges> {
    policy.validate()?;
    let cutoff = policy.cutoff(now)?;
    let mut changes = LifecycleChanges::default();
    for memory in records.iter().filter(|m| !m.archived) {
        changes.processed += 1;
        if memory.created < cutoff && memory.relevance_score < policy.relevance_floor {
            let mut updated = memory.clone();
            updated.archived = true;
            updated.bump_version(now);
            changes.updated.push(updated);
        }
    }
    Ok(changes)
}

/// One consolidation group: the kept record (already merged) and the ids it absorbs.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeGroup {
    pub survivor: Memory,
    pub absorbed: Vec<String>,
}

/// Everything a consolidation run will write and delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsolidationPlan {
    pub groups: Vec<MergeGroup>,
    /// Records outside any group whose edges pointed at an absorbed id.
    pub redirected: Vec<Memory>,
    /// Records already listed in another record's `consolidated_from`,
    /// left behind by an interrupted run.
    pub stale: Vec<String>,
}

impl ConsolidationPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.stale.is_empty()
    }

    /// Every id this plan hard-deletes.
    pub fn removed_ids(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.absorbed.iter().cloned())
            .chain(self.stale.iter().cloned())
            .collect()
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Work out a consolidation run without touching storage.
///
/// Merge-worthy pairs are joined transitively. Each group keeps its most
/// recently created record (ties: greatest id); the others are absorbed into
/// it and scheduled for deletion.
pub fn plan_consolidation(records: &[Memory], threshold: f64, now: DateTime<Utc>) -> ConsolidationPlan {
    let listed: BTreeSet<&str> = records
        .iter()
        .flat_map(|m| m.consolidated_from.iter().map(String::as_str))
        .collect();
    let stale: Vec<String> = records
        .iter()
        .filter(|m| listed.contains(m.id.as_str()))
        .map(|m| m.id.clone())
        .collect();

    let live: Vec<&Memory> = records
        .iter()
        .filter(|m| !listed.contains(m.id.as_str()))
        .collect();
    let owned: Vec<Memory> = live.iter().map(|m| (*m).clone()).collect();
    let position: BTreeMap<&str, usize> = owned
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();

    let mut sets = DisjointSet::new(owned.len());
    for pair in find_consolidation_candidates(&owned, threshold)
        .into_iter()
        .filter(|p| p.should_merge)
    {
        if let (Some(&a), Some(&b)) = (
            position.get(pair.first.as_str()),
            position.get(pair.second.as_str()),
        ) {
            sets.union(a, b);
        }
    }

    let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..owned.len() {
        members.entry(sets.find(i)).or_default().push(i);
    }

    let mut redirect: BTreeMap<String, String> = BTreeMap::new();
    let mut groups = Vec::new();
    for group in members.into_values().filter(|g| g.len() > 1) {
        let Some(&keep) = group.iter().max_by(|&&a, &&b| {
            owned[a]
                .created
                .cmp(&owned[b].created)
                .then_with(|| owned[a].id.cmp(&owned[b].id))
        }) else {
            continue;
        };

        let mut survivor = owned[keep].clone();
        let group_ids: BTreeSet<String> = group.iter().map(|&i| owned[i].id.clone()).collect();
        let mut absorbed = Vec::new();

        for &i in group.iter().filter(|&&i| i != keep) {
            let other = &owned[i];
            survivor.tags.extend(other.tags.iter().cloned());
            survivor.entities.extend(other.entities.iter().cloned());
            for related in &other.related_memories {
                if !group_ids.contains(related) && !survivor.related_memories.contains(related) {
                    survivor.related_memories.push(related.clone());
                }
            }
            survivor.relevance_score = survivor.relevance_score.max(other.relevance_score);
            survivor.confidence = survivor.confidence.max(other.confidence);
            survivor.access_count += other.access_count;
            survivor.absorb_ids(
                std::iter::once(other.id.clone()).chain(other.consolidated_from.iter().cloned()),
            );
            redirect.insert(other.id.clone(), survivor.id.clone());
            absorbed.push(other.id.clone());
        }
        survivor
            .related_memories
            .retain(|id| !group_ids.contains(id));
        survivor.bump_version(now);
        absorbed.sort();
        groups.push(MergeGroup { survivor, absorbed });
    }

    // Edges into absorbed records now point at their survivor.
    for group in &mut groups {
        redirect_edges(&mut group.survivor, &redirect);
    }
    let grouped: BTreeSet<&str> = groups
        .iter()
        .flat_map(|g| {
            std::iter::once(g.survivor.id.as_str()).chain(g.absorbed.iter().map(String::as_str))
        })
        .collect();
    let mut redirected = Vec::new();
    for memory in live.iter().filter(|m| !grouped.contains(m.id.as_str())) {
        let mut updated = (*memory).clone();
        if redirect_edges(&mut updated, &redirect) {
            updated.bump_version(now);
            redirected.push(updated);
        }
    }

    ConsolidationPlan {
        groups,
        redirected,
        stale,
    }
}

fn redirect_edges(memory: &mut Memory, redirect: &BTreeMap<String, String>) -> bool {
    let mut changed = false;
    let mut seen = BTreeSet::new();
    let own_id = memory.id.clone();
    let mut rewritten = Vec::with_capacity(memory.related_memories.len());
    for id in memory.related_memories.drain(..) {
        let target = match redirect.get(&id) {
            Some(survivor) => {
                changed = true;
                survivor.clone()
            }
            None => id,
        };
        if target != own_id && seen.insert(target.clone()) {
            rewritten.push(target);
        }
    }
    memory.related_memories = rewritten;

    if let Some(survivor) = memory.supersedes.as_ref().and_then(|s| redirect.get(s)) {
        memory.supersedes = Some(survivor.clone());
        changed = true;
    }
    changed
}

/// One record reached by a chain walk, with its hop distance from the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub id: String,
    pub depth: usize,
}

/// Breadth-first walk over `related_memories`, up to `depth` hops.
///
/// Edges are followed in both directions. Ids with no stored record are
/// skipped. Each reachable id appears once; the root comes first.
pub fn build_chain(root: &str, depth: usize, records: &[Memory]) -> Vec<ChainLink> {
    let known: BTreeSet<&str> = records.iter().map(|m| m.id.as_str()).collect();
    if !known.contains(root) {
        return Vec::new();
    }

    let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for m in records {
        for related in &m.related_memories {
            if related != &m.id && known.contains(related.as_str()) {
                adjacency.entry(m.id.as_str()).or_default().push(related.as_str());
                adjacency.entry(related.as_str()).or_default().push(m.id.as_str());
            }
        }
    }

    let mut visited = BTreeSet::from([root]);
    let mut queue = VecDeque::from([(root, 0usize)]);
    let mut chain = Vec::new();
    while let Some((id, hops)) = queue.pop_front() {
        chain.push(ChainLink {
            id: id.to_string(),
            depth: hops,
        });
        if hops == depth {
            continue;
        }
        for &next in adjacency.get(id).map(Vec::as_slice).unwrap_or_default() {
            if visited.insert(next) {
                queue.push_back((next, hops + 1));
            }
        }
    }
    chain
}
