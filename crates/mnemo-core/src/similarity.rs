//! Lexical similarity, entity extraction, and duplicate detection.
//!
//! Similarity is token based (Jaccard and a stop-word weighted variant). There
//! is no embedding model: paraphrases that share no vocabulary score low, which
//! is a known precision limit of this engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{Memory, MemoryType};

/// Weight given to stop words by [`weighted_similarity`].
pub const STOP_WORD_WEIGHT: f64 = 0.1;

/// Share of the consolidation score contributed by summaries; content makes up the rest.
pub const SUMMARY_WEIGHT: f64 = 0.4;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "before", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "just", "may",
    "me", "more", "my", "no", "not", "now", "of", "on", "once", "only", "or", "other", "our",
    "out", "over", "own", "same", "she", "should", "so", "some", "such", "than", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "those", "to", "too", "under",
    "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "why",
    "will", "with", "would", "you", "your",
];

/// A scored pairing of two memories. Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub first: String,
    pub second: String,
    pub score: f64,
    pub should_merge: bool,
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

/// Lowercased alphanumeric/underscore runs.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Tokens that carry meaning (stop words removed).
pub fn meaningful_tokens(text: &str) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stop_word(t))
        .collect()
}

/// Canonical form of a summary used for grouping and exact-match checks.
pub fn normalize_summary(summary: &str) -> String {
    tokenize(summary).join(" ")
}

/// Jaccard similarity over token sets. Symmetric; identical input scores 1.0.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let ta = token_set(a);
    let tb = token_set(b);
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}

/// Weighted Jaccard where stop words count for [`STOP_WORD_WEIGHT`].
pub fn weighted_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let weight = |t: &String| if is_stop_word(t) { STOP_WORD_WEIGHT } else { 1.0 };
    let ta = token_set(a);
    let tb = token_set(b);
    let union: f64 = ta.union(&tb).map(weight).sum();
    if union == 0.0 {
        return 0.0;
    }
    let shared: f64 = ta.intersection(&tb).map(weight).sum();
    (shared / union).clamp(0.0, 1.0)
}

struct EntityPatterns {
    path: Regex,
    file: Regex,
    scoped_package: Regex,
    module_path: Regex,
    camel: Regex,
    pascal: Regex,
    snake: Regex,
}

fn patterns() -> &'static EntityPatterns {
    static PATTERNS: OnceLock<EntityPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let compile = |p: &str| Regex::new(p).expect("entity pattern is valid");
        EntityPatterns {
            path: compile(r"(?:[A-Za-z0-9_.~\-]+/)+[A-Za-z0-9_.\-]+"),
            file: compile(
                r"\b[A-Za-z0-9_\-]+\.(?:rs|ts|tsx|js|jsx|mjs|py|go|java|kt|rb|php|c|h|cc|cpp|hpp|cs|swift|sql|sh|md|json|toml|yaml|yml|html|css|scss|vue|lock)\b",
            ),
            scoped_package: compile(r"@[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+"),
            module_path: compile(r"\b[A-Za-z_][A-Za-z0-9_]*(?:::[A-Za-z_][A-Za-z0-9_]*)+"),
            camel: compile(r"\b[a-z][a-z0-9]*(?:[A-Z][a-z0-9]*)+\b"),
            pascal: compile(r"\b[A-Z][a-z0-9]+(?:[A-Z][a-z0-9]*)+\b"),
            snake: compile(r"\b[a-z][a-z0-9]*(?:_[a-z0-9]+)+\b"),
        }
    })
}

/// Heuristic extraction of file paths, package names and code identifiers.
///
/// Biased toward recall: prose like `and/or` will be picked up as a path.
pub fn extract_entities(text: &str) -> BTreeSet<String> {
    let p = patterns();
    let mut found = BTreeSet::new();

    let mut collect = |re: &Regex| {
        for m in re.find_iter(text) {
            let token = m
                .as_str()
                .trim_end_matches(|c: char| c == '.' || c == '-' || c == '/');
            if token.len() > 1 {
                found.insert(token.to_string());
            }
        }
    };

    collect(&p.scoped_package);
    collect(&p.path);
    collect(&p.file);
    collect(&p.module_path);
    collect(&p.camel);
    collect(&p.pascal);
    collect(&p.snake);

    found
}

/// Find a record in `recent` that `candidate` duplicates.
///
/// Only records of the same type created within `window_secs` before the
/// candidate are considered. A match is an identical content digest, an equal
/// normalized summary, or content similarity at or above `threshold`. The most
/// recently created match wins.
pub fn find_duplicate_candidate(
    candidate: &Memory,
    recent: &[Memory],
    window_secs: i64,
    threshold: f64,
) -> Option<String> {
    let window_start = Duration::try_seconds(window_secs)
        .and_then(|w| candidate.created.checked_sub_signed(w));
    let summary_key = normalize_summary(&candidate.summary);

    recent
        .iter()
        .filter(|m| m.id != candidate.id)
        .filter(|m| m.memory_type == candidate.memory_type)
        .filter(|m| window_start.map_or(true, |start| m.created >= start))
        .filter(|m| {
            (!m.content_digest.is_empty() && m.content_digest == candidate.content_digest)
                || normalize_summary(&m.summary) == summary_key
                || text_similarity(&m.content, &candidate.content) >= threshold
        })
        .max_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)))
        .map(|m| m.id.clone())
}

/// Score a pair for consolidation: summary and content weighted similarity.
pub fn consolidation_score(a: &Memory, b: &Memory) -> f64 {
    SUMMARY_WEIGHT * weighted_similarity(&a.summary, &b.summary)
        + (1.0 - SUMMARY_WEIGHT) * weighted_similarity(&a.content, &b.content)
}

/// Surface pairs of active, same-typed memories that look like duplicates.
///
/// Pairs whose normalized summaries coincide are always reported, but only
/// pairs scoring at or above `threshold` are marked `should_merge`. When the
/// threshold is above the content share of the score, pairs sharing no summary
/// token (stop words included) cannot qualify and are skipped without scoring.
pub fn find_consolidation_candidates(records: &[Memory], threshold: f64) -> Vec<SimilarityResult> {
    let mut by_type: BTreeMap<MemoryType, Vec<&Memory>> = BTreeMap::new();
    for m in records.iter().filter(|m| !m.archived) {
        by_type.entry(m.memory_type).or_default().push(m);
    }

    let prune = threshold > 1.0 - SUMMARY_WEIGHT;
    let mut results = Vec::new();

    for group in by_type.values() {
        let keys: Vec<String> = group.iter().map(|m| normalize_summary(&m.summary)).collect();

        let pairs: BTreeSet<(usize, usize)> = if prune {
            let mut postings: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, m) in group.iter().enumerate() {
                for token in token_set(&m.summary) {
                    postings.entry(token).or_default().push(i);
                }
                postings.entry(format!("\0{}", keys[i])).or_default().push(i);
            }
            postings
                .values()
                .flat_map(|members| {
                    members.iter().enumerate().flat_map(move |(n, &i)| {
                        members[n + 1..].iter().map(move |&j| (i.min(j), i.max(j)))
                    })
                })
                .collect()
        } else {
            (0..group.len())
                .flat_map(|i| (i + 1..group.len()).map(move |j| (i, j)))
                .collect()
        };

        for (i, j) in pairs {
            let (a, b) = (group[i], group[j]);
            let score = consolidation_score(a, b);
            let same_summary = keys[i] == keys[j];
            if same_summary || score >= threshold {
                let (first, second) = if a.id <= b.id { (a, b) } else { (b, a) };
                results.push(SimilarityResult {
                    first: first.id.clone(),
                    second: second.id.clone(),
                    score,
                    should_merge: score >= threshold,
                });
            }
        }
    }

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.first.cmp(&b.first))
            .then_with(|| a.second.cmp(&b.second))
    });
    results
}
