//! Store configuration: defaults, `<root>/config.json`, then `MNEMO_*`
//! environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::lifecycle::ArchivePolicy;

pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_ROOT: &str = ".mnemo";
/// One year; wider duplicate windows are rejected.
pub const MAX_DEDUP_WINDOW_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// Seconds during which a near-identical submission is rejected.
    pub dedup_window_secs: i64,
    pub duplicate_threshold: f64,
    pub consolidation_threshold: f64,
    pub access_boost: f64,
    pub half_life_days: f64,
    pub archive_age_days: u64,
    pub archive_relevance_floor: f64,
    pub default_limit: usize,
    pub max_chain_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            dedup_window_secs: 300,
            duplicate_threshold: 0.95,
            consolidation_threshold: 0.85,
            access_boost: 0.05,
            half_life_days: 30.0,
            archive_age_days: 90,
            archive_relevance_floor: 0.3,
            default_limit: 10,
            max_chain_depth: 5,
        }
    }
}

impl StoreConfig {
    /// Config for a store rooted at `root`, with defaults everywhere else.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load `<root>/config.json` if present, then apply environment overrides.
    ///
    /// `root` always wins over any `root` value in the file.
    pub async fn load(root: impl AsRef<Path>) -> MemoryResult<Self> {
        let root = root.as_ref();
        let path = root.join(CONFIG_FILE);
        let mut config = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreConfig>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(crate::store::StorageError::Io { path, source }.into());
            }
        };
        config.root = root.to_path_buf();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MNEMO_*` overrides from `lookup`. Unparseable values are logged
    /// and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn set<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(value) => *slot = value,
                    Err(_) => tracing::warn!(event = "config.bad_override", key = key, value = %raw),
                }
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        set(lookup, "MNEMO_DEDUP_WINDOW_SECS", &mut self.dedup_window_secs);
        set(lookup, "MNEMO_DUPLICATE_THRESHOLD", &mut self.duplicate_threshold);
        set(lookup, "MNEMO_CONSOLIDATION_THRESHOLD", &mut self.consolidation_threshold);
        set(lookup, "MNEMO_ACCESS_BOOST", &mut self.access_boost);
        set(lookup, "MNEMO_HALF_LIFE_DAYS", &mut self.half_life_days);
        set(lookup, "MNEMO_ARCHIVE_AGE_DAYS", &mut self.archive_age_days);
        set(lookup, "MNEMO_ARCHIVE_RELEVANCE_FLOOR", &mut self.archive_relevance_floor);
        set(lookup, "MNEMO_DEFAULT_LIMIT", &mut self.default_limit);
        set(lookup, "MNEMO_MAX_CHAIN_DEPTH", &mut self.max_chain_depth);
    }

    pub fn validate(&self) -> MemoryResult<()> {
        let unit = [
            ("duplicate_threshold", self.duplicate_threshold),
            ("consolidation_threshold", self.consolidation_threshold),
            ("access_boost", self.access_boost),
            ("archive_relevance_floor", self.archive_relevance_floor),
        ];
        for (field, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::validation(field, "must be within [0, 1]"));
            }
        }
        if !(self.half_life_days.is_finite() && self.half_life_days > 0.0) {
            return Err(MemoryError::validation("half_life_days", "must be positive"));
        }
        if !(0..=MAX_DEDUP_WINDOW_SECS).contains(&self.dedup_window_secs) {
            return Err(MemoryError::validation(
                "dedup_window_secs",
                format!("must be within [0, {MAX_DEDUP_WINDOW_SECS}]"),
            ));
        }
        self.archive_policy().validate()?;
        if self.default_limit == 0 {
            return Err(MemoryError::validation("default_limit", "must be at least 1"));
        }
        Ok(())
    }

    pub fn archive_policy(&self) -> ArchivePolicy {
        ArchivePolicy {
            age_days: self.archive_age_days,
            relevance_floor: self.archive_relevance_floor,
        }
    }
}
