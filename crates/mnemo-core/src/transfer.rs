//! Export and import of memory sets.
//!
//! Structured exports are a JSON bundle carrying a SHA-256 checksum of the
//! memories array; narrative exports are Markdown meant for humans and cannot
//! be imported back.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FailedRecord, MemoryError, MemoryResult};
use crate::model::{timestamp, Memory};

/// Revision of the [`ExportBundle`] layout.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Structured,
    Narrative,
}

impl std::str::FromStr for ExportFormat {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "structured" | "json" => Ok(Self::Structured),
            "narrative" | "markdown" | "md" => Ok(Self::Narrative),
            other => Err(MemoryError::validation(
                "format",
                format!("unknown export format `{other}`"),
            )),
        }
    }
}

/// Portable, self-verifying set of memories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub format_version: u32,
    #[serde(with = "timestamp")]
    pub exported_at: DateTime<Utc>,
    pub count: usize,
    /// SHA-256 hex over the compact JSON encoding of `memories`.
    #[serde(default)]
    pub checksum: Option<String>,
    pub memories: Vec<Memory>,
}

impl ExportBundle {
    pub fn new(memories: Vec<Memory>, now: DateTime<Utc>) -> MemoryResult<Self> {
        let checksum = checksum(&memories)?;
        Ok(Self {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: now,
            count: memories.len(),
            checksum: Some(checksum),
            memories,
        })
    }

    pub fn verify(&self) -> MemoryResult<()> {
        if self.format_version > EXPORT_FORMAT_VERSION {
            return Err(MemoryError::UnsupportedImport(format!(
                "bundle format {} is newer than supported {}",
                self.format_version, EXPORT_FORMAT_VERSION
            )));
        }
        if self.count != self.memories.len() {
            return Err(MemoryError::validation(
                "count",
                format!(
                    "bundle declares {} memories but holds {}",
                    self.count,
                    self.memories.len()
                ),
            ));
        }
        if let Some(expected) = &self.checksum {
            let actual = checksum(&self.memories)?;
            if &actual != expected {
                return Err(MemoryError::validation(
                    "checksum",
                    format!("expected {expected}, computed {actual}"),
                ));
            }
        }
        Ok(())
    }
}

fn checksum(memories: &[Memory]) -> MemoryResult<String> {
    let bytes = serde_json::to_vec(memories)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn export_structured(memories: Vec<Memory>, now: DateTime<Utc>) -> MemoryResult<Vec<u8>> {
    let bundle = ExportBundle::new(memories, now)?;
    Ok(serde_json::to_vec_pretty(&bundle)?)
}

/// Render memories as a Markdown document, one section per memory.
pub fn export_narrative(memories: &[Memory], now: DateTime<Utc>) -> Vec<u8> {
    let mut out = String::new();
    let _ = writeln!(out, "# Memory export");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "_{} memories, exported {}_",
        memories.len(),
        timestamp::format(&now)
    );

    for m in memories {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {}", m.summary);
        let _ = writeln!(out);
        let mut facts = vec![
            format!("**type:** {}", m.memory_type),
            format!("**relevance:** {:.2}", m.relevance_score),
            format!("**confidence:** {:.2}", m.confidence),
            format!("**created:** {}", timestamp::format(&m.created)),
        ];
        if !m.tags.is_empty() {
            let tags: Vec<&str> = m.tags.iter().map(String::as_str).collect();
            facts.push(format!("**tags:** {}", tags.join(", ")));
        }
        if let Some(project) = &m.project_id {
            facts.push(format!("**project:** {project}"));
        }
        if m.archived {
            facts.push("**archived**".to_string());
        }
        let _ = writeln!(out, "{}", facts.join(" | "));
        let _ = writeln!(out, "<!-- id: {} -->", m.id);
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", m.content.trim_end());
        if !m.related_memories.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Related: {}", m.related_memories.join(", "));
        }
    }
    out.into_bytes()
}

/// Decode importable input: a structured bundle or a bare JSON array of memories.
pub fn parse_import(bytes: &[u8]) -> MemoryResult<Vec<Memory>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| MemoryError::UnsupportedImport(format!("input is not UTF-8: {e}")))?;
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();

    match trimmed.chars().next() {
        Some('{') => {
            let bundle: ExportBundle = serde_json::from_str(trimmed)?;
            bundle.verify()?;
            Ok(bundle.memories)
        }
        Some('[') => Ok(serde_json::from_str(trimmed)?),
        Some('#') => Err(MemoryError::UnsupportedImport(
            "narrative exports cannot be imported; use the structured format".to_string(),
        )),
        Some(_) => Err(MemoryError::UnsupportedImport(
            "expected a JSON export bundle or array".to_string(),
        )),
        None => Err(MemoryError::UnsupportedImport("input is empty".to_string())),
    }
}

/// Outcome of an import.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub overwritten: usize,
    pub skipped: usize,
    pub failed: Vec<FailedRecord>,
}
