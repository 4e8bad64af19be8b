//! Bounded, append-only history for scratchpad sections.
//!
//! Each `set`/`update` appends the *prior* raw file content as
//! `history/{section}/entry-N.yaml`. The ring keeps the most recent
//! `limit` entries (default 50). Rollback replaces the current value with a
//! chosen entry and records that replacement as a new entry; history itself
//! is never rewritten.

use crate::errors::ScratchpadError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default ring size.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Why an entry was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryReason {
    /// Ordinary overwrite via `set`/`update`.
    Set,
    /// The value being replaced by a rollback.
    Rollback,
}

/// One archived prior value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entry: u64,
    pub section: String,
    pub recorded_at: DateTime<Utc>,
    pub reason: HistoryReason,
    /// Raw prior file content, format-agnostic.
    pub content: String,
}

/// Append-only ring of prior values for one section.
pub struct HistoryRing {
    dir: PathBuf,
    section_key: String,
    limit: usize,
}

impl HistoryRing {
    pub fn new(history_root: &Path, section_key: &str, limit: usize) -> Self {
        Self {
            dir: history_root.join(section_key),
            section_key: section_key.to_string(),
            limit,
        }
    }

    /// Append a prior value. Prunes entries beyond the ring limit.
    pub fn append(&self, content: &str, reason: HistoryReason) -> Result<u64, ScratchpadError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ScratchpadError::Io {
            action: "create history directory",
            path: self.dir.clone(),
            source,
        })?;

        let next = self.entry_numbers()?.last().map_or(1, |n| n + 1);
        let entry = HistoryEntry {
            entry: next,
            section: self.section_key.clone(),
            recorded_at: Utc::now(),
            reason,
            content: content.to_string(),
        };

        let path = self.entry_path(next);
        let body = serde_yaml::to_string(&entry).map_err(|e| ScratchpadError::Serialize {
            section: self.section_key.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, body).map_err(|source| ScratchpadError::Io {
            action: "write history entry",
            path: path.clone(),
            source,
        })?;

        self.prune()?;
        Ok(next)
    }

    /// Read one entry by number.
    pub fn get(&self, entry: u64) -> Result<Option<HistoryEntry>, ScratchpadError> {
        let path = self.entry_path(entry);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ScratchpadError::Io {
            action: "read history entry",
            path: path.clone(),
            source,
        })?;
        let parsed = serde_yaml::from_str(&raw).map_err(|e| ScratchpadError::CorruptState {
            path,
            message: e.to_string(),
        })?;
        Ok(Some(parsed))
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>, ScratchpadError> {
        let mut out = Vec::new();
        for n in self.entry_numbers()? {
            if let Some(entry) = self.get(n)? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn prune(&self) -> Result<(), ScratchpadError> {
        let numbers = self.entry_numbers()?;
        if numbers.len() <= self.limit {
            return Ok(());
        }
        let excess = numbers.len() - self.limit;
        for n in &numbers[..excess] {
            let path = self.entry_path(*n);
            std::fs::remove_file(&path).map_err(|source| ScratchpadError::Io {
                action: "prune history entry",
                path,
                source,
            })?;
        }
        Ok(())
    }

    fn entry_path(&self, entry: u64) -> PathBuf {
        self.dir.join(format!("entry-{entry}.yaml"))
    }

    /// Sorted entry numbers currently on disk.
    fn entry_numbers(&self) -> Result<Vec<u64>, ScratchpadError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let read = std::fs::read_dir(&self.dir).map_err(|source| ScratchpadError::Io {
            action: "list history directory",
            path: self.dir.clone(),
            source,
        })?;
        let mut numbers: Vec<u64> = read
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_prefix("entry-")?
                    .strip_suffix(".yaml")?
                    .parse()
                    .ok()
            })
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }
}
