//! Scratchpad state manager.
//!
//! The scratchpad is the only shared state between agent invocations: a
//! typed, validated, lockable file tree rooted at the project's `.ad-sdlc`
//! directory. Writes are atomic (temp file + rename), schema-validated, and
//! recorded in a bounded history ring; reads take shared locks so a writer
//! drains readers by waiting. Lifecycle transitions and checkpoints go
//! through here so every mutation leaves an auditable trail on disk.

pub mod checkpoint;
pub mod history;
pub mod layout;
pub mod lifecycle;
pub mod lock;
pub mod schema;
pub mod watch;

pub use checkpoint::{Checkpoint, WorkerStep};
pub use history::{HistoryEntry, HistoryReason, HistoryRing};
pub use layout::{CONFIG_DIR, Format, Section};
pub use lifecycle::{ProjectState, TransitionLog, TransitionRecord, TransitionTrigger};
pub use lock::FileLock;
pub use watch::{ChangeKind, SectionChange, WatchGuard};

use crate::errors::ScratchpadError;
use crate::model::Project;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// A read value with its on-disk metadata.
#[derive(Debug)]
pub struct Stored<T> {
    pub value: T,
    pub path: PathBuf,
    pub modified_at: Option<DateTime<Utc>>,
}

/// File-backed state store for one project directory.
#[derive(Debug, Clone)]
pub struct Scratchpad {
    root: PathBuf,
    lock_timeout: Duration,
    history_limit: usize,
}

impl Scratchpad {
    /// Open a scratchpad rooted at the `.ad-sdlc` directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: lock::DEFAULT_LOCK_TIMEOUT,
            history_limit: history::DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Override the bounded lock wait.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Override the history ring size; 0 disables history.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a section for a project.
    pub fn path_for(&self, section: &Section, project_id: &str) -> PathBuf {
        self.root.join(section.relative_path(project_id))
    }

    // ── Structured sections ──────────────────────────────────────────────

    /// Read a structured section. `None` when absent.
    pub fn get<T: DeserializeOwned>(
        &self,
        section: &Section,
        project_id: &str,
    ) -> Result<Option<Stored<T>>, ScratchpadError> {
        let path = self.path_for(section, project_id);
        if !path.exists() {
            return Ok(None);
        }
        let _lock = FileLock::shared(&path, self.lock_timeout)?;
        self.load(section, project_id)
    }

    /// Read a section the caller requires; absent is an error.
    pub fn get_required<T: DeserializeOwned>(
        &self,
        section: &Section,
        project_id: &str,
    ) -> Result<Stored<T>, ScratchpadError> {
        self.get(section, project_id)?
            .ok_or_else(|| ScratchpadError::NotFound {
                section: section.key(),
                project_id: project_id.to_string(),
            })
    }

    /// Atomic, validated write of a structured section.
    pub fn set<T: Serialize>(
        &self,
        section: &Section,
        project_id: &str,
        value: &T,
    ) -> Result<(), ScratchpadError> {
        let path = self.path_for(section, project_id);
        let _lock = FileLock::exclusive(&path, self.lock_timeout)?;
        self.store(section, project_id, value)
    }

    /// Read-modify-write with the write lock held throughout.
    pub fn update<T, F>(
        &self,
        section: &Section,
        project_id: &str,
        f: F,
    ) -> Result<T, ScratchpadError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Result<T, ScratchpadError>,
    {
        let path = self.path_for(section, project_id);
        let _lock = FileLock::exclusive(&path, self.lock_timeout)?;
        let current = self.load(section, project_id)?.map(|s| s.value);
        let next = f(current)?;
        self.store(section, project_id, &next)?;
        Ok(next)
    }

    // ── Markdown documents ───────────────────────────────────────────────

    /// Read a markdown document section.
    pub fn get_document(
        &self,
        section: &Section,
        project_id: &str,
    ) -> Result<Option<Stored<String>>, ScratchpadError> {
        debug_assert_eq!(section.format(), Format::Markdown);
        let path = self.path_for(section, project_id);
        if !path.exists() {
            return Ok(None);
        }
        let _lock = FileLock::shared(&path, self.lock_timeout)?;
        let content = read_file(&path)?;
        let modified_at = modified_time(&path);
        Ok(Some(Stored {
            value: content,
            path,
            modified_at,
        }))
    }

    /// Write a markdown document section. Empty documents are rejected.
    pub fn set_document(
        &self,
        section: &Section,
        project_id: &str,
        content: &str,
    ) -> Result<(), ScratchpadError> {
        debug_assert_eq!(section.format(), Format::Markdown);
        if content.trim().is_empty() {
            return Err(ScratchpadError::SchemaValidation {
                section: section.key(),
                message: "document must not be empty".into(),
            });
        }
        let path = self.path_for(section, project_id);
        let _lock = FileLock::exclusive(&path, self.lock_timeout)?;
        self.record_history(section, &path, HistoryReason::Set)?;
        write_atomic(&path, content.as_bytes())?;
        debug!(section = %section.key(), %project_id, "document written");
        Ok(())
    }

    // ── History ──────────────────────────────────────────────────────────

    /// All history entries for a section, oldest first.
    pub fn history(&self, section: &Section) -> Result<Vec<HistoryEntry>, ScratchpadError> {
        self.ring(section).entries()
    }

    /// Replace the current value with a history entry. The replaced value
    /// is itself recorded, so history is never rewritten.
    pub fn rollback(
        &self,
        section: &Section,
        project_id: &str,
        entry: u64,
    ) -> Result<(), ScratchpadError> {
        let chosen =
            self.ring(section)
                .get(entry)?
                .ok_or_else(|| ScratchpadError::NotFound {
                    section: format!("history/{}/entry-{entry}", section.key()),
                    project_id: project_id.to_string(),
                })?;
        let path = self.path_for(section, project_id);
        let _lock = FileLock::exclusive(&path, self.lock_timeout)?;
        self.record_history(section, &path, HistoryReason::Rollback)?;
        write_atomic(&path, chosen.content.as_bytes())
    }

    // ── Lifecycle transitions ────────────────────────────────────────────

    /// Validated state-machine transition. Serialised by the project-state
    /// lock; always appends a `TransitionRecord`.
    pub fn transition(
        &self,
        project_id: &str,
        to: ProjectState,
        trigger: TransitionTrigger,
        actor: &str,
        reason: &str,
    ) -> Result<TransitionRecord, ScratchpadError> {
        let section = Section::Project;
        let path = self.path_for(&section, project_id);
        let _lock = FileLock::exclusive(&path, self.lock_timeout)?;

        let mut project: Project = self
            .load(&section, project_id)?
            .map(|s| s.value)
            .ok_or_else(|| ScratchpadError::NotFound {
                section: section.key(),
                project_id: project_id.to_string(),
            })?;

        lifecycle::validate_transition(project.state, to, trigger)?;

        let record = TransitionRecord {
            from: project.state,
            to,
            timestamp: Utc::now(),
            trigger,
            actor: actor.to_string(),
            reason: reason.to_string(),
        };

        project.state = to;
        project.updated_at = record.timestamp;
        self.store(&section, project_id, &project)?;
        self.append_transition(project_id, record.clone())?;

        debug!(%project_id, from = %record.from, to = %record.to, trigger = ?trigger, "state transition");
        Ok(record)
    }

    /// Skip forward across non-required stages. Records a lifecycle
    /// checkpoint of the prior state so the skip can be recovered.
    pub fn skip_to(
        &self,
        project_id: &str,
        target: ProjectState,
        reason: &str,
        approved_by: &str,
    ) -> Result<TransitionRecord, ScratchpadError> {
        let prior: Stored<Project> = self.get_required(&Section::Project, project_id)?;
        let payload = serde_yaml::to_value(prior.value.state.as_str()).map_err(|e| {
            ScratchpadError::Serialize {
                section: "checkpoint".into(),
                message: e.to_string(),
            }
        })?;
        let record = self.transition(
            project_id,
            target,
            TransitionTrigger::Skip,
            approved_by,
            reason,
        )?;
        let cp = Checkpoint::new(
            &format!("project-{project_id}"),
            WorkerStep::ContextAnalysis,
            1,
            payload,
        );
        self.create_checkpoint(project_id, &cp)?;
        Ok(record)
    }

    /// Recover backward to an earlier phase entry.
    pub fn recover_to(
        &self,
        project_id: &str,
        target: ProjectState,
        reason: &str,
        actor: &str,
    ) -> Result<TransitionRecord, ScratchpadError> {
        self.transition(project_id, target, TransitionTrigger::Recovery, actor, reason)
    }

    /// Force any transition, bypassing the table. Always audited.
    pub fn admin_override(
        &self,
        project_id: &str,
        target: ProjectState,
        reason: &str,
        actor: &str,
    ) -> Result<TransitionRecord, ScratchpadError> {
        warn!(%project_id, target = %target, %actor, "admin override transition");
        self.transition(project_id, target, TransitionTrigger::Admin, actor, reason)
    }

    /// The full transition log for a project.
    pub fn transitions(&self, project_id: &str) -> Result<TransitionLog, ScratchpadError> {
        Ok(self
            .get::<TransitionLog>(&Section::Transitions, project_id)?
            .map(|s| s.value)
            .unwrap_or_default())
    }

    fn append_transition(
        &self,
        project_id: &str,
        record: TransitionRecord,
    ) -> Result<(), ScratchpadError> {
        self.update::<TransitionLog, _>(&Section::Transitions, project_id, |log| {
            let mut log = log.unwrap_or_default();
            log.records.push(record);
            Ok(log)
        })?;
        Ok(())
    }

    // ── Checkpoints ──────────────────────────────────────────────────────

    /// Persist a checkpoint; the latest write strictly supersedes.
    pub fn create_checkpoint(
        &self,
        project_id: &str,
        cp: &Checkpoint,
    ) -> Result<(), ScratchpadError> {
        self.set(&Section::Checkpoint(cp.work_order_id.clone()), project_id, cp)
    }

    /// Load the latest checkpoint for a scope, dropping expired ones.
    pub fn restore_checkpoint(
        &self,
        project_id: &str,
        work_order_id: &str,
    ) -> Result<Option<Checkpoint>, ScratchpadError> {
        let section = Section::Checkpoint(work_order_id.to_string());
        let Some(stored) = self.get::<Checkpoint>(&section, project_id)? else {
            return Ok(None);
        };
        if stored.value.is_expired() {
            self.clear_checkpoint(project_id, work_order_id)?;
            return Ok(None);
        }
        Ok(Some(stored.value))
    }

    /// Remove a checkpoint after successful completion.
    pub fn clear_checkpoint(
        &self,
        project_id: &str,
        work_order_id: &str,
    ) -> Result<(), ScratchpadError> {
        let path = self.path_for(&Section::Checkpoint(work_order_id.to_string()), project_id);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| ScratchpadError::Io {
                action: "remove checkpoint",
                path,
                source,
            })?;
        }
        Ok(())
    }

    // ── Watching ─────────────────────────────────────────────────────────

    /// Watch one section (or the whole project scratchpad) for changes.
    pub fn watch(
        &self,
        project_id: &str,
        section: Option<&Section>,
        callback: impl Fn(SectionChange) + Send + 'static,
    ) -> Result<WatchGuard, ScratchpadError> {
        let filter = match section {
            Some(s) => self.path_for(s, project_id),
            None => self.root.join("scratchpad"),
        };
        watch::watch(&self.root, filter, callback)
    }

    // ── Internals (caller holds the lock) ────────────────────────────────

    fn load<T: DeserializeOwned>(
        &self,
        section: &Section,
        project_id: &str,
    ) -> Result<Option<Stored<T>>, ScratchpadError> {
        let path = self.path_for(section, project_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = read_file(&path)?;
        let value: serde_yaml::Value = match section.format() {
            Format::Yaml => serde_yaml::from_str(&raw).map_err(|e| {
                ScratchpadError::CorruptState {
                    path: path.clone(),
                    message: e.to_string(),
                }
            })?,
            Format::Json => serde_json::from_str(&raw).map_err(|e| {
                ScratchpadError::CorruptState {
                    path: path.clone(),
                    message: e.to_string(),
                }
            })?,
            Format::Markdown => {
                return Err(ScratchpadError::SchemaValidation {
                    section: section.key(),
                    message: "markdown sections use the document accessors".into(),
                });
            }
        };
        let decoded = schema::decode(section, value)?;
        let modified_at = modified_time(&path);
        Ok(Some(Stored {
            value: decoded,
            path,
            modified_at,
        }))
    }

    fn store<T: Serialize>(
        &self,
        section: &Section,
        project_id: &str,
        value: &T,
    ) -> Result<(), ScratchpadError> {
        let encoded = schema::encode(section, value)?;
        let body = match section.format() {
            Format::Yaml => serde_yaml::to_string(&encoded).map_err(|e| {
                ScratchpadError::Serialize {
                    section: section.key(),
                    message: e.to_string(),
                }
            })?,
            Format::Json => {
                let mut s = serde_json::to_string_pretty(&encoded).map_err(|e| {
                    ScratchpadError::Serialize {
                        section: section.key(),
                        message: e.to_string(),
                    }
                })?;
                s.push('\n');
                s
            }
            Format::Markdown => {
                return Err(ScratchpadError::SchemaValidation {
                    section: section.key(),
                    message: "markdown sections use the document accessors".into(),
                });
            }
        };
        let path = self.path_for(section, project_id);
        self.record_history(section, &path, HistoryReason::Set)?;
        write_atomic(&path, body.as_bytes())
    }

    fn record_history(
        &self,
        section: &Section,
        path: &Path,
        reason: HistoryReason,
    ) -> Result<(), ScratchpadError> {
        if self.history_limit == 0 || !section.history_enabled() || !path.exists() {
            return Ok(());
        }
        let prior = read_file(path)?;
        self.ring(section).append(&prior, reason)?;
        Ok(())
    }

    fn ring(&self, section: &Section) -> HistoryRing {
        HistoryRing::new(
            &self.root.join("scratchpad/history"),
            &section.key(),
            self.history_limit.max(1),
        )
    }
}

/// Write via temp file + rename in the same directory. Never mutates in
/// place, so readers observe either the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ScratchpadError> {
    let parent = path.parent().ok_or_else(|| ScratchpadError::Io {
        action: "resolve parent of",
        path: path.to_path_buf(),
        source: std::io::Error::other("path has no parent"),
    })?;
    std::fs::create_dir_all(parent).map_err(|source| ScratchpadError::Io {
        action: "create directory",
        path: parent.to_path_buf(),
        source,
    })?;
    let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, bytes).map_err(|source| ScratchpadError::Io {
        action: "write temp file",
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| ScratchpadError::Io {
        action: "rename into place",
        path: path.to_path_buf(),
        source,
    })
}

fn read_file(path: &Path) -> Result<String, ScratchpadError> {
    std::fs::read_to_string(path).map_err(|source| ScratchpadError::Io {
        action: "read",
        path: path.to_path_buf(),
        source,
    })
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    path.metadata()
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
