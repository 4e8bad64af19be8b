//! Shared domain entities persisted through the scratchpad.
//!
//! Documents are keyed by stable ids (`FR-NNN`, `SF-NNN`, `CMP-NNN`,
//! `UC-NNN`, `ISS-NNN`). Ids are unique within their document, allocated
//! monotonically, and never reused after deprecation; the allocator only
//! ever moves its high-water mark forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pipeline mode selected for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Greenfield,
    Enhancement,
    Import,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greenfield => "greenfield",
            Self::Enhancement => "enhancement",
            Self::Import => "import",
        }
    }
}

impl std::fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GitHub repository metadata attached to a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

/// Root project record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub mode: PipelineMode,
    pub state: crate::scratchpad::lifecycle::ProjectState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Relative scratchpad paths of produced documents, keyed by kind.
    #[serde(default)]
    pub documents: BTreeMap<String, String>,
    #[serde(default)]
    pub repo: RepoMeta,
}

impl Project {
    pub fn new(name: &str, mode: PipelineMode) -> Self {
        let now = Utc::now();
        Self {
            id: format!("proj-{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            mode,
            state: crate::scratchpad::lifecycle::ProjectState::Collecting,
            created_at: now,
            updated_at: now,
            documents: BTreeMap::new(),
            repo: RepoMeta::default(),
        }
    }
}

/// Prefix for a stable document id family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdKind {
    Requirement,
    Feature,
    Component,
    UseCase,
    Issue,
    WorkOrder,
    PullRequest,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Requirement => "FR",
            Self::Feature => "SF",
            Self::Component => "CMP",
            Self::UseCase => "UC",
            Self::Issue => "ISS",
            Self::WorkOrder => "WO",
            Self::PullRequest => "PR",
        }
    }

    pub fn format(&self, n: u32) -> String {
        format!("{}-{:03}", self.prefix(), n)
    }

    /// Parse the numeric part of an id of this kind.
    pub fn number(&self, id: &str) -> Option<u32> {
        id.strip_prefix(self.prefix())?
            .strip_prefix('-')?
            .parse()
            .ok()
    }
}

/// Monotonic id allocator. Deprecating an entity never frees its number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdAllocator {
    #[serde(default)]
    high_water: BTreeMap<String, u32>,
}

impl IdAllocator {
    /// Allocate the next id of the given kind.
    pub fn next(&mut self, kind: IdKind) -> String {
        let counter = self.high_water.entry(kind.prefix().to_string()).or_insert(0);
        *counter += 1;
        kind.format(*counter)
    }

    /// Record externally observed ids so future allocations stay above them.
    pub fn observe(&mut self, kind: IdKind, id: &str) {
        if let Some(n) = kind.number(id) {
            let counter = self.high_water.entry(kind.prefix().to_string()).or_insert(0);
            *counter = (*counter).max(n);
        }
    }
}

/// Requirements gathered before PRD drafting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedInfo {
    pub project_id: String,
    pub source: String,
    pub raw_request: String,
    #[serde(default)]
    pub clarifications: Vec<String>,
    pub collected_at: DateTime<Utc>,
}

/// Issue priority, P0 highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    /// Weight used by the dispatch priority score.
    pub fn weight(&self) -> u32 {
        match self {
            Self::P0 => 100,
            Self::P1 => 75,
            Self::P2 => 50,
            Self::P3 => 25,
        }
    }
}

/// Lifecycle of a single issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Ready,
    InProgress,
    Completed,
    Blocked,
}

/// One implementation task, traceable back to a PRD requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub priority: Priority,
    /// Estimated effort in hours.
    pub effort: u32,
    #[serde(default)]
    pub status: IssueStatus,
    /// Traceability links into the SDS/SRS/PRD.
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub feature_id: Option<String>,
    #[serde(default)]
    pub requirement_id: Option<String>,
    #[serde(default)]
    pub related_files: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// The issue list document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueList {
    pub project_id: String,
    pub generated_at: DateTime<Utc>,
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub allocator: IdAllocator,
}

impl IssueList {
    pub fn get(&self, id: &str) -> Option<&Issue> {
        self.issues.iter().find(|i| i.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Issue> {
        self.issues.iter_mut().find(|i| i.id == id)
    }
}

/// A blocking edge: `from` must complete before `to` starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

/// The dependency graph document fed to the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyGraphDoc {
    pub project_id: String,
    pub nodes: Vec<Issue>,
    pub edges: Vec<DependencyEdge>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_formatting_is_zero_padded() {
        assert_eq!(IdKind::Requirement.format(1), "FR-001");
        assert_eq!(IdKind::Issue.format(42), "ISS-042");
        assert_eq!(IdKind::WorkOrder.format(123), "WO-123");
    }

    #[test]
    fn id_number_parses_own_kind_only() {
        assert_eq!(IdKind::Issue.number("ISS-007"), Some(7));
        assert_eq!(IdKind::Issue.number("FR-007"), None);
        assert_eq!(IdKind::Issue.number("ISS-x"), None);
    }

    #[test]
    fn allocator_is_monotonic_per_kind() {
        let mut alloc = IdAllocator::default();
        assert_eq!(alloc.next(IdKind::Requirement), "FR-001");
        assert_eq!(alloc.next(IdKind::Requirement), "FR-002");
        assert_eq!(alloc.next(IdKind::Issue), "ISS-001");
    }

    #[test]
    fn allocator_never_reuses_after_observe() {
        let mut alloc = IdAllocator::default();
        alloc.observe(IdKind::Issue, "ISS-040");
        assert_eq!(alloc.next(IdKind::Issue), "ISS-041");
        // Observing a lower number does not move the mark backwards.
        alloc.observe(IdKind::Issue, "ISS-002");
        assert_eq!(alloc.next(IdKind::Issue), "ISS-042");
    }

    #[test]
    fn priority_weights_are_ordered() {
        assert!(Priority::P0.weight() > Priority::P1.weight());
        assert!(Priority::P1.weight() > Priority::P2.weight());
        assert!(Priority::P2.weight() > Priority::P3.weight());
    }

    #[test]
    fn new_project_starts_collecting() {
        let project = Project::new("todo-app", PipelineMode::Greenfield);
        assert!(project.id.starts_with("proj-"));
        assert_eq!(
            project.state,
            crate::scratchpad::lifecycle::ProjectState::Collecting
        );
    }
}
