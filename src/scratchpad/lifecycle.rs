//! Project lifecycle state machine.
//!
//! The lifecycle is a linear walk from `collecting` to `merged` with two
//! terminal states. Each state declares its normal forward transitions,
//! recovery (backward) transitions, and permitted skip targets. Skipping is
//! rejected when a *required* stage sits strictly between the current state
//! and the target; `prd_drafting` and `pr_review` are always required.
//! Admin overrides bypass validation but are always audited.

use crate::errors::ScratchpadError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Project lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Collecting,
    Clarifying,
    PrdDrafting,
    PrdApproved,
    SrsDrafting,
    SrsApproved,
    SdsDrafting,
    SdsApproved,
    IssuesCreating,
    IssuesCreated,
    Implementing,
    PrReview,
    Merged,
    Cancelled,
}

/// The forward walk, in order. `Cancelled` sits outside the chain.
const CHAIN: [ProjectState; 13] = [
    ProjectState::Collecting,
    ProjectState::Clarifying,
    ProjectState::PrdDrafting,
    ProjectState::PrdApproved,
    ProjectState::SrsDrafting,
    ProjectState::SrsApproved,
    ProjectState::SdsDrafting,
    ProjectState::SdsApproved,
    ProjectState::IssuesCreating,
    ProjectState::IssuesCreated,
    ProjectState::Implementing,
    ProjectState::PrReview,
    ProjectState::Merged,
];

impl ProjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collecting => "collecting",
            Self::Clarifying => "clarifying",
            Self::PrdDrafting => "prd_drafting",
            Self::PrdApproved => "prd_approved",
            Self::SrsDrafting => "srs_drafting",
            Self::SrsApproved => "srs_approved",
            Self::SdsDrafting => "sds_drafting",
            Self::SdsApproved => "sds_approved",
            Self::IssuesCreating => "issues_creating",
            Self::IssuesCreated => "issues_created",
            Self::Implementing => "implementing",
            Self::PrReview => "pr_review",
            Self::Merged => "merged",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        CHAIN
            .iter()
            .chain(std::iter::once(&Self::Cancelled))
            .copied()
            .find(|state| state.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Cancelled)
    }

    /// Stages that may never be bypassed by a skip.
    pub fn is_required(&self) -> bool {
        matches!(self, Self::PrdDrafting | Self::PrReview)
    }

    /// Position in the forward walk; `None` for `Cancelled`.
    fn order(&self) -> Option<usize> {
        CHAIN.iter().position(|s| s == self)
    }

    /// Whether this state sits strictly before `other` in the forward walk.
    pub fn precedes(&self, other: ProjectState) -> bool {
        match (self.order(), other.order()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    /// Normal forward transitions: the next state in the walk, plus
    /// cancellation from any non-terminal state.
    pub fn forward_targets(&self) -> Vec<ProjectState> {
        let mut targets = Vec::new();
        if let Some(i) = self.order()
            && i + 1 < CHAIN.len()
        {
            targets.push(CHAIN[i + 1]);
        }
        if !self.is_terminal() {
            targets.push(Self::Cancelled);
        }
        targets
    }

    /// Recovery transitions: back to the start of any earlier phase.
    pub fn recovery_targets(&self) -> Vec<ProjectState> {
        const PHASE_ENTRIES: [ProjectState; 8] = [
            ProjectState::Collecting,
            ProjectState::Clarifying,
            ProjectState::PrdDrafting,
            ProjectState::SrsDrafting,
            ProjectState::SdsDrafting,
            ProjectState::IssuesCreating,
            ProjectState::Implementing,
            ProjectState::PrReview,
        ];
        let Some(current) = self.order() else {
            return Vec::new();
        };
        if self.is_terminal() {
            return Vec::new();
        }
        PHASE_ENTRIES
            .into_iter()
            .filter(|t| t.order().is_some_and(|o| o < current))
            .collect()
    }
}

impl std::fmt::Display for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    Normal,
    Recovery,
    Skip,
    Admin,
    Resume,
}

/// Audit entry for one state-machine move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ProjectState,
    pub to: ProjectState,
    pub timestamp: DateTime<Utc>,
    pub trigger: TransitionTrigger,
    pub actor: String,
    pub reason: String,
}

/// Persisted transition log for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionLog {
    pub records: Vec<TransitionRecord>,
}

/// Validate a proposed transition against the table.
///
/// Admin transitions always pass (the caller is responsible for recording
/// the audit entry). `Resume` replays a previously valid walk, so it is
/// validated like `Normal` but additionally allows staying in place.
pub fn validate_transition(
    from: ProjectState,
    to: ProjectState,
    trigger: TransitionTrigger,
) -> Result<(), ScratchpadError> {
    let invalid = || ScratchpadError::InvalidTransition {
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
    };

    match trigger {
        TransitionTrigger::Admin => Ok(()),
        TransitionTrigger::Normal => {
            if from.forward_targets().contains(&to) {
                Ok(())
            } else {
                Err(invalid())
            }
        }
        TransitionTrigger::Resume => {
            if from == to || from.forward_targets().contains(&to) {
                Ok(())
            } else {
                Err(invalid())
            }
        }
        TransitionTrigger::Recovery => {
            if from.recovery_targets().contains(&to) {
                Ok(())
            } else {
                Err(invalid())
            }
        }
        TransitionTrigger::Skip => {
            let (Some(f), Some(t)) = (from.order(), to.order()) else {
                return Err(invalid());
            };
            if t <= f || from.is_terminal() {
                return Err(invalid());
            }
            // A skip may land on a required stage but never jump over one.
            if let Some(required) = CHAIN[f + 1..t].iter().find(|s| s.is_required()) {
                return Err(ScratchpadError::RequiredSkip {
                    target: to.as_str().to_string(),
                    required: required.as_str().to_string(),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_walk_follows_the_chain() {
        validate_transition(
            ProjectState::Collecting,
            ProjectState::Clarifying,
            TransitionTrigger::Normal,
        )
        .unwrap();
        validate_transition(
            ProjectState::PrReview,
            ProjectState::Merged,
            TransitionTrigger::Normal,
        )
        .unwrap();
    }

    #[test]
    fn normal_walk_rejects_jumps() {
        let result = validate_transition(
            ProjectState::Collecting,
            ProjectState::Implementing,
            TransitionTrigger::Normal,
        );
        assert!(matches!(
            result,
            Err(ScratchpadError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cancellation_is_reachable_from_any_active_state() {
        for state in [
            ProjectState::Collecting,
            ProjectState::SrsDrafting,
            ProjectState::Implementing,
            ProjectState::PrReview,
        ] {
            validate_transition(state, ProjectState::Cancelled, TransitionTrigger::Normal)
                .unwrap();
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(ProjectState::Merged.forward_targets().is_empty());
        assert!(ProjectState::Cancelled.forward_targets().is_empty());
        assert!(ProjectState::Merged.recovery_targets().is_empty());
    }

    #[test]
    fn recovery_goes_back_to_phase_entries() {
        let targets = ProjectState::SdsDrafting.recovery_targets();
        assert!(targets.contains(&ProjectState::PrdDrafting));
        assert!(targets.contains(&ProjectState::SrsDrafting));
        assert!(!targets.contains(&ProjectState::SdsApproved));

        validate_transition(
            ProjectState::SdsDrafting,
            ProjectState::PrdDrafting,
            TransitionTrigger::Recovery,
        )
        .unwrap();
    }

    #[test]
    fn recovery_cannot_go_forward() {
        let result = validate_transition(
            ProjectState::PrdDrafting,
            ProjectState::Implementing,
            TransitionTrigger::Recovery,
        );
        assert!(result.is_err());
    }

    #[test]
    fn skip_over_optional_stage_is_allowed() {
        // srs_approved sits between srs_drafting and sds_drafting and is
        // not required, so a minor change may go straight to SDS drafting.
        validate_transition(
            ProjectState::SrsDrafting,
            ProjectState::SdsDrafting,
            TransitionTrigger::Skip,
        )
        .unwrap();
    }

    #[test]
    fn skip_over_required_stage_is_rejected() {
        let result = validate_transition(
            ProjectState::Implementing,
            ProjectState::Merged,
            TransitionTrigger::Skip,
        );
        match result {
            Err(ScratchpadError::RequiredSkip { required, .. }) => {
                assert_eq!(required, "pr_review");
            }
            other => panic!("expected RequiredSkip, got {other:?}"),
        }
    }

    #[test]
    fn skip_onto_required_stage_is_allowed() {
        validate_transition(
            ProjectState::Clarifying,
            ProjectState::PrdDrafting,
            TransitionTrigger::Skip,
        )
        .unwrap();
    }

    #[test]
    fn skip_backward_is_rejected() {
        let result = validate_transition(
            ProjectState::SdsDrafting,
            ProjectState::PrdDrafting,
            TransitionTrigger::Skip,
        );
        assert!(matches!(
            result,
            Err(ScratchpadError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn admin_override_always_validates() {
        validate_transition(
            ProjectState::Merged,
            ProjectState::Collecting,
            TransitionTrigger::Admin,
        )
        .unwrap();
    }

    #[test]
    fn state_names_round_trip() {
        for state in CHAIN.iter().chain(std::iter::once(&ProjectState::Cancelled)) {
            assert_eq!(ProjectState::parse(state.as_str()), Some(*state));
        }
        assert_eq!(ProjectState::parse("nope"), None);
    }
}
