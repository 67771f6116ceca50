//! Objective records and their state machine.
//!
//! An objective is the smallest unit of sequenced work. Its status moves
//! along a fixed transition graph; every transition (and every recorded
//! setback) is appended to the objective's history for audit. Nothing is
//! ever removed from the history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::model::worker::Role;
use crate::model::short_id;

/// A named pipeline step. Breakdown and Design run at campaign level;
/// Execute, Review, and Test run per objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Breakdown,
    Design,
    Execute,
    Review,
    Test,
}

impl Stage {
    /// The specialized role that performs this stage.
    pub fn role(self) -> Role {
        match self {
            Stage::Breakdown => Role::Planner,
            Stage::Design => Role::Architect,
            Stage::Execute => Role::Implementer,
            Stage::Review => Role::Reviewer,
            Stage::Test => Role::Verifier,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Breakdown => "breakdown",
            Stage::Design => "design",
            Stage::Execute => "execute",
            Stage::Review => "review",
            Stage::Test => "test",
        };
        write!(f, "{s}")
    }
}

/// Objective status. `Done` and `Escalated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveState {
    Created,
    Planned,
    Active,
    Review,
    Testing,
    Blocked,
    Rejected,
    Escalated,
    Done,
}

impl ObjectiveState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ObjectiveState::Done | ObjectiveState::Escalated)
    }

    /// Whether `self -> next` is an edge of the transition graph.
    ///
    /// `Blocked` is enterable from any non-terminal state (a checkpoint can
    /// suspend progress anywhere); leaving `Blocked` goes back to the state
    /// recorded at suspension time, or to `Rejected`/`Escalated` when the
    /// checkpoint was refused.
    pub fn can_transition_to(self, next: ObjectiveState) -> bool {
        use ObjectiveState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Blocked {
            return true;
        }
        match self {
            Created => matches!(next, Planned),
            Planned => matches!(next, Active),
            Active => matches!(next, Review | Testing | Done | Escalated),
            Review => matches!(next, Rejected | Testing | Done | Escalated),
            Testing => matches!(next, Rejected | Done | Escalated),
            Rejected => matches!(next, Active),
            Blocked => matches!(
                next,
                Planned | Active | Review | Testing | Done | Rejected | Escalated
            ),
            Done | Escalated => false,
        }
    }
}

impl std::fmt::Display for ObjectiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObjectiveState::Created => "created",
            ObjectiveState::Planned => "planned",
            ObjectiveState::Active => "active",
            ObjectiveState::Review => "review",
            ObjectiveState::Testing => "testing",
            ObjectiveState::Blocked => "blocked",
            ObjectiveState::Rejected => "rejected",
            ObjectiveState::Escalated => "escalated",
            ObjectiveState::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// One entry in an objective's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The smallest unit of sequenced work, owned by exactly one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub campaign_id: String,
    pub title: String,
    pub description: String,
    /// Position within the campaign; objectives execute strictly in order.
    pub ordinal: u32,
    pub state: ObjectiveState,
    /// State to return to when an enclosing checkpoint is approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_state: Option<ObjectiveState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<Role>,
    #[serde(default)]
    pub execute_retries: u32,
    #[serde(default)]
    pub review_retries: u32,
    #[serde(default)]
    pub test_retries: u32,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// File references reported by workers for this objective.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Raw worker output per stage, keyed by stage name.
    #[serde(default)]
    pub stage_outputs: BTreeMap<String, String>,
    /// Failure feedback from the most recent setback, injected into the
    /// next worker run's context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub history: Vec<TransitionEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Objective {
    pub fn new(campaign_id: &str, title: &str, description: &str, ordinal: u32) -> Self {
        let now = Utc::now();
        Self {
            id: short_id("obj"),
            campaign_id: campaign_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            ordinal,
            state: ObjectiveState::Created,
            resume_state: None,
            assignee: None,
            execute_retries: 0,
            review_retries: 0,
            test_retries: 0,
            acceptance_criteria: Vec::new(),
            artifacts: Vec::new(),
            stage_outputs: BTreeMap::new(),
            feedback: None,
            history: vec![TransitionEvent {
                timestamp: now,
                event: "created".into(),
                actor: "coordinator".into(),
                detail: None,
            }],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, validating the edge and appending a history entry.
    ///
    /// Entering `Blocked` remembers the current state so the objective can
    /// resume where it was suspended; leaving `Blocked` clears it.
    pub fn transition(
        &mut self,
        next: ObjectiveState,
        actor: &str,
        detail: impl Into<String>,
    ) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::IllegalTransition {
                id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next == ObjectiveState::Blocked {
            self.resume_state = Some(self.state);
        } else if self.state == ObjectiveState::Blocked {
            self.resume_state = None;
        }
        self.state = next;
        self.record(&format!("status_change:{next}"), actor, Some(detail.into()));
        Ok(())
    }

    /// Append a non-transition history entry (setbacks, retries, notes).
    pub fn record(&mut self, event: &str, actor: &str, detail: Option<String>) {
        self.history.push(TransitionEvent {
            timestamp: Utc::now(),
            event: event.to_string(),
            actor: actor.to_string(),
            detail,
        });
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn objective() -> Objective {
        Objective::new("cmp_1", "Add login endpoint", "POST /login with JWT", 0)
    }

    #[test]
    fn new_objective_starts_created_with_history() {
        let obj = objective();
        assert_eq!(obj.state, ObjectiveState::Created);
        assert_eq!(obj.history.len(), 1);
        assert_eq!(obj.history[0].event, "created");
    }

    #[test]
    fn happy_path_walks_the_full_graph() {
        let mut obj = objective();
        for next in [
            ObjectiveState::Planned,
            ObjectiveState::Active,
            ObjectiveState::Review,
            ObjectiveState::Testing,
            ObjectiveState::Done,
        ] {
            obj.transition(next, "coordinator", "test").unwrap();
        }
        assert!(obj.is_terminal());
        // created + 5 transitions
        assert_eq!(obj.history.len(), 6);
    }

    #[test]
    fn created_cannot_jump_to_active() {
        let mut obj = objective();
        let err = obj
            .transition(ObjectiveState::Active, "coordinator", "skip")
            .unwrap_err();
        assert!(matches!(err, PipelineError::IllegalTransition { .. }));
        assert_eq!(obj.state, ObjectiveState::Created);
    }

    #[test]
    fn no_state_revisits_created() {
        use ObjectiveState::*;
        for state in [Planned, Active, Review, Testing, Blocked, Rejected, Escalated, Done] {
            assert!(!state.can_transition_to(Created), "{state} -> created");
        }
    }

    #[test]
    fn terminal_states_allow_nothing() {
        use ObjectiveState::*;
        for terminal in [Done, Escalated] {
            for next in [Planned, Active, Review, Testing, Blocked, Rejected, Done] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn rejected_loops_back_to_active_only() {
        use ObjectiveState::*;
        assert!(Rejected.can_transition_to(Active));
        assert!(!Rejected.can_transition_to(Review));
        assert!(!Rejected.can_transition_to(Done));
    }

    #[test]
    fn blocked_remembers_and_clears_resume_state() {
        let mut obj = objective();
        obj.transition(ObjectiveState::Planned, "coordinator", "planned")
            .unwrap();
        obj.transition(ObjectiveState::Active, "coordinator", "started")
            .unwrap();
        obj.transition(ObjectiveState::Review, "agent", "execute done")
            .unwrap();
        obj.transition(ObjectiveState::Blocked, "checkpoint", "security review")
            .unwrap();
        assert_eq!(obj.resume_state, Some(ObjectiveState::Review));

        obj.transition(ObjectiveState::Testing, "user", "approved")
            .unwrap();
        assert_eq!(obj.resume_state, None);
    }

    #[test]
    fn any_non_terminal_state_can_block() {
        use ObjectiveState::*;
        for state in [Created, Planned, Active, Review, Testing, Rejected] {
            assert!(state.can_transition_to(Blocked), "{state} -> blocked");
        }
        assert!(!Done.can_transition_to(Blocked));
        assert!(!Escalated.can_transition_to(Blocked));
    }

    #[test]
    fn stage_role_mapping() {
        assert_eq!(Stage::Breakdown.role(), Role::Planner);
        assert_eq!(Stage::Design.role(), Role::Architect);
        assert_eq!(Stage::Execute.role(), Role::Implementer);
        assert_eq!(Stage::Review.role(), Role::Reviewer);
        assert_eq!(Stage::Test.role(), Role::Verifier);
    }

    #[test]
    fn serialization_roundtrip_preserves_state() {
        let mut obj = objective();
        obj.transition(ObjectiveState::Planned, "coordinator", "planned")
            .unwrap();
        let json = serde_json::to_string(&obj).unwrap();
        assert!(json.contains("\"state\":\"planned\""));
        let parsed: Objective = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.state, ObjectiveState::Planned);
        assert_eq!(parsed.history.len(), obj.history.len());
    }
}
