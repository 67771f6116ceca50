//! Worker run records: one invocation of an ephemeral execution unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::objective::Stage;
use crate::model::short_id;

/// The specialized roles a worker can assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Architect,
    Implementer,
    Reviewer,
    Verifier,
}

impl Role {
    /// Roles that plan rather than code get tighter execution limits.
    pub fn is_planning(self) -> bool {
        matches!(self, Role::Planner | Role::Architect)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Planner => "planner",
            Role::Architect => "architect",
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
            Role::Verifier => "verifier",
        };
        write!(f, "{s}")
    }
}

/// Final outcome of a worker run. Absent while the unit is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success,
    Failure,
    Timeout,
}

impl std::fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerOutcome::Success => "success",
            WorkerOutcome::Failure => "failure",
            WorkerOutcome::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// One invocation of an ephemeral execution unit performing a stage.
/// Finalized exactly once: completion, timeout, or forced teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRun {
    pub id: String,
    pub campaign_id: String,
    /// Absent for campaign-level stages (Breakdown, Design).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective_id: Option<String>,
    pub role: Role,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WorkerOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reference to the captured output (store-relative path or key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_ref: Option<String>,
}

impl WorkerRun {
    pub fn new(campaign_id: &str, objective_id: Option<&str>, stage: Stage) -> Self {
        Self {
            id: short_id("run"),
            campaign_id: campaign_id.to_string(),
            objective_id: objective_id.map(str::to_string),
            role: stage.role(),
            stage,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            summary: None,
            artifacts: Vec::new(),
            error: None,
            log_ref: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.outcome.is_some()
    }

    /// Record the final outcome. A run is finalized at most once; the
    /// lifecycle manager enforces the call discipline.
    pub fn finalize(
        &mut self,
        outcome: WorkerOutcome,
        summary: Option<String>,
        artifacts: Vec<String>,
        error: Option<String>,
    ) {
        self.outcome = Some(outcome);
        self.summary = summary;
        self.artifacts = artifacts;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_derives_role_from_stage() {
        let run = WorkerRun::new("cmp_1", Some("obj_1"), Stage::Review);
        assert!(run.id.starts_with("run_"));
        assert_eq!(run.role, Role::Reviewer);
        assert!(!run.is_finalized());
    }

    #[test]
    fn campaign_level_run_has_no_objective() {
        let run = WorkerRun::new("cmp_1", None, Stage::Breakdown);
        assert_eq!(run.objective_id, None);
        assert_eq!(run.role, Role::Planner);
    }

    #[test]
    fn finalize_sets_outcome_and_timestamps() {
        let mut run = WorkerRun::new("cmp_1", Some("obj_1"), Stage::Execute);
        run.finalize(
            WorkerOutcome::Success,
            Some("implemented login endpoint".into()),
            vec!["src/auth.rs".into()],
            None,
        );
        assert!(run.is_finalized());
        assert_eq!(run.outcome, Some(WorkerOutcome::Success));
        assert!(run.finished_at.is_some());
        assert_eq!(run.artifacts, vec!["src/auth.rs".to_string()]);
    }

    #[test]
    fn planning_roles_are_flagged() {
        assert!(Role::Planner.is_planning());
        assert!(Role::Architect.is_planning());
        assert!(!Role::Implementer.is_planning());
        assert!(!Role::Verifier.is_planning());
    }
}
