//! Checkpoint records: human approval gates tied to a stage transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::objective::Stage;
use crate::model::short_id;

/// Well-known checkpoint trigger names.
pub mod trigger {
    pub const PLAN_APPROVAL: &str = "plan_approval";
    pub const DESIGN_APPROVAL: &str = "design_approval";
    pub const SECURITY_REVIEW: &str = "security_review";
    pub const EXECUTE_ESCALATION: &str = "execute_escalation";
    pub const REVIEW_ESCALATION: &str = "review_escalation";
    pub const TEST_ESCALATION: &str = "test_escalation";
    pub const BATCH_REVIEW: &str = "batch_review";
    pub const BATCH_TEST: &str = "batch_test";
}

/// Approval level, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointLevel {
    /// Logged only; resolved as approved immediately, no suspension.
    Auto,
    /// Suspends the target; auto-resolves after the configured timeout if
    /// no explicit decision arrives.
    Optional,
    /// Suspends the target indefinitely; only an explicit decision or a
    /// campaign abort resolves it.
    Required,
}

impl std::fmt::Display for CheckpointLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointLevel::Auto => "auto",
            CheckpointLevel::Optional => "optional",
            CheckpointLevel::Required => "required",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Approved,
    Rejected,
    /// An optional checkpoint whose timeout elapsed with no decision.
    /// Interpreted as approval by the coordinator, but kept distinct so
    /// the audit trail shows nobody actually looked.
    TimedOut,
}

impl CheckpointStatus {
    pub fn is_resolved(self) -> bool {
        !matches!(self, CheckpointStatus::Pending)
    }

    /// Whether this resolution lets the target proceed.
    pub fn is_go(self) -> bool {
        matches!(self, CheckpointStatus::Approved | CheckpointStatus::TimedOut)
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Approved => "approved",
            CheckpointStatus::Rejected => "rejected",
            CheckpointStatus::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// What a checkpoint blocks: a whole campaign or one objective's stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointTarget {
    Campaign {
        campaign_id: String,
    },
    Objective {
        campaign_id: String,
        objective_id: String,
        stage: Stage,
    },
}

impl CheckpointTarget {
    pub fn campaign_id(&self) -> &str {
        match self {
            CheckpointTarget::Campaign { campaign_id }
            | CheckpointTarget::Objective { campaign_id, .. } => campaign_id,
        }
    }

    pub fn objective_id(&self) -> Option<&str> {
        match self {
            CheckpointTarget::Campaign { .. } => None,
            CheckpointTarget::Objective { objective_id, .. } => Some(objective_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub target: CheckpointTarget,
    pub trigger: String,
    pub level: CheckpointLevel,
    pub status: CheckpointStatus,
    /// Diagnostic content shown to the resolver: plan, design edict,
    /// failure report.
    pub payload: String,
    /// Resolver feedback, carried into the next worker run's context on
    /// rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(target: CheckpointTarget, trigger: &str, level: CheckpointLevel, payload: &str) -> Self {
        Self {
            id: short_id("cp"),
            target,
            trigger: trigger.to_string(),
            level,
            status: CheckpointStatus::Pending,
            payload: payload.to_string(),
            feedback: None,
            resolved_by: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checkpoint_is_pending() {
        let cp = Checkpoint::new(
            CheckpointTarget::Campaign {
                campaign_id: "cmp_1".into(),
            },
            trigger::PLAN_APPROVAL,
            CheckpointLevel::Required,
            "3 objectives proposed",
        );
        assert!(cp.id.starts_with("cp_"));
        assert_eq!(cp.status, CheckpointStatus::Pending);
        assert!(!cp.status.is_resolved());
    }

    #[test]
    fn timed_out_counts_as_go() {
        assert!(CheckpointStatus::Approved.is_go());
        assert!(CheckpointStatus::TimedOut.is_go());
        assert!(!CheckpointStatus::Rejected.is_go());
        assert!(!CheckpointStatus::Pending.is_go());
    }

    #[test]
    fn target_accessors() {
        let target = CheckpointTarget::Objective {
            campaign_id: "cmp_1".into(),
            objective_id: "obj_2".into(),
            stage: Stage::Review,
        };
        assert_eq!(target.campaign_id(), "cmp_1");
        assert_eq!(target.objective_id(), Some("obj_2"));

        let target = CheckpointTarget::Campaign {
            campaign_id: "cmp_9".into(),
        };
        assert_eq!(target.objective_id(), None);
    }

    #[test]
    fn target_serializes_with_kind_tag() {
        let cp = Checkpoint::new(
            CheckpointTarget::Objective {
                campaign_id: "cmp_1".into(),
                objective_id: "obj_1".into(),
                stage: Stage::Test,
            },
            trigger::TEST_ESCALATION,
            CheckpointLevel::Required,
            "two consecutive failures",
        );
        let json = serde_json::to_string(&cp).unwrap();
        assert!(json.contains("\"kind\":\"objective\""));
        assert!(json.contains("\"stage\":\"test\""));
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.target, cp.target);
    }
}
