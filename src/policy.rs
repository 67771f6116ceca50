//! Per-campaign policy snapshots.
//!
//! Live configuration is compiled once into an immutable `PolicySnapshot`
//! when a campaign is created, plus a small tagged stage list, instead of
//! branching on global settings at each transition. Mid-campaign behavior
//! stays deterministic even if defaults change underneath.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::model::checkpoint::CheckpointLevel;
use crate::model::objective::{ObjectiveState, Stage};
use crate::model::worker::Role;

/// When an optional stage runs relative to the objectives it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    /// Immediately after the objective's prior stage.
    PerSubtask,
    /// Deferred until every objective completes Execute, then one batch
    /// pass over the accumulated artifacts.
    PerCampaign,
}

impl std::fmt::Display for StageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageMode::PerSubtask => "per_subtask",
            StageMode::PerCampaign => "per_campaign",
        };
        write!(f, "{s}")
    }
}

/// Enablement and mode for one optional stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToggle {
    pub enabled: bool,
    pub mode: StageMode,
}

impl StageToggle {
    pub fn per_subtask(&self) -> bool {
        self.enabled && self.mode == StageMode::PerSubtask
    }

    pub fn per_campaign(&self) -> bool {
        self.enabled && self.mode == StageMode::PerCampaign
    }
}

/// One slot in the compiled per-objective stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSlot {
    Execute,
    Review(StageMode),
    Test(StageMode),
}

/// Immutable copy of the stage-enablement/mode/limit configuration,
/// stored on the campaign record at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Whether the campaign-level Design stage runs after Breakdown.
    #[serde(default = "default_true")]
    pub design_enabled: bool,
    pub review: StageToggle,
    pub test: StageToggle,
    /// Re-executions granted per setback kind per objective before
    /// escalation.
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
    /// Checkpoint level for the Breakdown/Design approval gates.
    #[serde(default = "default_approval_level")]
    pub approval_level: CheckpointLevel,
    pub worker_timeout_secs: u64,
    /// Tighter bound for planner/architect invocations.
    pub planning_timeout_secs: u64,
    /// How long an optional checkpoint waits before auto-resolving.
    pub optional_checkpoint_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_retry_cap() -> u32 {
    1
}

fn default_approval_level() -> CheckpointLevel {
    CheckpointLevel::Required
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            design_enabled: true,
            review: StageToggle {
                enabled: true,
                mode: StageMode::PerSubtask,
            },
            test: StageToggle {
                enabled: true,
                mode: StageMode::PerSubtask,
            },
            retry_cap: 1,
            approval_level: CheckpointLevel::Required,
            worker_timeout_secs: 600,
            planning_timeout_secs: 300,
            optional_checkpoint_timeout_secs: 1800,
        }
    }
}

impl PolicySnapshot {
    /// Validate the snapshot at campaign creation. Invalid policy is a
    /// `ConfigError`: the campaign is never created.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.worker_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "worker_timeout_secs must be positive".into(),
            ));
        }
        if self.planning_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "planning_timeout_secs must be positive".into(),
            ));
        }
        if self.optional_checkpoint_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "optional_checkpoint_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Timeout for one worker invocation, scaled down for planning roles.
    pub fn timeout_for(&self, role: Role) -> Duration {
        if role.is_planning() {
            Duration::from_secs(self.planning_timeout_secs.min(self.worker_timeout_secs))
        } else {
            Duration::from_secs(self.worker_timeout_secs)
        }
    }

    pub fn optional_checkpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.optional_checkpoint_timeout_secs)
    }

    /// The compiled per-objective stage sequence.
    pub fn objective_stages(&self) -> Vec<StageSlot> {
        let mut slots = vec![StageSlot::Execute];
        if self.review.enabled {
            slots.push(StageSlot::Review(self.review.mode));
        }
        if self.test.enabled {
            slots.push(StageSlot::Test(self.test.mode));
        }
        slots
    }

    /// Where an objective goes after `stage` completes cleanly: the next
    /// per-subtask slot in the compiled sequence, or `Done` when none
    /// remains (deferred `per_campaign` slots run at campaign level).
    pub fn state_after(&self, stage: Stage) -> ObjectiveState {
        let slots = self.objective_stages();
        let position = slots
            .iter()
            .position(|slot| {
                matches!(
                    (slot, stage),
                    (StageSlot::Execute, Stage::Execute)
                        | (StageSlot::Review(_), Stage::Review)
                        | (StageSlot::Test(_), Stage::Test)
                )
            })
            .map(|i| i + 1)
            .unwrap_or(slots.len());
        slots[position..]
            .iter()
            .find_map(|slot| match slot {
                StageSlot::Review(StageMode::PerSubtask) => Some(ObjectiveState::Review),
                StageSlot::Test(StageMode::PerSubtask) => Some(ObjectiveState::Testing),
                _ => None,
            })
            .unwrap_or(ObjectiveState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_validates() {
        PolicySnapshot::default().validate().unwrap();
    }

    #[test]
    fn zero_timeout_is_a_config_error() {
        let policy = PolicySnapshot {
            worker_timeout_secs: 0,
            ..PolicySnapshot::default()
        };
        let err = policy.validate().unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn planning_roles_get_the_tighter_timeout() {
        let policy = PolicySnapshot::default();
        assert_eq!(policy.timeout_for(Role::Planner), Duration::from_secs(300));
        assert_eq!(
            policy.timeout_for(Role::Implementer),
            Duration::from_secs(600)
        );
        // Planning timeout never exceeds the general worker timeout.
        let tight = PolicySnapshot {
            worker_timeout_secs: 120,
            planning_timeout_secs: 300,
            ..PolicySnapshot::default()
        };
        assert_eq!(tight.timeout_for(Role::Architect), Duration::from_secs(120));
    }

    #[test]
    fn stage_list_reflects_toggles() {
        let policy = PolicySnapshot::default();
        assert_eq!(
            policy.objective_stages(),
            vec![
                StageSlot::Execute,
                StageSlot::Review(StageMode::PerSubtask),
                StageSlot::Test(StageMode::PerSubtask),
            ]
        );

        let execute_only = PolicySnapshot {
            review: StageToggle {
                enabled: false,
                mode: StageMode::PerSubtask,
            },
            test: StageToggle {
                enabled: false,
                mode: StageMode::PerSubtask,
            },
            ..PolicySnapshot::default()
        };
        assert_eq!(execute_only.objective_stages(), vec![StageSlot::Execute]);
    }

    #[test]
    fn state_after_follows_the_compiled_sequence() {
        let policy = PolicySnapshot::default();
        assert_eq!(policy.state_after(Stage::Execute), ObjectiveState::Review);
        assert_eq!(policy.state_after(Stage::Review), ObjectiveState::Testing);
        assert_eq!(policy.state_after(Stage::Test), ObjectiveState::Done);
    }

    #[test]
    fn state_after_skips_deferred_and_disabled_slots() {
        // Review deferred to the campaign level: Execute routes straight
        // to Testing.
        let deferred_review = PolicySnapshot {
            review: StageToggle {
                enabled: true,
                mode: StageMode::PerCampaign,
            },
            ..PolicySnapshot::default()
        };
        assert_eq!(
            deferred_review.state_after(Stage::Execute),
            ObjectiveState::Testing
        );

        let nothing_after_execute = PolicySnapshot {
            review: StageToggle {
                enabled: false,
                mode: StageMode::PerSubtask,
            },
            test: StageToggle {
                enabled: false,
                mode: StageMode::PerSubtask,
            },
            ..PolicySnapshot::default()
        };
        assert_eq!(
            nothing_after_execute.state_after(Stage::Execute),
            ObjectiveState::Done
        );
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let policy = PolicySnapshot {
            review: StageToggle {
                enabled: true,
                mode: StageMode::PerCampaign,
            },
            ..PolicySnapshot::default()
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("per_campaign"));
        let parsed: PolicySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }
}
