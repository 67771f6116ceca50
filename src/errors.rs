//! Typed error hierarchy for the vanguard engine.
//!
//! Four top-level enums cover the four subsystems:
//! - `StoreError` — durable state store failures
//! - `GateError` — checkpoint gate failures
//! - `WorkerError` — worker lifecycle and execution failures
//! - `PipelineError` — coordinator failures, including the conversions
//!   from the three above

use thiserror::Error;

/// Errors from the durable state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} record {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} record {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("version conflict on {kind} {id}: expected {expected}, stored {actual}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("corrupt {kind} record {id}: {source}")]
    Corrupt {
        kind: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store io failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the checkpoint gate.
#[derive(Debug, Error)]
pub enum GateError {
    /// Raised on any attempt to resolve a checkpoint that is no longer
    /// pending. Resolution happens exactly once.
    #[error("checkpoint {id} is not pending (status: {status})")]
    InvalidCheckpointState { id: String, status: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the worker lifecycle manager and executors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn {role} worker: {reason}")]
    SpawnFailed { role: String, reason: String },

    #[error("worker run {run_id} already has a live execution unit")]
    AlreadyLive { run_id: String },

    #[error("objective {objective_id} already has an active worker run")]
    ObjectiveBusy { objective_id: String },

    #[error("campaign {campaign_id} already has a live worker (single-writer workspace)")]
    CampaignBusy { campaign_id: String },

    #[error("worker io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the pipeline coordinator.
///
/// Stage-level setbacks (review rejection, test failure, worker failure)
/// are not errors: the coordinator routes them through the retry and
/// escalation policy. This enum covers the failures that stop a campaign.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid policy: {0}")]
    Config(String),

    #[error("objective {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("campaign {id} was aborted")]
    Aborted { id: String },

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conflict_carries_both_versions() {
        let err = StoreError::VersionConflict {
            kind: "objective",
            id: "obj_1".into(),
            expected: 3,
            actual: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("stored 5"));
    }

    #[test]
    fn invalid_checkpoint_state_is_matchable() {
        let err = GateError::InvalidCheckpointState {
            id: "cp_1".into(),
            status: "approved".into(),
        };
        assert!(matches!(err, GateError::InvalidCheckpointState { .. }));
        assert!(err.to_string().contains("not pending"));
    }

    #[test]
    fn pipeline_error_converts_from_subsystems() {
        let store_err = StoreError::NotFound {
            kind: "campaign",
            id: "cmp_1".into(),
        };
        let pipeline_err: PipelineError = store_err.into();
        assert!(matches!(
            pipeline_err,
            PipelineError::Store(StoreError::NotFound { .. })
        ));

        let gate_err = GateError::InvalidCheckpointState {
            id: "cp_1".into(),
            status: "rejected".into(),
        };
        let pipeline_err: PipelineError = gate_err.into();
        assert!(matches!(pipeline_err, PipelineError::Gate(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NotFound {
            kind: "campaign",
            id: "cmp_1".into(),
        });
        assert_std_error(&WorkerError::AlreadyLive {
            run_id: "run_1".into(),
        });
        assert_std_error(&PipelineError::Config("retry cap missing".into()));
    }
}
