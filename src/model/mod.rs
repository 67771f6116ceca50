//! Persistent record types: campaigns, objectives, checkpoints, worker runs.
//!
//! Everything in this module is serializable state owned by the state store.
//! Mutation goes through the methods here so that transition rules and the
//! append-only history are enforced in one place.

pub mod campaign;
pub mod checkpoint;
pub mod objective;
pub mod worker;

pub use campaign::{Campaign, CampaignStatus, GuidanceNote};
pub use checkpoint::{Checkpoint, CheckpointLevel, CheckpointStatus, CheckpointTarget};
pub use objective::{Objective, ObjectiveState, Stage, TransitionEvent};
pub use worker::{Role, WorkerOutcome, WorkerRun};

use uuid::Uuid;

/// Short display id in the `prefix_1a2b3c4d` form used across all records.
pub fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_prefixed_and_unique() {
        let a = short_id("obj");
        let b = short_id("obj");
        assert!(a.starts_with("obj_"));
        assert_eq!(a.len(), "obj_".len() + 8);
        assert_ne!(a, b);
    }
}
