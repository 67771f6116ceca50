//! Checkpoint gate: approval levels and blocking semantics.
//!
//! - `auto` checkpoints are resolved approved at creation and never
//!   suspend anything; they exist for the audit trail.
//! - `optional` checkpoints suspend their target and auto-resolve as
//!   `timed_out` (treated as approval) when the configured window passes
//!   with no explicit decision.
//! - `required` checkpoints suspend their target indefinitely; only an
//!   explicit decision or a campaign abort resolves them.
//!
//! Resolution happens exactly once; a second attempt fails with
//! `InvalidCheckpointState`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::errors::{GateError, StoreError};
use crate::model::{Checkpoint, CheckpointLevel, CheckpointStatus, CheckpointTarget};
use crate::store::{ActivityEntry, StateStore, Versioned};

/// An explicit resolver decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

pub struct CheckpointGate {
    store: Arc<dyn StateStore>,
}

impl CheckpointGate {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Create a checkpoint. `auto`-level checkpoints come back already
    /// approved; the other levels start pending.
    pub async fn create(
        &self,
        target: CheckpointTarget,
        trigger: &str,
        level: CheckpointLevel,
        payload: &str,
    ) -> Result<Checkpoint, GateError> {
        let mut checkpoint = Checkpoint::new(target, trigger, level, payload);
        if level == CheckpointLevel::Auto {
            checkpoint.status = CheckpointStatus::Approved;
            checkpoint.resolved_by = Some("auto".into());
            checkpoint.resolved_at = Some(chrono::Utc::now());
        }
        self.store.create_checkpoint(&checkpoint).await?;
        self.store
            .append_activity(ActivityEntry::new(
                "gate",
                format!(
                    "checkpoint {} created ({}, {}) -> {}",
                    checkpoint.id, checkpoint.trigger, level, checkpoint.status
                ),
                Some(checkpoint.target.campaign_id()),
            ))
            .await?;
        info!(
            checkpoint = %checkpoint.id,
            trigger = %checkpoint.trigger,
            %level,
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Apply an explicit decision. Fails with `InvalidCheckpointState` if
    /// the checkpoint is already resolved.
    pub async fn resolve(
        &self,
        checkpoint_id: &str,
        decision: Decision,
        feedback: Option<String>,
        resolved_by: &str,
    ) -> Result<Checkpoint, GateError> {
        let Versioned {
            version,
            record: mut checkpoint,
        } = self.store.get_checkpoint(checkpoint_id).await?;

        if checkpoint.status.is_resolved() {
            return Err(GateError::InvalidCheckpointState {
                id: checkpoint_id.to_string(),
                status: checkpoint.status.to_string(),
            });
        }

        checkpoint.status = match decision {
            Decision::Approve => CheckpointStatus::Approved,
            Decision::Reject => CheckpointStatus::Rejected,
        };
        checkpoint.feedback = feedback;
        checkpoint.resolved_by = Some(resolved_by.to_string());
        checkpoint.resolved_at = Some(chrono::Utc::now());
        self.store.update_checkpoint(&checkpoint, version).await?;
        self.store
            .append_activity(ActivityEntry::new(
                resolved_by,
                format!("checkpoint {} {}", checkpoint.id, checkpoint.status),
                Some(checkpoint.target.campaign_id()),
            ))
            .await?;
        info!(checkpoint = %checkpoint.id, status = %checkpoint.status, "checkpoint resolved");
        Ok(checkpoint)
    }

    /// Suspend until the checkpoint is resolved.
    ///
    /// For `optional` checkpoints the wait is bounded by `optional_window`:
    /// when it elapses with no decision, the gate resolves the checkpoint
    /// as `timed_out` itself. `required` checkpoints wait for as long as it
    /// takes. `auto` checkpoints return immediately (they are created
    /// resolved).
    pub async fn await_resolution(
        &self,
        checkpoint_id: &str,
        optional_window: Duration,
    ) -> Result<Checkpoint, GateError> {
        // Subscribe before the first read so a resolution between the read
        // and the wait still wakes us.
        let mut events = self.store.subscribe();
        let deadline = tokio::time::Instant::now() + optional_window;

        loop {
            let Versioned {
                version,
                record: checkpoint,
            } = self.store.get_checkpoint(checkpoint_id).await?;

            if checkpoint.status.is_resolved() {
                return Ok(checkpoint);
            }

            match checkpoint.level {
                CheckpointLevel::Auto => {
                    // Created resolved; a pending auto checkpoint cannot
                    // exist, but re-loop rather than assume.
                    debug!(checkpoint = %checkpoint_id, "auto checkpoint still pending");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                CheckpointLevel::Required => match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        // Feed gone; fall back to polling.
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                },
                CheckpointLevel::Optional => {
                    tokio::select! {
                        recv = events.recv() => match recv {
                            Ok(_) | Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => {
                                tokio::time::sleep(Duration::from_millis(200)).await;
                            }
                        },
                        _ = tokio::time::sleep_until(deadline) => {
                            match self.expire(checkpoint, version).await {
                                Ok(expired) => return Ok(expired),
                                // Lost the race to an explicit decision;
                                // re-read and return that resolution.
                                Err(GateError::Store(StoreError::VersionConflict { .. })) => {}
                                Err(other) => return Err(other),
                            }
                        }
                    }
                }
            }
        }
    }

    async fn expire(
        &self,
        mut checkpoint: Checkpoint,
        version: u64,
    ) -> Result<Checkpoint, GateError> {
        checkpoint.status = CheckpointStatus::TimedOut;
        checkpoint.resolved_by = Some("timeout".into());
        checkpoint.resolved_at = Some(chrono::Utc::now());
        self.store.update_checkpoint(&checkpoint, version).await?;
        self.store
            .append_activity(ActivityEntry::new(
                "gate",
                format!("checkpoint {} timed out, proceeding", checkpoint.id),
                Some(checkpoint.target.campaign_id()),
            ))
            .await?;
        warn!(checkpoint = %checkpoint.id, "optional checkpoint expired without a decision");
        Ok(checkpoint)
    }

    /// Campaign abort sweep: forcibly reject every pending checkpoint that
    /// targets the campaign.
    pub async fn reject_pending_for_campaign(
        &self,
        campaign_id: &str,
        reason: &str,
    ) -> Result<usize, GateError> {
        let mut rejected = 0;
        for checkpoint in self.store.pending_checkpoints().await? {
            if checkpoint.target.campaign_id() != campaign_id {
                continue;
            }
            match self
                .resolve(
                    &checkpoint.id,
                    Decision::Reject,
                    Some(reason.to_string()),
                    "abort",
                )
                .await
            {
                Ok(_) => rejected += 1,
                // Resolved by someone else between listing and now.
                Err(GateError::InvalidCheckpointState { .. }) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(rejected)
    }
}
