//! Durable state store interface.
//!
//! The store is the single source of truth for resumption: campaigns,
//! objectives, checkpoints, and worker runs are independently addressable,
//! versioned for optimistic updates, and survive process restart. Every
//! committed write publishes a `StateEvent` on the subscribe feed.
//!
//! Two implementations ship with the crate: a JSON-directory store for
//! real use and an in-memory store for tests and embedding.

pub mod json;
pub mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::{PipelineError, StoreError};
use crate::model::{Campaign, Checkpoint, Objective, WorkerRun};

/// A record together with the version the store holds for it. Updates must
/// present this version back; a mismatch is a `VersionConflict`.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

/// What happened, for subscribers (presentation layers, gate waits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CampaignCreated,
    CampaignUpdated,
    ObjectiveCreated,
    ObjectiveUpdated,
    CheckpointCreated,
    CheckpointResolved,
    WorkerRunStarted,
    WorkerRunFinalized,
}

/// One entry on the notification feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub campaign_id: String,
    /// Id of the record the event is about.
    pub subject_id: String,
    pub detail: String,
}

/// One line of the bounded activity trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
}

impl ActivityEntry {
    pub fn new(actor: &str, message: impl Into<String>, campaign_id: Option<&str>) -> Self {
        Self {
            at: Utc::now(),
            actor: actor.to_string(),
            message: message.into(),
            campaign_id: campaign_id.map(str::to_string),
        }
    }
}

/// The durable state store contract.
///
/// `create_*` fails on id collision; `update_*` fails unless
/// `expected_version` matches the stored version, and returns the new
/// version on success.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), StoreError>;
    async fn get_campaign(&self, id: &str) -> Result<Versioned<Campaign>, StoreError>;
    async fn update_campaign(&self, campaign: &Campaign, expected_version: u64)
    -> Result<u64, StoreError>;
    async fn list_campaigns(&self) -> Result<Vec<Campaign>, StoreError>;

    async fn create_objective(&self, objective: &Objective) -> Result<(), StoreError>;
    async fn get_objective(&self, id: &str) -> Result<Versioned<Objective>, StoreError>;
    async fn update_objective(
        &self,
        objective: &Objective,
        expected_version: u64,
    ) -> Result<u64, StoreError>;
    /// Objectives of one campaign, ordered by ordinal.
    async fn list_objectives(&self, campaign_id: &str) -> Result<Vec<Objective>, StoreError>;

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    async fn get_checkpoint(&self, id: &str) -> Result<Versioned<Checkpoint>, StoreError>;
    async fn update_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<u64, StoreError>;
    async fn pending_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError>;
    /// All checkpoints targeting a campaign (or its objectives), oldest
    /// first.
    async fn checkpoints_for_campaign(&self, campaign_id: &str)
    -> Result<Vec<Checkpoint>, StoreError>;

    async fn create_worker_run(&self, run: &WorkerRun) -> Result<(), StoreError>;
    async fn get_worker_run(&self, id: &str) -> Result<Versioned<WorkerRun>, StoreError>;
    async fn update_worker_run(
        &self,
        run: &WorkerRun,
        expected_version: u64,
    ) -> Result<u64, StoreError>;
    async fn runs_for_campaign(&self, campaign_id: &str) -> Result<Vec<WorkerRun>, StoreError>;

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), StoreError>;
    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, StoreError>;

    /// Subscribe to the notification feed. Slow subscribers may observe
    /// `Lagged`; the store is the source of truth, the feed is a wakeup.
    fn subscribe(&self) -> broadcast::Receiver<StateEvent>;
}

/// Attempts per load-mutate-store cycle before a conflict is fatal. The
/// coordinator is the single writer for its campaign, but guidance and
/// abort land from other tasks.
const MODIFY_ATTEMPTS: usize = 3;

/// Load-mutate-store an objective under its version check, retrying the
/// cycle on a lost race.
pub async fn modify_objective<F>(
    store: &dyn StateStore,
    id: &str,
    mut mutate: F,
) -> Result<Objective, PipelineError>
where
    F: FnMut(&mut Objective) -> Result<(), PipelineError>,
{
    let mut attempt = 0;
    loop {
        let Versioned { version, mut record } = store.get_objective(id).await?;
        mutate(&mut record)?;
        match store.update_objective(&record, version).await {
            Ok(_) => return Ok(record),
            Err(StoreError::VersionConflict { .. }) if attempt < MODIFY_ATTEMPTS => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Load-mutate-store a campaign under its version check, retrying the
/// cycle on a lost race.
pub async fn modify_campaign<F>(
    store: &dyn StateStore,
    id: &str,
    mut mutate: F,
) -> Result<Campaign, PipelineError>
where
    F: FnMut(&mut Campaign) -> Result<(), PipelineError>,
{
    let mut attempt = 0;
    loop {
        let Versioned { version, mut record } = store.get_campaign(id).await?;
        mutate(&mut record)?;
        match store.update_campaign(&record, version).await {
            Ok(_) => return Ok(record),
            Err(StoreError::VersionConflict { .. }) if attempt < MODIFY_ATTEMPTS => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Maximum entries retained on the activity trail.
pub(crate) const ACTIVITY_CAP: usize = 1000;
