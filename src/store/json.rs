//! JSON-directory state store.
//!
//! One file per record under the store root:
//!
//! ```text
//! <root>/campaigns/<id>.json
//! <root>/objectives/<id>.json
//! <root>/checkpoints/<id>.json
//! <root>/runs/<id>.json
//! <root>/activity.jsonl
//! ```
//!
//! Each file holds a `{version, record}` envelope. Writes go through a
//! temp file and rename, so a crash never leaves a half-written record,
//! and updates re-read the stored version under the store lock before
//! committing: the optimistic check the coordinator relies on for
//! exactly-once stage scheduling across restarts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::StoreError;
use crate::model::{Campaign, Checkpoint, CheckpointStatus, Objective, WorkerRun};
use crate::store::{ActivityEntry, EventKind, StateEvent, StateStore, Versioned};

const CAMPAIGNS: &str = "campaigns";
const OBJECTIVES: &str = "objectives";
const CHECKPOINTS: &str = "checkpoints";
const RUNS: &str = "runs";
const ACTIVITY_FILE: &str = "activity.jsonl";

#[derive(Serialize, Deserialize)]
struct Stored<T> {
    version: u64,
    record: T,
}

pub struct JsonStore {
    root: PathBuf,
    // Serializes read-modify-write cycles; fs operations are short.
    lock: Mutex<()>,
    events: broadcast::Sender<StateEvent>,
}

impl JsonStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        for sub in [CAMPAIGNS, OBJECTIVES, CHECKPOINTS, RUNS] {
            fs::create_dir_all(root.join(sub))?;
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            root: root.to_path_buf(),
            lock: Mutex::new(()),
            events,
        })
    }

    fn record_path(&self, dir: &str, id: &str) -> PathBuf {
        self.root.join(dir).join(format!("{id}.json"))
    }

    fn read_stored<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        dir: &str,
        id: &str,
    ) -> Result<Stored<T>, StoreError> {
        let path = self.record_path(dir, id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    kind,
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            kind,
            id: id.to_string(),
            source,
        })
    }

    fn write_stored<T: Serialize>(
        &self,
        kind: &'static str,
        dir: &str,
        id: &str,
        stored: &Stored<T>,
    ) -> Result<(), StoreError> {
        let path = self.record_path(dir, id);
        let json = serde_json::to_string_pretty(stored).map_err(|source| StoreError::Corrupt {
            kind,
            id: id.to_string(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn create_record<T: Serialize>(
        &self,
        kind: &'static str,
        dir: &str,
        id: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        if self.record_path(dir, id).exists() {
            return Err(StoreError::AlreadyExists {
                kind,
                id: id.to_string(),
            });
        }
        self.write_stored(kind, dir, id, &Stored { version: 1, record })
    }

    fn update_record<T: Serialize + DeserializeOwned>(
        &self,
        kind: &'static str,
        dir: &str,
        id: &str,
        record: &T,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().unwrap();
        let current: Stored<T> = self.read_stored(kind, dir, id)?;
        if current.version != expected {
            return Err(StoreError::VersionConflict {
                kind,
                id: id.to_string(),
                expected,
                actual: current.version,
            });
        }
        let next = expected + 1;
        self.write_stored(
            kind,
            dir,
            id,
            &Stored {
                version: next,
                record,
            },
        )?;
        Ok(next)
    }

    fn scan<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        dir: &str,
    ) -> Result<Vec<T>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.root.join(dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let stored: Stored<T> = self.read_stored(kind, dir, &id)?;
            records.push(stored.record);
        }
        Ok(records)
    }

    fn publish(&self, kind: EventKind, campaign_id: &str, subject_id: &str, detail: &str) {
        let _ = self.events.send(StateEvent {
            at: Utc::now(),
            kind,
            campaign_id: campaign_id.to_string(),
            subject_id: subject_id.to_string(),
            detail: detail.to_string(),
        });
    }
}

#[async_trait]
impl StateStore for JsonStore {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.create_record("campaign", CAMPAIGNS, &campaign.id, campaign)?;
        self.publish(
            EventKind::CampaignCreated,
            &campaign.id,
            &campaign.id,
            &campaign.status.to_string(),
        );
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Versioned<Campaign>, StoreError> {
        let stored: Stored<Campaign> = self.read_stored("campaign", CAMPAIGNS, id)?;
        Ok(Versioned {
            version: stored.version,
            record: stored.record,
        })
    }

    async fn update_campaign(
        &self,
        campaign: &Campaign,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version =
            self.update_record("campaign", CAMPAIGNS, &campaign.id, campaign, expected_version)?;
        self.publish(
            EventKind::CampaignUpdated,
            &campaign.id,
            &campaign.id,
            &campaign.status.to_string(),
        );
        Ok(version)
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, StoreError> {
        let mut campaigns: Vec<Campaign> = self.scan("campaign", CAMPAIGNS)?;
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn create_objective(&self, objective: &Objective) -> Result<(), StoreError> {
        self.create_record("objective", OBJECTIVES, &objective.id, objective)?;
        self.publish(
            EventKind::ObjectiveCreated,
            &objective.campaign_id,
            &objective.id,
            &objective.state.to_string(),
        );
        Ok(())
    }

    async fn get_objective(&self, id: &str) -> Result<Versioned<Objective>, StoreError> {
        let stored: Stored<Objective> = self.read_stored("objective", OBJECTIVES, id)?;
        Ok(Versioned {
            version: stored.version,
            record: stored.record,
        })
    }

    async fn update_objective(
        &self,
        objective: &Objective,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version = self.update_record(
            "objective",
            OBJECTIVES,
            &objective.id,
            objective,
            expected_version,
        )?;
        self.publish(
            EventKind::ObjectiveUpdated,
            &objective.campaign_id,
            &objective.id,
            &objective.state.to_string(),
        );
        Ok(version)
    }

    async fn list_objectives(&self, campaign_id: &str) -> Result<Vec<Objective>, StoreError> {
        let mut objectives: Vec<Objective> = self
            .scan::<Objective>("objective", OBJECTIVES)?
            .into_iter()
            .filter(|o| o.campaign_id == campaign_id)
            .collect();
        objectives.sort_by_key(|o| o.ordinal);
        Ok(objectives)
    }

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.create_record("checkpoint", CHECKPOINTS, &checkpoint.id, checkpoint)?;
        self.publish(
            EventKind::CheckpointCreated,
            checkpoint.target.campaign_id(),
            &checkpoint.id,
            &checkpoint.trigger,
        );
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Versioned<Checkpoint>, StoreError> {
        let stored: Stored<Checkpoint> = self.read_stored("checkpoint", CHECKPOINTS, id)?;
        Ok(Versioned {
            version: stored.version,
            record: stored.record,
        })
    }

    async fn update_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version = self.update_record(
            "checkpoint",
            CHECKPOINTS,
            &checkpoint.id,
            checkpoint,
            expected_version,
        )?;
        self.publish(
            EventKind::CheckpointResolved,
            checkpoint.target.campaign_id(),
            &checkpoint.id,
            &checkpoint.status.to_string(),
        );
        Ok(version)
    }

    async fn pending_checkpoints(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let mut pending: Vec<Checkpoint> = self
            .scan::<Checkpoint>("checkpoint", CHECKPOINTS)?
            .into_iter()
            .filter(|cp| cp.status == CheckpointStatus::Pending)
            .collect();
        pending.sort_by_key(|cp| cp.created_at);
        Ok(pending)
    }

    async fn checkpoints_for_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .scan::<Checkpoint>("checkpoint", CHECKPOINTS)?
            .into_iter()
            .filter(|cp| cp.target.campaign_id() == campaign_id)
            .collect();
        checkpoints.sort_by_key(|cp| cp.created_at);
        Ok(checkpoints)
    }

    async fn create_worker_run(&self, run: &WorkerRun) -> Result<(), StoreError> {
        self.create_record("worker_run", RUNS, &run.id, run)?;
        self.publish(
            EventKind::WorkerRunStarted,
            &run.campaign_id,
            &run.id,
            &format!("{}:{}", run.role, run.stage),
        );
        Ok(())
    }

    async fn get_worker_run(&self, id: &str) -> Result<Versioned<WorkerRun>, StoreError> {
        let stored: Stored<WorkerRun> = self.read_stored("worker_run", RUNS, id)?;
        Ok(Versioned {
            version: stored.version,
            record: stored.record,
        })
    }

    async fn update_worker_run(
        &self,
        run: &WorkerRun,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version = self.update_record("worker_run", RUNS, &run.id, run, expected_version)?;
        let detail = run
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "running".to_string());
        self.publish(EventKind::WorkerRunFinalized, &run.campaign_id, &run.id, &detail);
        Ok(version)
    }

    async fn runs_for_campaign(&self, campaign_id: &str) -> Result<Vec<WorkerRun>, StoreError> {
        let mut runs: Vec<WorkerRun> = self
            .scan::<WorkerRun>("worker_run", RUNS)?
            .into_iter()
            .filter(|r| r.campaign_id == campaign_id)
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap();
        let line = serde_json::to_string(&entry).map_err(|source| StoreError::Corrupt {
            kind: "activity",
            id: "activity".to_string(),
            source,
        })?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(ACTIVITY_FILE))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, StoreError> {
        let path = self.root.join(ACTIVITY_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        let mut entries: Vec<ActivityEntry> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }
}
