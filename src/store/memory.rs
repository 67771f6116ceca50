//! In-memory state store for tests and embedded use.
//!
//! Same semantics as the durable stores (optimistic versioning, event
//! feed, bounded activity trail), minus the disk.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::errors::StoreError;
use crate::model::{Campaign, Checkpoint, CheckpointStatus, Objective, WorkerRun};
use crate::store::{ACTIVITY_CAP, ActivityEntry, EventKind, StateEvent, StateStore, Versioned};

struct Shelf<T> {
    records: HashMap<String, (u64, T)>,
}

impl<T> Default for Shelf<T> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
        }
    }
}

impl<T: Clone> Shelf<T> {
    fn create(&mut self, kind: &'static str, id: &str, record: T) -> Result<(), StoreError> {
        if self.records.contains_key(id) {
            return Err(StoreError::AlreadyExists {
                kind,
                id: id.to_string(),
            });
        }
        self.records.insert(id.to_string(), (1, record));
        Ok(())
    }

    fn get(&self, kind: &'static str, id: &str) -> Result<Versioned<T>, StoreError> {
        self.records
            .get(id)
            .map(|(version, record)| Versioned {
                version: *version,
                record: record.clone(),
            })
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    fn update(
        &mut self,
        kind: &'static str,
        id: &str,
        record: T,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let entry = self.records.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_string(),
        })?;
        if entry.0 != expected {
            return Err(StoreError::VersionConflict {
                kind,
                id: id.to_string(),
                expected,
                actual: entry.0,
            });
        }
        entry.0 += 1;
        entry.1 = record;
        Ok(entry.0)
    }
}

#[derive(Default)]
struct Inner {
    campaigns: Shelf<Campaign>,
    objectives: Shelf<Objective>,
    checkpoints: Shelf<Checkpoint>,
    runs: Shelf<WorkerRun>,
    activity: VecDeque<ActivityEntry>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StateEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    fn publish(&self, kind: EventKind, campaign_id: &str, subject_id: &str, detail: &str) {
        // No receivers is fine; the feed is best-effort wakeup.
        let _ = self.events.send(StateEvent {
            at: Utc::now(),
            kind,
            campaign_id: campaign_id.to_string(),
            subject_id: subject_id.to_string(),
            detail: detail.to_string(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_campaign(&self, campaign: &Campaign) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .campaigns
            .create("campaign", &campaign.id, campaign.clone())?;
        self.publish(
            EventKind::CampaignCreated,
            &campaign.id,
            &campaign.id,
            &campaign.status.to_string(),
        );
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Versioned<Campaign>, StoreError> {
        self.inner.lock().unwrap().campaigns.get("campaign", id)
    }

    async fn update_campaign(
        &self,
        campaign: &Campaign,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version = self.inner.lock().unwrap().campaigns.update(
            "campaign",
            &campaign.id,
            campaign.clone(),
            expected_version,
        )?;
        self.publish(
            EventKind::CampaignUpdated,
            &campaign.id,
            &campaign.id,
            &campaign.status.to_string(),
        );
        Ok(version)
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut campaigns: Vec<Campaign> = inner
            .campaigns
            .records
            .values()
            .map(|(_, c)| c.clone())
            .collect();
        campaigns.sort_by_key(|c| c.created_at);
        Ok(campaigns)
    }

    async fn create_objective(&self, objective: &Objective) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .objectives
            .create("objective", &objective.id, objective.clone())?;
        self.publish(
            EventKind::ObjectiveCreated,
            &objective.campaign_id,
            &objective.id,
            &objective.state.to_string(),
        );
        Ok(())
    }

    async fn get_objective(&self, id: &str) -> Result<Versioned<Objective>, StoreError> {
        self.inner.lock().unwrap().objectives.get("objective", id)
    }

    async fn update_objective(
        &self,
        objective: &Objective,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version = self.inner.lock().unwrap().objectives.update(
            "objective",
            &objective.id,
            objective.clone(),
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
        let inner = self.inner.lock().unwrap();
        let mut objectives: Vec<Objective> = inner
            .objectives
            .records
            .values()
            .filter(|(_, o)| o.campaign_id == campaign_id)
            .map(|(_, o)| o.clone())
            .collect();
        objectives.sort_by_key(|o| o.ordinal);
        Ok(objectives)
    }

    async fn create_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .checkpoints
            .create("checkpoint", &checkpoint.id, checkpoint.clone())?;
        self.publish(
            EventKind::CheckpointCreated,
            checkpoint.target.campaign_id(),
            &checkpoint.id,
            &checkpoint.trigger,
        );
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Versioned<Checkpoint>, StoreError> {
        self.inner.lock().unwrap().checkpoints.get("checkpoint", id)
    }

    async fn update_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version = self.inner.lock().unwrap().checkpoints.update(
            "checkpoint",
            &checkpoint.id,
            checkpoint.clone(),
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
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<Checkpoint> = inner
            .checkpoints
            .records
            .values()
            .filter(|(_, cp)| cp.status == CheckpointStatus::Pending)
            .map(|(_, cp)| cp.clone())
            .collect();
        pending.sort_by_key(|cp| cp.created_at);
        Ok(pending)
    }

    async fn checkpoints_for_campaign(
        &self,
        campaign_id: &str,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut checkpoints: Vec<Checkpoint> = inner
            .checkpoints
            .records
            .values()
            .filter(|(_, cp)| cp.target.campaign_id() == campaign_id)
            .map(|(_, cp)| cp.clone())
            .collect();
        checkpoints.sort_by_key(|cp| cp.created_at);
        Ok(checkpoints)
    }

    async fn create_worker_run(&self, run: &WorkerRun) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .runs
            .create("worker_run", &run.id, run.clone())?;
        self.publish(
            EventKind::WorkerRunStarted,
            &run.campaign_id,
            &run.id,
            &format!("{}:{}", run.role, run.stage),
        );
        Ok(())
    }

    async fn get_worker_run(&self, id: &str) -> Result<Versioned<WorkerRun>, StoreError> {
        self.inner.lock().unwrap().runs.get("worker_run", id)
    }

    async fn update_worker_run(
        &self,
        run: &WorkerRun,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let version = self.inner.lock().unwrap().runs.update(
            "worker_run",
            &run.id,
            run.clone(),
            expected_version,
        )?;
        let detail = run
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "running".to_string());
        self.publish(EventKind::WorkerRunFinalized, &run.campaign_id, &run.id, &detail);
        Ok(version)
    }

    async fn runs_for_campaign(&self, campaign_id: &str) -> Result<Vec<WorkerRun>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<WorkerRun> = inner
            .runs
            .records
            .values()
            .filter(|(_, r)| r.campaign_id == campaign_id)
            .map(|(_, r)| r.clone())
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn append_activity(&self, entry: ActivityEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.activity.push_back(entry);
        while inner.activity.len() > ACTIVITY_CAP {
            inner.activity.pop_front();
        }
        Ok(())
    }

    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.activity.iter().rev().take(limit).cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckpointLevel, CheckpointTarget, ObjectiveState, Stage, WorkerOutcome};
    use crate::policy::PolicySnapshot;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = store();
        let campaign = Campaign::new("goal", PolicySnapshot::default(), false);
        store.create_campaign(&campaign).await.unwrap();

        let loaded = store.get_campaign(&campaign.id).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.record.goal, "goal");
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = store();
        let campaign = Campaign::new("goal", PolicySnapshot::default(), false);
        store.create_campaign(&campaign).await.unwrap();
        let err = store.create_campaign(&campaign).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = store();
        let mut campaign = Campaign::new("goal", PolicySnapshot::default(), false);
        store.create_campaign(&campaign).await.unwrap();

        campaign.push_guidance("note");
        let v2 = store.update_campaign(&campaign, 1).await.unwrap();
        assert_eq!(v2, 2);

        // Re-submitting against the old version must fail.
        let err = store.update_campaign(&campaign, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn objectives_list_in_ordinal_order() {
        let store = store();
        for (ordinal, title) in [(2u32, "third"), (0, "first"), (1, "second")] {
            let obj = Objective::new("cmp_1", title, "", ordinal);
            store.create_objective(&obj).await.unwrap();
        }
        let listed = store.list_objectives("cmp_1").await.unwrap();
        let titles: Vec<&str> = listed.iter().map(|o| o.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn pending_checkpoints_excludes_resolved() {
        let store = store();
        let mut cp = Checkpoint::new(
            CheckpointTarget::Campaign {
                campaign_id: "cmp_1".into(),
            },
            "plan_approval",
            CheckpointLevel::Required,
            "payload",
        );
        store.create_checkpoint(&cp).await.unwrap();
        assert_eq!(store.pending_checkpoints().await.unwrap().len(), 1);

        cp.status = CheckpointStatus::Approved;
        store.update_checkpoint(&cp, 1).await.unwrap();
        assert!(store.pending_checkpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_are_published_on_writes() {
        let store = store();
        let mut rx = store.subscribe();

        let obj = Objective::new("cmp_1", "title", "", 0);
        store.create_objective(&obj).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ObjectiveCreated);
        assert_eq!(event.subject_id, obj.id);
        assert_eq!(event.detail, ObjectiveState::Created.to_string());
    }

    #[tokio::test]
    async fn runs_filter_by_campaign() {
        let store = store();
        let mut run_a = WorkerRun::new("cmp_a", None, Stage::Breakdown);
        store.create_worker_run(&run_a).await.unwrap();
        let run_b = WorkerRun::new("cmp_b", None, Stage::Breakdown);
        store.create_worker_run(&run_b).await.unwrap();

        run_a.finalize(WorkerOutcome::Success, None, vec![], None);
        store.update_worker_run(&run_a, 1).await.unwrap();

        let runs = store.runs_for_campaign("cmp_a").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Some(WorkerOutcome::Success));
    }

    #[tokio::test]
    async fn activity_trail_is_bounded() {
        let store = store();
        for i in 0..(ACTIVITY_CAP + 10) {
            store
                .append_activity(ActivityEntry::new("test", format!("entry {i}"), None))
                .await
                .unwrap();
        }
        let recent = store.recent_activity(ACTIVITY_CAP * 2).await.unwrap();
        assert_eq!(recent.len(), ACTIVITY_CAP);
        // Newest first.
        assert!(recent[0].message.ends_with(&format!("{}", ACTIVITY_CAP + 9)));
    }
}
