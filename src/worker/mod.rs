//! Worker lifecycle manager.
//!
//! One ephemeral execution unit per stage invocation: the manager creates
//! the `WorkerRun` record *before* spawning (so a restart can tell an
//! attempt was in flight), registers the unit in a live-handle table,
//! awaits a bounded result, and finalizes the record exactly once on every
//! exit path (success, worker-reported failure, timeout, or abort). The
//! executor future is dropped on timeout/abort, which tears the unit down
//! (executors are written drop-safe), and `abort_campaign` sweeps any
//! stragglers for a campaign.

pub mod process;

#[cfg(feature = "docker")]
pub mod docker;

pub use process::ProcessExecutor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::errors::WorkerError;
use crate::model::{Stage, WorkerOutcome, WorkerRun};
use crate::store::{ActivityEntry, StateStore};

/// Everything an execution unit needs for one stage invocation.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub run_id: String,
    pub role: crate::model::Role,
    pub stage: Stage,
    /// Role-specific standing instructions.
    pub instructions: String,
    /// Assembled stage context: goal, design edicts, feedback, memory.
    pub context: String,
    pub workspace: PathBuf,
    pub timeout: Duration,
}

/// Structured result reported by an execution unit.
///
/// `success: false` is a worker-reported failure (retryable); executors
/// return `Err` only for infrastructure problems like failing to spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Full captured output, for stage-outcome parsing.
    #[serde(default)]
    pub raw_output: String,
}

/// The single integration point used to "execute a stage": given a spec,
/// run an ephemeral unit to completion and return its structured result.
/// Implementations must tear the unit down when their future is dropped.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    async fn execute(&self, spec: &WorkerSpec) -> Result<WorkerOutput, WorkerError>;
}

struct LiveEntry {
    campaign_id: String,
    objective_id: Option<String>,
    abort: Option<oneshot::Sender<()>>,
}

/// A finalized invocation: the persisted run record plus, when the unit
/// completed, its structured output.
#[derive(Debug)]
pub struct Invocation {
    pub run: WorkerRun,
    pub output: Option<WorkerOutput>,
}

pub struct WorkerLifecycle {
    store: Arc<dyn StateStore>,
    executor: Arc<dyn WorkerExecutor>,
    live: Arc<Mutex<HashMap<String, LiveEntry>>>,
}

/// Removes the run from the live table on every exit path.
struct LiveGuard {
    live: Arc<Mutex<HashMap<String, LiveEntry>>>,
    run_id: String,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.lock().unwrap().remove(&self.run_id);
    }
}

impl WorkerLifecycle {
    pub fn new(store: Arc<dyn StateStore>, executor: Arc<dyn WorkerExecutor>) -> Self {
        Self {
            store,
            executor,
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one stage invocation to a finalized `WorkerRun`.
    ///
    /// Enforces at most one live unit per objective and per campaign (the
    /// shared workspace is single-writer). Returns `Err` only for
    /// infrastructure failures; worker-reported failures and timeouts come
    /// back as finalized runs.
    pub async fn invoke(
        &self,
        campaign_id: &str,
        objective_id: Option<&str>,
        stage: Stage,
        instructions: &str,
        context: &str,
        workspace: PathBuf,
        timeout: Duration,
    ) -> Result<Invocation, WorkerError> {
        let mut run = WorkerRun::new(campaign_id, objective_id, stage);
        let (abort_tx, mut abort_rx) = oneshot::channel();

        {
            let mut live = self.live.lock().unwrap();
            for entry in live.values() {
                if entry.campaign_id != campaign_id {
                    continue;
                }
                if entry.objective_id.as_deref() == objective_id && objective_id.is_some() {
                    return Err(WorkerError::ObjectiveBusy {
                        objective_id: objective_id.unwrap_or_default().to_string(),
                    });
                }
                return Err(WorkerError::CampaignBusy {
                    campaign_id: campaign_id.to_string(),
                });
            }
            live.insert(
                run.id.clone(),
                LiveEntry {
                    campaign_id: campaign_id.to_string(),
                    objective_id: objective_id.map(str::to_string),
                    abort: Some(abort_tx),
                },
            );
        }
        let _guard = LiveGuard {
            live: self.live.clone(),
            run_id: run.id.clone(),
        };

        // Persist the run before spawning: a restart finding a
        // non-finalized run knows this attempt was in flight.
        self.store.create_worker_run(&run).await?;
        info!(run = %run.id, role = %run.role, %stage, "worker run starting");

        let spec = WorkerSpec {
            run_id: run.id.clone(),
            role: run.role,
            stage,
            instructions: instructions.to_string(),
            context: context.to_string(),
            workspace,
            timeout,
        };

        let exec = self.executor.execute(&spec);
        tokio::pin!(exec);

        enum Settled {
            Finished(WorkerOutput),
            Spawn(WorkerError),
            TimedOut,
            Aborted,
        }

        let settled = tokio::select! {
            res = tokio::time::timeout(timeout, &mut exec) => match res {
                Ok(Ok(output)) => Settled::Finished(output),
                Ok(Err(e)) => Settled::Spawn(e),
                Err(_) => Settled::TimedOut,
            },
            _ = &mut abort_rx => Settled::Aborted,
        };
        // Dropping `exec` (timeout/abort arms) tears the unit down.

        let output = match settled {
            Settled::Finished(output) => {
                let outcome = if output.success {
                    WorkerOutcome::Success
                } else {
                    WorkerOutcome::Failure
                };
                run.finalize(
                    outcome,
                    Some(output.summary.clone()),
                    output.artifacts.clone(),
                    output.error.clone(),
                );
                Some(output)
            }
            Settled::Spawn(e) => {
                run.finalize(WorkerOutcome::Failure, None, vec![], Some(e.to_string()));
                self.finalize_record(&run).await?;
                warn!(run = %run.id, error = %e, "worker spawn failed");
                return Err(e);
            }
            Settled::TimedOut => {
                warn!(run = %run.id, ?timeout, "worker run exceeded its deadline, torn down");
                run.finalize(
                    WorkerOutcome::Timeout,
                    None,
                    vec![],
                    Some(format!("exceeded {}s deadline", timeout.as_secs())),
                );
                None
            }
            Settled::Aborted => {
                warn!(run = %run.id, "worker run aborted");
                run.finalize(WorkerOutcome::Failure, None, vec![], Some("aborted".into()));
                None
            }
        };

        self.finalize_record(&run).await?;
        Ok(Invocation { run, output })
    }

    async fn finalize_record(&self, run: &WorkerRun) -> Result<(), WorkerError> {
        // The manager is the only writer of run records; version 1 is the
        // create we just did.
        self.store.update_worker_run(run, 1).await?;
        self.store
            .append_activity(ActivityEntry::new(
                "worker",
                format!(
                    "run {} ({} {}) finalized: {}",
                    run.id,
                    run.role,
                    run.stage,
                    run.outcome.map(|o| o.to_string()).unwrap_or_default()
                ),
                Some(&run.campaign_id),
            ))
            .await?;
        Ok(())
    }

    /// Abort sweep: signal every live unit belonging to the campaign.
    /// Their `invoke` calls finalize the runs as aborted failures.
    pub fn abort_campaign(&self, campaign_id: &str) -> usize {
        let mut live = self.live.lock().unwrap();
        let mut aborted = 0;
        for entry in live.values_mut() {
            if entry.campaign_id == campaign_id
                && let Some(abort) = entry.abort.take()
            {
                let _ = abort.send(());
                aborted += 1;
            }
        }
        aborted
    }

    /// Ids of currently live runs, for the status interface.
    pub fn live_runs(&self) -> Vec<String> {
        self.live.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Executor scripted for tests: optionally blocks until released, and
    /// records whether it was torn down before completing.
    struct BlockingExecutor {
        release: Notify,
        completed: AtomicBool,
        torn_down: AtomicBool,
        output: WorkerOutput,
    }

    struct TeardownFlag<'a>(&'a AtomicBool, &'a AtomicBool);

    impl Drop for TeardownFlag<'_> {
        fn drop(&mut self) {
            if !self.1.load(Ordering::SeqCst) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
    }

    impl BlockingExecutor {
        fn new(block: bool, success: bool) -> Self {
            let release = Notify::new();
            if !block {
                release.notify_one();
            }
            Self {
                release,
                completed: AtomicBool::new(false),
                torn_down: AtomicBool::new(false),
                output: WorkerOutput {
                    success,
                    summary: "scripted".into(),
                    artifacts: vec!["src/lib.rs".into()],
                    error: if success { None } else { Some("boom".into()) },
                    raw_output: String::new(),
                },
            }
        }
    }

    #[async_trait]
    impl WorkerExecutor for BlockingExecutor {
        async fn execute(&self, _spec: &WorkerSpec) -> Result<WorkerOutput, WorkerError> {
            let _flag = TeardownFlag(&self.torn_down, &self.completed);
            self.release.notified().await;
            self.completed.store(true, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct FailingSpawn;

    #[async_trait]
    impl WorkerExecutor for FailingSpawn {
        async fn execute(&self, spec: &WorkerSpec) -> Result<WorkerOutput, WorkerError> {
            Err(WorkerError::SpawnFailed {
                role: spec.role.to_string(),
                reason: "image not found".into(),
            })
        }
    }

    fn lifecycle(executor: Arc<dyn WorkerExecutor>) -> (WorkerLifecycle, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (WorkerLifecycle::new(store.clone(), executor), store)
    }

    #[tokio::test]
    async fn success_finalizes_run_with_artifacts() {
        let (manager, store) = lifecycle(Arc::new(BlockingExecutor::new(false, true)));
        let invocation = manager
            .invoke(
                "cmp_1",
                Some("obj_1"),
                Stage::Execute,
                "build it",
                "context",
                PathBuf::from("/tmp/ws"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(invocation.run.outcome, Some(WorkerOutcome::Success));
        assert_eq!(invocation.run.artifacts, vec!["src/lib.rs".to_string()]);
        assert!(invocation.output.is_some());
        assert!(manager.live_runs().is_empty());

        let stored = store.get_worker_run(&invocation.run.id).await.unwrap();
        assert!(stored.record.is_finalized());
    }

    #[tokio::test]
    async fn worker_reported_failure_is_a_failure_outcome() {
        let (manager, _) = lifecycle(Arc::new(BlockingExecutor::new(false, false)));
        let invocation = manager
            .invoke(
                "cmp_1",
                Some("obj_1"),
                Stage::Execute,
                "build it",
                "",
                PathBuf::from("/tmp/ws"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(invocation.run.outcome, Some(WorkerOutcome::Failure));
        assert_eq!(invocation.run.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn timeout_finalizes_and_tears_down() {
        let executor = Arc::new(BlockingExecutor::new(true, true));
        let (manager, store) = lifecycle(executor.clone());
        let invocation = manager
            .invoke(
                "cmp_1",
                Some("obj_1"),
                Stage::Execute,
                "build it",
                "",
                PathBuf::from("/tmp/ws"),
                Duration::from_millis(30),
            )
            .await
            .unwrap();

        assert_eq!(invocation.run.outcome, Some(WorkerOutcome::Timeout));
        assert!(invocation.output.is_none());
        // The executor future was dropped before completing.
        assert!(executor.torn_down.load(Ordering::SeqCst));
        assert!(!executor.completed.load(Ordering::SeqCst));

        let stored = store.get_worker_run(&invocation.run.id).await.unwrap();
        assert_eq!(stored.record.outcome, Some(WorkerOutcome::Timeout));
    }

    #[tokio::test]
    async fn second_invoke_for_same_objective_is_rejected() {
        let executor = Arc::new(BlockingExecutor::new(true, true));
        let (manager, _) = lifecycle(executor.clone());
        let manager = Arc::new(manager);

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .invoke(
                        "cmp_1",
                        Some("obj_1"),
                        Stage::Execute,
                        "",
                        "",
                        PathBuf::from("/tmp/ws"),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        // Let the first invocation register itself.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = manager
            .invoke(
                "cmp_1",
                Some("obj_1"),
                Stage::Execute,
                "",
                "",
                PathBuf::from("/tmp/ws"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ObjectiveBusy { .. }));

        // A different campaign is unaffected.
        let other = manager
            .invoke(
                "cmp_2",
                Some("obj_9"),
                Stage::Execute,
                "",
                "",
                PathBuf::from("/tmp/ws"),
                Duration::from_millis(30),
            )
            .await
            .unwrap();
        assert_eq!(other.run.campaign_id, "cmp_2");

        executor.release.notify_one();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn abort_sweep_finalizes_live_runs_as_aborted() {
        let executor = Arc::new(BlockingExecutor::new(true, true));
        let (manager, _) = lifecycle(executor.clone());
        let manager = Arc::new(manager);

        let running = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .invoke(
                        "cmp_1",
                        Some("obj_1"),
                        Stage::Execute,
                        "",
                        "",
                        PathBuf::from("/tmp/ws"),
                        Duration::from_secs(30),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.abort_campaign("cmp_1"), 1);
        let invocation = running.await.unwrap().unwrap();
        assert_eq!(invocation.run.outcome, Some(WorkerOutcome::Failure));
        assert_eq!(invocation.run.error.as_deref(), Some("aborted"));
        assert!(executor.torn_down.load(Ordering::SeqCst));
        assert!(manager.live_runs().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_propagates_and_finalizes() {
        let (manager, store) = lifecycle(Arc::new(FailingSpawn));
        let err = manager
            .invoke(
                "cmp_1",
                None,
                Stage::Breakdown,
                "",
                "",
                PathBuf::from("/tmp/ws"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::SpawnFailed { .. }));

        // The run record still exists, finalized as a failure.
        let runs = store.runs_for_campaign("cmp_1").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Some(WorkerOutcome::Failure));
    }
}
