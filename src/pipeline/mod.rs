//! Pipeline coordinator: the campaign state machine.
//!
//! One sequential loop per campaign drives Breakdown (planner) → optional
//! Design (architect), each gated before any objective starts, then each
//! objective in ordinal order through Execute (implementer) → optional
//! Review (reviewer) → optional Test (verifier). Review rejection and test
//! failure each grant one re-execution before escalating to a required
//! checkpoint; a test-failure retry re-enters Review first, because the
//! code changed.
//!
//! Every transition is committed to the state store before the next stage
//! is scheduled, so a restarted coordinator resumes from the persisted
//! position without duplicating a stage invocation: the per-objective loop
//! is driven purely by the stored objective state.

pub mod context;
pub mod outcome;

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::errors::{PipelineError, WorkerError};
use crate::gate::{CheckpointGate, Decision};
use crate::memory_gateway::{MemoryGateway, namespace};
use crate::model::checkpoint::trigger;
use crate::model::{
    Campaign, CampaignStatus, Checkpoint, CheckpointLevel, CheckpointTarget, Objective,
    ObjectiveState, Stage, WorkerOutcome, WorkerRun,
};
use crate::settings::Settings;
use crate::store::{
    ActivityEntry, StateEvent, StateStore, Versioned, modify_campaign, modify_objective,
};
use crate::worker::{Invocation, WorkerExecutor, WorkerLifecycle};
use context::{ContextBuilder, role_instructions};
use outcome::{
    DesignEdict, design_payload, parse_breakdown, parse_design, parse_review, parse_test_report,
    plan_payload,
};

/// Read-only snapshot for the status interface.
pub struct StatusReport {
    pub campaign: Campaign,
    pub objectives: Vec<Objective>,
    pub pending_checkpoints: Vec<Checkpoint>,
    pub runs: Vec<WorkerRun>,
}

pub struct Coordinator {
    store: Arc<dyn StateStore>,
    gate: CheckpointGate,
    workers: Arc<WorkerLifecycle>,
    memory: Arc<dyn MemoryGateway>,
    settings: Settings,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        executor: Arc<dyn WorkerExecutor>,
        memory: Arc<dyn MemoryGateway>,
        settings: Settings,
    ) -> Self {
        Self {
            gate: CheckpointGate::new(store.clone()),
            workers: Arc::new(WorkerLifecycle::new(store.clone(), executor)),
            store,
            memory,
            settings,
        }
    }

    /// Submission interface: create a campaign with a policy snapshot
    /// compiled from the current settings. `direct` bypasses Breakdown
    /// and Design entirely.
    pub async fn submit(&self, goal: &str, direct: bool) -> Result<Campaign, PipelineError> {
        let policy = self.settings.policy();
        policy.validate()?;
        let campaign = Campaign::new(goal, policy, direct);
        self.store.create_campaign(&campaign).await?;
        self.store
            .append_activity(ActivityEntry::new(
                "coordinator",
                format!("campaign {} submitted (direct={direct})", campaign.id),
                Some(&campaign.id),
            ))
            .await?;
        info!(campaign = %campaign.id, direct, "campaign submitted");
        Ok(campaign)
    }

    /// Drive a campaign to a terminal status. Safe to call again after a
    /// process restart: the loop picks up from the persisted state.
    pub async fn run(&self, campaign_id: &str) -> Result<CampaignStatus, PipelineError> {
        self.reap_orphaned_runs(campaign_id).await?;
        match self.drive(campaign_id).await {
            Ok(status) => Ok(status),
            Err(PipelineError::Aborted { .. }) => {
                // The campaign went terminal underneath the loop; report
                // whatever actually stuck (aborted or failed).
                Ok(self.store.get_campaign(campaign_id).await?.record.status)
            }
            Err(e) => {
                error!(campaign = %campaign_id, error = %e, "campaign failed");
                // Infrastructure failure: the campaign is FAILED, distinct
                // from any individual objective's status.
                let _ = modify_campaign(self.store.as_ref(), campaign_id, |c| {
                    if !c.status.is_terminal() {
                        c.status = CampaignStatus::Failed;
                    }
                    Ok(())
                })
                .await;
                Err(e)
            }
        }
    }

    /// Resume every non-terminal campaign, concurrently.
    pub async fn resume_all(&self) -> Result<Vec<(String, CampaignStatus)>, PipelineError> {
        let active: Vec<String> = self
            .store
            .list_campaigns()
            .await?
            .into_iter()
            .filter(|c| !c.status.is_terminal())
            .map(|c| c.id)
            .collect();
        let results = join_all(active.iter().map(|id| self.run(id))).await;
        Ok(active
            .into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.ok().map(|status| (id, status)))
            .collect())
    }

    /// Abort a campaign: forcibly reject its pending checkpoints and tear
    /// down any live worker, then mark it ABORTED.
    pub async fn abort(&self, campaign_id: &str) -> Result<(), PipelineError> {
        modify_campaign(self.store.as_ref(), campaign_id, |c| {
            if !c.status.is_terminal() {
                c.status = CampaignStatus::Aborted;
            }
            Ok(())
        })
        .await?;
        self.gate
            .reject_pending_for_campaign(campaign_id, "campaign aborted")
            .await?;
        let torn_down = self.workers.abort_campaign(campaign_id);
        self.store
            .append_activity(ActivityEntry::new(
                "coordinator",
                format!("campaign {campaign_id} aborted ({torn_down} live worker(s) torn down)"),
                Some(campaign_id),
            ))
            .await?;
        warn!(campaign = %campaign_id, torn_down, "campaign aborted");
        Ok(())
    }

    /// Checkpoint resolution interface.
    pub async fn resolve_checkpoint(
        &self,
        checkpoint_id: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> Result<Checkpoint, PipelineError> {
        Ok(self
            .gate
            .resolve(checkpoint_id, decision, feedback, "user")
            .await?)
    }

    /// Queue mid-campaign guidance; consumed at the next stage boundary.
    pub async fn guide(&self, campaign_id: &str, note: &str) -> Result<(), PipelineError> {
        modify_campaign(self.store.as_ref(), campaign_id, |c| {
            c.push_guidance(note);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Status interface: one consistent snapshot of a campaign.
    pub async fn status(&self, campaign_id: &str) -> Result<StatusReport, PipelineError> {
        let campaign = self.store.get_campaign(campaign_id).await?.record;
        let objectives = self.store.list_objectives(campaign_id).await?;
        let pending_checkpoints = self
            .store
            .pending_checkpoints()
            .await?
            .into_iter()
            .filter(|cp| cp.target.campaign_id() == campaign_id)
            .collect();
        let runs = self.store.runs_for_campaign(campaign_id).await?;
        Ok(StatusReport {
            campaign,
            objectives,
            pending_checkpoints,
            runs,
        })
    }

    /// Event feed for presentation layers.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StateEvent> {
        self.store.subscribe()
    }

    /// Run ids of currently live execution units in this process.
    pub fn live_workers(&self) -> Vec<String> {
        self.workers.live_runs()
    }

    // ------------------------------------------------------------------
    // Campaign loop
    // ------------------------------------------------------------------

    async fn drive(&self, campaign_id: &str) -> Result<CampaignStatus, PipelineError> {
        // Campaign-level stages first: Breakdown and Design, each gated
        // before any objective starts.
        loop {
            let campaign = self.load_active(campaign_id).await?;
            if campaign.direct {
                self.ensure_direct_objective(&campaign).await?;
                break;
            }
            if !self.ensure_breakdown(&campaign).await? {
                continue; // plan rejected, re-run with feedback
            }
            let campaign = self.load_active(campaign_id).await?;
            if campaign.policy.design_enabled && !self.ensure_design(&campaign).await? {
                continue; // design rejected, re-run with feedback
            }
            break;
        }

        // Objectives, strictly in ordinal order. The next objective cannot
        // start until the previous one is terminal. Only objectives on the
        // campaign's current list count; a rejected plan's objectives
        // stay on record but are superseded.
        loop {
            let campaign = self.load_active(campaign_id).await?;
            let objectives = self.store.list_objectives(campaign_id).await?;
            let next = campaign
                .objective_ids
                .iter()
                .filter_map(|id| objectives.iter().find(|o| &o.id == id))
                .find(|o| !o.is_terminal());
            match next {
                Some(objective) => {
                    let id = objective.id.clone();
                    self.run_objective(campaign_id, &id).await?;
                }
                None => break,
            }
        }

        // Deferred batch passes, if configured.
        self.run_batch_passes(campaign_id).await?;

        let campaign = modify_campaign(self.store.as_ref(), campaign_id, |c| {
            if !c.status.is_terminal() {
                c.status = CampaignStatus::Done;
            }
            Ok(())
        })
        .await?;
        info!(campaign = %campaign_id, status = %campaign.status, "campaign finished");
        Ok(campaign.status)
    }

    /// Load the campaign, failing with `Aborted` once it goes terminal;
    /// the loops re-check after every suspension point.
    async fn load_active(&self, campaign_id: &str) -> Result<Campaign, PipelineError> {
        let campaign = self.store.get_campaign(campaign_id).await?.record;
        match campaign.status {
            CampaignStatus::Active => Ok(campaign),
            _ => Err(PipelineError::Aborted {
                id: campaign_id.to_string(),
            }),
        }
    }

    /// Finalize worker runs left non-finalized by a dead process. The
    /// stage they belonged to is re-invoked as a fresh attempt; retry
    /// counters are not charged.
    async fn reap_orphaned_runs(&self, campaign_id: &str) -> Result<(), PipelineError> {
        let live = self.workers.live_runs();
        for run in self.store.runs_for_campaign(campaign_id).await? {
            if run.is_finalized() || live.contains(&run.id) {
                continue;
            }
            let Versioned {
                version,
                record: mut orphan,
            } = self.store.get_worker_run(&run.id).await?;
            orphan.finalize(
                WorkerOutcome::Timeout,
                None,
                vec![],
                Some("orphaned by restart".into()),
            );
            self.store.update_worker_run(&orphan, version).await?;
            warn!(run = %orphan.id, "finalized orphaned worker run");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Campaign-level stages
    // ------------------------------------------------------------------

    /// Latest checkpoint for a campaign-level trigger.
    async fn latest_campaign_checkpoint(
        &self,
        campaign_id: &str,
        for_trigger: &str,
    ) -> Result<Option<Checkpoint>, PipelineError> {
        Ok(self
            .store
            .checkpoints_for_campaign(campaign_id)
            .await?
            .into_iter()
            .filter(|cp| cp.trigger == for_trigger && cp.target.objective_id().is_none())
            .next_back())
    }

    /// Returns `Ok(true)` once the plan is approved; `Ok(false)` means the
    /// plan was rejected and Breakdown must re-run.
    async fn ensure_breakdown(&self, campaign: &Campaign) -> Result<bool, PipelineError> {
        let latest = self
            .latest_campaign_checkpoint(&campaign.id, trigger::PLAN_APPROVAL)
            .await?;
        let checkpoint = match latest {
            Some(cp) if cp.status.is_go() => return Ok(true),
            Some(cp) if cp.status.is_resolved() => {
                // Rejected: regenerate the plan with the resolver's
                // feedback, superseding the previous objectives.
                self.generate_plan(campaign, cp.feedback.as_deref()).await?
            }
            Some(cp) => cp, // pending from a previous process; wait on it
            None => self.generate_plan(campaign, None).await?,
        };
        let resolved = self
            .gate
            .await_resolution(&checkpoint.id, campaign.policy.optional_checkpoint_timeout())
            .await?;
        self.load_active(&campaign.id).await?;
        if resolved.status.is_go() {
            info!(campaign = %campaign.id, "plan approved");
            Ok(true)
        } else {
            info!(campaign = %campaign.id, "plan rejected, breakdown will re-run");
            Ok(false)
        }
    }

    /// Invoke the planner, carve out the objectives, and gate them behind
    /// a plan-approval checkpoint.
    async fn generate_plan(
        &self,
        campaign: &Campaign,
        feedback: Option<&str>,
    ) -> Result<Checkpoint, PipelineError> {
        let invocation = self
            .invoke_stage(campaign, None, Stage::Breakdown, feedback, &[])
            .await?;
        let raw = invocation
            .output
            .map(|o| o.raw_output)
            .unwrap_or_default();
        let plan = match invocation.run.outcome {
            Some(WorkerOutcome::Success) => parse_breakdown(&raw),
            _ => None,
        };
        let Some(plan) = plan else {
            return Err(PipelineError::Infrastructure(format!(
                "breakdown produced no usable plan for campaign {}",
                campaign.id
            )));
        };

        // Supersede objectives from a rejected previous plan.
        let previous = self.store.list_objectives(&campaign.id).await?;
        for old in previous.iter().filter(|o| !o.is_terminal()) {
            modify_objective(self.store.as_ref(), &old.id, |o| {
                o.record("superseded", "coordinator", Some("plan regenerated".into()));
                Ok(())
            })
            .await?;
        }

        let mut objective_ids = Vec::new();
        for (ordinal, planned) in plan.objectives.iter().enumerate() {
            let mut objective = Objective::new(
                &campaign.id,
                &planned.title,
                &planned.description,
                ordinal as u32,
            );
            objective.acceptance_criteria = planned.acceptance_criteria.clone();
            objective.transition(ObjectiveState::Planned, "planner", "carved out of plan")?;
            self.store.create_objective(&objective).await?;
            objective_ids.push(objective.id);
        }
        modify_campaign(self.store.as_ref(), &campaign.id, |c| {
            c.objective_ids = objective_ids.clone();
            c.stage_outputs.insert("breakdown".into(), raw.clone());
            Ok(())
        })
        .await?;

        let payload = plan_payload(&campaign.goal, &plan);
        Ok(self
            .gate
            .create(
                CheckpointTarget::Campaign {
                    campaign_id: campaign.id.clone(),
                },
                trigger::PLAN_APPROVAL,
                campaign.policy.approval_level,
                &payload,
            )
            .await?)
    }

    /// Returns `Ok(true)` once the design is approved; `Ok(false)` means
    /// it was rejected and the Design stage must re-run.
    async fn ensure_design(&self, campaign: &Campaign) -> Result<bool, PipelineError> {
        let latest = self
            .latest_campaign_checkpoint(&campaign.id, trigger::DESIGN_APPROVAL)
            .await?;
        let checkpoint = match latest {
            Some(cp) if cp.status.is_go() => return Ok(true),
            Some(cp) if cp.status.is_resolved() => {
                self.generate_design(campaign, cp.feedback.as_deref())
                    .await?
            }
            Some(cp) => cp,
            None => self.generate_design(campaign, None).await?,
        };
        let resolved = self
            .gate
            .await_resolution(&checkpoint.id, campaign.policy.optional_checkpoint_timeout())
            .await?;
        self.load_active(&campaign.id).await?;
        Ok(resolved.status.is_go())
    }

    async fn generate_design(
        &self,
        campaign: &Campaign,
        feedback: Option<&str>,
    ) -> Result<Checkpoint, PipelineError> {
        let invocation = self
            .invoke_stage(campaign, None, Stage::Design, feedback, &[])
            .await?;
        let raw = invocation
            .output
            .map(|o| o.raw_output)
            .unwrap_or_default();
        if invocation.run.outcome != Some(WorkerOutcome::Success) {
            return Err(PipelineError::Infrastructure(format!(
                "design stage failed for campaign {}",
                campaign.id
            )));
        }
        modify_campaign(self.store.as_ref(), &campaign.id, |c| {
            c.stage_outputs.insert("design".into(), raw.clone());
            Ok(())
        })
        .await?;

        let edict = parse_design(&raw).unwrap_or_default();
        Ok(self
            .gate
            .create(
                CheckpointTarget::Campaign {
                    campaign_id: campaign.id.clone(),
                },
                trigger::DESIGN_APPROVAL,
                campaign.policy.approval_level,
                &design_payload(&edict),
            )
            .await?)
    }

    /// Direct bypass: one objective, already ACTIVE, assigned to the
    /// implementer.
    async fn ensure_direct_objective(&self, campaign: &Campaign) -> Result<(), PipelineError> {
        if !campaign.objective_ids.is_empty() {
            return Ok(());
        }
        let title: String = campaign.goal.chars().take(80).collect();
        let mut objective = Objective::new(&campaign.id, &title, &campaign.goal, 0);
        objective.assignee = Some(Stage::Execute.role());
        objective.transition(ObjectiveState::Planned, "coordinator", "direct submission")?;
        objective.transition(ObjectiveState::Active, "coordinator", "direct submission")?;
        self.store.create_objective(&objective).await?;
        modify_campaign(self.store.as_ref(), &campaign.id, |c| {
            c.objective_ids = vec![objective.id.clone()];
            Ok(())
        })
        .await?;
        info!(campaign = %campaign.id, objective = %objective.id, "direct objective created");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Objective loop
    // ------------------------------------------------------------------

    /// Drive one objective to a terminal state. Every iteration re-reads
    /// the persisted state, so restarts and aborts converge here.
    async fn run_objective(
        &self,
        campaign_id: &str,
        objective_id: &str,
    ) -> Result<(), PipelineError> {
        loop {
            let campaign = self.load_active(campaign_id).await?;
            let objective = self.store.get_objective(objective_id).await?.record;

            match objective.state {
                ObjectiveState::Done => return Ok(()),
                ObjectiveState::Escalated => {
                    // An escalation checkpoint may still be pending (e.g.
                    // after a restart); campaign continuation hinges on it.
                    return self.await_escalation(&campaign, &objective).await;
                }
                ObjectiveState::Created => {
                    modify_objective(self.store.as_ref(), objective_id, |o| {
                        o.transition(ObjectiveState::Planned, "coordinator", "reached in sequence")
                    })
                    .await?;
                }
                ObjectiveState::Planned => {
                    modify_objective(self.store.as_ref(), objective_id, |o| {
                        o.assignee = Some(Stage::Execute.role());
                        o.transition(ObjectiveState::Active, "coordinator", "reached in sequence")
                    })
                    .await?;
                }
                ObjectiveState::Rejected => {
                    modify_objective(self.store.as_ref(), objective_id, |o| {
                        o.transition(ObjectiveState::Active, "coordinator", "re-execute after rework")
                    })
                    .await?;
                }
                ObjectiveState::Blocked => {
                    self.resume_blocked(&campaign, &objective).await?;
                }
                ObjectiveState::Active => {
                    self.execute_stage(&campaign, &objective).await?;
                }
                ObjectiveState::Review => {
                    self.review_stage(&campaign, &objective).await?;
                }
                ObjectiveState::Testing => {
                    self.test_stage(&campaign, &objective).await?;
                }
            }
        }
    }

    /// Execute stage: one implementer run, then route per the compiled
    /// stage list.
    async fn execute_stage(
        &self,
        campaign: &Campaign,
        objective: &Objective,
    ) -> Result<(), PipelineError> {
        let invocation = self
            .invoke_stage(
                campaign,
                Some(objective),
                Stage::Execute,
                objective.feedback.as_deref(),
                &[],
            )
            .await?;

        match invocation.run.outcome {
            Some(WorkerOutcome::Success) => {
                let output = invocation.output.unwrap_or(crate::worker::WorkerOutput {
                    success: true,
                    summary: String::new(),
                    artifacts: vec![],
                    error: None,
                    raw_output: String::new(),
                });
                let next = campaign.policy.state_after(Stage::Execute);
                let updated = modify_objective(self.store.as_ref(), &objective.id, |o| {
                    o.stage_outputs.insert("execute".into(), output.raw_output.clone());
                    for artifact in &output.artifacts {
                        if !o.artifacts.contains(artifact) {
                            o.artifacts.push(artifact.clone());
                        }
                    }
                    o.feedback = None;
                    o.transition(next, "implementer", output.summary.clone())
                })
                .await?;
                if updated.is_terminal() {
                    self.on_objective_terminal(&updated).await;
                }
                Ok(())
            }
            _ => {
                // WorkerFailure: one automatic re-execution, then escalate.
                let error = invocation
                    .run
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker failed".into());
                if objective.execute_retries < campaign.policy.retry_cap {
                    modify_objective(self.store.as_ref(), &objective.id, |o| {
                        o.execute_retries += 1;
                        o.feedback = Some(format!("Previous execution attempt failed: {error}"));
                        o.record("worker_failure", "worker", Some(error.clone()));
                        Ok(())
                    })
                    .await?;
                    warn!(objective = %objective.id, "execute failed, retrying");
                    Ok(())
                } else {
                    self.escalate(
                        campaign,
                        &objective.id,
                        Stage::Execute,
                        trigger::EXECUTE_ESCALATION,
                        &format!(
                            "Execution failed twice for '{}'.\n\nLast error: {error}",
                            objective.title
                        ),
                    )
                    .await
                }
            }
        }
    }

    /// Review stage: reviewer verdict routes to approve, rework, security
    /// checkpoint, or escalation.
    async fn review_stage(
        &self,
        campaign: &Campaign,
        objective: &Objective,
    ) -> Result<(), PipelineError> {
        let invocation = self
            .invoke_stage(campaign, Some(objective), Stage::Review, None, &objective.artifacts)
            .await?;
        let raw = invocation
            .output
            .as_ref()
            .map(|o| o.raw_output.clone())
            .unwrap_or_default();
        let verdict = parse_review(&raw);
        modify_objective(self.store.as_ref(), &objective.id, |o| {
            o.stage_outputs.insert("review".into(), raw.clone());
            Ok(())
        })
        .await?;

        // Security concerns force a checkpoint regardless of the verdict.
        if let Some(verdict) = verdict.as_ref().filter(|v| !v.security_concerns.is_empty()) {
            let payload = format!(
                "Reviewer flagged security concerns in '{}':\n\n{}",
                objective.title,
                verdict.payload_text()
            );
            modify_objective(self.store.as_ref(), &objective.id, |o| {
                o.transition(ObjectiveState::Blocked, "reviewer", "security concerns")
            })
            .await?;
            self.gate
                .create(
                    CheckpointTarget::Objective {
                        campaign_id: campaign.id.clone(),
                        objective_id: objective.id.clone(),
                        stage: Stage::Review,
                    },
                    trigger::SECURITY_REVIEW,
                    CheckpointLevel::Required,
                    &payload,
                )
                .await?;
            return Ok(());
        }

        let rejected = match (&verdict, invocation.run.outcome) {
            (Some(v), _) => !v.passed(),
            // No readable verdict: a unit that claims success is advisory
            // noise (treated as approval, the original behavior); a unit
            // that failed outright is a rejection with its error as the
            // finding.
            (None, Some(WorkerOutcome::Success)) => false,
            (None, _) => true,
        };

        if !rejected {
            let next = campaign.policy.state_after(Stage::Review);
            let updated = modify_objective(self.store.as_ref(), &objective.id, |o| {
                o.transition(next, "reviewer", "review passed")
            })
            .await?;
            if updated.is_terminal() {
                self.on_objective_terminal(&updated).await;
            }
            return Ok(());
        }

        let feedback = verdict
            .as_ref()
            .map(|v| v.feedback_text())
            .unwrap_or_else(|| {
                format!(
                    "Review run failed: {}",
                    invocation.run.error.clone().unwrap_or_default()
                )
            });
        let attempt = objective.review_retries + 1;
        if objective.review_retries < campaign.policy.retry_cap {
            modify_objective(self.store.as_ref(), &objective.id, |o| {
                o.review_retries += 1;
                o.feedback = Some(feedback.clone());
                o.stage_outputs
                    .insert(format!("review_failure_{attempt}"), feedback.clone());
                o.transition(
                    ObjectiveState::Rejected,
                    "reviewer",
                    format!("rejected (retry {attempt}/{})", campaign.policy.retry_cap),
                )
            })
            .await?;
            info!(objective = %objective.id, attempt, "review rejected, re-executing");
            Ok(())
        } else {
            let payload = format!(
                "Review rejected '{}' after {} re-execution(s).\n\n{}",
                objective.title, campaign.policy.retry_cap, feedback
            );
            self.escalate(
                campaign,
                &objective.id,
                Stage::Review,
                trigger::REVIEW_ESCALATION,
                &payload,
            )
            .await
        }
    }

    /// Test stage: verifier report routes to done, rework, or escalation.
    /// A rework re-enters Review before Testing: no stage is skipped on
    /// retry.
    async fn test_stage(
        &self,
        campaign: &Campaign,
        objective: &Objective,
    ) -> Result<(), PipelineError> {
        let invocation = self
            .invoke_stage(campaign, Some(objective), Stage::Test, None, &objective.artifacts)
            .await?;
        let raw = invocation
            .output
            .as_ref()
            .map(|o| o.raw_output.clone())
            .unwrap_or_default();
        let report = parse_test_report(&raw);
        modify_objective(self.store.as_ref(), &objective.id, |o| {
            o.stage_outputs.insert("test".into(), raw.clone());
            Ok(())
        })
        .await?;

        let failed = match (&report, invocation.run.outcome) {
            (Some(r), _) => !r.passed(),
            (None, Some(WorkerOutcome::Success)) => false,
            (None, _) => true,
        };

        if !failed {
            let updated = modify_objective(self.store.as_ref(), &objective.id, |o| {
                o.transition(ObjectiveState::Done, "verifier", "tests passed")
            })
            .await?;
            self.on_objective_terminal(&updated).await;
            return Ok(());
        }

        let feedback = report
            .as_ref()
            .map(|r| r.feedback_text())
            .unwrap_or_else(|| {
                format!(
                    "Test run failed: {}",
                    invocation.run.error.clone().unwrap_or_default()
                )
            });
        let attempt = objective.test_retries + 1;
        if objective.test_retries < campaign.policy.retry_cap {
            modify_objective(self.store.as_ref(), &objective.id, |o| {
                o.test_retries += 1;
                o.feedback = Some(feedback.clone());
                o.stage_outputs
                    .insert(format!("test_failure_{attempt}"), feedback.clone());
                o.transition(
                    ObjectiveState::Rejected,
                    "verifier",
                    format!("tests failed (retry {attempt}/{})", campaign.policy.retry_cap),
                )
            })
            .await?;
            info!(objective = %objective.id, attempt, "tests failed, re-executing");
            Ok(())
        } else {
            // Second consecutive failure: escalate with every failure
            // report collected so far.
            let mut payload = format!(
                "Tests failed twice for '{}'; no further automatic retries.\n",
                objective.title
            );
            for (key, report) in objective
                .stage_outputs
                .iter()
                .filter(|(k, _)| k.starts_with("test_failure_"))
            {
                payload.push_str(&format!("\n--- {key} ---\n{report}\n"));
            }
            payload.push_str(&format!("\n--- final failure ---\n{feedback}\n"));
            self.escalate(
                campaign,
                &objective.id,
                Stage::Test,
                trigger::TEST_ESCALATION,
                &payload,
            )
            .await
        }
    }

    /// Blocked objective: wait on its checkpoint and route the decision.
    async fn resume_blocked(
        &self,
        campaign: &Campaign,
        objective: &Objective,
    ) -> Result<(), PipelineError> {
        let latest = self
            .store
            .checkpoints_for_campaign(&campaign.id)
            .await?
            .into_iter()
            .filter(|cp| cp.target.objective_id() == Some(objective.id.as_str()))
            .next_back();
        let Some(checkpoint) = latest else {
            // No checkpoint on record: unblock back to where it was.
            let back = objective.resume_state.unwrap_or(ObjectiveState::Active);
            modify_objective(self.store.as_ref(), &objective.id, |o| {
                o.transition(back, "coordinator", "no checkpoint pending, resuming")
            })
            .await?;
            return Ok(());
        };

        let resolved = if checkpoint.status.is_resolved() {
            checkpoint
        } else {
            self.gate
                .await_resolution(&checkpoint.id, campaign.policy.optional_checkpoint_timeout())
                .await?
        };
        self.load_active(&campaign.id).await?;

        if resolved.status.is_go() {
            // Security approvals proceed past Review; everything else
            // resumes the suspended state.
            let next = if resolved.trigger == trigger::SECURITY_REVIEW {
                campaign.policy.state_after(Stage::Review)
            } else {
                objective.resume_state.unwrap_or(ObjectiveState::Active)
            };
            let updated = modify_objective(self.store.as_ref(), &objective.id, |o| {
                o.transition(next, "user", format!("checkpoint {} approved", resolved.id))
            })
            .await?;
            if updated.is_terminal() {
                self.on_objective_terminal(&updated).await;
            }
        } else {
            let updated = modify_objective(self.store.as_ref(), &objective.id, |o| {
                o.feedback = resolved.feedback.clone().or(o.feedback.take());
                o.transition(
                    ObjectiveState::Escalated,
                    "user",
                    format!("checkpoint {} rejected", resolved.id),
                )
            })
            .await?;
            self.on_objective_terminal(&updated).await;
        }
        Ok(())
    }

    /// Escalation: terminal for the objective; a required checkpoint
    /// decides whether the campaign continues past it.
    async fn escalate(
        &self,
        campaign: &Campaign,
        objective_id: &str,
        stage: Stage,
        escalation_trigger: &str,
        payload: &str,
    ) -> Result<(), PipelineError> {
        let updated = modify_objective(self.store.as_ref(), objective_id, |o| {
            o.transition(
                ObjectiveState::Escalated,
                "coordinator",
                format!("{stage} retries exhausted"),
            )
        })
        .await?;
        self.on_objective_terminal(&updated).await;
        self.gate
            .create(
                CheckpointTarget::Objective {
                    campaign_id: campaign.id.clone(),
                    objective_id: objective_id.to_string(),
                    stage,
                },
                escalation_trigger,
                CheckpointLevel::Required,
                payload,
            )
            .await?;
        warn!(objective = %objective_id, %stage, "objective escalated");
        self.await_escalation(campaign, &updated).await
    }

    /// Wait out a pending escalation checkpoint: approval accepts the
    /// work as-is and the campaign continues; rejection aborts the
    /// campaign.
    async fn await_escalation(
        &self,
        campaign: &Campaign,
        objective: &Objective,
    ) -> Result<(), PipelineError> {
        let pending = self
            .store
            .pending_checkpoints()
            .await?
            .into_iter()
            .find(|cp| cp.target.objective_id() == Some(objective.id.as_str()));
        let Some(checkpoint) = pending else {
            return Ok(()); // already decided in a previous session
        };
        let resolved = self
            .gate
            .await_resolution(&checkpoint.id, campaign.policy.optional_checkpoint_timeout())
            .await?;
        if resolved.status.is_go() {
            self.store
                .append_activity(ActivityEntry::new(
                    "user",
                    format!(
                        "escalation on {} accepted, campaign continues",
                        objective.id
                    ),
                    Some(&campaign.id),
                ))
                .await?;
            Ok(())
        } else {
            self.abort(&campaign.id).await?;
            Err(PipelineError::Aborted {
                id: campaign.id.clone(),
            })
        }
    }

    // ------------------------------------------------------------------
    // Deferred batch passes (per_campaign mode)
    // ------------------------------------------------------------------

    /// Batch Review/Test over the accumulated artifacts. Findings are
    /// flagged and escalate through a checkpoint; objectives already DONE
    /// are never reopened.
    async fn run_batch_passes(&self, campaign_id: &str) -> Result<(), PipelineError> {
        let campaign = self.load_active(campaign_id).await?;
        if campaign.policy.review.per_campaign() {
            self.batch_pass(&campaign, Stage::Review, trigger::BATCH_REVIEW)
                .await?;
        }
        let campaign = self.load_active(campaign_id).await?;
        if campaign.policy.test.per_campaign() {
            self.batch_pass(&campaign, Stage::Test, trigger::BATCH_TEST)
                .await?;
        }
        Ok(())
    }

    async fn batch_pass(
        &self,
        campaign: &Campaign,
        stage: Stage,
        batch_trigger: &str,
    ) -> Result<(), PipelineError> {
        // A pending batch checkpoint from a previous session comes first.
        if let Some(pending) = self
            .latest_campaign_checkpoint(&campaign.id, batch_trigger)
            .await?
        {
            let resolved = if pending.status.is_resolved() {
                pending
            } else {
                self.gate
                    .await_resolution(&pending.id, campaign.policy.optional_checkpoint_timeout())
                    .await?
            };
            return self.settle_batch(campaign, resolved).await;
        }
        let marker = format!("batch_{stage}");
        if campaign.stage_outputs.contains_key(&marker) {
            return Ok(()); // already ran and passed
        }

        let objectives = self.store.list_objectives(&campaign.id).await?;
        let artifacts: Vec<String> = campaign
            .objective_ids
            .iter()
            .filter_map(|id| objectives.iter().find(|o| &o.id == id))
            .flat_map(|o| o.artifacts.clone())
            .collect();
        let invocation = self
            .invoke_stage(campaign, None, stage, None, &artifacts)
            .await?;
        let raw = invocation
            .output
            .as_ref()
            .map(|o| o.raw_output.clone())
            .unwrap_or_default();
        modify_campaign(self.store.as_ref(), &campaign.id, |c| {
            c.stage_outputs.insert(marker.clone(), raw.clone());
            Ok(())
        })
        .await?;

        let failure = match stage {
            Stage::Review => parse_review(&raw)
                .filter(|v| !v.passed() || !v.security_concerns.is_empty())
                .map(|v| v.payload_text()),
            Stage::Test => parse_test_report(&raw)
                .filter(|r| !r.passed())
                .map(|r| r.feedback_text()),
            _ => None,
        }
        .or_else(|| match invocation.run.outcome {
            Some(WorkerOutcome::Success) => None,
            _ => Some(format!(
                "batch {stage} run failed: {}",
                invocation.run.error.clone().unwrap_or_default()
            )),
        });

        let Some(failure) = failure else {
            info!(campaign = %campaign.id, %stage, "batch pass clean");
            return Ok(());
        };

        // Flag-only: record and escalate, never reopen DONE objectives.
        let checkpoint = self
            .gate
            .create(
                CheckpointTarget::Campaign {
                    campaign_id: campaign.id.clone(),
                },
                batch_trigger,
                CheckpointLevel::Required,
                &format!(
                    "Campaign-wide {stage} pass reported problems. Completed \
                     objectives are not reopened.\n\n{failure}"
                ),
            )
            .await?;
        let resolved = self
            .gate
            .await_resolution(&checkpoint.id, campaign.policy.optional_checkpoint_timeout())
            .await?;
        self.settle_batch(campaign, resolved).await
    }

    async fn settle_batch(
        &self,
        campaign: &Campaign,
        resolved: Checkpoint,
    ) -> Result<(), PipelineError> {
        if resolved.status.is_go() {
            return Ok(());
        }
        // The operator found the flagged result unacceptable.
        modify_campaign(self.store.as_ref(), &campaign.id, |c| {
            if !c.status.is_terminal() {
                c.status = CampaignStatus::Failed;
            }
            Ok(())
        })
        .await?;
        Err(PipelineError::Aborted {
            id: campaign.id.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Stage invocation plumbing
    // ------------------------------------------------------------------

    /// Compose context, consult memory, and run one worker invocation.
    async fn invoke_stage(
        &self,
        campaign: &Campaign,
        objective: Option<&Objective>,
        stage: Stage,
        feedback: Option<&str>,
        artifacts: &[String],
    ) -> Result<Invocation, PipelineError> {
        let role = stage.role();
        // Guidance queued since the last stage boundary rides along in
        // this stage's context, exactly once.
        let mut fresh_guidance = Vec::new();
        modify_campaign(self.store.as_ref(), &campaign.id, |c| {
            fresh_guidance = c.drain_guidance();
            Ok(())
        })
        .await?;

        let query = objective
            .map(|o| format!("{}: {}", campaign.goal, o.title))
            .unwrap_or_else(|| campaign.goal.clone());
        let namespaces = vec![
            namespace::campaign(&campaign.id),
            namespace::project(&self.project_name()),
            namespace::global(),
        ];
        let facts = match self
            .memory
            .search(&query, &namespaces, self.settings.memory.search_limit)
            .await
        {
            Ok(facts) => facts,
            Err(e) => {
                warn!(error = %e, "memory search failed, continuing without excerpts");
                Vec::new()
            }
        };

        let edict: Option<DesignEdict> = campaign
            .stage_outputs
            .get("design")
            .and_then(|raw| parse_design(raw));
        let mut builder = ContextBuilder::new(&campaign.goal);
        if let Some(objective) = objective {
            builder = builder.objective(objective);
        }
        let context = builder
            .design(edict.as_ref())
            .feedback(feedback)
            .guidance(&fresh_guidance)
            .memory(&facts)
            .artifacts(artifacts)
            .build();

        let invocation = self
            .workers
            .invoke(
                &campaign.id,
                objective.map(|o| o.id.as_str()),
                stage,
                role_instructions(role),
                &context,
                self.settings.worker.workspace.clone(),
                campaign.policy.timeout_for(role),
            )
            .await;
        match invocation {
            Ok(invocation) => Ok(invocation),
            Err(e @ WorkerError::SpawnFailed { .. }) => Err(PipelineError::Infrastructure(
                format!("cannot spawn worker: {e}"),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn project_name(&self) -> String {
        self.settings
            .worker
            .workspace
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace")
            .to_string()
    }

    /// Persist a fact about a finished objective for later campaigns.
    async fn on_objective_terminal(&self, objective: &Objective) {
        let summary = objective
            .history
            .last()
            .and_then(|e| e.detail.clone())
            .unwrap_or_default();
        let fact = format!(
            "Objective '{}' finished {}: {}",
            objective.title, objective.state, summary
        );
        if let Err(e) = self
            .memory
            .store(
                &fact,
                &namespace::project(&self.project_name()),
                serde_json::json!({
                    "campaign_id": objective.campaign_id,
                    "objective_id": objective.id,
                    "state": objective.state.to_string(),
                }),
            )
            .await
        {
            warn!(error = %e, objective = %objective.id, "memory store failed");
        }
    }
}
