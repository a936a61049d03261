//! Patch plan approval, execution, and rollback.
//!
//! Request-side operations validate and enqueue; worker-side operations
//! ([`PatchWorkflow::execute_run`], [`PatchWorkflow::rollback`]) are invoked
//! by the `patch-exec` handler and may run more than once per job.
//!
//! Every run status change goes through the store's compare-and-set, so a
//! rollback racing an execution never has its terminal state overwritten.
//! The change is published before the next one is attempted, so
//! `patch_run_update` events for a run arrive in the order they were stored.

use chrono::Utc;
use notify::{Notifier, NotifyEvent};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::executor::StepExecutor;
use super::types::{
    ApprovalDecision, ApprovalStatus, NewPlan, PatchPlan, PatchRun, PlanId, RunId, RunStatus,
    RunUpdate,
};
use crate::error::{OpsError, OpsResult};
use crate::jobs::JobPayload;
use crate::queue::{JobId, JobQueue};
use crate::store::Store;

/// Policy knobs for the patch workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkflowPolicy {
    /// Allow runs of plans that are still PENDING approval
    pub auto_execute: bool,
}

/// Drives plans and runs through their state machines.
pub struct PatchWorkflow {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    executor: Arc<dyn StepExecutor>,
    policy: WorkflowPolicy,
    /// Held across a status write and its event
    transitions: Mutex<()>,
}

impl PatchWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        executor: Arc<dyn StepExecutor>,
        policy: WorkflowPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            executor,
            policy,
            transitions: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> WorkflowPolicy {
        self.policy
    }

    pub async fn create_plan(&self, plan: NewPlan) -> OpsResult<PatchPlan> {
        let plan = self.store.create_plan(plan).await?;
        info!(
            plan_id = %plan.id,
            client_id = %plan.client_id,
            steps = plan.steps.len(),
            created_by = %plan.created_by,
            "Plan created"
        );
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: PlanId) -> OpsResult<PatchPlan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| OpsError::not_found("plan", plan_id))
    }

    pub async fn get_run(&self, run_id: RunId) -> OpsResult<PatchRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| OpsError::not_found("run", run_id))
    }

    /// Runs of a plan in creation order.
    pub async fn list_runs(&self, plan_id: PlanId) -> OpsResult<Vec<PatchRun>> {
        self.get_plan(plan_id).await?;
        Ok(self.store.list_runs(plan_id).await?)
    }

    /// Record an approval decision.
    ///
    /// Repeating the decision already recorded is a no-op; reversing it is
    /// an invalid transition.
    pub async fn decide(&self, plan_id: PlanId, decision: ApprovalDecision) -> OpsResult<PatchPlan> {
        let plan = self.get_plan(plan_id).await?;
        let target = ApprovalStatus::from(decision);

        if plan.approval_status == target {
            debug!(plan_id = %plan_id, status = %target, "Approval decision already recorded");
            return Ok(plan);
        }
        if plan.approval_status.is_decided() {
            return Err(OpsError::InvalidTransition {
                entity: "plan",
                id: plan_id.to_string(),
                from: plan.approval_status.to_string(),
                to: target.to_string(),
            });
        }

        let plan = self.store.set_approval(plan_id, target).await?;
        info!(plan_id = %plan_id, status = %target, "Plan approval decided");
        Ok(plan)
    }

    /// Create a PENDING run for an approved plan and enqueue its execution.
    pub async fn request_run(&self, plan_id: PlanId) -> OpsResult<PatchRun> {
        let plan = self.get_plan(plan_id).await?;
        match plan.approval_status {
            ApprovalStatus::Approved => {}
            ApprovalStatus::Pending if self.policy.auto_execute => {
                info!(plan_id = %plan_id, "Auto-execute enabled, running unapproved plan");
            }
            status => {
                return Err(OpsError::NotApproved {
                    plan_id: plan_id.to_string(),
                    status: status.to_string(),
                });
            }
        }

        let run = self.store.create_run(plan_id).await?;
        self.publish(&run, "Run queued");

        let job_id = JobPayload::ExecuteRun { run_id: run.id }
            .enqueue(self.queue.as_ref())
            .await
            .map_err(|e| {
                warn!(run_id = %run.id, error = %e, "Failed to enqueue run, left PENDING");
                e
            })?;

        info!(plan_id = %plan_id, run_id = %run.id, job_id = %job_id, "Run requested");
        Ok(run)
    }

    /// Validate a rollback request and enqueue it.
    ///
    /// Returns `None` when the run is already rolled back.
    pub async fn request_rollback(&self, run_id: RunId) -> OpsResult<Option<JobId>> {
        let run = self.get_run(run_id).await?;

        match run.status {
            RunStatus::RolledBack => {
                info!(run_id = %run_id, "Run already rolled back");
                Ok(None)
            }
            status if status.can_roll_back() => {
                let job_id = JobPayload::Rollback { run_id }
                    .enqueue(self.queue.as_ref())
                    .await?;
                info!(run_id = %run_id, job_id = %job_id, from = %status, "Rollback requested");
                Ok(Some(job_id))
            }
            status => Err(invalid_run_transition(run_id, status, RunStatus::RolledBack)),
        }
    }

    /// Execute the steps of a run, returning the status it ends in.
    ///
    /// A redelivered job finds the run RUNNING and replays every step. A run
    /// that already reached a terminal state is left alone.
    pub async fn execute_run(&self, run_id: RunId) -> OpsResult<RunStatus> {
        let run = self.get_run(run_id).await?;

        match run.status {
            RunStatus::Pending => {
                let update = RunUpdate::to(RunStatus::Running)
                    .started(Utc::now())
                    .message("Executing plan");
                if self.transition(run_id, RunStatus::Pending, update).await?.is_none() {
                    return Ok(self.get_run(run_id).await?.status);
                }
            }
            RunStatus::Running => {
                info!(run_id = %run_id, "Resuming run after redelivery");
            }
            status => {
                debug!(run_id = %run_id, status = %status, "Run already finished, nothing to execute");
                return Ok(status);
            }
        }

        let plan = self.get_plan(run.plan_id).await?;
        let scope = plan.scope();
        let total = plan.steps.len();

        for (index, step) in plan.steps.iter().enumerate() {
            let current = self.get_run(run_id).await?.status;
            if current != RunStatus::Running {
                info!(run_id = %run_id, status = %current, "Run left RUNNING, stopping execution");
                return Ok(current);
            }

            let position = index + 1;
            debug!(run_id = %run_id, step = position, total, descriptor = %step, "Applying step");
            if let Err(e) = self.executor.apply(&scope, step).await {
                let failure = OpsError::StepExecution {
                    step: position,
                    kind: step.kind().to_string(),
                    reason: e.to_string(),
                };
                warn!(run_id = %run_id, error = %failure, "Run failed");

                let update = RunUpdate::to(RunStatus::Failed)
                    .finished(Utc::now())
                    .message(failure.to_string())
                    .failed_step(position);
                return self.settle(run_id, RunStatus::Running, update).await;
            }
        }

        let update = RunUpdate::to(RunStatus::Success)
            .finished(Utc::now())
            .message(format!("Applied {total} steps"));
        self.settle(run_id, RunStatus::Running, update).await
    }

    /// Replay the plan's rollback steps and mark the run ROLLED_BACK.
    ///
    /// Failing compensating steps are logged and do not block the transition.
    pub async fn rollback(&self, run_id: RunId) -> OpsResult<RunStatus> {
        let run = self.get_run(run_id).await?;
        if run.status == RunStatus::RolledBack {
            debug!(run_id = %run_id, "Run already rolled back");
            return Ok(RunStatus::RolledBack);
        }
        if !run.status.can_roll_back() {
            return Err(invalid_run_transition(run_id, run.status, RunStatus::RolledBack));
        }

        let plan = self.get_plan(run.plan_id).await?;
        let scope = plan.scope();
        let mut unverified = 0usize;

        for (index, step) in plan.rollback_steps.iter().enumerate() {
            if let Err(e) = self.executor.apply(&scope, step).await {
                unverified += 1;
                warn!(
                    run_id = %run_id,
                    step = index + 1,
                    descriptor = %step,
                    error = %e,
                    "Rollback step failed, continuing"
                );
            }
        }

        let message = if unverified == 0 {
            "Rollback completed".to_string()
        } else {
            format!("Rollback completed with {unverified} unverified step(s)")
        };

        // Statuses only move forward, so this settles within a few rounds.
        let mut expected = run.status;
        loop {
            let update = RunUpdate::to(RunStatus::RolledBack)
                .finished(Utc::now())
                .message(message.clone());
            if self.transition(run_id, expected, update).await?.is_some() {
                return Ok(RunStatus::RolledBack);
            }

            let current = self.get_run(run_id).await?.status;
            if current == RunStatus::RolledBack {
                return Ok(current);
            }
            if !current.can_roll_back() {
                return Err(invalid_run_transition(run_id, current, RunStatus::RolledBack));
            }
            debug!(run_id = %run_id, from = %expected, to = %current, "Run moved during rollback, retrying");
            expected = current;
        }
    }

    /// Surface a dead-lettered execution or rollback job on its run.
    ///
    /// A RUNNING run is marked FAILED. Any other run keeps its status and an
    /// event carrying the reason is published, except for an execution whose
    /// run already finished.
    pub async fn abandon(&self, run_id: RunId, action: RunAction, reason: &str) {
        let run = match self.get_run(run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Cannot record abandoned {}", action.as_str());
                return;
            }
        };
        let message = format!("{} abandoned: {reason}", action.as_str());

        if run.status == RunStatus::Running {
            let update = RunUpdate::to(RunStatus::Failed)
                .finished(Utc::now())
                .message(message.clone());
            match self.transition(run_id, RunStatus::Running, update).await {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(e) => error!(run_id = %run_id, error = %e, "Failed to mark run FAILED"),
            }
        } else if run.status.is_terminal() && action == RunAction::Execute {
            return;
        }

        self.publish(&run, &message);
    }

    /// Guarded compare-and-set. Publishes on success.
    async fn transition(
        &self,
        run_id: RunId,
        expected: RunStatus,
        update: RunUpdate,
    ) -> OpsResult<Option<PatchRun>> {
        if !expected.can_transition_to(update.status) {
            return Err(invalid_run_transition(run_id, expected, update.status));
        }

        let to = update.status;
        let _ordered = self.transitions.lock().await;
        let Some(run) = self.store.set_run_status(run_id, expected, update).await? else {
            return Ok(None);
        };

        info!(run_id = %run_id, from = %expected, to = %to, "Run status changed");
        let message = run.message.clone().unwrap_or_default();
        self.publish(&run, &message);
        Ok(Some(run))
    }

    /// Transition out of `expected`, reporting whichever status the run ends in.
    async fn settle(
        &self,
        run_id: RunId,
        expected: RunStatus,
        update: RunUpdate,
    ) -> OpsResult<RunStatus> {
        let to = update.status;
        if self.transition(run_id, expected, update).await?.is_some() {
            return Ok(to);
        }

        let current = self.get_run(run_id).await?.status;
        info!(run_id = %run_id, status = %current, wanted = %to, "Run settled elsewhere");
        Ok(current)
    }

    fn publish(&self, run: &PatchRun, message: &str) {
        self.notifier.emit(NotifyEvent::run_update(
            run.id.to_string(),
            run.status.as_str(),
            message,
        ));
    }
}

/// Worker-side run operation, named in dead-letter reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    Execute,
    Rollback,
}

impl RunAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "Execution",
            Self::Rollback => "Rollback",
        }
    }
}

fn invalid_run_transition(run_id: RunId, from: RunStatus, to: RunStatus) -> OpsError {
    OpsError::InvalidTransition {
        entity: "run",
        id: run_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
