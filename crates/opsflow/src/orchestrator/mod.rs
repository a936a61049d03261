//! Composition root.
//!
//! [`Orchestrator`] wires the store, queue, notifier, and domain engines
//! together and exposes the intents called by the boundary layer. Intents
//! that change a single row (plan creation, approval) complete synchronously;
//! clustering, execution, and rollback are enqueued and report progress
//! through the notifier.

mod handlers;
mod single_flight;

use notify::Notifier;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use handlers::{ClusterJobHandler, PatchJobHandler};
pub use single_flight::{ClusterTrigger, ClusteringFlight};

use crate::alerts::{Alert, AlertCluster, AlertFilter, AlertId, AlertStatus, ClusterEngine, NewAlert};
use crate::config::OrchestratorConfig;
use crate::error::{OpsError, OpsResult};
use crate::jobs::{QUEUE_ALERT_TRIAGE, QUEUE_PATCH_EXEC};
use crate::patch::{
    ApprovalDecision, NewPlan, PatchPlan, PatchRun, PatchWorkflow, PlanId, PlanStep, RunId,
    StepExecutor, SuggestionProvider, WorkflowPolicy,
};
use crate::queue::{DeadLetter, JobId, JobQueue, WorkerPool};
use crate::store::Store;

/// Entry point for every externally triggered intent.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    engine: Arc<ClusterEngine>,
    flight: Arc<ClusteringFlight>,
    workflow: Arc<PatchWorkflow>,
    suggestions: Arc<dyn SuggestionProvider>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        executor: Arc<dyn StepExecutor>,
        suggestions: Arc<dyn SuggestionProvider>,
    ) -> Self {
        let workflow = PatchWorkflow::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&notifier),
            executor,
            WorkflowPolicy {
                auto_execute: config.auto_execute,
            },
        );

        Self {
            engine: Arc::new(ClusterEngine::new(Arc::clone(&store))),
            flight: Arc::new(ClusteringFlight::new()),
            workflow: Arc::new(workflow),
            store,
            queue,
            notifier,
            suggestions,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Upsert alerts by `(source, externalId)`. Returns how many were written.
    pub async fn ingest_alerts(&self, alerts: Vec<NewAlert>) -> OpsResult<usize> {
        let total = alerts.len();
        for alert in alerts {
            self.store.upsert_alert(alert).await?;
        }
        info!(count = total, "Alerts ingested");
        Ok(total)
    }

    pub async fn ack_alert(&self, id: AlertId) -> OpsResult<Alert> {
        if self.store.get_alert(id).await?.is_none() {
            return Err(OpsError::not_found("alert", id));
        }
        Ok(self.store.set_alert_status(id, AlertStatus::Ack).await?)
    }

    pub async fn list_alerts(&self, filter: &AlertFilter) -> OpsResult<Vec<Alert>> {
        Ok(self.store.list_alerts(filter).await?)
    }

    pub async fn list_clusters(&self) -> OpsResult<Vec<AlertCluster>> {
        Ok(self.store.list_clusters().await?)
    }

    /// Enqueue a clustering pass, or join the one already in flight.
    pub async fn trigger_clustering(&self) -> OpsResult<ClusterTrigger> {
        self.flight.trigger(self.queue.as_ref()).await
    }

    pub async fn create_plan(
        &self,
        client_id: &str,
        steps: Vec<PlanStep>,
        rollback_steps: Vec<PlanStep>,
    ) -> OpsResult<PlanId> {
        let plan = self
            .workflow
            .create_plan(NewPlan::new(client_id, steps, rollback_steps))
            .await?;
        Ok(plan.id)
    }

    /// Store a plan built from a full request.
    pub async fn submit_plan(&self, plan: NewPlan) -> OpsResult<PatchPlan> {
        self.workflow.create_plan(plan).await
    }

    /// Ask the suggestion provider for a plan and store it as PENDING.
    pub async fn propose_plan(
        &self,
        client_id: &str,
        products: &[String],
        created_by: Option<&str>,
    ) -> OpsResult<PatchPlan> {
        let provider = self.suggestions.name();
        debug!(client_id, provider, "Requesting plan proposal");

        let proposal = self
            .suggestions
            .propose_patch_plan(client_id, products)
            .await?;
        let plan = proposal.into_plan(client_id, created_by.unwrap_or(provider));
        self.workflow.create_plan(plan).await
    }

    pub async fn approve_plan(
        &self,
        plan_id: PlanId,
        decision: ApprovalDecision,
    ) -> OpsResult<PatchPlan> {
        self.workflow.decide(plan_id, decision).await
    }

    /// Create a PENDING run and enqueue its execution.
    pub async fn request_run(&self, plan_id: PlanId) -> OpsResult<RunId> {
        Ok(self.workflow.request_run(plan_id).await?.id)
    }

    /// Enqueue a rollback. `None` means the run was already rolled back.
    pub async fn request_rollback(&self, run_id: RunId) -> OpsResult<Option<JobId>> {
        self.workflow.request_rollback(run_id).await
    }

    pub async fn get_plan(&self, plan_id: PlanId) -> OpsResult<PatchPlan> {
        self.workflow.get_plan(plan_id).await
    }

    pub async fn get_run(&self, run_id: RunId) -> OpsResult<PatchRun> {
        self.workflow.get_run(run_id).await
    }

    pub async fn list_runs(&self, plan_id: PlanId) -> OpsResult<Vec<PatchRun>> {
        self.workflow.list_runs(plan_id).await
    }

    /// Jobs parked on `queue` after exhausting their attempts.
    pub async fn dead_letters(&self, queue: &str) -> OpsResult<Vec<DeadLetter>> {
        Ok(self.queue.dead_letters(queue).await?)
    }

    /// Spawn the worker pools for both queues.
    pub fn start_workers(&self, shutdown: CancellationToken) -> Workers {
        let cluster = WorkerPool::spawn(
            Arc::clone(&self.queue),
            QUEUE_ALERT_TRIAGE,
            self.config.cluster_workers,
            Arc::new(ClusterJobHandler::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.flight),
                Arc::clone(&self.notifier),
            )),
            shutdown.clone(),
        );
        let patch = WorkerPool::spawn(
            Arc::clone(&self.queue),
            QUEUE_PATCH_EXEC,
            self.config.patch_workers,
            Arc::new(PatchJobHandler::new(Arc::clone(&self.workflow))),
            shutdown.clone(),
        );

        Workers {
            pools: vec![cluster, patch],
            shutdown,
        }
    }
}

/// Running worker pools.
pub struct Workers {
    pools: Vec<WorkerPool>,
    shutdown: CancellationToken,
}

impl Workers {
    /// Total workers across all pools.
    #[must_use]
    pub fn size(&self) -> usize {
        self.pools.iter().map(WorkerPool::size).sum()
    }

    /// Cancel every worker and wait for them to exit. Jobs in progress
    /// finish their current delivery first.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for pool in self.pools {
            debug!(queue = pool.queue_name(), "Stopping worker pool");
            pool.join().await;
        }
        info!("Workers stopped");
    }
}
