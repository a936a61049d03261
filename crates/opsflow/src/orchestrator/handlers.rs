//! Queue handlers for clustering and patch jobs.

use async_trait::async_trait;
use notify::{Notifier, NotifyEvent};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::single_flight::ClusteringFlight;
use crate::alerts::ClusterEngine;
use crate::jobs::JobPayload;
use crate::patch::{PatchWorkflow, RunAction};
use crate::queue::{Job, JobError, JobHandler};

/// Runs clustering passes from the `alert-triage` queue.
pub struct ClusterJobHandler {
    engine: Arc<ClusterEngine>,
    flight: Arc<ClusteringFlight>,
    notifier: Arc<dyn Notifier>,
    /// A redelivered job can overlap the lease it replaced.
    pass_lock: Mutex<()>,
}

impl ClusterJobHandler {
    pub fn new(
        engine: Arc<ClusterEngine>,
        flight: Arc<ClusteringFlight>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            flight,
            notifier,
            pass_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl JobHandler for ClusterJobHandler {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        match JobPayload::from_job(job)? {
            JobPayload::Cluster => {}
            other => {
                return Err(JobError::Permanent(format!(
                    "unexpected {other:?} job on {}",
                    job.queue
                )));
            }
        }

        let _pass = self.pass_lock.lock().await;
        let report = self.engine.run_pass().await?;

        self.flight.release(job.id).await;
        self.notifier.emit(NotifyEvent::clustered(
            true,
            report.clusters.len(),
            report.skipped.len(),
        ));
        Ok(())
    }

    async fn on_dead_letter(&self, job: &Job, reason: &str) {
        error!(job_id = %job.id, reason, "Clustering pass abandoned");
        self.flight.release(job.id).await;
        self.notifier.emit(NotifyEvent::clustered(false, 0, 0));
    }
}

/// Executes and rolls back runs from the `patch-exec` queue.
pub struct PatchJobHandler {
    workflow: Arc<PatchWorkflow>,
}

impl PatchJobHandler {
    pub fn new(workflow: Arc<PatchWorkflow>) -> Self {
        Self { workflow }
    }
}

#[async_trait]
impl JobHandler for PatchJobHandler {
    fn name(&self) -> &'static str {
        "patch"
    }

    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let status = match JobPayload::from_job(job)? {
            JobPayload::ExecuteRun { run_id } => self.workflow.execute_run(run_id).await?,
            JobPayload::Rollback { run_id } => self.workflow.rollback(run_id).await?,
            JobPayload::Cluster => {
                return Err(JobError::Permanent(format!(
                    "unexpected clustering job on {}",
                    job.queue
                )));
            }
        };
        info!(job_id = %job.id, status = %status, "Patch job finished");
        Ok(())
    }

    async fn on_dead_letter(&self, job: &Job, reason: &str) {
        match JobPayload::from_job(job) {
            Ok(JobPayload::ExecuteRun { run_id }) => {
                self.workflow.abandon(run_id, RunAction::Execute, reason).await;
            }
            Ok(JobPayload::Rollback { run_id }) => {
                self.workflow.abandon(run_id, RunAction::Rollback, reason).await;
            }
            Ok(JobPayload::Cluster) | Err(_) => {
                error!(job_id = %job.id, reason, "Dead-lettered job names no run");
            }
        }
    }
}
