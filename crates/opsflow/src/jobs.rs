//! Job payloads and the queues they travel on.

use serde::{Deserialize, Serialize};

use crate::patch::RunId;
use crate::queue::{Job, JobError, JobId, JobQueue, QueueError};

/// Queue carrying clustering passes.
pub const QUEUE_ALERT_TRIAGE: &str = "alert-triage";

/// Queue carrying patch execution and rollback.
pub const QUEUE_PATCH_EXEC: &str = "patch-exec";

/// Work items understood by the orchestrator's handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Run one clustering pass
    Cluster,
    /// Execute the steps of a run
    ExecuteRun { run_id: RunId },
    /// Replay the rollback steps of a run
    Rollback { run_id: RunId },
}

impl JobPayload {
    /// Queue this payload belongs on.
    #[must_use]
    pub const fn queue(&self) -> &'static str {
        match self {
            Self::Cluster => QUEUE_ALERT_TRIAGE,
            Self::ExecuteRun { .. } | Self::Rollback { .. } => QUEUE_PATCH_EXEC,
        }
    }

    /// Serialize and enqueue on the payload's queue.
    pub async fn enqueue(&self, queue: &dyn JobQueue) -> Result<JobId, QueueError> {
        let value =
            serde_json::to_value(self).map_err(|e| QueueError::Payload(e.to_string()))?;
        queue.enqueue(self.queue(), value).await
    }

    /// Decode a delivered job. Undecodable payloads are permanent failures.
    pub fn from_job(job: &Job) -> Result<Self, JobError> {
        serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::Permanent(format!("invalid job payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_payload_wire_shape_and_queue() {
        let run_id = Uuid::new_v4();
        let payload = JobPayload::ExecuteRun { run_id };
        let json = serde_json::to_value(payload).unwrap();
        assert_eq!(json["kind"], "execute_run");
        assert_eq!(json["run_id"], run_id.to_string());
        assert_eq!(payload.queue(), QUEUE_PATCH_EXEC);
        assert_eq!(JobPayload::Cluster.queue(), QUEUE_ALERT_TRIAGE);
    }

    #[test]
    fn test_undecodable_payload_is_permanent() {
        let job = Job {
            id: Uuid::new_v4(),
            queue: QUEUE_PATCH_EXEC.into(),
            payload: serde_json::json!({ "kind": "reticulate" }),
            attempt: 1,
            enqueued_at: Utc::now(),
        };
        assert!(matches!(
            JobPayload::from_job(&job),
            Err(JobError::Permanent(_))
        ));
    }
}
