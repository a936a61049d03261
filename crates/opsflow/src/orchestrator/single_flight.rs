//! Single-flight guard for clustering passes.

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OpsError, OpsResult};
use crate::jobs::{JobPayload, QUEUE_ALERT_TRIAGE};
use crate::queue::{JobId, JobQueue, JobState};

/// Result of a clustering trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTrigger {
    /// Job that will perform the pass
    pub job_id: JobId,
    /// Whether the request joined a pass already in flight
    pub coalesced: bool,
}

/// Tracks the one clustering job allowed to be queued or running.
///
/// The slot is released by the handler when the job completes or is
/// dead-lettered. A slot whose job the queue no longer holds is treated as
/// stale and replaced.
#[derive(Debug, Default)]
pub struct ClusteringFlight {
    in_flight: Mutex<Option<JobId>>,
}

impl ClusteringFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a clustering job unless one is already in flight.
    pub async fn trigger(&self, queue: &dyn JobQueue) -> OpsResult<ClusterTrigger> {
        let mut slot = self.in_flight.lock().await;

        match self.check_slot(&mut slot, queue).await {
            Err(OpsError::ClusteringConflict { .. }) => {
                if let Some(job_id) = *slot {
                    debug!(job_id = %job_id, "Clustering already in flight, coalescing");
                    return Ok(ClusterTrigger {
                        job_id,
                        coalesced: true,
                    });
                }
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        let job_id = JobPayload::Cluster.enqueue(queue).await?;
        *slot = Some(job_id);
        info!(job_id = %job_id, "Clustering pass enqueued");
        Ok(ClusterTrigger {
            job_id,
            coalesced: false,
        })
    }

    /// Release the slot if `job_id` still holds it.
    pub async fn release(&self, job_id: JobId) {
        let mut slot = self.in_flight.lock().await;
        if *slot == Some(job_id) {
            *slot = None;
            debug!(job_id = %job_id, "Clustering slot released");
        }
    }

    /// Job currently holding the slot.
    pub async fn current(&self) -> Option<JobId> {
        *self.in_flight.lock().await
    }

    /// `Err(ClusteringConflict)` while a live job holds the slot. Clears a
    /// stale slot.
    async fn check_slot(&self, slot: &mut Option<JobId>, queue: &dyn JobQueue) -> OpsResult<()> {
        let Some(job_id) = *slot else {
            return Ok(());
        };

        match queue.job_state(QUEUE_ALERT_TRIAGE, job_id).await? {
            Some(JobState::Ready | JobState::Leased) => Err(OpsError::ClusteringConflict {
                job_id: job_id.to_string(),
            }),
            state => {
                warn!(job_id = %job_id, ?state, "Clearing stale clustering slot");
                *slot = None;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;

    #[tokio::test]
    async fn test_second_trigger_coalesces() {
        let queue = MemoryQueue::default();
        let flight = ClusteringFlight::new();

        let first = flight.trigger(&queue).await.unwrap();
        let second = flight.trigger(&queue).await.unwrap();

        assert!(!first.coalesced);
        assert!(second.coalesced);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(queue.depth(QUEUE_ALERT_TRIAGE).await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_release_allows_new_pass() {
        let queue = MemoryQueue::default();
        let flight = ClusteringFlight::new();

        let first = flight.trigger(&queue).await.unwrap();
        flight.release(first.job_id).await;
        assert_eq!(flight.current().await, None);

        let second = flight.trigger(&queue).await.unwrap();
        assert!(!second.coalesced);
        assert_ne!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn test_stale_slot_is_replaced() {
        let queue = MemoryQueue::default();
        let flight = ClusteringFlight::new();

        let first = flight.trigger(&queue).await.unwrap();
        let delivery = queue
            .receive(QUEUE_ALERT_TRIAGE)
            .await
            .unwrap()
            .into_delivery()
            .unwrap();
        queue.ack(&delivery.receipt).await.unwrap();

        let second = flight.trigger(&queue).await.unwrap();
        assert!(!second.coalesced);
        assert_ne!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn test_release_of_other_job_keeps_slot() {
        let queue = MemoryQueue::default();
        let flight = ClusteringFlight::new();

        let first = flight.trigger(&queue).await.unwrap();
        flight.release(uuid::Uuid::new_v4()).await;
        assert_eq!(flight.current().await, Some(first.job_id));
    }
}
