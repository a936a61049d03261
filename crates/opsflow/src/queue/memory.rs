//! In-memory queue backend.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    DeadLetter, Delivery, Job, JobId, JobQueue, JobState, NackOutcome, QueueDepth, QueueError,
    QueueSettings, Receipt, Received,
};

struct Lease {
    token: Uuid,
    job: Job,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    leased: HashMap<JobId, Lease>,
    dead: Vec<DeadLetter>,
    /// Expired final attempts whose dead-letter hook has not run yet
    expired: VecDeque<DeadLetter>,
    wake: Arc<Notify>,
}

impl QueueState {
    /// Return expired leases to the queue, dead-lettering exhausted ones.
    fn reclaim_expired(&mut self, now: Instant, max_attempts: u32) {
        let expired: Vec<JobId> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let Some(lease) = self.leased.remove(&id) else {
                continue;
            };
            if lease.job.attempt >= max_attempts {
                warn!(
                    queue = %lease.job.queue,
                    job_id = %id,
                    attempt = lease.job.attempt,
                    "Visibility timeout exceeded on final attempt, dead-lettering"
                );
                let dead = DeadLetter {
                    job: lease.job,
                    reason: "visibility timeout exceeded".to_string(),
                    dead_at: Utc::now(),
                };
                self.dead.push(dead.clone());
                self.expired.push_back(dead);
            } else {
                debug!(
                    queue = %lease.job.queue,
                    job_id = %id,
                    attempt = lease.job.attempt,
                    "Visibility timeout exceeded, redelivering"
                );
                self.ready.push_back(lease.job);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.leased.values().map(|lease| lease.deadline).min()
    }

    fn take_lease(&mut self, receipt: &Receipt) -> Result<Lease, QueueError> {
        let current = self
            .leased
            .get(&receipt.job_id)
            .is_some_and(|lease| lease.token == receipt.lease);
        if !current {
            return Err(QueueError::LeaseExpired(receipt.job_id));
        }
        self.leased
            .remove(&receipt.job_id)
            .ok_or(QueueError::LeaseExpired(receipt.job_id))
    }
}

/// At-least-once queue held in process memory.
///
/// Jobs survive until acknowledged or dead-lettered but not a process restart.
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    settings: QueueSettings,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            settings,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> QueueSettings {
        self.settings
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> Result<JobId, QueueError> {
        let job = Job {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            payload,
            attempt: 0,
            enqueued_at: Utc::now(),
        };
        let id = job.id;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.ready.push_back(job);
        state.wake.notify_one();

        debug!(queue, job_id = %id, "Job enqueued");
        Ok(id)
    }

    async fn receive(&self, queue: &str) -> Result<Received, QueueError> {
        loop {
            let (wake, wait) = {
                let mut queues = self.queues.lock().await;
                let state = queues.entry(queue.to_string()).or_default();
                let now = Instant::now();
                state.reclaim_expired(now, self.settings.max_attempts);

                if let Some(dead) = state.expired.pop_front() {
                    return Ok(Received::Expired(dead));
                }

                if let Some(mut job) = state.ready.pop_front() {
                    job.attempt += 1;
                    let token = Uuid::new_v4();
                    state.leased.insert(
                        job.id,
                        Lease {
                            token,
                            job: job.clone(),
                            deadline: now + self.settings.visibility_timeout,
                        },
                    );
                    debug!(queue, job_id = %job.id, attempt = job.attempt, "Job leased");
                    let receipt = Receipt {
                        queue: queue.to_string(),
                        job_id: job.id,
                        lease: token,
                    };
                    return Ok(Received::Job(Delivery { job, receipt }));
                }

                let wait = state
                    .next_deadline()
                    .map_or(self.settings.poll_interval, |deadline| {
                        deadline.saturating_duration_since(now)
                    })
                    .min(self.settings.poll_interval);
                (Arc::clone(&state.wake), wait)
            };

            let _ = tokio::time::timeout(wait, wake.notified()).await;
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(receipt.queue.clone()).or_default();
        state.take_lease(receipt)?;
        debug!(queue = %receipt.queue, job_id = %receipt.job_id, "Job acknowledged");
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, reason: &str) -> Result<NackOutcome, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(receipt.queue.clone()).or_default();
        let lease = state.take_lease(receipt)?;
        let attempt = lease.job.attempt;

        if attempt >= self.settings.max_attempts {
            state.dead.push(DeadLetter {
                job: lease.job,
                reason: reason.to_string(),
                dead_at: Utc::now(),
            });
            return Ok(NackOutcome::DeadLettered);
        }

        state.ready.push_back(lease.job);
        state.wake.notify_one();
        Ok(NackOutcome::Requeued { attempt })
    }

    async fn dead_letter(&self, receipt: &Receipt, reason: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(receipt.queue.clone()).or_default();
        let lease = state.take_lease(receipt)?;
        state.dead.push(DeadLetter {
            job: lease.job,
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|state| state.dead.clone())
            .unwrap_or_default())
    }

    async fn job_state(&self, queue: &str, job_id: JobId) -> Result<Option<JobState>, QueueError> {
        let queues = self.queues.lock().await;
        let Some(state) = queues.get(queue) else {
            return Ok(None);
        };

        if state.leased.contains_key(&job_id) {
            Ok(Some(JobState::Leased))
        } else if state.ready.iter().any(|job| job.id == job_id) {
            Ok(Some(JobState::Ready))
        } else if state.dead.iter().any(|d| d.job.id == job_id) {
            Ok(Some(JobState::DeadLettered))
        } else {
            Ok(None)
        }
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or_else(QueueDepth::default, |state| QueueDepth {
            ready: state.ready.len(),
            leased: state.leased.len(),
            dead: state.dead.len(),
        }))
    }
}
