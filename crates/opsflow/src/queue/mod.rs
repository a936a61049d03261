//! Named work queues with at-least-once delivery.
//!
//! A consumer receives a [`Delivery`] holding the job and a lease
//! [`Receipt`]. The job stays invisible to other consumers until the lease is
//! acknowledged, nacked, or the visibility timeout passes, in which case the
//! job is delivered again. After `max_attempts` deliveries a failing job is
//! moved to the dead-letter list and never retried.
//!
//! A final attempt that outlives its lease is dead-lettered by the queue
//! itself. Exactly one consumer is handed that job as [`Received::Expired`]
//! so its dead-letter hook still runs.
//!
//! The queue does not deduplicate: two enqueues of the same logical operation
//! are two jobs. Handlers must be idempotent.

mod memory;
pub mod worker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryQueue;
pub use worker::{JobError, JobHandler, WorkerPool};

pub type JobId = Uuid;

/// Default lease length before an unacknowledged job is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of deliveries before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default interval at which idle consumers re-check expired leases.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Errors raised by a queue backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Lease for job {0} expired or was already settled")]
    LeaseExpired(JobId),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid job payload: {0}")]
    Payload(String),
}

/// Delivery semantics shared by every queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Deliveries so far, including the current one
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Proof of a lease, required to settle a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub queue: String,
    pub job_id: JobId,
    pub lease: Uuid,
}

/// A leased job.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub receipt: Receipt,
}

/// Outcome of [`JobQueue::receive`].
#[derive(Debug, Clone)]
pub enum Received {
    /// A leased job to process
    Job(Delivery),
    /// A job whose final lease timed out; already in the dead-letter list
    Expired(DeadLetter),
}

impl Received {
    /// The leased delivery, if this is one.
    #[must_use]
    pub fn into_delivery(self) -> Option<Delivery> {
        match self {
            Self::Job(delivery) => Some(delivery),
            Self::Expired(_) => None,
        }
    }
}

/// What happened to a nacked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back on the queue for another delivery
    Requeued { attempt: u32 },
    /// Attempts exhausted; parked for inspection
    DeadLettered,
}

/// Where a job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    Leased,
    DeadLettered,
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job: Job,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// Snapshot of a queue's size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub leased: usize,
    pub dead: usize,
}

/// Queue interface consumed by the orchestrator and the worker pool.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job; returns once the job is stored.
    async fn enqueue(&self, queue: &str, payload: serde_json::Value) -> Result<JobId, QueueError>;

    /// Wait for and lease the next job, or hand over a job that was
    /// dead-lettered by lease expiry.
    async fn receive(&self, queue: &str) -> Result<Received, QueueError>;

    /// Settle a delivery as done.
    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError>;

    /// Settle a delivery as failed; the job is redelivered or dead-lettered.
    async fn nack(&self, receipt: &Receipt, reason: &str) -> Result<NackOutcome, QueueError>;

    /// Park a delivery immediately without further retries.
    async fn dead_letter(&self, receipt: &Receipt, reason: &str) -> Result<(), QueueError>;

    /// Jobs parked on a queue.
    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, QueueError>;

    /// Where a job sits; `None` once it has been acknowledged.
    async fn job_state(&self, queue: &str, job_id: JobId) -> Result<Option<JobState>, QueueError>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError>;
}

/// Stream of receipts from one queue.
pub fn consume(
    queue: Arc<dyn JobQueue>,
    name: impl Into<String>,
) -> BoxStream<'static, Result<Received, QueueError>> {
    stream::unfold((queue, name.into()), |(queue, name)| async move {
        let next = queue.receive(&name).await;
        Some((next, (queue, name)))
    })
    .boxed()
}
