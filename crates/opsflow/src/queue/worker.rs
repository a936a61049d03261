//! Fixed-size worker pools draining one queue each.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{consume, DeadLetter, Delivery, Job, JobQueue, NackOutcome, Received};
use crate::error::OpsError;

/// Failure reported by a job handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// Nack and redeliver until attempts run out
    #[error("{0}")]
    Retryable(String),

    /// Dead-letter without further attempts
    #[error("{0}")]
    Permanent(String),
}

impl From<OpsError> for JobError {
    fn from(err: OpsError) -> Self {
        if err.is_transient() {
            Self::Retryable(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

/// Domain logic run for each delivered job.
///
/// Handlers may see the same job more than once and must be idempotent. A
/// panic inside [`JobHandler::handle`] counts as a retryable failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, job: &Job) -> Result<(), JobError>;

    /// Called once a job is parked in the dead-letter list, including jobs
    /// whose final lease timed out.
    async fn on_dead_letter(&self, _job: &Job, _reason: &str) {}
}

/// Workers consuming one queue until shutdown is requested.
pub struct WorkerPool {
    queue_name: String,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks consuming `queue_name`.
    pub fn spawn(
        queue: Arc<dyn JobQueue>,
        queue_name: &str,
        workers: usize,
        handler: Arc<dyn JobHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        info!(queue = queue_name, workers, handler = handler.name(), "Starting worker pool");

        let handles = (0..workers)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                let queue_name = queue_name.to_string();
                tokio::spawn(async move {
                    run_worker(worker, queue, queue_name, handler, shutdown).await;
                })
            })
            .collect();

        Self {
            queue_name: queue_name.to_string(),
            handles,
        }
    }

    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. Cancel the shutdown token first.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(queue = %self.queue_name, error = %e, "Worker task panicked");
            }
        }
        debug!(queue = %self.queue_name, "Worker pool stopped");
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
) {
    let mut deliveries = consume(Arc::clone(&queue), queue_name.clone());

    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(Received::Job(delivery))) => {
                let span = info_span!(
                    "job",
                    queue = %queue_name,
                    worker,
                    job_id = %delivery.job.id,
                    attempt = delivery.job.attempt
                );
                process(queue.as_ref(), handler.as_ref(), delivery)
                    .instrument(span)
                    .await;
            }
            Some(Ok(Received::Expired(dead))) => {
                let span = info_span!(
                    "job",
                    queue = %queue_name,
                    worker,
                    job_id = %dead.job.id,
                    attempt = dead.job.attempt
                );
                expire(handler.as_ref(), dead).instrument(span).await;
            }
            Some(Err(e)) => {
                warn!(queue = %queue_name, worker, error = %e, "Failed to receive job");
            }
            None => break,
        }
    }

    debug!(queue = %queue_name, worker, "Worker exiting");
}

async fn process(queue: &dyn JobQueue, handler: &dyn JobHandler, delivery: Delivery) {
    let Delivery { job, receipt } = delivery;

    let outcome = AssertUnwindSafe(handler.handle(&job))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let reason = format!("Handler panicked: {}", panic_message(panic.as_ref()));
            error!(reason = %reason, "Job handler panicked");
            Err(JobError::Retryable(reason))
        });

    match outcome {
        Ok(()) => {
            if let Err(e) = queue.ack(&receipt).await {
                warn!(error = %e, "Failed to acknowledge job");
            }
        }
        Err(JobError::Retryable(reason)) => match queue.nack(&receipt, &reason).await {
            Ok(NackOutcome::Requeued { attempt }) => {
                warn!(attempt, reason = %reason, "Job failed, will be redelivered");
            }
            Ok(NackOutcome::DeadLettered) => {
                error!(reason = %reason, "Job exhausted its attempts, dead-lettered");
                handler.on_dead_letter(&job, &reason).await;
            }
            Err(e) => warn!(error = %e, "Failed to nack job"),
        },
        Err(JobError::Permanent(reason)) => {
            error!(reason = %reason, "Job failed permanently, dead-lettering");
            match queue.dead_letter(&receipt, &reason).await {
                Ok(()) => handler.on_dead_letter(&job, &reason).await,
                Err(e) => warn!(error = %e, "Failed to dead-letter job"),
            }
        }
    }
}

async fn expire(handler: &dyn JobHandler, dead: DeadLetter) {
    error!(reason = %dead.reason, "Job lease expired on its final attempt, dead-lettered");
    handler.on_dead_letter(&dead.job, &dead.reason).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobState, MemoryQueue, QueueSettings};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the first `failures` deliveries with the given error.
    struct FlakyHandler {
        failures: u32,
        permanent: bool,
        calls: AtomicU32,
        dead: Mutex<Vec<String>>,
    }

    impl FlakyHandler {
        fn new(failures: u32, permanent: bool) -> Self {
            Self {
                failures,
                permanent,
                calls: AtomicU32::new(0),
                dead: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call > self.failures {
                return Ok(());
            }
            if self.permanent {
                Err(JobError::Permanent("bad payload".into()))
            } else {
                Err(JobError::Retryable("store down".into()))
            }
        }

        async fn on_dead_letter(&self, _job: &Job, reason: &str) {
            self.dead.lock().unwrap().push(reason.to_string());
        }
    }

    fn fast_queue(max_attempts: u32) -> Arc<MemoryQueue> {
        Arc::new(MemoryQueue::new(QueueSettings {
            visibility_timeout: Duration::from_secs(5),
            max_attempts,
            poll_interval: Duration::from_millis(10),
        }))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered_then_succeeds() {
        let queue = fast_queue(3);
        let handler = Arc::new(FlakyHandler::new(2, false));
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(queue.clone(), "q", 2, handler.clone(), shutdown.clone());

        let id = queue.enqueue("q", serde_json::Value::Null).await.unwrap();
        wait_until(|| handler.calls.load(Ordering::SeqCst) >= 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.job_state("q", id).await.unwrap(), None);
        assert!(handler.dead.lock().unwrap().is_empty());

        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_retryable_failure_dead_letters_after_max_attempts() {
        let queue = fast_queue(2);
        let handler = Arc::new(FlakyHandler::new(u32::MAX, false));
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(queue.clone(), "q", 1, handler.clone(), shutdown.clone());

        queue.enqueue("q", serde_json::Value::Null).await.unwrap();
        wait_until(|| !handler.dead.lock().unwrap().is_empty()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.dead_letters("q").await.unwrap().len(), 1);

        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let queue = fast_queue(5);
        let handler = Arc::new(FlakyHandler::new(u32::MAX, true));
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(queue.clone(), "q", 1, handler.clone(), shutdown.clone());

        queue.enqueue("q", serde_json::Value::Null).await.unwrap();
        wait_until(|| !handler.dead.lock().unwrap().is_empty()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.dead.lock().unwrap()[0], "bad payload");

        shutdown.cancel();
        pool.join().await;
    }

    /// Panics on the first `panics` calls, then sleeps `stall` and succeeds.
    struct UnrulyHandler {
        panics: u32,
        stall: Duration,
        calls: AtomicU32,
        dead: Mutex<Vec<String>>,
    }

    impl UnrulyHandler {
        fn new(panics: u32, stall: Duration) -> Self {
            Self {
                panics,
                stall,
                calls: AtomicU32::new(0),
                dead: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler for UnrulyHandler {
        fn name(&self) -> &'static str {
            "unruly"
        }

        async fn handle(&self, _job: &Job) -> Result<(), JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(call > self.panics, "handler blew up on call {call}");
            tokio::time::sleep(self.stall).await;
            Ok(())
        }

        async fn on_dead_letter(&self, _job: &Job, reason: &str) {
            self.dead.lock().unwrap().push(reason.to_string());
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried_and_worker_survives() {
        let queue = fast_queue(3);
        let handler = Arc::new(UnrulyHandler::new(1, Duration::ZERO));
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(queue.clone(), "q", 1, handler.clone(), shutdown.clone());

        let first = queue.enqueue("q", serde_json::Value::Null).await.unwrap();
        let second = queue.enqueue("q", serde_json::Value::Null).await.unwrap();
        wait_until(|| handler.calls.load(Ordering::SeqCst) >= 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.job_state("q", first).await.unwrap(), None);
        assert_eq!(queue.job_state("q", second).await.unwrap(), None);
        assert!(handler.dead.lock().unwrap().is_empty());

        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_panics_on_every_attempt_reach_dead_letter_hook() {
        let queue = fast_queue(2);
        let handler = Arc::new(UnrulyHandler::new(u32::MAX, Duration::ZERO));
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(queue.clone(), "q", 1, handler.clone(), shutdown.clone());

        queue.enqueue("q", serde_json::Value::Null).await.unwrap();
        wait_until(|| !handler.dead.lock().unwrap().is_empty()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(handler.dead.lock().unwrap()[0].starts_with("Handler panicked"));

        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_lease_expiry_on_final_attempt_runs_dead_letter_hook() {
        let queue = Arc::new(MemoryQueue::new(QueueSettings {
            visibility_timeout: Duration::from_millis(30),
            max_attempts: 1,
            poll_interval: Duration::from_millis(10),
        }));
        let handler = Arc::new(UnrulyHandler::new(0, Duration::from_millis(300)));
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(queue.clone(), "q", 2, handler.clone(), shutdown.clone());

        let id = queue.enqueue("q", serde_json::Value::Null).await.unwrap();
        wait_until(|| !handler.dead.lock().unwrap().is_empty()).await;

        assert_eq!(
            handler.dead.lock().unwrap().as_slice(),
            ["visibility timeout exceeded".to_string()]
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            queue.job_state("q", id).await.unwrap(),
            Some(JobState::DeadLettered)
        );

        shutdown.cancel();
        pool.join().await;
    }

    #[test]
    fn test_ops_errors_map_to_job_errors() {
        let transient: JobError = OpsError::TransientStore("reset".into()).into();
        assert!(matches!(transient, JobError::Retryable(_)));

        let missing: JobError = OpsError::not_found("run", "r1").into();
        assert!(matches!(missing, JobError::Permanent(_)));
    }
}
