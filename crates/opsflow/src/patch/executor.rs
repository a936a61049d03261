//! Step execution against a target scope.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::types::PlanStep;

/// A single step could not be applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct StepError(pub String);

/// Applies plan steps to the machines in a scope.
///
/// Steps are replayed on redelivery, so implementations should treat every
/// step as idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn apply(&self, scope: &str, step: &PlanStep) -> Result<(), StepError>;
}

/// Executor that only logs, for dry runs and demos.
///
/// Can be told to fail every step of given kinds and to sleep per step.
#[derive(Default)]
pub struct SimulatedExecutor {
    failing_kinds: HashSet<String>,
    step_delay: Duration,
    applied: Mutex<Vec<String>>,
}

impl SimulatedExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every step whose kind is `kind`.
    #[must_use]
    pub fn failing_on(mut self, kind: impl Into<String>) -> Self {
        self.failing_kinds.insert(kind.into());
        self
    }

    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Descriptors of every step applied successfully, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StepExecutor for SimulatedExecutor {
    async fn apply(&self, scope: &str, step: &PlanStep) -> Result<(), StepError> {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }

        if self.failing_kinds.contains(step.kind()) {
            debug!(scope, step = %step, "Simulated step failure");
            return Err(StepError(format!("simulated failure of '{step}' on {scope}")));
        }

        info!(scope, step = %step, "Applied step");
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_executor_records_and_fails() {
        let executor = SimulatedExecutor::new().failing_on("reboot");

        executor
            .apply("acme/default", &PlanStep::Backup { target: "acme".into() })
            .await
            .unwrap();
        let err = executor
            .apply("acme/default", &PlanStep::Reboot)
            .await
            .unwrap_err();

        assert!(err.0.contains("reboot"));
        assert_eq!(executor.applied(), vec!["backup:acme"]);
    }
}
