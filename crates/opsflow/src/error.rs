//! Error types for the orchestration pipeline.

use serde::Serialize;
use thiserror::Error;

use crate::queue::QueueError;
use crate::store::StoreError;

/// Result alias used throughout the crate.
pub type OpsResult<T> = Result<T, OpsError>;

/// Errors surfaced by the orchestrator and its workers.
#[derive(Debug, Error)]
pub enum OpsError {
    #[error("Plan '{plan_id}' is not approved (approval status {status})")]
    NotApproved { plan_id: String, status: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Step {step} ({kind}) failed: {reason}")]
    StepExecution {
        step: usize,
        kind: String,
        reason: String,
    },

    #[error("Store temporarily unavailable: {0}")]
    TransientStore(String),

    #[error("Clustering already in flight as job {job_id}")]
    ClusteringConflict { job_id: String },

    #[error("Invalid {entity} transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Suggestion provider failed: {0}")]
    Suggestion(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Stable error identifiers handed to the boundary layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    NotApproved,
    NotFound,
    StepExecutionFailure,
    TransientStoreFailure,
    ClusteringConflict,
    InvalidTransition,
    SuggestionFailure,
    QueueFailure,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotApproved => "NotApproved",
            Self::NotFound => "NotFound",
            Self::StepExecutionFailure => "StepExecutionFailure",
            Self::TransientStoreFailure => "TransientStoreFailure",
            Self::ClusteringConflict => "ClusteringConflict",
            Self::InvalidTransition => "InvalidTransition",
            Self::SuggestionFailure => "SuggestionFailure",
            Self::QueueFailure => "QueueFailure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OpsError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotApproved { .. } => ErrorKind::NotApproved,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::StepExecution { .. } => ErrorKind::StepExecutionFailure,
            Self::TransientStore(_) => ErrorKind::TransientStoreFailure,
            Self::ClusteringConflict { .. } => ErrorKind::ClusteringConflict,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Suggestion(_) => ErrorKind::SuggestionFailure,
            Self::Queue(_) => ErrorKind::QueueFailure,
        }
    }

    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientStore(_) | Self::Queue(QueueError::Unavailable(_))
        )
    }

    /// Split into the `(kind, message)` pair returned to request handlers.
    #[must_use]
    pub fn into_parts(self) -> (ErrorKind, String) {
        (self.kind(), self.to_string())
    }
}

impl From<StoreError> for OpsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Unavailable(reason) => Self::TransientStore(reason),
        }
    }
}
