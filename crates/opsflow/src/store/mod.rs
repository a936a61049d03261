//! Record store for alerts, clusters, plans and runs.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::alerts::{
    Alert, AlertCluster, AlertFilter, AlertId, AlertKey, AlertStatus, ClusterFields, ClusterId,
    FingerprintGroup, NewAlert,
};
use crate::patch::{ApprovalStatus, NewPlan, PatchPlan, PatchRun, PlanId, RunId, RunStatus, RunUpdate};

pub use memory::MemoryStore;

/// Errors raised by a store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Backend temporarily unreachable; the caller may retry
    #[error("{0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage interface consumed by the cluster engine and the patch workflow.
#[async_trait]
pub trait Store: Send + Sync {
    // === Alert Operations ===

    /// Insert or update by `(source, external_id)`.
    ///
    /// Updates severity, status, fingerprint, payload and client in place and
    /// never creates a second record for the same key.
    async fn upsert_alert(&self, alert: NewAlert) -> StoreResult<Alert>;

    async fn get_alert(&self, id: AlertId) -> StoreResult<Option<Alert>>;

    async fn find_alert_by_key(&self, key: &AlertKey) -> StoreResult<Option<Alert>>;

    /// Alerts matching the filter, in ingestion order.
    async fn list_alerts(&self, filter: &AlertFilter) -> StoreResult<Vec<Alert>>;

    async fn set_alert_status(&self, id: AlertId, status: AlertStatus) -> StoreResult<Alert>;

    /// Distinct fingerprints with member counts, ordered by fingerprint.
    async fn group_alerts_by_fingerprint(&self) -> StoreResult<Vec<FingerprintGroup>>;

    async fn find_alerts_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Vec<Alert>>;

    /// Point every alert with `fingerprint` at `cluster_id`. Returns the number updated.
    async fn batch_set_cluster_id(
        &self,
        fingerprint: &str,
        cluster_id: ClusterId,
    ) -> StoreResult<usize>;

    // === Cluster Operations ===

    /// Insert or refresh the cluster keyed by `fingerprint_hash`.
    async fn upsert_cluster(
        &self,
        fingerprint_hash: &str,
        fields: ClusterFields,
    ) -> StoreResult<AlertCluster>;

    /// All clusters, ordered by fingerprint.
    async fn list_clusters(&self) -> StoreResult<Vec<AlertCluster>>;

    // === Plan Operations ===

    async fn create_plan(&self, plan: NewPlan) -> StoreResult<PatchPlan>;

    async fn get_plan(&self, id: PlanId) -> StoreResult<Option<PatchPlan>>;

    async fn set_approval(&self, id: PlanId, status: ApprovalStatus) -> StoreResult<PatchPlan>;

    // === Run Operations ===

    /// Create a run in `PENDING`.
    async fn create_run(&self, plan_id: PlanId) -> StoreResult<PatchRun>;

    async fn get_run(&self, id: RunId) -> StoreResult<Option<PatchRun>>;

    async fn list_runs(&self, plan_id: PlanId) -> StoreResult<Vec<PatchRun>>;

    /// Compare-and-set the run status.
    ///
    /// Applies `update` only if the stored status equals `expected` and
    /// returns the updated run; returns `None` when the status has moved on.
    async fn set_run_status(
        &self,
        id: RunId,
        expected: RunStatus,
        update: RunUpdate,
    ) -> StoreResult<Option<PatchRun>>;
}
