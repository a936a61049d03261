//! In-memory store backend.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{Store, StoreError, StoreResult};
use crate::alerts::{
    Alert, AlertCluster, AlertFilter, AlertId, AlertKey, AlertStatus, ClusterFields, ClusterId,
    FingerprintGroup, NewAlert,
};
use crate::patch::{ApprovalStatus, NewPlan, PatchPlan, PatchRun, PlanId, RunId, RunStatus, RunUpdate};

#[derive(Default)]
struct Tables {
    alerts: HashMap<AlertId, Alert>,
    alert_keys: HashMap<AlertKey, AlertId>,
    /// Alert ids in ingestion order
    alert_order: Vec<AlertId>,
    clusters: HashMap<String, AlertCluster>,
    plans: HashMap<PlanId, PatchPlan>,
    runs: HashMap<RunId, PatchRun>,
    run_order: Vec<RunId>,
}

/// Store backed by process memory.
///
/// Used by the CLI and the test-suite. `inject_failures` simulates a backend
/// outage for the next `n` calls.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failures: AtomicU32,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail with [`StoreError::Unavailable`].
    pub fn inject_failures(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of injected failures not consumed yet.
    pub fn pending_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn check_available(&self, op: &str) -> StoreResult<()> {
        let consumed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            debug!(op, "Injected store failure");
            return Err(StoreError::Unavailable(format!("store unavailable during {op}")));
        }
        Ok(())
    }
}

fn plan_not_found(id: PlanId) -> StoreError {
    StoreError::NotFound {
        entity: "plan",
        id: id.to_string(),
    }
}

fn run_not_found(id: RunId) -> StoreError {
    StoreError::NotFound {
        entity: "run",
        id: id.to_string(),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_alert(&self, alert: NewAlert) -> StoreResult<Alert> {
        self.check_available("upsert_alert")?;
        let mut tables = self.tables.write().await;
        let key = alert.key();
        let now = Utc::now();

        if let Some(id) = tables.alert_keys.get(&key).copied() {
            if let Some(existing) = tables.alerts.get_mut(&id) {
                existing.client_id = alert.client_id;
                existing.severity = alert.severity;
                existing.status = alert.status;
                existing.fingerprint = alert.fingerprint;
                existing.payload = alert.payload;
                existing.updated_at = now;
                return Ok(existing.clone());
            }
        }

        let record = Alert {
            id: Uuid::new_v4(),
            client_id: alert.client_id,
            source: alert.source,
            external_id: alert.external_id,
            severity: alert.severity,
            status: alert.status,
            fingerprint: alert.fingerprint,
            payload: alert.payload,
            cluster_id: None,
            created_at: now,
            updated_at: now,
        };
        tables.alert_keys.insert(key, record.id);
        tables.alert_order.push(record.id);
        tables.alerts.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_alert(&self, id: AlertId) -> StoreResult<Option<Alert>> {
        self.check_available("get_alert")?;
        Ok(self.tables.read().await.alerts.get(&id).cloned())
    }

    async fn find_alert_by_key(&self, key: &AlertKey) -> StoreResult<Option<Alert>> {
        self.check_available("find_alert_by_key")?;
        let tables = self.tables.read().await;
        Ok(tables
            .alert_keys
            .get(key)
            .and_then(|id| tables.alerts.get(id))
            .cloned())
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> StoreResult<Vec<Alert>> {
        self.check_available("list_alerts")?;
        let tables = self.tables.read().await;
        Ok(tables
            .alert_order
            .iter()
            .filter_map(|id| tables.alerts.get(id))
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    async fn set_alert_status(&self, id: AlertId, status: AlertStatus) -> StoreResult<Alert> {
        self.check_available("set_alert_status")?;
        let mut tables = self.tables.write().await;
        let alert = tables.alerts.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "alert",
            id: id.to_string(),
        })?;
        alert.status = status;
        alert.updated_at = Utc::now();
        Ok(alert.clone())
    }

    async fn group_alerts_by_fingerprint(&self) -> StoreResult<Vec<FingerprintGroup>> {
        self.check_available("group_alerts_by_fingerprint")?;
        let tables = self.tables.read().await;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for alert in tables.alerts.values() {
            *counts.entry(alert.fingerprint.as_str()).or_default() += 1;
        }

        let mut groups: Vec<FingerprintGroup> = counts
            .into_iter()
            .map(|(fingerprint, count)| FingerprintGroup {
                fingerprint: fingerprint.to_string(),
                count,
            })
            .collect();
        groups.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(groups)
    }

    async fn find_alerts_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Vec<Alert>> {
        self.check_available("find_alerts_by_fingerprint")?;
        let tables = self.tables.read().await;
        Ok(tables
            .alert_order
            .iter()
            .filter_map(|id| tables.alerts.get(id))
            .filter(|a| a.fingerprint == fingerprint)
            .cloned()
            .collect())
    }

    async fn batch_set_cluster_id(
        &self,
        fingerprint: &str,
        cluster_id: ClusterId,
    ) -> StoreResult<usize> {
        self.check_available("batch_set_cluster_id")?;
        let mut tables = self.tables.write().await;
        let mut updated = 0;
        for alert in tables.alerts.values_mut() {
            if alert.fingerprint == fingerprint {
                alert.cluster_id = Some(cluster_id);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn upsert_cluster(
        &self,
        fingerprint_hash: &str,
        fields: ClusterFields,
    ) -> StoreResult<AlertCluster> {
        self.check_available("upsert_cluster")?;
        let mut tables = self.tables.write().await;
        let cluster = tables
            .clusters
            .entry(fingerprint_hash.to_string())
            .and_modify(|c| {
                c.fingerprint.clone_from(&fields.fingerprint);
                c.size = fields.size;
                c.top_severity = fields.top_severity;
                c.representative_alert_id = fields.representative_alert_id;
            })
            .or_insert_with(|| AlertCluster {
                id: Uuid::new_v4(),
                fingerprint_hash: fingerprint_hash.to_string(),
                fingerprint: fields.fingerprint.clone(),
                size: fields.size,
                top_severity: fields.top_severity,
                representative_alert_id: fields.representative_alert_id,
                created_at: Utc::now(),
            });
        Ok(cluster.clone())
    }

    async fn list_clusters(&self) -> StoreResult<Vec<AlertCluster>> {
        self.check_available("list_clusters")?;
        let tables = self.tables.read().await;
        let mut clusters: Vec<AlertCluster> = tables.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(clusters)
    }

    async fn create_plan(&self, plan: NewPlan) -> StoreResult<PatchPlan> {
        self.check_available("create_plan")?;
        let record = PatchPlan {
            id: Uuid::new_v4(),
            client_id: plan.client_id,
            target_group: plan.target_group,
            dry_run: plan.dry_run,
            steps: plan.steps,
            rollback_steps: plan.rollback_steps,
            risks: plan.risks,
            approval_status: ApprovalStatus::Pending,
            created_by: plan.created_by,
            created_at: Utc::now(),
        };
        self.tables
            .write()
            .await
            .plans
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_plan(&self, id: PlanId) -> StoreResult<Option<PatchPlan>> {
        self.check_available("get_plan")?;
        Ok(self.tables.read().await.plans.get(&id).cloned())
    }

    async fn set_approval(&self, id: PlanId, status: ApprovalStatus) -> StoreResult<PatchPlan> {
        self.check_available("set_approval")?;
        let mut tables = self.tables.write().await;
        let plan = tables.plans.get_mut(&id).ok_or_else(|| plan_not_found(id))?;
        plan.approval_status = status;
        Ok(plan.clone())
    }

    async fn create_run(&self, plan_id: PlanId) -> StoreResult<PatchRun> {
        self.check_available("create_run")?;
        let mut tables = self.tables.write().await;
        if !tables.plans.contains_key(&plan_id) {
            return Err(plan_not_found(plan_id));
        }

        let run = PatchRun {
            id: Uuid::new_v4(),
            plan_id,
            status: RunStatus::Pending,
            started_at: None,
            finished_at: None,
            message: None,
            failed_step: None,
            created_at: Utc::now(),
        };
        tables.run_order.push(run.id);
        tables.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> StoreResult<Option<PatchRun>> {
        self.check_available("get_run")?;
        Ok(self.tables.read().await.runs.get(&id).cloned())
    }

    async fn list_runs(&self, plan_id: PlanId) -> StoreResult<Vec<PatchRun>> {
        self.check_available("list_runs")?;
        let tables = self.tables.read().await;
        Ok(tables
            .run_order
            .iter()
            .filter_map(|id| tables.runs.get(id))
            .filter(|r| r.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn set_run_status(
        &self,
        id: RunId,
        expected: RunStatus,
        update: RunUpdate,
    ) -> StoreResult<Option<PatchRun>> {
        self.check_available("set_run_status")?;
        let mut tables = self.tables.write().await;
        let run = tables.runs.get_mut(&id).ok_or_else(|| run_not_found(id))?;

        if run.status != expected {
            debug!(
                run_id = %id,
                expected = %expected,
                actual = %run.status,
                "Run status moved on, skipping update"
            );
            return Ok(None);
        }

        run.status = update.status;
        if let Some(at) = update.started_at {
            run.started_at = Some(at);
        }
        if let Some(at) = update.finished_at {
            run.finished_at = Some(at);
        }
        if let Some(message) = update.message {
            run.message = Some(message);
        }
        if let Some(index) = update.failed_step {
            run.failed_step = Some(index);
        }
        Ok(Some(run.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::Severity;
    use crate::patch::PlanStep;

    fn alert(source: &str, external_id: &str, severity: Severity, fingerprint: &str) -> NewAlert {
        NewAlert {
            client_id: "acme".into(),
            source: source.into(),
            external_id: external_id.into(),
            severity,
            status: AlertStatus::New,
            fingerprint: fingerprint.into(),
            payload: serde_json::json!({ "host": "web-1" }),
        }
    }

    #[tokio::test]
    async fn test_upsert_alert_updates_in_place() {
        let store = MemoryStore::new();
        let first = store
            .upsert_alert(alert("datadog", "1", Severity::Low, "fp-a"))
            .await
            .unwrap();

        let mut again = alert("datadog", "1", Severity::Critical, "fp-b");
        again.status = AlertStatus::Ack;
        let second = store.upsert_alert(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.severity, Severity::Critical);
        assert_eq!(second.status, AlertStatus::Ack);
        assert_eq!(second.fingerprint, "fp-b");

        let all = store.list_alerts(&AlertFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_same_external_id_different_source_is_distinct() {
        let store = MemoryStore::new();
        store
            .upsert_alert(alert("datadog", "1", Severity::Low, "fp"))
            .await
            .unwrap();
        store
            .upsert_alert(alert("pagerduty", "1", Severity::Low, "fp"))
            .await
            .unwrap();

        let groups = store.group_alerts_by_fingerprint().await.unwrap();
        assert_eq!(
            groups,
            vec![FingerprintGroup {
                fingerprint: "fp".into(),
                count: 2
            }]
        );
    }

    #[tokio::test]
    async fn test_list_alerts_filters() {
        let store = MemoryStore::new();
        store
            .upsert_alert(alert("s", "1", Severity::Low, "fp"))
            .await
            .unwrap();
        let high = store
            .upsert_alert(alert("s", "2", Severity::High, "fp"))
            .await
            .unwrap();
        store.set_alert_status(high.id, AlertStatus::Ack).await.unwrap();

        let acked = store
            .list_alerts(&AlertFilter {
                status: Some(AlertStatus::Ack),
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].id, high.id);

        let other_client = store
            .list_alerts(&AlertFilter {
                client_id: Some("globex".into()),
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert!(other_client.is_empty());
    }

    #[tokio::test]
    async fn test_set_run_status_is_compare_and_set() {
        let store = MemoryStore::new();
        let plan = store
            .create_plan(NewPlan::new("acme", vec![PlanStep::Reboot], vec![]))
            .await
            .unwrap();
        let run = store.create_run(plan.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        let now = Utc::now();
        let updated = store
            .set_run_status(run.id, RunStatus::Pending, RunUpdate::to(RunStatus::Running).started(now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, RunStatus::Running);
        assert_eq!(updated.started_at, Some(now));

        let stale = store
            .set_run_status(run.id, RunStatus::Pending, RunUpdate::to(RunStatus::Running))
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_create_run_requires_plan() {
        let store = MemoryStore::new();
        let err = store.create_run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "plan", .. }));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.inject_failures(2);

        assert!(matches!(
            store.list_clusters().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.list_clusters().await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.pending_failures(), 0);
        assert!(store.list_clusters().await.unwrap().is_empty());
    }
}
