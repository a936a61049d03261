//! Fingerprint clustering of noisy alert streams.
//!
//! A pass groups every alert by fingerprint, refreshes one [`AlertCluster`]
//! per distinct fingerprint and points each member alert at its cluster. The
//! pass is idempotent: with no new alerts a second pass leaves the cluster
//! table unchanged. A group that fails to refresh is logged and skipped.
//!
//! Two passes must not overlap; the orchestrator keeps clustering
//! single-flight.

use sha1::{Digest, Sha1};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Alert, AlertCluster, ClusterFields};
use crate::error::OpsResult;
use crate::store::Store;

/// Stable cluster key for a fingerprint (lowercase hex SHA-1).
#[must_use]
pub fn fingerprint_hash(fingerprint: &str) -> String {
    hex::encode(Sha1::digest(fingerprint.as_bytes()))
}

/// Pick the member shown for the cluster: highest severity, then the earliest
/// created, then the smallest id.
fn representative(members: &[Alert]) -> Option<&Alert> {
    members.iter().max_by(|a, b| {
        a.severity
            .cmp(&b.severity)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.id.cmp(&a.id))
    })
}

/// Outcome of one clustering pass.
#[derive(Debug, Clone, Default)]
pub struct ClusterPassReport {
    /// Clusters created or refreshed
    pub clusters: Vec<AlertCluster>,
    /// Fingerprints whose refresh failed and were skipped
    pub skipped: Vec<String>,
    /// Alerts whose cluster reference was (re)assigned
    pub alerts_assigned: usize,
}

impl ClusterPassReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Materializes [`AlertCluster`] records from the alert table.
pub struct ClusterEngine {
    store: Arc<dyn Store>,
}

impl ClusterEngine {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Run one clustering pass.
    ///
    /// # Errors
    /// Fails only when the fingerprint groups cannot be read. Per-group
    /// failures are recorded in [`ClusterPassReport::skipped`].
    pub async fn run_pass(&self) -> OpsResult<ClusterPassReport> {
        let groups = self.store.group_alerts_by_fingerprint().await?;
        debug!(groups = groups.len(), "Starting clustering pass");

        let mut report = ClusterPassReport::default();

        for group in groups {
            match self.refresh_group(&group.fingerprint).await {
                Ok(Some((cluster, assigned))) => {
                    report.alerts_assigned += assigned;
                    report.clusters.push(cluster);
                }
                Ok(None) => {
                    debug!(fingerprint = %group.fingerprint, "Fingerprint group emptied during pass");
                }
                Err(e) => {
                    warn!(
                        fingerprint = %group.fingerprint,
                        error = %e,
                        "Failed to refresh cluster, skipping group"
                    );
                    report.skipped.push(group.fingerprint);
                }
            }
        }

        info!(
            clusters = report.clusters.len(),
            skipped = report.skipped.len(),
            alerts = report.alerts_assigned,
            "Clustering pass complete"
        );

        Ok(report)
    }

    async fn refresh_group(&self, fingerprint: &str) -> OpsResult<Option<(AlertCluster, usize)>> {
        let members = self.store.find_alerts_by_fingerprint(fingerprint).await?;
        let Some(representative) = representative(&members) else {
            return Ok(None);
        };

        let fields = ClusterFields {
            fingerprint: fingerprint.to_string(),
            size: members.len(),
            top_severity: representative.severity,
            representative_alert_id: representative.id,
        };

        let cluster = self
            .store
            .upsert_cluster(&fingerprint_hash(fingerprint), fields)
            .await?;
        let assigned = self
            .store
            .batch_set_cluster_id(fingerprint, cluster.id)
            .await?;

        debug!(
            fingerprint,
            cluster_id = %cluster.id,
            size = cluster.size,
            top_severity = %cluster.top_severity,
            "Cluster refreshed"
        );

        Ok(Some((cluster, assigned)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertStatus, Severity};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn member(severity: Severity, age_secs: i64) -> Alert {
        let now = Utc::now();
        Alert {
            id: Uuid::new_v4(),
            client_id: "acme".into(),
            source: "s".into(),
            external_id: Uuid::new_v4().to_string(),
            severity,
            status: AlertStatus::New,
            fingerprint: "fp".into(),
            payload: serde_json::Value::Null,
            cluster_id: None,
            created_at: now - Duration::seconds(age_secs),
            updated_at: now,
        }
    }

    #[test]
    fn test_fingerprint_hash_is_stable_hex() {
        let hash = fingerprint_hash("fp-0");
        assert_eq!(hash.len(), 40);
        assert_eq!(hash, fingerprint_hash("fp-0"));
        assert_ne!(hash, fingerprint_hash("fp-1"));
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_representative_prefers_highest_severity() {
        let members = vec![
            member(Severity::Low, 50),
            member(Severity::Critical, 10),
            member(Severity::High, 40),
        ];
        assert_eq!(representative(&members).unwrap().id, members[1].id);
    }

    #[test]
    fn test_representative_tie_breaks_on_oldest() {
        let members = vec![
            member(Severity::High, 5),
            member(Severity::High, 30),
            member(Severity::Low, 60),
        ];
        assert_eq!(representative(&members).unwrap().id, members[1].id);
    }

    #[test]
    fn test_representative_of_empty_group() {
        assert!(representative(&[]).is_none());
    }
}
