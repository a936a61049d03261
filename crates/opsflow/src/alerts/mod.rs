//! Alerts and their dedup clusters.

pub mod cluster;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use cluster::{fingerprint_hash, ClusterEngine, ClusterPassReport};

pub type AlertId = Uuid;
pub type ClusterId = Uuid;

/// Alert severity, ordered `LOW < MED < HIGH < CRITICAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Med,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Med => "MED",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MED" | "MEDIUM" => Ok(Self::Med),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Triage status of an alert. `RESOLVED` is terminal but the record is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    #[default]
    New,
    Noise,
    Ack,
    Resolved,
}

impl AlertStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Noise => "NOISE",
            Self::Ack => "ACK",
            Self::Resolved => "RESOLVED",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of an alert: unique per monitoring source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertKey {
    pub source: String,
    pub external_id: String,
}

impl AlertKey {
    pub fn new(source: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.external_id)
    }
}

/// Alert as received from a monitoring source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAlert {
    pub client_id: String,
    pub source: String,
    pub external_id: String,
    pub severity: Severity,
    #[serde(default)]
    pub status: AlertStatus,
    pub fingerprint: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl NewAlert {
    /// A NEW alert with an empty payload.
    pub fn new(
        client_id: impl Into<String>,
        key: AlertKey,
        severity: Severity,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            source: key.source,
            external_id: key.external_id,
            severity,
            status: AlertStatus::default(),
            fingerprint: fingerprint.into(),
            payload: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn key(&self) -> AlertKey {
        AlertKey::new(&self.source, &self.external_id)
    }
}

/// Stored alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: AlertId,
    pub client_id: String,
    pub source: String,
    pub external_id: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub fingerprint: String,
    pub payload: serde_json::Value,
    /// Back-reference set only by the cluster engine
    pub cluster_id: Option<ClusterId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional filters for listing alerts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub severity: Option<Severity>,
    pub client_id: Option<String>,
}

impl AlertFilter {
    #[must_use]
    pub fn matches(&self, alert: &Alert) -> bool {
        self.status.map_or(true, |s| alert.status == s)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self
                .client_id
                .as_deref()
                .map_or(true, |c| alert.client_id == c)
    }
}

/// Materialized dedup bucket for one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertCluster {
    pub id: ClusterId,
    pub fingerprint_hash: String,
    pub fingerprint: String,
    pub size: usize,
    pub top_severity: Severity,
    pub representative_alert_id: AlertId,
    pub created_at: DateTime<Utc>,
}

/// Fields recomputed on every clustering pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterFields {
    pub fingerprint: String,
    pub size: usize,
    pub top_severity: Severity,
    pub representative_alert_id: AlertId,
}

/// Distinct fingerprint with its current member count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintGroup {
    pub fingerprint: String,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Med);
        assert!(Severity::Med < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(
            [Severity::High, Severity::Low, Severity::Critical, Severity::Med]
                .into_iter()
                .max(),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("critical".parse::<Severity>(), Ok(Severity::Critical));
        assert_eq!("MED".parse::<Severity>(), Ok(Severity::Med));
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn test_new_alert_defaults() {
        let alert: NewAlert = serde_json::from_str(
            r#"{"clientId":"acme","source":"datadog","externalId":"dd-1","severity":"HIGH","fingerprint":"cpu"}"#,
        )
        .unwrap();
        assert_eq!(alert.status, AlertStatus::New);
        assert_eq!(alert.payload, serde_json::Value::Null);
        assert_eq!(alert.key(), AlertKey::new("datadog", "dd-1"));
    }
}
