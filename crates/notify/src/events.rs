//! Status event types pushed to dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Topics that observers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// A clustering pass finished (successfully or not)
    AlertClustered,
    /// A patch run changed status
    PatchRunUpdate,
}

impl Topic {
    /// Wire name of the topic.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AlertClustered => "alert_clustered",
            Self::PatchRunUpdate => "patch_run_update",
        }
    }

    /// All known topics.
    #[must_use]
    pub const fn all() -> [Self; 2] {
        [Self::AlertClustered, Self::PatchRunUpdate]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that observers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    // =========================================================================
    // Alert clustering
    // =========================================================================
    /// A clustering pass completed
    AlertClustered {
        ok: bool,
        /// Number of clusters refreshed during the pass
        #[serde(default)]
        clusters: usize,
        /// Fingerprint groups that could not be refreshed
        #[serde(default)]
        skipped: usize,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Patch runs
    // =========================================================================
    /// A patch run changed status
    PatchRunUpdate {
        run_id: String,
        status: String,
        message: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Build a clustering completion event stamped now.
    #[must_use]
    pub fn clustered(ok: bool, clusters: usize, skipped: usize) -> Self {
        Self::AlertClustered {
            ok,
            clusters,
            skipped,
            timestamp: Utc::now(),
        }
    }

    /// Build a run status event stamped now.
    #[must_use]
    pub fn run_update(
        run_id: impl Into<String>,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::PatchRunUpdate {
            run_id: run_id.into(),
            status: status.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// The topic this event belongs to.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::AlertClustered { .. } => Topic::AlertClustered,
            Self::PatchRunUpdate { .. } => Topic::PatchRunUpdate,
        }
    }

    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::AlertClustered { ok, clusters, .. } => {
                if *ok {
                    format!("Alerts clustered: {clusters} clusters")
                } else {
                    "Alert clustering failed".to_string()
                }
            }
            Self::PatchRunUpdate { run_id, status, .. } => {
                format!("Patch run {run_id}: {status}")
            }
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::AlertClustered { timestamp, .. } | Self::PatchRunUpdate { timestamp, .. } => {
                *timestamp
            }
        }
    }
}
