//! Types for patch plans and runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type PlanId = Uuid;
pub type RunId = Uuid;

/// Target group used when a plan does not name one.
pub const DEFAULT_TARGET_GROUP: &str = "default";

/// Approval state of a plan. Moves one way: `PENDING -> APPROVED | REJECTED`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    #[must_use]
    pub const fn is_decided(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision recorded by a privileged actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl From<ApprovalDecision> for ApprovalStatus {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approve => Self::Approved,
            ApprovalDecision::Reject => Self::Rejected,
        }
    }
}

/// Status of one execution attempt.
///
/// ```text
/// PENDING -> RUNNING -> SUCCESS | FAILED | ROLLED_BACK
/// SUCCESS | FAILED   -> ROLLED_BACK
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    RolledBack,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::RolledBack)
    }

    #[must_use]
    pub const fn can_roll_back(&self) -> bool {
        matches!(self, Self::Running | Self::Success | Self::Failed)
    }

    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Success | Self::Failed | Self::RolledBack)
                | (Self::Success | Self::Failed, Self::RolledBack)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remediation or compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum PlanStep {
    Backup {
        target: String,
    },
    Apply {
        products: Vec<String>,
    },
    Reboot,
    Verify,
    Restore {
        from: String,
    },
    Custom {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

impl PlanStep {
    /// Parse a `kind[:arg]` descriptor as produced by suggestion providers.
    ///
    /// Unknown kinds become [`PlanStep::Custom`].
    #[must_use]
    pub fn from_descriptor(raw: &str) -> Self {
        let raw = raw.trim();
        let (kind, arg) = match raw.split_once(':') {
            Some((kind, arg)) => (kind.trim(), Some(arg.trim())),
            None => (raw, None),
        };

        match (kind.to_ascii_lowercase().as_str(), arg) {
            ("backup", arg) => Self::Backup {
                target: arg.unwrap_or_default().to_string(),
            },
            ("apply", arg) => Self::Apply {
                products: arg
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            },
            ("reboot", None) => Self::Reboot,
            ("verify", None) => Self::Verify,
            ("restore", arg) => Self::Restore {
                from: arg.unwrap_or_default().to_string(),
            },
            (_, arg) => Self::Custom {
                name: kind.to_string(),
                args: arg.map_or(serde_json::Value::Null, |a| {
                    serde_json::Value::String(a.to_string())
                }),
            },
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Backup { .. } => "backup",
            Self::Apply { .. } => "apply",
            Self::Reboot => "reboot",
            Self::Verify => "verify",
            Self::Restore { .. } => "restore",
            Self::Custom { name, .. } => name,
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup { target } => write!(f, "backup:{target}"),
            Self::Apply { products } => write!(f, "apply:{}", products.join(",")),
            Self::Reboot => f.write_str("reboot"),
            Self::Verify => f.write_str("verify"),
            Self::Restore { from } => write!(f, "restore:{from}"),
            Self::Custom { name, args } => match args {
                serde_json::Value::Null => f.write_str(name),
                serde_json::Value::String(arg) => write!(f, "{name}:{arg}"),
                other => write!(f, "{name}:{other}"),
            },
        }
    }
}

/// Request to store a new plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlan {
    pub client_id: String,
    #[serde(default = "default_target_group")]
    pub target_group: String,
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    pub steps: Vec<PlanStep>,
    pub rollback_steps: Vec<PlanStep>,
    #[serde(default)]
    pub risks: Vec<String>,
    pub created_by: String,
}

fn default_target_group() -> String {
    DEFAULT_TARGET_GROUP.to_string()
}

const fn default_dry_run() -> bool {
    true
}

impl NewPlan {
    pub fn new(
        client_id: impl Into<String>,
        steps: Vec<PlanStep>,
        rollback_steps: Vec<PlanStep>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            target_group: default_target_group(),
            dry_run: default_dry_run(),
            steps,
            rollback_steps,
            risks: Vec::new(),
            created_by: "operator".to_string(),
        }
    }

    #[must_use]
    pub fn created_by(mut self, actor: impl Into<String>) -> Self {
        self.created_by = actor.into();
        self
    }

    #[must_use]
    pub fn target_group(mut self, group: impl Into<String>) -> Self {
        self.target_group = group.into();
        self
    }

    #[must_use]
    pub fn risks(mut self, risks: Vec<String>) -> Self {
        self.risks = risks;
        self
    }
}

/// Stored plan. Only `approval_status` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchPlan {
    pub id: PlanId,
    pub client_id: String,
    pub target_group: String,
    pub dry_run: bool,
    pub steps: Vec<PlanStep>,
    pub rollback_steps: Vec<PlanStep>,
    pub risks: Vec<String>,
    pub approval_status: ApprovalStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl PatchPlan {
    /// Scope passed to the step executor.
    #[must_use]
    pub fn scope(&self) -> String {
        format!("{}/{}", self.client_id, self.target_group)
    }
}

/// Stored run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRun {
    pub id: RunId,
    pub plan_id: PlanId,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last transition message
    pub message: Option<String>,
    /// Position of the failed step, counted from 1 as in the failure message
    pub failed_step: Option<usize>,
    pub created_at: DateTime<Utc>,
}

/// Status change applied by [`crate::store::Store::set_run_status`].
///
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub failed_step: Option<usize>,
}

impl RunUpdate {
    #[must_use]
    pub const fn to(status: RunStatus) -> Self {
        Self {
            status,
            started_at: None,
            finished_at: None,
            message: None,
            failed_step: None,
        }
    }

    #[must_use]
    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    #[must_use]
    pub fn finished(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn failed_step(mut self, step: usize) -> Self {
        self.failed_step = Some(step);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_transitions() {
        use RunStatus::{Failed, Pending, RolledBack, Running, Success};

        assert!(Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(RolledBack));

        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(RolledBack));

        assert!(Success.can_transition_to(RolledBack));
        assert!(Failed.can_transition_to(RolledBack));
        assert!(!Success.can_transition_to(Failed));
        assert!(!RolledBack.can_transition_to(Running));
        assert!(!RolledBack.can_transition_to(RolledBack));
    }

    #[test]
    fn test_rollback_eligibility() {
        assert!(!RunStatus::Pending.can_roll_back());
        assert!(RunStatus::Running.can_roll_back());
        assert!(RunStatus::Success.can_roll_back());
        assert!(RunStatus::Failed.can_roll_back());
        assert!(!RunStatus::RolledBack.can_roll_back());
    }

    #[test]
    fn test_run_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&RunStatus::RolledBack).unwrap(),
            "\"ROLLED_BACK\""
        );
        assert_eq!(RunStatus::RolledBack.to_string(), "ROLLED_BACK");
    }

    #[test]
    fn test_step_descriptors() {
        assert_eq!(
            PlanStep::from_descriptor("backup:acme"),
            PlanStep::Backup {
                target: "acme".into()
            }
        );
        assert_eq!(
            PlanStep::from_descriptor("apply:openssl, nginx"),
            PlanStep::Apply {
                products: vec!["openssl".into(), "nginx".into()]
            }
        );
        assert_eq!(PlanStep::from_descriptor("reboot"), PlanStep::Reboot);
        assert_eq!(PlanStep::from_descriptor("VERIFY"), PlanStep::Verify);
        assert_eq!(
            PlanStep::from_descriptor("restore:backup"),
            PlanStep::Restore {
                from: "backup".into()
            }
        );
        assert_eq!(
            PlanStep::from_descriptor("drain:node-3"),
            PlanStep::Custom {
                name: "drain".into(),
                args: serde_json::Value::String("node-3".into())
            }
        );
    }

    #[test]
    fn test_step_display_matches_descriptor() {
        for raw in ["backup:acme", "apply:a,b", "reboot", "verify", "restore:backup", "drain:n1"] {
            assert_eq!(PlanStep::from_descriptor(raw).to_string(), raw);
        }
    }

    #[test]
    fn test_step_wire_shape() {
        let json = serde_json::to_value(PlanStep::Backup {
            target: "acme".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "backup");
        assert_eq!(json["params"]["target"], "acme");

        let step: PlanStep = serde_json::from_str(r#"{"kind":"reboot"}"#).unwrap();
        assert_eq!(step, PlanStep::Reboot);
    }

    #[test]
    fn test_new_plan_defaults() {
        let plan = NewPlan::new("acme", vec![PlanStep::Reboot], vec![]);
        assert_eq!(plan.target_group, DEFAULT_TARGET_GROUP);
        assert!(plan.dry_run);
        assert_eq!(plan.created_by, "operator");
    }
}
