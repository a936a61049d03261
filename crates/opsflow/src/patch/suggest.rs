//! Plan suggestions from an external model.
//!
//! The model is opaque: it returns step descriptors as `kind[:arg]` strings,
//! which are parsed into [`PlanStep`]s before a plan is stored.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{NewPlan, PlanStep};
use crate::error::OpsResult;

/// Raw proposal returned by a suggestion provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchProposal {
    pub steps: Vec<String>,
    pub rollback: Vec<String>,
    pub risks: Vec<String>,
}

impl PatchProposal {
    /// Turn the proposal into a plan request for `client_id`.
    pub fn into_plan(self, client_id: impl Into<String>, created_by: impl Into<String>) -> NewPlan {
        let steps = self
            .steps
            .iter()
            .map(|s| PlanStep::from_descriptor(s))
            .collect();
        let rollback = self
            .rollback
            .iter()
            .map(|s| PlanStep::from_descriptor(s))
            .collect();

        NewPlan::new(client_id, steps, rollback)
            .risks(self.risks)
            .created_by(created_by)
    }
}

/// Capability that proposes remediation plans.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SuggestionProvider: Send + Sync {
    /// Name recorded as the plan author when no actor is given.
    fn name(&self) -> &'static str;

    async fn propose_patch_plan(
        &self,
        client_id: &str,
        products: &[String],
    ) -> OpsResult<PatchProposal>;
}

/// Deterministic provider used when no model is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct CannedSuggestions;

#[async_trait]
impl SuggestionProvider for CannedSuggestions {
    fn name(&self) -> &'static str {
        "canned"
    }

    async fn propose_patch_plan(
        &self,
        client_id: &str,
        products: &[String],
    ) -> OpsResult<PatchProposal> {
        Ok(PatchProposal {
            steps: vec![
                format!("backup:{client_id}"),
                format!("apply:{}", products.join(",")),
                "reboot".to_string(),
                "verify".to_string(),
            ],
            rollback: vec!["restore:backup".to_string()],
            risks: vec![
                "service interruption".to_string(),
                "rollback required".to_string(),
            ],
        })
    }
}
