//! Patch plans and runs.
//!
//! A plan is an ordered list of steps plus compensating rollback steps that
//! must be approved before it can run. Each execution attempt is a run.

pub mod executor;
pub mod suggest;
pub mod types;
pub mod workflow;

pub use executor::{SimulatedExecutor, StepError, StepExecutor};
pub use suggest::{CannedSuggestions, PatchProposal, SuggestionProvider};
pub use types::{
    ApprovalDecision, ApprovalStatus, NewPlan, PatchPlan, PatchRun, PlanId, PlanStep, RunId,
    RunStatus, RunUpdate, DEFAULT_TARGET_GROUP,
};
pub use workflow::{PatchWorkflow, RunAction, WorkflowPolicy};
