//! Alert deduplication and patch rollout orchestration.
//!
//! Noisy alert streams are collapsed into fingerprint clusters, and patch
//! plans move through approval, execution, and rollback. Slow work runs on
//! named job queues with at-least-once delivery; status changes are pushed
//! to observers through a [`notify::Notifier`].
//!
//! # Architecture
//!
//! - [`store::Store`]: persistence for alerts, clusters, plans, and runs
//! - [`alerts::ClusterEngine`]: idempotent clustering passes
//! - [`patch::PatchWorkflow`]: plan and run state machines
//! - [`queue::JobQueue`] and [`queue::WorkerPool`]: leased delivery with
//!   retries and a dead-letter list
//! - [`orchestrator::Orchestrator`]: composition root exposing the intents
//!
//! # Configuration
//!
//! See [`config::OrchestratorConfig::from_env`].

#![warn(clippy::pedantic)]

pub mod alerts;
pub mod config;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod patch;
pub mod queue;
pub mod store;

pub use config::OrchestratorConfig;
pub use error::{ErrorKind, OpsError, OpsResult};
pub use orchestrator::{ClusterTrigger, Orchestrator, Workers};
