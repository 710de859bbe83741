//! # Portal Runner
//!
//! Runs bulk retrieval actions (ledgers, return histories, payment
//! receipts) against a tax portal for many clients, tracking every piece
//! of work in a hierarchical task tree and retrying only what failed.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: Task tree with state and progress aggregation, the
//!   task function wrapper and the parallel / paged mappers
//! - **[`portal`]**: Traits for the portal session and fetch layer plus a
//!   fixture-driven simulated portal
//! - **[`action`]**: Action registry, the action instance state machine,
//!   failure bookkeeping and output merging
//! - **[`run`]**: Run orchestrator and the store of runs and instances
//! - **[`export`]**: JSON export of merged outputs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portal_runner::{
//!     ActionInput, ActionPlan, ActionRegistry, PortalFixture, RunOrchestrator, RunnerConfig,
//!     SimulatedPortal,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let fixture = PortalFixture::from_json_file("portal.json")?;
//!     let portal = Arc::new(SimulatedPortal::new(fixture));
//!     let clients = portal.clients().to_vec();
//!     let client_ids: Vec<String> = clients.iter().map(|c| c.id.clone()).collect();
//!
//!     let mut orchestrator = RunOrchestrator::new(
//!         RunnerConfig::default(),
//!         ActionRegistry::default(),
//!         clients,
//!         portal.clone(),
//!         portal,
//!     );
//!     let plan = ActionPlan {
//!         action_id: "ledger_records".to_string(),
//!         input: ActionInput {
//!             from_date: Some("01/01/2024".to_string()),
//!             to_date: Some("31/12/2024".to_string()),
//!             ..ActionInput::default()
//!         },
//!     };
//!     orchestrator.run_selected(&client_ids, &[plan]).await?;
//!     orchestrator.retry_failures().await?;
//!     Ok(())
//! }
//! ```

/// Hierarchical task tracking.
///
/// Task tree, task function wrapper and bounded-concurrency mappers.
pub mod task;

/// Portal collaborators and the simulated portal.
pub mod portal;

/// Actions, their instances and failure bookkeeping.
pub mod action;

/// Run orchestration and the run store.
pub mod run;

/// JSON export of merged outputs.
pub mod export;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use action::{
    Action, ActionError, ActionInput, ActionInstance, ActionOutput, ActionRegistry, ActionRunner,
    FailedWork, RetryInput, ValidationError, WorkUnit,
};
pub use portal::{Client, PortalError, PortalFetcher, PortalFixture, SessionProvider, SimulatedPortal};
pub use run::{
    ActionPlan, ClientFailures, MergedOutput, RunEvent, RunEventHandler, RunOrchestrator,
    RunStore, RunSummary, RunnerConfig,
};
pub use task::{
    LoggingEventHandler, SharedTaskTree, Task, TaskHandle, TaskId, TaskState, task_function,
};
