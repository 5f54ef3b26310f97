//! tidewater-rollout — service deployments with automatic rollback.
//!
//! This crate drives one service's rollout from a [`DeploymentSpec`]
//! through to a persisted verdict.
//!
//! # Components
//!
//! - **`taskdef`**: spec validation and task-definition construction
//! - **`stability`**: watch timeout and the ordered stability checks
//! - **`orchestrator`**: deploy, stability watcher, rollback, resume
//!
//! # Record lifecycle
//!
//! ```text
//! deploy ──► running ──► success
//!               │
//!               ├──────► failed ──► rollback to newest success
//!               │
//!               └──────► aborted   (a newer deploy started)
//! ```
//!
//! Only `running` records change status. A watcher whose record was
//! aborted meanwhile drops its verdict and issues no rollback.
//!
//! [`DeploymentSpec`]: tidewater_state::DeploymentSpec

pub mod error;
pub mod orchestrator;
pub mod stability;
pub mod taskdef;

pub use error::{DeployError, DeployResult};
pub use orchestrator::{DeployReceipt, Orchestrator, WatchOutcome};
pub use stability::{assess, watch_timeout};
pub use taskdef::{build_task_definition, image_uri, validate_spec};
