//! tidewater-drain — graceful removal of terminating workers.
//!
//! A termination lifecycle event puts the worker into DRAINING on the
//! platform so the scheduler moves its tasks elsewhere. A background
//! watcher then polls the worker's running-task count and releases the
//! termination hook with CONTINUE once it reaches zero, or once the
//! attempt budget is spent.
//!
//! Watchers are keyed by instance id. After a restart,
//! [`DrainCoordinator::resume`] re-attaches to every worker the platform
//! still reports as DRAINING.

pub mod coordinator;
pub mod error;

pub use coordinator::{DrainCoordinator, DrainStarted, PendingRelease};
pub use error::{DrainError, DrainResult};
