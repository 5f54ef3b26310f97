//! tidewater-state — embedded state store for Tidewater.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployment records, service records, and per-cluster
//! resource snapshots.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Deployment records use the composite key `{service}/{time}` with the time
//! zero-padded, so a prefix scan returns one service's history in version
//! order.
//!
//! Status changes on deployment records go through
//! [`StateStore::transition_deployment`], which reads and writes inside one
//! write transaction and consults [`DeploymentStatus::can_transition_to`].
//! A late verdict for a record that already left `running` is rejected
//! instead of overwriting it.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, Transition};
pub use types::*;
