//! tidewater-platform — contracts to the world outside the controller.
//!
//! The controller never talks to a cloud API directly. Everything it needs
//! from the orchestration platform, the worker fleet group, and the
//! role/routing provisioners is expressed as an async trait here:
//!
//! - [`OrchestrationPlatform`]: task definitions, services, tasks and
//!   container instances on one cluster.
//! - [`FleetGroup`]: the auto-scaling group behind a cluster: capacity,
//!   desired-size writes and termination lifecycle hooks.
//! - [`RoleProvisioner`] / [`RoutingProvisioner`]: execution roles and load
//!   balancer targets/rules created on first deploy.
//!
//! Inbound event payloads ([`CapacityEvent`], [`TerminationEvent`]) and the
//! resource conversion helpers live in [`events`].
//!
//! [`MemoryPlatform`] implements every contract in memory. It backs the
//! test suites and the standalone daemon.

pub mod error;
pub mod events;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::{PlatformError, PlatformResult};
pub use events::{
    Attribute, CapacityEvent, Resource, ResourcePair, TerminationEvent, availability_zone,
    cluster_name_from_arn,
};
pub use memory::{MemoryPlatform, RolloutMode};
pub use traits::{
    FleetGroup, OrchestrationPlatform, RoleProvisioner, RoutingProvisioner, describe_all_services,
    describe_all_tasks,
};
pub use types::*;
