//! tidewaterd — the Tidewater controller daemon.
//!
//! Assembles the subsystems around one state store and one platform:
//! - Deployment orchestrator (`tidewater-rollout`)
//! - Fleet scaling engine (`tidewater-autoscale`)
//! - Node drain coordinator (`tidewater-drain`)
//! - Resource cache shared by scaling and drain (`tidewater-cache`)
//!
//! Control events arrive as newline-delimited JSON (see [`event`]).

pub mod controller;
pub mod event;
pub mod fleet;

pub use controller::{Controller, Resumed};
pub use event::ControlEvent;
pub use fleet::FleetSeed;
