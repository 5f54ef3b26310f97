//! tidewater-core — pieces shared by every Tidewater crate.
//!
//! - **`config`**: `tidewater.toml` parsing (`ControllerConfig`)
//! - **`registry`**: keyed registry of fire-and-forget background watchers
//! - **`clock`**: epoch-millisecond helpers used for record keys and cooldowns

pub mod clock;
pub mod config;
pub mod registry;

pub use clock::{epoch_millis, minutes, secs};
pub use config::{ControllerConfig, DrainConfig, ProvisioningConfig, RolloutConfig, ScalingConfig};
pub use registry::WatcherRegistry;
