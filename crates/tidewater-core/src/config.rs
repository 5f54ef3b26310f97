//! tidewater.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file at all) yields
//! the production settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub scaling: ScalingConfig,
    pub rollout: RolloutConfig,
    pub drain: DrainConfig,
    pub provisioning: ProvisioningConfig,
}

/// Fleet autoscaling thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Maximum age of a cluster resource snapshot before a full rebuild.
    pub cache_ttl_secs: u64,
    /// Minimum interval between two fleet-size mutations for one cluster.
    pub cooldown_secs: u64,
    /// Extra memory headroom, as a fraction of the worst-case unit, required
    /// per zone before a node may be removed.
    pub scale_down_buffer_ratio: f64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 240,
            cooldown_secs: 300,
            scale_down_buffer_ratio: 0.5,
        }
    }
}

/// Deployment stability watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub poll_interval_secs: u64,
    /// Timeout used when the spec has no health-check grace period.
    pub default_timeout_mins: u64,
    /// How many recent records rollback inspects for a known-good version.
    pub rollback_window: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            default_timeout_mins: 15,
            rollback_window: 10,
        }
    }
}

/// Node drain watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    /// Lifecycle transition used to look up the pending hook on resume.
    pub lifecycle_transition: String,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            max_attempts: 80,
            lifecycle_transition: "autoscaling:EC2_INSTANCE_TERMINATING".to_string(),
        }
    }
}

/// Settings for the provisioning collaborators and task definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Attach a secrets-access policy to new execution roles and inject the
    /// parameter path into containers.
    pub parameter_store_enabled: bool,
    /// Parameter path prefix, e.g. `myco-prod`.
    pub parameter_store_prefix: String,
    /// Registry host used for images given without a full URI.
    pub image_registry: Option<String>,
    /// Role the platform assumes to register tasks with the load balancer.
    pub service_role: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            parameter_store_enabled: false,
            parameter_store_prefix: String::new(),
            image_registry: None,
            service_role: "ecs-service-role".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl ScalingConfig {
    pub fn cache_ttl_millis(&self) -> u64 {
        crate::clock::secs(self.cache_ttl_secs)
    }

    pub fn cooldown_millis(&self) -> u64 {
        crate::clock::secs(self.cooldown_secs)
    }
}

impl RolloutConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl DrainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
