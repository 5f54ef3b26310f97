//! Inbound event payloads and resource conversion.

use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, PlatformResult};

/// Attribute carrying a container instance's availability zone.
pub const ZONE_ATTRIBUTE: &str = "ecs.availability-zone";

/// A named resource value reported for a container instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub integer_value: i64,
    pub long_value: i64,
    pub double_value: f64,
    pub string_set_value: Vec<String>,
}

impl Resource {
    pub fn integer(name: &str, value: i64) -> Self {
        Self {
            name: name.to_string(),
            kind: "INTEGER".to_string(),
            integer_value: value,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Container-instance state change emitted by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityEvent {
    pub cluster_arn: String,
    pub ec2_instance_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub remaining_resources: Vec<Resource>,
    #[serde(default)]
    pub registered_resources: Vec<Resource>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl CapacityEvent {
    pub fn cluster_name(&self) -> PlatformResult<String> {
        cluster_name_from_arn(&self.cluster_arn)
    }

    pub fn availability_zone(&self) -> Option<String> {
        availability_zone(&self.attributes)
    }
}

/// Instance-termination lifecycle notification from the fleet group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationEvent {
    #[serde(rename = "EC2InstanceId")]
    pub instance_id: String,
    #[serde(rename = "AutoScalingGroupName")]
    pub group: String,
    #[serde(rename = "LifecycleHookName")]
    pub hook: String,
    #[serde(rename = "LifecycleActionToken", default)]
    pub token: Option<String>,
}

/// Cpu and memory extracted from a resource list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourcePair {
    pub cpu: i64,
    pub memory: i64,
}

impl ResourcePair {
    /// Extract `CPU` and `MEMORY`. Other names are ignored; a `CPU` or
    /// `MEMORY` entry that is not `INTEGER`/`LONG` is rejected. Missing
    /// entries count as zero.
    pub fn from_resources(resources: &[Resource]) -> PlatformResult<Self> {
        let mut pair = ResourcePair::default();
        for r in resources {
            let slot = match r.name.as_str() {
                "CPU" => &mut pair.cpu,
                "MEMORY" => &mut pair.memory,
                _ => continue,
            };
            *slot = match r.kind.as_str() {
                "INTEGER" => r.integer_value,
                "LONG" if r.long_value != 0 => r.long_value,
                "LONG" => r.integer_value,
                other => {
                    return Err(PlatformError::InvalidResource {
                        name: r.name.clone(),
                        reason: format!("unexpected type {other}"),
                    });
                }
            };
        }
        Ok(pair)
    }
}

/// `arn:…:cluster/<name>` → `<name>`.
pub fn cluster_name_from_arn(arn: &str) -> PlatformResult<String> {
    let parts: Vec<&str> = arn.split('/').collect();
    match parts.as_slice() {
        [_, name] if !name.is_empty() => Ok((*name).to_string()),
        _ => Err(PlatformError::MalformedArn(arn.to_string())),
    }
}

pub fn availability_zone(attributes: &[Attribute]) -> Option<String> {
    attributes
        .iter()
        .find(|a| a.name == ZONE_ATTRIBUTE)
        .and_then(|a| a.value.clone())
}
