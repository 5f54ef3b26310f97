//! Request and description types exchanged with the platform.

use serde::{Deserialize, Serialize};

use crate::events::{Attribute, Resource};

/// Status string of a running task.
pub const TASK_RUNNING: &str = "RUNNING";

/// Service status reported after deletion; treated as absent.
pub const SERVICE_INACTIVE: &str = "INACTIVE";

// ── Task definitions ──────────────────────────────────────────────

/// A task-definition revision to register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Revision family; one per service.
    pub family: String,
    /// Execution role id returned by the role provisioner.
    pub task_role: String,
    pub containers: Vec<ContainerDefinition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    pub port_mappings: Vec<u16>,
    pub command: Vec<String>,
    pub essential: bool,
    pub cpu: Option<u32>,
    pub memory: Option<u32>,
    pub memory_reservation: Option<u32>,
    pub environment: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

// ── Services ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementKind {
    Spread,
    Binpack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementStrategy {
    pub kind: PlacementKind,
    pub field: String,
}

/// Binds a service's tasks to a load-balancer target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerBinding {
    pub container_name: String,
    pub container_port: u16,
    pub target: String,
}

/// Everything needed to create a service on a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub cluster: String,
    pub service_name: String,
    pub task_definition: String,
    pub desired_count: u32,
    pub placement: Vec<PlacementStrategy>,
    pub load_balancer: Option<LoadBalancerBinding>,
    /// Role the platform assumes to register tasks with the load balancer.
    pub role: Option<String>,
    pub minimum_healthy_percent: Option<u32>,
    pub maximum_percent: Option<u32>,
    pub health_check_grace_period: Option<u32>,
}

/// Switch a running service to another task-definition revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateServiceRequest {
    pub cluster: String,
    pub service_name: String,
    pub task_definition: String,
    pub health_check_grace_period: Option<u32>,
}

/// One deployment generation of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDeployment {
    pub task_definition: String,
    /// `PRIMARY` for the newest generation, `ACTIVE` for older ones.
    pub status: String,
    pub desired_count: u32,
    pub running_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub service_name: String,
    pub cluster: String,
    pub status: String,
    pub task_definition: String,
    pub desired_count: u32,
    pub running_count: u32,
    pub deployments: Vec<ServiceDeployment>,
}

impl ServiceDescription {
    /// Whether the service exists in a usable form.
    pub fn is_active(&self) -> bool {
        self.status != SERVICE_INACTIVE
    }

    /// Exactly one deployment generation whose running count reached the
    /// desired count.
    pub fn is_stable(&self) -> bool {
        match self.deployments.as_slice() {
            [only] => only.running_count == only.desired_count,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_arn: String,
    pub task_definition: String,
    pub last_status: String,
}

// ── Container instances ───────────────────────────────────────────

/// A worker node registered with a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub arn: String,
    pub ec2_instance_id: String,
    /// `ACTIVE` or `DRAINING`.
    pub status: String,
    pub running_tasks_count: u32,
    pub remaining_resources: Vec<Resource>,
    pub registered_resources: Vec<Resource>,
    pub attributes: Vec<Attribute>,
}

impl ContainerInstance {
    pub fn is_draining(&self) -> bool {
        self.status == "DRAINING"
    }
}

// ── Fleet ─────────────────────────────────────────────────────────

/// Bounds and current desired size of a fleet group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetCapacity {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleAction {
    Continue,
    Abandon,
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleAction::Continue => f.write_str("CONTINUE"),
            LifecycleAction::Abandon => f.write_str("ABANDON"),
        }
    }
}

/// A recorded lifecycle completion, as seen by the fleet group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleCompletion {
    pub group: String,
    pub instance_id: String,
    pub hook: String,
    /// `None` for the pending-hook variant.
    pub token: Option<String>,
    pub action: LifecycleAction,
}

// ── Routing ───────────────────────────────────────────────────────

/// Target group settings derived from a deployment spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub service_name: String,
    pub port: u16,
    pub protocol: String,
    pub health_check: tidewater_state::HealthCheck,
}
