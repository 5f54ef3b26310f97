//! Domain types for the Tidewater state store.
//!
//! These types represent the persisted state of deployments, services, and
//! cluster resource snapshots. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

/// Name of a managed service (also the task definition family).
pub type ServiceName = String;

/// Name of an orchestration cluster.
pub type ClusterName = String;

/// Cloud instance id of a worker node (e.g. `i-0abc…`).
pub type InstanceId = String;

// ── Deployment spec ───────────────────────────────────────────────

/// Immutable description of one rollout, as supplied by CI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentSpec {
    pub cluster: ClusterName,
    /// Port the load balancer forwards to.
    pub service_port: u16,
    /// `HTTP`, `HTTPS`, … or `none` to run without routing.
    pub service_protocol: String,
    pub desired_count: u32,
    pub minimum_healthy_percent: Option<u32>,
    pub maximum_percent: Option<u32>,
    pub containers: Vec<ContainerSpec>,
    pub health_check: HealthCheck,
    pub rule_conditions: Vec<RuleCondition>,
    pub stickiness: Stickiness,
    /// Target deregistration delay in seconds; `None` keeps the platform default.
    pub deregistration_delay: Option<u32>,
}

/// One container of a task definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSpec {
    pub container_name: String,
    /// Image repository name; defaults to the container name.
    pub container_image: Option<String>,
    pub container_tag: Option<String>,
    /// Fully qualified image reference. Wins over image + tag.
    pub container_uri: Option<String>,
    pub container_port: Option<u16>,
    pub container_command: Vec<String>,
    pub essential: bool,
    /// Hard cpu limit (cpu units).
    pub cpu: u32,
    pub cpu_reservation: u32,
    /// Hard memory limit (MiB).
    pub memory: u32,
    pub memory_reservation: u32,
}

/// Target-group health check parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheck {
    pub grace_period_seconds: u32,
    pub path: Option<String>,
    pub interval_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
    /// Accepted HTTP codes, e.g. `200-299`.
    pub matcher: Option<String>,
}

/// A routing rule: requests matching the path and/or host on the listed
/// listeners go to this service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleCondition {
    pub listeners: Vec<String>,
    pub path_pattern: Option<String>,
    pub hostname: Option<String>,
}

/// Load-balancer session stickiness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Stickiness {
    pub enabled: bool,
    pub duration: Option<u32>,
}

/// Aggregate cpu/memory reservation and limit of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceShape {
    pub cpu_reservation: i64,
    pub cpu_limit: i64,
    pub memory_reservation: i64,
    pub memory_limit: i64,
}

impl DeploymentSpec {
    /// Whether this service is exposed through the load balancer.
    pub fn is_routed(&self) -> bool {
        !self.service_protocol.eq_ignore_ascii_case("none")
    }

    /// Sum container reservations and limits. A container without a
    /// reservation reserves its hard limit.
    pub fn resource_shape(&self) -> ResourceShape {
        let mut shape = ResourceShape::default();
        for c in &self.containers {
            let memory_reservation = if c.memory_reservation == 0 {
                c.memory
            } else {
                c.memory_reservation
            };
            let cpu_reservation = if c.cpu_reservation == 0 {
                c.cpu
            } else {
                c.cpu_reservation
            };
            shape.memory_reservation += i64::from(memory_reservation);
            shape.memory_limit += i64::from(c.memory);
            shape.cpu_reservation += i64::from(cpu_reservation);
            shape.cpu_limit += i64::from(c.cpu);
        }
        shape
    }

    /// Whether the target-group attributes differ from `other`.
    pub fn target_attributes_differ(&self, other: &DeploymentSpec) -> bool {
        self.stickiness != other.stickiness
            || self.deregistration_delay != other.deregistration_delay
    }
}

// ── Deployment record ─────────────────────────────────────────────

/// Status of one deploy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Success,
    Failed,
    Aborted,
}

impl DeploymentStatus {
    /// Allowed transitions: `running` moves to any terminal status, and
    /// terminal statuses never change.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        matches!(
            (self, next),
            (
                DeploymentStatus::Running,
                DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::Aborted
            )
        )
    }

    pub fn is_terminal(self) -> bool {
        self != DeploymentStatus::Running
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Running => "running",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One persisted deploy attempt. Records are append-only and form the
/// version history that rollback searches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub service_name: ServiceName,
    pub cluster: ClusterName,
    /// Creation time in epoch milliseconds; doubles as the version key.
    pub time: u64,
    pub task_definition: String,
    pub spec: DeploymentSpec,
    pub status: DeploymentStatus,
    pub reason: Option<String>,
}

impl DeploymentRecord {
    /// Build the composite key for the deployments table.
    pub fn table_key(&self) -> String {
        deployment_key(&self.service_name, self.time)
    }
}

/// Composite key for a deployment record.
pub fn deployment_key(service: &str, time: u64) -> String {
    format!("{service}/{time:020}")
}

// ── Service record ────────────────────────────────────────────────

/// A managed service and the resource shape of its current spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceRecord {
    pub name: ServiceName,
    pub cluster: ClusterName,
    /// Listener ids the service's routing rules were attached to.
    pub listeners: Vec<String>,
    pub resources: ResourceShape,
    pub updated_at: u64,
}

// ── Cluster resources ─────────────────────────────────────────────

/// Scheduling status of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Active,
    Draining,
}

/// Free capacity of one worker instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceCapacity {
    pub instance_id: InstanceId,
    pub availability_zone: String,
    pub free_cpu: i64,
    pub free_memory: i64,
    pub status: InstanceStatus,
}

/// Fleet-size mutation chosen by the scaling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    #[serde(rename = "none")]
    NoChange,
    Up,
    Down,
}

/// Cached view of one cluster's free capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterResourceSnapshot {
    pub cluster: ClusterName,
    pub instances: Vec<InstanceCapacity>,
    /// When the instance list was last rebuilt from the platform.
    pub captured_at: u64,
    /// When any entry was last patched.
    pub updated_at: u64,
    /// Action chosen by the most recent scaling decision.
    pub last_action: ScalingAction,
    /// When the last real fleet-size mutation was issued.
    pub last_scaled_at: Option<u64>,
}

impl ClusterResourceSnapshot {
    /// Fresh snapshot built from a full platform query.
    pub fn rebuilt(cluster: &str, instances: Vec<InstanceCapacity>, now: u64) -> Self {
        Self {
            cluster: cluster.to_string(),
            instances,
            captured_at: now,
            updated_at: now,
            last_action: ScalingAction::NoChange,
            last_scaled_at: None,
        }
    }

    /// Whether the instance list is older than `ttl_millis`.
    pub fn is_stale(&self, now: u64, ttl_millis: u64) -> bool {
        now.saturating_sub(self.captured_at) > ttl_millis
    }

    /// Whether a fleet mutation was issued within the last `cooldown_millis`.
    pub fn in_cooldown(&self, now: u64, cooldown_millis: u64) -> bool {
        self.last_scaled_at
            .is_some_and(|at| now.saturating_sub(at) < cooldown_millis)
    }

    pub fn entry(&self, instance_id: &str) -> Option<&InstanceCapacity> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    /// Replace the entry with the same instance id, or append it.
    pub fn upsert(&mut self, entry: InstanceCapacity, now: u64) {
        match self
            .instances
            .iter_mut()
            .find(|i| i.instance_id == entry.instance_id)
        {
            Some(existing) => *existing = entry,
            None => self.instances.push(entry),
        }
        self.updated_at = now;
    }

    /// Set an existing entry's status. Returns `false` if the instance is unknown.
    pub fn set_status(&mut self, instance_id: &str, status: InstanceStatus, now: u64) -> bool {
        match self
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
        {
            Some(entry) => {
                entry.status = status;
                self.updated_at = now;
                true
            }
            None => false,
        }
    }

    /// Record the decision of one scaling cycle. Only real mutations move
    /// the cooldown clock.
    pub fn record_action(&mut self, action: ScalingAction, now: u64) {
        self.last_action = action;
        if action != ScalingAction::NoChange {
            self.last_scaled_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Instance ids currently marked draining.
    pub fn draining(&self) -> impl Iterator<Item = &InstanceCapacity> {
        self.instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Draining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(
        memory: u32,
        memory_reservation: u32,
        cpu: u32,
        cpu_reservation: u32,
    ) -> ContainerSpec {
        ContainerSpec {
            container_name: "web".to_string(),
            memory,
            memory_reservation,
            cpu,
            cpu_reservation,
            ..Default::default()
        }
    }

    #[test]
    fn resource_shape_falls_back_to_hard_limit() {
        let spec = DeploymentSpec {
            containers: vec![container(512, 0, 256, 0), container(1024, 256, 0, 128)],
            ..Default::default()
        };
        let shape = spec.resource_shape();
        assert_eq!(shape.memory_reservation, 512 + 256);
        assert_eq!(shape.memory_limit, 512 + 1024);
        assert_eq!(shape.cpu_reservation, 256 + 128);
        assert_eq!(shape.cpu_limit, 256);
    }

    #[test]
    fn protocol_none_disables_routing() {
        let mut spec = DeploymentSpec {
            service_protocol: "HTTP".to_string(),
            ..Default::default()
        };
        assert!(spec.is_routed());
        spec.service_protocol = "None".to_string();
        assert!(!spec.is_routed());
    }

    #[test]
    fn transition_table() {
        use DeploymentStatus::*;
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Aborted));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Success, Failed, Aborted] {
            assert!(terminal.is_terminal());
            for next in [Running, Success, Failed, Aborted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn deployment_keys_sort_by_time() {
        assert!(deployment_key("api", 999) < deployment_key("api", 1_000));
        assert_eq!(deployment_key("api", 7), "api/00000000000000000007");
    }

    #[test]
    fn snapshot_staleness_and_cooldown() {
        let mut snap = ClusterResourceSnapshot::rebuilt("prod", vec![], 1_000);
        assert!(!snap.is_stale(1_000 + 240_000, 240_000));
        assert!(snap.is_stale(1_000 + 240_001, 240_000));

        assert!(!snap.in_cooldown(5_000, 300_000));
        snap.record_action(ScalingAction::NoChange, 5_000);
        assert!(!snap.in_cooldown(5_000, 300_000));
        snap.record_action(ScalingAction::Up, 5_000);
        assert!(snap.in_cooldown(5_000 + 60_000, 300_000));
        assert!(!snap.in_cooldown(5_000 + 300_000, 300_000));
    }

    #[test]
    fn upsert_replaces_by_instance_id() {
        let mut snap = ClusterResourceSnapshot::rebuilt("prod", vec![], 0);
        let entry = InstanceCapacity {
            instance_id: "i-1".to_string(),
            availability_zone: "eu-west-1a".to_string(),
            free_cpu: 1024,
            free_memory: 2048,
            status: InstanceStatus::Active,
        };
        snap.upsert(entry.clone(), 1);
        snap.upsert(InstanceCapacity { free_cpu: 10, ..entry }, 2);

        assert_eq!(snap.instances.len(), 1);
        assert_eq!(snap.entry("i-1").unwrap().free_cpu, 10);
        assert!(snap.set_status("i-1", InstanceStatus::Draining, 3));
        assert!(!snap.set_status("i-2", InstanceStatus::Draining, 3));
        assert_eq!(snap.draining().count(), 1);
    }

    #[test]
    fn spec_parses_camel_case_json() {
        let json = r#"{
            "cluster": "prod",
            "servicePort": 8080,
            "serviceProtocol": "HTTP",
            "desiredCount": 2,
            "containers": [
                {"containerName": "api", "containerTag": "v2", "memoryReservation": 256, "essential": true}
            ],
            "healthCheck": {"gracePeriodSeconds": 120}
        }"#;
        let spec: DeploymentSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.desired_count, 2);
        assert_eq!(spec.containers[0].memory_reservation, 256);
        assert_eq!(spec.health_check.grace_period_seconds, 120);
        assert!(spec.rule_conditions.is_empty());
    }
}
