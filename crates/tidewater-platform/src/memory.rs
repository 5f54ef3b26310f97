//! In-memory implementation of every platform contract.
//!
//! Rollouts resolve instantly according to a per-service [`RolloutMode`],
//! running-task counts can be scripted per instance, and every mutating
//! call is recorded so callers can assert on what was issued.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tidewater_state::{HealthCheck, RuleCondition, Stickiness};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PlatformError, PlatformResult};
use crate::events::{Attribute, Resource, ResourcePair, ZONE_ATTRIBUTE};
use crate::traits::*;
use crate::types::*;

/// How a service reacts to the next create/update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RolloutMode {
    /// One generation, every task of the new revision running.
    #[default]
    Converge,
    /// The new generation never replaces the old one.
    Hang,
    /// One generation whose tasks of the new revision never reach RUNNING.
    Crash,
}

#[derive(Debug, Clone)]
struct GroupState {
    cluster: String,
    capacity: FleetCapacity,
    hooks: Vec<(String, String)>,
}

#[derive(Default)]
struct MemoryState {
    revisions: HashMap<String, u32>,
    task_definitions: HashMap<String, TaskDefinition>,
    services: BTreeMap<(String, String), ServiceDescription>,
    tasks: HashMap<(String, String), Vec<TaskInfo>>,
    rollout_modes: HashMap<String, RolloutMode>,
    instances: BTreeMap<String, Vec<ContainerInstance>>,
    running_scripts: HashMap<String, VecDeque<u32>>,
    groups: BTreeMap<String, GroupState>,
    completions: Vec<LifecycleCompletion>,
    created_services: Vec<CreateServiceRequest>,
    service_updates: Vec<UpdateServiceRequest>,
    scale_calls: Vec<(String, i32)>,
    roles: BTreeSet<String>,
    role_policies: BTreeSet<String>,
    listeners: HashMap<String, Vec<String>>,
    targets: HashMap<(String, String), String>,
    rules: Vec<(String, RuleCondition)>,
    health_check_updates: Vec<String>,
    attribute_updates: Vec<String>,
    failures: HashSet<String>,
    mutations: u64,
    task_seq: u64,
}

impl MemoryState {
    fn check(&self, operation: &'static str) -> PlatformResult<()> {
        if self.failures.contains(operation) {
            return Err(PlatformError::api(operation, "injected failure"));
        }
        Ok(())
    }

    /// Like [`check`](Self::check), but also honours failures scoped to one
    /// group, cluster or service.
    fn check_for(&self, operation: &'static str, target: &str) -> PlatformResult<()> {
        self.check(operation)?;
        if self.failures.contains(&format!("{operation}:{target}")) {
            return Err(PlatformError::api(operation, "injected failure"));
        }
        Ok(())
    }

    fn mutate(&mut self, operation: &'static str) -> PlatformResult<()> {
        self.check(operation)?;
        self.mutations += 1;
        Ok(())
    }

    fn next_task_arn(&mut self, cluster: &str) -> String {
        self.task_seq += 1;
        format!("arn:aws:ecs:local:000000000000:task/{cluster}/{:08}", self.task_seq)
    }

    /// Point a service at `task_definition` and resolve the rollout.
    fn roll_out(&mut self, cluster: &str, service: &str, task_definition: &str) {
        let mode = self.rollout_modes.get(service).copied().unwrap_or_default();
        let key = (cluster.to_string(), service.to_string());
        let Some(desc) = self.services.get(&key).cloned() else {
            return;
        };
        let desired = desc.desired_count;
        let previous = desc
            .deployments
            .iter()
            .find(|d| d.status == "PRIMARY")
            .cloned();

        let (deployments, tasks) = match mode {
            RolloutMode::Converge => {
                let tasks = (0..desired)
                    .map(|_| TaskInfo {
                        task_arn: self.next_task_arn(cluster),
                        task_definition: task_definition.to_string(),
                        last_status: TASK_RUNNING.to_string(),
                    })
                    .collect();
                let deployments = vec![ServiceDeployment {
                    task_definition: task_definition.to_string(),
                    status: "PRIMARY".to_string(),
                    desired_count: desired,
                    running_count: desired,
                }];
                (deployments, tasks)
            }
            RolloutMode::Hang => {
                let mut deployments = vec![ServiceDeployment {
                    task_definition: task_definition.to_string(),
                    status: "PRIMARY".to_string(),
                    desired_count: desired,
                    running_count: 0,
                }];
                if let Some(mut old) = previous {
                    old.status = "ACTIVE".to_string();
                    deployments.push(old);
                }
                let tasks = self.tasks.get(&key).cloned().unwrap_or_default();
                (deployments, tasks)
            }
            RolloutMode::Crash => {
                let tasks = (0..desired.max(1))
                    .map(|_| TaskInfo {
                        task_arn: self.next_task_arn(cluster),
                        task_definition: task_definition.to_string(),
                        last_status: "STOPPED".to_string(),
                    })
                    .collect();
                let deployments = vec![ServiceDeployment {
                    task_definition: task_definition.to_string(),
                    status: "PRIMARY".to_string(),
                    desired_count: desired,
                    running_count: 0,
                }];
                (deployments, tasks)
            }
        };

        let running_count = deployments.iter().map(|d| d.running_count).sum();
        if let Some(desc) = self.services.get_mut(&key) {
            desc.task_definition = task_definition.to_string();
            desc.deployments = deployments;
            desc.running_count = running_count;
        }
        self.tasks.insert(key, tasks);
        debug!(%cluster, %service, %task_definition, ?mode, "simulated rollout");
    }

    fn find_instance_mut(&mut self, instance_id: &str) -> Option<&mut ContainerInstance> {
        self.instances
            .values_mut()
            .flat_map(|v| v.iter_mut())
            .find(|ci| ci.ec2_instance_id == instance_id)
    }
}

/// In-memory platform. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryPlatform {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Setup ──────────────────────────────────────────────────────

    /// Register a worker with a cluster. Returns its container-instance arn.
    pub async fn add_worker(
        &self,
        cluster: &str,
        instance_id: &str,
        zone: &str,
        free: ResourcePair,
        registered: ResourcePair,
    ) -> String {
        let arn =
            format!("arn:aws:ecs:local:000000000000:container-instance/{cluster}/{instance_id}");
        let instance = ContainerInstance {
            arn: arn.clone(),
            ec2_instance_id: instance_id.to_string(),
            status: "ACTIVE".to_string(),
            running_tasks_count: 0,
            remaining_resources: vec![
                Resource::integer("CPU", free.cpu),
                Resource::integer("MEMORY", free.memory),
            ],
            registered_resources: vec![
                Resource::integer("CPU", registered.cpu),
                Resource::integer("MEMORY", registered.memory),
            ],
            attributes: vec![Attribute {
                name: ZONE_ATTRIBUTE.to_string(),
                value: Some(zone.to_string()),
            }],
        };
        let mut state = self.state.lock().await;
        let workers = state.instances.entry(cluster.to_string()).or_default();
        workers.retain(|ci| ci.ec2_instance_id != instance_id);
        workers.push(instance);
        arn
    }

    pub async fn add_fleet_group(&self, group: &str, cluster: &str, capacity: FleetCapacity) {
        let mut state = self.state.lock().await;
        state.groups.insert(
            group.to_string(),
            GroupState {
                cluster: cluster.to_string(),
                capacity,
                hooks: Vec::new(),
            },
        );
    }

    pub async fn add_lifecycle_hook(&self, group: &str, transition: &str, hook: &str) {
        let mut state = self.state.lock().await;
        if let Some(g) = state.groups.get_mut(group) {
            g.hooks.push((transition.to_string(), hook.to_string()));
        }
    }

    pub async fn add_listener(&self, cluster: &str, listener: &str) {
        let mut state = self.state.lock().await;
        state
            .listeners
            .entry(cluster.to_string())
            .or_default()
            .push(listener.to_string());
    }

    pub async fn set_rollout_mode(&self, service: &str, mode: RolloutMode) {
        self.state
            .lock()
            .await
            .rollout_modes
            .insert(service.to_string(), mode);
    }

    /// Resolve a hanging or crashing rollout as if it had converged.
    pub async fn finish_rollout(&self, cluster: &str, service: &str) {
        let mut state = self.state.lock().await;
        let key = (cluster.to_string(), service.to_string());
        let Some(td) = state.services.get(&key).map(|d| d.task_definition.clone()) else {
            return;
        };
        state.rollout_modes.insert(service.to_string(), RolloutMode::Converge);
        state.roll_out(cluster, service, &td);
    }

    pub async fn set_running_tasks(&self, instance_id: &str, count: u32) {
        let mut state = self.state.lock().await;
        if let Some(ci) = state.find_instance_mut(instance_id) {
            ci.running_tasks_count = count;
        }
    }

    /// Successive `describe_container_instances` calls report these running
    /// counts for the instance; the last value sticks.
    pub async fn script_running_tasks(&self, instance_id: &str, counts: Vec<u32>) {
        let mut state = self.state.lock().await;
        let arn = state.find_instance_mut(instance_id).map(|ci| ci.arn.clone());
        if let Some(arn) = arn {
            state.running_scripts.insert(arn, counts.into());
        }
    }

    pub async fn set_instance_status(&self, instance_id: &str, status: &str) {
        let mut state = self.state.lock().await;
        if let Some(ci) = state.find_instance_mut(instance_id) {
            ci.status = status.to_string();
        }
    }

    /// Make every later call to `operation` fail with an API error.
    pub async fn fail_on(&self, operation: &'static str) {
        self.state.lock().await.failures.insert(operation.to_string());
    }

    /// Make later calls to `operation` fail only when they name `target`.
    pub async fn fail_for(&self, operation: &'static str, target: &str) {
        self.state
            .lock()
            .await
            .failures
            .insert(format!("{operation}:{target}"));
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Number of mutating calls issued so far.
    pub async fn mutation_count(&self) -> u64 {
        self.state.lock().await.mutations
    }

    pub async fn fleet_capacity(&self, group: &str) -> Option<FleetCapacity> {
        self.state.lock().await.groups.get(group).map(|g| g.capacity)
    }

    pub async fn scale_calls(&self) -> Vec<(String, i32)> {
        self.state.lock().await.scale_calls.clone()
    }

    pub async fn completions(&self) -> Vec<LifecycleCompletion> {
        self.state.lock().await.completions.clone()
    }

    pub async fn created_services(&self) -> Vec<CreateServiceRequest> {
        self.state.lock().await.created_services.clone()
    }

    pub async fn service_updates(&self) -> Vec<UpdateServiceRequest> {
        self.state.lock().await.service_updates.clone()
    }

    pub async fn task_definition(&self, id: &str) -> Option<TaskDefinition> {
        self.state.lock().await.task_definitions.get(id).cloned()
    }

    pub async fn instance_status(&self, instance_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .find_instance_mut(instance_id)
            .map(|ci| ci.status.clone())
    }

    pub async fn roles(&self) -> Vec<String> {
        self.state.lock().await.roles.iter().cloned().collect()
    }

    pub async fn role_policies(&self) -> Vec<String> {
        self.state.lock().await.role_policies.iter().cloned().collect()
    }

    /// Rules as `(target, condition)` pairs, in creation order.
    pub async fn rules(&self) -> Vec<(String, RuleCondition)> {
        self.state.lock().await.rules.clone()
    }

    pub async fn health_check_updates(&self) -> Vec<String> {
        self.state.lock().await.health_check_updates.clone()
    }

    pub async fn attribute_updates(&self) -> Vec<String> {
        self.state.lock().await.attribute_updates.clone()
    }
}

#[async_trait]
impl OrchestrationPlatform for MemoryPlatform {
    async fn register_task_definition(
        &self,
        definition: &TaskDefinition,
    ) -> PlatformResult<String> {
        let mut state = self.state.lock().await;
        state.mutate("register_task_definition")?;
        let revision = state.revisions.entry(definition.family.clone()).or_insert(0);
        *revision += 1;
        let id = format!(
            "arn:aws:ecs:local:000000000000:task-definition/{}:{}",
            definition.family, revision
        );
        state.task_definitions.insert(id.clone(), definition.clone());
        Ok(id)
    }

    async fn create_service(&self, request: &CreateServiceRequest) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.mutate("create_service")?;
        let key = (request.cluster.clone(), request.service_name.clone());
        if state.services.get(&key).is_some_and(|d| d.is_active()) {
            return Err(PlatformError::api(
                "create_service",
                format!("service {} already exists", request.service_name),
            ));
        }
        state.services.insert(
            key,
            ServiceDescription {
                service_name: request.service_name.clone(),
                cluster: request.cluster.clone(),
                status: "ACTIVE".to_string(),
                task_definition: request.task_definition.clone(),
                desired_count: request.desired_count,
                running_count: 0,
                deployments: Vec::new(),
            },
        );
        state.created_services.push(request.clone());
        state.roll_out(&request.cluster, &request.service_name, &request.task_definition);
        Ok(())
    }

    async fn update_service(&self, request: &UpdateServiceRequest) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.mutate("update_service")?;
        let key = (request.cluster.clone(), request.service_name.clone());
        if !state.services.get(&key).is_some_and(|d| d.is_active()) {
            return Err(PlatformError::not_found("service", &request.service_name));
        }
        state.service_updates.push(request.clone());
        state.roll_out(&request.cluster, &request.service_name, &request.task_definition);
        Ok(())
    }

    async fn delete_service(&self, cluster: &str, service: &str) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.mutate("delete_service")?;
        let key = (cluster.to_string(), service.to_string());
        match state.services.get_mut(&key) {
            Some(desc) => {
                desc.status = SERVICE_INACTIVE.to_string();
                desc.desired_count = 0;
                desc.running_count = 0;
                desc.deployments.clear();
                state.tasks.remove(&key);
                Ok(())
            }
            None => Err(PlatformError::not_found("service", service)),
        }
    }

    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> PlatformResult<Vec<ServiceDescription>> {
        if services.len() > DESCRIBE_SERVICES_LIMIT {
            return Err(PlatformError::BatchTooLarge {
                operation: "describe_services",
                limit: DESCRIBE_SERVICES_LIMIT,
                given: services.len(),
            });
        }
        let state = self.state.lock().await;
        state.check("describe_services")?;
        Ok(services
            .iter()
            .filter_map(|s| state.services.get(&(cluster.to_string(), s.clone())).cloned())
            .collect())
    }

    async fn list_tasks(&self, cluster: &str, service: &str) -> PlatformResult<Vec<String>> {
        let state = self.state.lock().await;
        state.check("list_tasks")?;
        Ok(state
            .tasks
            .get(&(cluster.to_string(), service.to_string()))
            .map(|tasks| tasks.iter().map(|t| t.task_arn.clone()).collect())
            .unwrap_or_default())
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        tasks: &[String],
    ) -> PlatformResult<Vec<TaskInfo>> {
        if tasks.len() > DESCRIBE_TASKS_LIMIT {
            return Err(PlatformError::BatchTooLarge {
                operation: "describe_tasks",
                limit: DESCRIBE_TASKS_LIMIT,
                given: tasks.len(),
            });
        }
        let state = self.state.lock().await;
        state.check("describe_tasks")?;
        let wanted: HashSet<&String> = tasks.iter().collect();
        Ok(state
            .tasks
            .iter()
            .filter(|((c, _), _)| c == cluster)
            .flat_map(|(_, ts)| ts.iter())
            .filter(|t| wanted.contains(&t.task_arn))
            .cloned()
            .collect())
    }

    async fn list_container_instances(&self, cluster: &str) -> PlatformResult<Vec<String>> {
        let state = self.state.lock().await;
        state.check("list_container_instances")?;
        Ok(state
            .instances
            .get(cluster)
            .map(|v| v.iter().map(|ci| ci.arn.clone()).collect())
            .unwrap_or_default())
    }

    async fn describe_container_instances(
        &self,
        cluster: &str,
        instances: &[String],
    ) -> PlatformResult<Vec<ContainerInstance>> {
        let mut state = self.state.lock().await;
        state.check("describe_container_instances")?;
        let mut out = Vec::new();
        for arn in instances {
            let scripted = match state.running_scripts.get_mut(arn) {
                Some(script) if script.len() > 1 => script.pop_front(),
                Some(script) => script.front().copied(),
                None => None,
            };
            let found = state
                .instances
                .get_mut(cluster)
                .and_then(|v| v.iter_mut().find(|ci| &ci.arn == arn));
            if let Some(ci) = found {
                if let Some(count) = scripted {
                    ci.running_tasks_count = count;
                }
                out.push(ci.clone());
            }
        }
        Ok(out)
    }

    async fn drain_container_instance(
        &self,
        cluster: &str,
        instance_arn: &str,
    ) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.mutate("drain_container_instance")?;
        let found = state
            .instances
            .get_mut(cluster)
            .and_then(|v| v.iter_mut().find(|ci| ci.arn == instance_arn));
        match found {
            Some(ci) => {
                ci.status = "DRAINING".to_string();
                Ok(())
            }
            None => Err(PlatformError::not_found("container instance", instance_arn)),
        }
    }

    async fn cluster_for_instance(&self, instance_id: &str) -> PlatformResult<String> {
        let state = self.state.lock().await;
        state.check("cluster_for_instance")?;
        state
            .instances
            .iter()
            .find(|(_, v)| v.iter().any(|ci| ci.ec2_instance_id == instance_id))
            .map(|(cluster, _)| cluster.clone())
            .ok_or_else(|| PlatformError::not_found("cluster tag for instance", instance_id))
    }
}

#[async_trait]
impl FleetGroup for MemoryPlatform {
    async fn group_for_cluster(&self, cluster: &str) -> PlatformResult<String> {
        let state = self.state.lock().await;
        state.check("group_for_cluster")?;
        state
            .groups
            .iter()
            .find(|(_, g)| g.cluster == cluster)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| PlatformError::not_found("fleet group for cluster", cluster))
    }

    async fn capacity(&self, group: &str) -> PlatformResult<FleetCapacity> {
        let state = self.state.lock().await;
        state.check("capacity")?;
        state
            .groups
            .get(group)
            .map(|g| g.capacity)
            .ok_or_else(|| PlatformError::not_found("fleet group", group))
    }

    async fn scale(&self, group: &str, change: i32) -> PlatformResult<u32> {
        let mut state = self.state.lock().await;
        state.check("scale")?;
        let capacity = state
            .groups
            .get(group)
            .map(|g| g.capacity)
            .ok_or_else(|| PlatformError::not_found("fleet group", group))?;
        if change > 0 && capacity.desired >= capacity.max {
            return Err(PlatformError::CapacityBound {
                group: group.to_string(),
                bound: "maximum",
                desired: capacity.desired,
            });
        }
        if change < 0 && capacity.desired <= capacity.min {
            return Err(PlatformError::CapacityBound {
                group: group.to_string(),
                bound: "minimum",
                desired: capacity.desired,
            });
        }
        state.mutations += 1;
        let desired = capacity
            .desired
            .saturating_add_signed(change)
            .clamp(capacity.min, capacity.max);
        if let Some(g) = state.groups.get_mut(group) {
            g.capacity.desired = desired;
        }
        state.scale_calls.push((group.to_string(), change));
        Ok(desired)
    }

    async fn lifecycle_hook_names(
        &self,
        group: &str,
        transition: &str,
    ) -> PlatformResult<Vec<String>> {
        let state = self.state.lock().await;
        state.check_for("lifecycle_hook_names", group)?;
        let g = state
            .groups
            .get(group)
            .ok_or_else(|| PlatformError::not_found("fleet group", group))?;
        Ok(g.hooks
            .iter()
            .filter(|(t, _)| t == transition)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn complete_lifecycle_action(
        &self,
        group: &str,
        instance_id: &str,
        hook: &str,
        token: &str,
        action: LifecycleAction,
    ) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.mutate("complete_lifecycle_action")?;
        state.completions.push(LifecycleCompletion {
            group: group.to_string(),
            instance_id: instance_id.to_string(),
            hook: hook.to_string(),
            token: Some(token.to_string()),
            action,
        });
        Ok(())
    }

    async fn complete_pending_lifecycle_action(
        &self,
        group: &str,
        instance_id: &str,
        hook: &str,
        action: LifecycleAction,
    ) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.mutate("complete_lifecycle_action")?;
        state.completions.push(LifecycleCompletion {
            group: group.to_string(),
            instance_id: instance_id.to_string(),
            hook: hook.to_string(),
            token: None,
            action,
        });
        Ok(())
    }
}

#[async_trait]
impl RoleProvisioner for MemoryPlatform {
    async fn ensure_task_role(
        &self,
        service: &str,
        secrets_access: bool,
    ) -> PlatformResult<String> {
        let mut state = self.state.lock().await;
        let role = format!("ecs-{service}");
        if !state.roles.contains(&role) {
            state.mutate("ensure_task_role")?;
            state.roles.insert(role.clone());
            if secrets_access {
                state.role_policies.insert(format!("paramstore-{service}"));
            }
        }
        Ok(format!("arn:aws:iam::000000000000:role/{role}"))
    }

    async fn ensure_service_role(&self, role: &str) -> PlatformResult<String> {
        let mut state = self.state.lock().await;
        if !state.roles.contains(role) {
            state.mutate("ensure_service_role")?;
            state.roles.insert(role.to_string());
        }
        Ok(format!("arn:aws:iam::000000000000:role/{role}"))
    }
}

#[async_trait]
impl RoutingProvisioner for MemoryPlatform {
    async fn create_target(&self, cluster: &str, target: &TargetSpec) -> PlatformResult<String> {
        let mut state = self.state.lock().await;
        state.mutate("create_target")?;
        let id = format!("tg-{cluster}-{}", target.service_name);
        state
            .targets
            .insert((cluster.to_string(), target.service_name.clone()), id.clone());
        Ok(id)
    }

    async fn target_for_service(&self, cluster: &str, service: &str) -> PlatformResult<String> {
        let state = self.state.lock().await;
        state.check("target_for_service")?;
        state
            .targets
            .get(&(cluster.to_string(), service.to_string()))
            .cloned()
            .ok_or_else(|| PlatformError::not_found("target", service))
    }

    async fn update_health_check(
        &self,
        target: &str,
        _health_check: &HealthCheck,
    ) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.mutate("update_health_check")?;
        state.health_check_updates.push(target.to_string());
        Ok(())
    }

    async fn update_target_attributes(
        &self,
        target: &str,
        _stickiness: &Stickiness,
        _deregistration_delay: Option<u32>,
    ) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.mutate("update_target_attributes")?;
        state.attribute_updates.push(target.to_string());
        Ok(())
    }

    async fn create_rules(
        &self,
        cluster: &str,
        target: &str,
        conditions: &[RuleCondition],
    ) -> PlatformResult<Vec<String>> {
        let mut state = self.state.lock().await;
        state.mutate("create_rules")?;
        let all = state.listeners.get(cluster).cloned().unwrap_or_default();
        let mut attached: Vec<String> = Vec::new();
        for condition in conditions {
            let listeners = if condition.listeners.is_empty() {
                all.clone()
            } else {
                condition.listeners.clone()
            };
            for l in listeners {
                if !attached.contains(&l) {
                    attached.push(l);
                }
            }
            state.rules.push((target.to_string(), condition.clone()));
        }
        Ok(attached)
    }
}
