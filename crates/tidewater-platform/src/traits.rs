use async_trait::async_trait;
use tidewater_state::{HealthCheck, RuleCondition, Stickiness};

use crate::error::PlatformResult;
use crate::types::*;

/// Maximum services per `describe_services` call.
pub const DESCRIBE_SERVICES_LIMIT: usize = 10;

/// Maximum tasks per `describe_tasks` call.
pub const DESCRIBE_TASKS_LIMIT: usize = 100;

#[async_trait]
pub trait OrchestrationPlatform: Send + Sync {
    /// Register a new revision; returns its identifier.
    async fn register_task_definition(&self, definition: &TaskDefinition) -> PlatformResult<String>;

    async fn create_service(&self, request: &CreateServiceRequest) -> PlatformResult<()>;

    async fn update_service(&self, request: &UpdateServiceRequest) -> PlatformResult<()>;

    async fn delete_service(&self, cluster: &str, service: &str) -> PlatformResult<()>;

    /// Describe up to [`DESCRIBE_SERVICES_LIMIT`] services. Unknown names are
    /// omitted from the result.
    async fn describe_services(
        &self,
        cluster: &str,
        services: &[String],
    ) -> PlatformResult<Vec<ServiceDescription>>;

    async fn list_tasks(&self, cluster: &str, service: &str) -> PlatformResult<Vec<String>>;

    /// Describe up to [`DESCRIBE_TASKS_LIMIT`] tasks.
    async fn describe_tasks(
        &self,
        cluster: &str,
        tasks: &[String],
    ) -> PlatformResult<Vec<TaskInfo>>;

    async fn list_container_instances(&self, cluster: &str) -> PlatformResult<Vec<String>>;

    async fn describe_container_instances(
        &self,
        cluster: &str,
        instances: &[String],
    ) -> PlatformResult<Vec<ContainerInstance>>;

    /// Stop placing tasks on a container instance.
    async fn drain_container_instance(
        &self,
        cluster: &str,
        instance_arn: &str,
    ) -> PlatformResult<()>;

    /// Cluster a worker instance is tagged with.
    async fn cluster_for_instance(&self, instance_id: &str) -> PlatformResult<String>;
}

#[async_trait]
pub trait FleetGroup: Send + Sync {
    /// Group tagged with the cluster name.
    async fn group_for_cluster(&self, cluster: &str) -> PlatformResult<String>;

    async fn capacity(&self, group: &str) -> PlatformResult<FleetCapacity>;

    /// Change the desired size by `change`. Fails with
    /// [`PlatformError::CapacityBound`](crate::PlatformError::CapacityBound)
    /// when the group already sits on the bound being crossed. Returns the
    /// new desired size.
    async fn scale(&self, group: &str, change: i32) -> PlatformResult<u32>;

    async fn lifecycle_hook_names(
        &self,
        group: &str,
        transition: &str,
    ) -> PlatformResult<Vec<String>>;

    async fn complete_lifecycle_action(
        &self,
        group: &str,
        instance_id: &str,
        hook: &str,
        token: &str,
        action: LifecycleAction,
    ) -> PlatformResult<()>;

    /// Complete the pending action for an instance without its token.
    async fn complete_pending_lifecycle_action(
        &self,
        group: &str,
        instance_id: &str,
        hook: &str,
        action: LifecycleAction,
    ) -> PlatformResult<()>;
}

#[async_trait]
pub trait RoleProvisioner: Send + Sync {
    /// Ensure the execution role of `service` exists, creating it (plus a
    /// secrets-access policy when `secrets_access` is set). Returns its id.
    async fn ensure_task_role(&self, service: &str, secrets_access: bool) -> PlatformResult<String>;

    /// Ensure the shared role the platform uses for load balancer registration.
    async fn ensure_service_role(&self, role: &str) -> PlatformResult<String>;
}

#[async_trait]
pub trait RoutingProvisioner: Send + Sync {
    /// Create the load-balancer target for a service; returns its id.
    async fn create_target(&self, cluster: &str, target: &TargetSpec) -> PlatformResult<String>;

    async fn target_for_service(&self, cluster: &str, service: &str) -> PlatformResult<String>;

    async fn update_health_check(
        &self,
        target: &str,
        health_check: &HealthCheck,
    ) -> PlatformResult<()>;

    async fn update_target_attributes(
        &self,
        target: &str,
        stickiness: &Stickiness,
        deregistration_delay: Option<u32>,
    ) -> PlatformResult<()>;

    /// Attach rules forwarding to `target`. A condition without listeners
    /// applies to every listener of the cluster. Returns the listener ids
    /// that received a rule.
    async fn create_rules(
        &self,
        cluster: &str,
        target: &str,
        conditions: &[RuleCondition],
    ) -> PlatformResult<Vec<String>>;
}

/// Describe any number of services, batching by the per-call limit.
pub async fn describe_all_services(
    platform: &dyn OrchestrationPlatform,
    cluster: &str,
    services: &[String],
) -> PlatformResult<Vec<ServiceDescription>> {
    let mut out = Vec::with_capacity(services.len());
    for chunk in services.chunks(DESCRIBE_SERVICES_LIMIT) {
        out.extend(platform.describe_services(cluster, chunk).await?);
    }
    Ok(out)
}

/// List and describe every task of a service, batching by the per-call limit.
pub async fn describe_all_tasks(
    platform: &dyn OrchestrationPlatform,
    cluster: &str,
    service: &str,
) -> PlatformResult<Vec<TaskInfo>> {
    let arns = platform.list_tasks(cluster, service).await?;
    let mut out = Vec::with_capacity(arns.len());
    for chunk in arns.chunks(DESCRIBE_TASKS_LIMIT) {
        out.extend(platform.describe_tasks(cluster, chunk).await?);
    }
    Ok(out)
}
