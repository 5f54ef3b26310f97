//! Orchestrator — drives a service from spec to persisted verdict.
//!
//! `deploy` does the synchronous part (role, task definition, service
//! create-or-update, records) and hands the record to a background
//! stability watcher. The watcher polls the platform until the service
//! settles or the timeout passes, writes the verdict through the gated
//! transition, and rolls back on failure.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tidewater_core::{ProvisioningConfig, RolloutConfig, WatcherRegistry, epoch_millis};
use tidewater_platform::{
    CreateServiceRequest, LoadBalancerBinding, OrchestrationPlatform, PlacementKind,
    PlacementStrategy, RoleProvisioner, RoutingProvisioner, ServiceDescription, TargetSpec,
    UpdateServiceRequest, describe_all_tasks,
};
use tidewater_state::{
    DeploymentRecord, DeploymentSpec, DeploymentStatus, RuleCondition, ServiceRecord, StateStore,
    Transition,
};

use crate::error::{DeployError, DeployResult};
use crate::stability::{assess, watch_timeout};
use crate::taskdef::{build_task_definition, validate_spec};

/// Identity of a started deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReceipt {
    pub service_name: String,
    pub cluster: String,
    pub task_definition: String,
    pub time: u64,
}

impl From<&DeploymentRecord> for DeployReceipt {
    fn from(r: &DeploymentRecord) -> Self {
        Self {
            service_name: r.service_name.clone(),
            cluster: r.cluster.clone(),
            task_definition: r.task_definition.clone(),
            time: r.time,
        }
    }
}

/// What a stability watcher concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    Succeeded,
    /// Marked failed. `rolled_back_to` names the re-applied task definition.
    Failed {
        reason: String,
        rolled_back_to: Option<String>,
    },
    /// The record left `running` before the verdict; nothing was written.
    Dropped { current: DeploymentStatus },
}

#[derive(Clone)]
pub struct Orchestrator {
    store: StateStore,
    platform: Arc<dyn OrchestrationPlatform>,
    roles: Arc<dyn RoleProvisioner>,
    routing: Arc<dyn RoutingProvisioner>,
    rollout: RolloutConfig,
    provisioning: ProvisioningConfig,
    watchers: WatcherRegistry,
    /// One deploy at a time per service, from reading the previous record
    /// to writing the new one.
    leases: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        platform: Arc<dyn OrchestrationPlatform>,
        roles: Arc<dyn RoleProvisioner>,
        routing: Arc<dyn RoutingProvisioner>,
        rollout: RolloutConfig,
        provisioning: ProvisioningConfig,
    ) -> Self {
        Self {
            store,
            platform,
            roles,
            routing,
            rollout,
            provisioning,
            watchers: WatcherRegistry::new("deployment"),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registry of in-flight stability watchers, keyed by record key.
    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    // ── Deploy ─────────────────────────────────────────────────────

    async fn lease(&self, service: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut leases = self.leases.lock().await;
            leases
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Start a deployment of `service`. Concurrent deploys of the same
    /// service queue behind each other, so at most one record is running.
    pub async fn deploy(&self, service: &str, spec: DeploymentSpec) -> DeployResult<DeployReceipt> {
        validate_spec(service, &spec)?;
        let _lease = self.lease(service).await;
        let cluster = spec.cluster.clone();
        let last = self.store.last_deployment(service)?;

        let role = self
            .roles
            .ensure_task_role(service, self.provisioning.parameter_store_enabled)
            .await?;
        let definition = build_task_definition(service, &role, &spec, &self.provisioning);
        let task_definition = self.platform.register_task_definition(&definition).await?;
        debug!(%service, %task_definition, "task definition registered");

        if self.service_exists(&cluster, service).await? {
            self.update_existing(service, &spec, last.as_ref(), &task_definition)
                .await?;
        } else {
            info!(%service, %cluster, "service not found, creating");
            self.create_service(service, &spec, &task_definition).await?;
        }

        if let Some(prev) = last.as_ref().filter(|r| r.status == DeploymentStatus::Running) {
            let t = self.store.transition_deployment(
                &prev.service_name,
                prev.time,
                DeploymentStatus::Aborted,
                None,
            )?;
            debug!(
                %service,
                time = prev.time,
                applied = t.is_applied(),
                "previous deployment aborted"
            );
        }

        let record = self.store.create_deployment(&DeploymentRecord {
            service_name: service.to_string(),
            cluster: cluster.clone(),
            time: epoch_millis(),
            task_definition: task_definition.clone(),
            spec,
            status: DeploymentStatus::Running,
            reason: None,
        })?;
        info!(%service, %cluster, time = record.time, %task_definition, "deployment started");

        let receipt = DeployReceipt::from(&record);
        self.launch_watcher(record).await;
        Ok(receipt)
    }

    /// Deploy the spec stored in an earlier record again.
    pub async fn redeploy(&self, service: &str, time: u64) -> DeployResult<DeployReceipt> {
        let record = self
            .store
            .get_deployment(service, time)?
            .ok_or_else(|| DeployError::NotFound(format!("{service}/{time}")))?;
        debug!(%service, time, "redeploying stored spec");
        self.deploy(service, record.spec).await
    }

    async fn service_exists(&self, cluster: &str, service: &str) -> DeployResult<bool> {
        let found = self
            .platform
            .describe_services(cluster, &[service.to_string()])
            .await?;
        Ok(found.iter().any(ServiceDescription::is_active))
    }

    async fn update_existing(
        &self,
        service: &str,
        spec: &DeploymentSpec,
        last: Option<&DeploymentRecord>,
        task_definition: &str,
    ) -> DeployResult<()> {
        if let Some(last) = last
            && spec.is_routed()
        {
            let target = self.routing.target_for_service(&spec.cluster, service).await?;
            if last.spec.health_check != spec.health_check {
                debug!(%service, %target, "updating health check");
                self.routing
                    .update_health_check(&target, &spec.health_check)
                    .await?;
            }
            if last.spec.target_attributes_differ(spec) {
                debug!(%service, %target, "updating target attributes");
                self.routing
                    .update_target_attributes(&target, &spec.stickiness, spec.deregistration_delay)
                    .await?;
            }
        }

        let shape = spec.resource_shape();
        match self.store.get_service(service)? {
            Some(mut record) if record.resources != shape => {
                debug!(%service, "service resource shape changed");
                record.resources = shape;
                record.updated_at = epoch_millis();
                self.store.put_service(&record)?;
            }
            Some(_) => {}
            None => {
                self.store.put_service(&ServiceRecord {
                    name: service.to_string(),
                    cluster: spec.cluster.clone(),
                    listeners: Vec::new(),
                    resources: shape,
                    updated_at: epoch_millis(),
                })?;
            }
        }

        self.platform
            .update_service(&UpdateServiceRequest {
                cluster: spec.cluster.clone(),
                service_name: service.to_string(),
                task_definition: task_definition.to_string(),
                health_check_grace_period: grace_period(spec),
            })
            .await?;
        debug!(%service, %task_definition, "service updated");
        Ok(())
    }

    async fn create_service(
        &self,
        service: &str,
        spec: &DeploymentSpec,
        task_definition: &str,
    ) -> DeployResult<()> {
        let cluster = spec.cluster.as_str();
        let mut listeners = Vec::new();
        let mut load_balancer = None;

        if spec.is_routed() {
            let target = self
                .routing
                .create_target(
                    cluster,
                    &TargetSpec {
                        service_name: service.to_string(),
                        port: spec.service_port,
                        protocol: spec.service_protocol.clone(),
                        health_check: spec.health_check.clone(),
                    },
                )
                .await?;
            if spec.deregistration_delay.is_some() || spec.stickiness.enabled {
                self.routing
                    .update_target_attributes(&target, &spec.stickiness, spec.deregistration_delay)
                    .await?;
            }
            let conditions = if spec.rule_conditions.is_empty() {
                default_rules(service)
            } else {
                spec.rule_conditions.clone()
            };
            listeners = self.routing.create_rules(cluster, &target, &conditions).await?;
            load_balancer = Some(LoadBalancerBinding {
                container_name: service.to_string(),
                container_port: spec.service_port,
                target,
            });
        }

        self.roles
            .ensure_service_role(&self.provisioning.service_role)
            .await?;

        self.platform
            .create_service(&CreateServiceRequest {
                cluster: cluster.to_string(),
                service_name: service.to_string(),
                task_definition: task_definition.to_string(),
                desired_count: spec.desired_count,
                placement: vec![
                    PlacementStrategy {
                        kind: PlacementKind::Spread,
                        field: "attribute:ecs.availability-zone".to_string(),
                    },
                    PlacementStrategy {
                        kind: PlacementKind::Binpack,
                        field: "memory".to_string(),
                    },
                ],
                role: load_balancer
                    .as_ref()
                    .map(|_| self.provisioning.service_role.clone()),
                load_balancer,
                minimum_healthy_percent: spec.minimum_healthy_percent.filter(|p| *p > 0),
                maximum_percent: spec.maximum_percent.filter(|p| *p > 0),
                health_check_grace_period: grace_period(spec),
            })
            .await?;

        self.store.put_service(&ServiceRecord {
            name: service.to_string(),
            cluster: cluster.to_string(),
            listeners,
            resources: spec.resource_shape(),
            updated_at: epoch_millis(),
        })?;
        info!(%service, %cluster, "service created");
        Ok(())
    }

    // ── Stability watch ────────────────────────────────────────────

    async fn launch_watcher(&self, record: DeploymentRecord) -> bool {
        let key = record.table_key();
        let this = self.clone();
        self.watchers
            .spawn(&key, async move {
                let service = record.service_name.clone();
                let deployment = record.table_key();
                match this.verify_stable(&record).await {
                    Ok(outcome) => {
                        debug!(%service, %deployment, ?outcome, "stability watcher finished")
                    }
                    Err(e) => error!(
                        %service,
                        %deployment,
                        error = %e,
                        "stability watcher abandoned, record stays running until the next resume"
                    ),
                }
            })
            .await
    }

    /// Poll until the record's rollout settles or times out, then persist
    /// the verdict. Failure triggers a rollback.
    pub async fn verify_stable(&self, record: &DeploymentRecord) -> DeployResult<WatchOutcome> {
        let service = record.service_name.as_str();
        let cluster = record.cluster.as_str();
        let timeout = watch_timeout(
            record.spec.health_check.grace_period_seconds,
            self.rollout.default_timeout_mins,
        );
        let deadline = Instant::now() + timeout;
        debug!(
            %service,
            %cluster,
            timeout_secs = timeout.as_secs(),
            "waiting for service to become stable"
        );

        let (description, timed_out) = loop {
            if let Some(current) = self.current_status(record)?
                && current.is_terminal()
            {
                debug!(%service, time = record.time, %current, "record no longer running");
                return Ok(WatchOutcome::Dropped { current });
            }

            let description = self
                .platform
                .describe_services(cluster, &[service.to_string()])
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| DeployError::NotFound(format!("service {service} on {cluster}")))?;

            if description.is_stable() {
                break (description, false);
            }
            if Instant::now() >= deadline {
                break (description, true);
            }
            debug!(
                %service,
                running = description.running_count,
                desired = description.desired_count,
                "service not stable yet"
            );
            tokio::time::sleep(self.rollout.poll_interval()).await;
        };

        let tasks = describe_all_tasks(self.platform.as_ref(), cluster, service).await?;
        match assess(&description, &tasks, &record.task_definition, timed_out) {
            Ok(()) => {
                match self.store.transition_deployment(
                    service,
                    record.time,
                    DeploymentStatus::Success,
                    None,
                )? {
                    Transition::Applied(_) => {
                        info!(%service, time = record.time, "deployment succeeded");
                        Ok(WatchOutcome::Succeeded)
                    }
                    Transition::Rejected { current } => {
                        debug!(
                            %service,
                            time = record.time,
                            %current,
                            "late success verdict dropped"
                        );
                        Ok(WatchOutcome::Dropped { current })
                    }
                }
            }
            Err(DeployError::RolloutFailed(reason)) => self.fail(record, reason).await,
            Err(e) => Err(e),
        }
    }

    fn current_status(&self, record: &DeploymentRecord) -> DeployResult<Option<DeploymentStatus>> {
        Ok(self
            .store
            .get_deployment(&record.service_name, record.time)?
            .map(|r| r.status))
    }

    async fn fail(&self, record: &DeploymentRecord, reason: String) -> DeployResult<WatchOutcome> {
        let service = record.service_name.as_str();
        let applied = self.store.transition_deployment(
            service,
            record.time,
            DeploymentStatus::Failed,
            Some(reason.clone()),
        )?;
        if let Transition::Rejected { current } = applied {
            debug!(%service, time = record.time, %current, "late failure verdict dropped");
            return Ok(WatchOutcome::Dropped { current });
        }
        warn!(%service, time = record.time, %reason, "deployment failed, rolling back");

        let rolled_back_to = match self.rollback(service).await {
            Ok(target) => Some(target.task_definition),
            Err(e @ DeployError::NoRollbackTarget(_)) => {
                warn!(%service, "no stable version to roll back to");
                let note = format!("rollback failed: {e}");
                self.store
                    .annotate_deployment_reason(service, record.time, &note)?;
                None
            }
            Err(e) => return Err(e),
        };
        Ok(WatchOutcome::Failed {
            reason,
            rolled_back_to,
        })
    }

    // ── Rollback ───────────────────────────────────────────────────

    /// Re-apply the newest successful task definition of `service`.
    ///
    /// Looks at the record before the newest one first, then widens to the
    /// configured window. No deployment record is written for the rollback.
    pub async fn rollback(&self, service: &str) -> DeployResult<DeploymentRecord> {
        let recent = self
            .store
            .recent_deployments(service, self.rollout.rollback_window.max(2))?;

        let target = match recent.get(1) {
            Some(prev) if prev.status == DeploymentStatus::Success => Some(prev),
            _ => {
                debug!(
                    %service,
                    checked = recent.len(),
                    "previous deploy was not successful, widening search"
                );
                recent.iter().find(|r| r.status == DeploymentStatus::Success)
            }
        };
        let Some(target) = target.cloned() else {
            return Err(DeployError::NoRollbackTarget(service.to_string()));
        };

        self.platform
            .update_service(&UpdateServiceRequest {
                cluster: target.cluster.clone(),
                service_name: service.to_string(),
                task_definition: target.task_definition.clone(),
                health_check_grace_period: grace_period(&target.spec),
            })
            .await?;
        info!(
            %service,
            task_definition = %target.task_definition,
            time = target.time,
            "rolled back"
        );
        Ok(target)
    }

    // ── Resume ─────────────────────────────────────────────────────

    /// Start a watcher for every `running` record that has none in flight.
    /// Returns how many were started.
    pub async fn resume(&self) -> DeployResult<usize> {
        let running = self.store.list_running_deployments()?;
        let mut started = 0;
        for record in running {
            let service = record.service_name.clone();
            if self.launch_watcher(record).await {
                info!(%service, "resumed stability watcher");
                started += 1;
            }
        }
        Ok(started)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn deployment_status(&self, service: &str, time: u64) -> DeployResult<DeploymentRecord> {
        self.store
            .get_deployment(service, time)?
            .ok_or_else(|| DeployError::NotFound(format!("{service}/{time}")))
    }

    /// Version history of a service, newest first.
    pub fn list_deployments(&self, service: &str) -> DeployResult<Vec<DeploymentRecord>> {
        let mut all = self.store.list_deployments_for_service(service)?;
        all.reverse();
        Ok(all)
    }

    pub fn deployments_between(&self, start: u64, end: u64) -> DeployResult<Vec<DeploymentRecord>> {
        Ok(self.store.deployments_between(start, end)?)
    }
}

fn grace_period(spec: &DeploymentSpec) -> Option<u32> {
    Some(spec.health_check.grace_period_seconds).filter(|g| *g > 0)
}

/// `/{service}` and `/{service}/*` on every listener.
fn default_rules(service: &str) -> Vec<RuleCondition> {
    [format!("/{service}"), format!("/{service}/*")]
        .into_iter()
        .map(|path| RuleCondition {
            listeners: Vec::new(),
            path_pattern: Some(path),
            hostname: None,
        })
        .collect()
}
