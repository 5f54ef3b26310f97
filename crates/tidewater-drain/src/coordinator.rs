//! DrainCoordinator — termination events in, lifecycle completions out.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use tidewater_cache::ResourceCache;
use tidewater_core::{DrainConfig, WatcherRegistry, epoch_millis};
use tidewater_platform::{
    ContainerInstance, FleetGroup, LifecycleAction, OrchestrationPlatform, PlatformResult,
    TerminationEvent,
};
use tidewater_state::{InstanceStatus, StateStore};

use crate::error::{DrainError, DrainResult};

/// Container instances per describe call.
const DESCRIBE_BATCH: usize = 100;

/// Result of a handled termination event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainStarted {
    pub cluster: String,
    pub container_instance: String,
    /// `false` when a watcher for the instance was already in flight.
    pub watcher_spawned: bool,
}

/// Everything a drain watcher needs to release the termination hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelease {
    pub cluster: String,
    pub container_instance: String,
    pub instance_id: String,
    pub group: String,
    pub hook: String,
    /// Completes through the token variant when present, the pending-hook
    /// variant otherwise.
    pub token: Option<String>,
}

#[derive(Clone)]
pub struct DrainCoordinator {
    store: StateStore,
    cache: ResourceCache,
    platform: Arc<dyn OrchestrationPlatform>,
    fleet: Arc<dyn FleetGroup>,
    config: DrainConfig,
    watchers: WatcherRegistry,
}

impl DrainCoordinator {
    pub fn new(
        store: StateStore,
        cache: ResourceCache,
        platform: Arc<dyn OrchestrationPlatform>,
        fleet: Arc<dyn FleetGroup>,
        config: DrainConfig,
    ) -> Self {
        Self {
            store,
            cache,
            platform,
            fleet,
            config,
            watchers: WatcherRegistry::new("drain"),
        }
    }

    /// Registry of in-flight drain watchers, keyed by instance id.
    pub fn watchers(&self) -> &WatcherRegistry {
        &self.watchers
    }

    /// Start draining the instance named by a termination lifecycle event.
    pub async fn handle_termination(&self, event: &TerminationEvent) -> DrainResult<DrainStarted> {
        let instance = event.instance_id.as_str();
        let cluster = self.platform.cluster_for_instance(instance).await?;
        let container_instance = self.find_container_instance(&cluster, instance).await?;

        self.platform
            .drain_container_instance(&cluster, &container_instance)
            .await?;
        info!(%cluster, %instance, group = %event.group, "instance set to draining");

        self.mark_draining(&cluster, instance).await?;

        let release = PendingRelease {
            cluster: cluster.clone(),
            container_instance: container_instance.clone(),
            instance_id: instance.to_string(),
            group: event.group.clone(),
            hook: event.hook.clone(),
            token: event.token.clone().filter(|t| !t.is_empty()),
        };
        let watcher_spawned = self.launch_watcher(release).await;

        Ok(DrainStarted {
            cluster,
            container_instance,
            watcher_spawned,
        })
    }

    /// Re-launch watchers for instances the platform reports as DRAINING.
    ///
    /// Clusters come from the service records and the cached snapshots.
    /// Clusters without a fleet group or without a hook for the configured
    /// transition are skipped, as are clusters whose lookups fail. Returns
    /// how many watchers were started.
    pub async fn resume(&self) -> DrainResult<usize> {
        let mut clusters: BTreeSet<String> = self
            .store
            .list_services()?
            .into_iter()
            .map(|s| s.cluster)
            .collect();
        clusters.extend(self.store.list_cluster_resources()?.into_iter().map(|s| s.cluster));

        let mut started = 0;
        for cluster in clusters {
            match self.resume_cluster(&cluster).await {
                Ok(n) => started += n,
                Err(e) => warn!(%cluster, error = %e, "drain resume skipped cluster"),
            }
        }
        Ok(started)
    }

    async fn resume_cluster(&self, cluster: &str) -> DrainResult<usize> {
        let group = match self.fleet.group_for_cluster(cluster).await {
            Ok(group) => group,
            Err(e) if e.is_not_found() => {
                debug!(%cluster, "no fleet group, skipping drain resume");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let hooks = self
            .fleet
            .lifecycle_hook_names(&group, &self.config.lifecycle_transition)
            .await?;
        let Some(hook) = hooks.into_iter().next() else {
            debug!(%cluster, %group, "no termination hook, skipping drain resume");
            return Ok(0);
        };

        let mut started = 0;
        for ci in self.describe_instances(cluster).await? {
            if !ci.is_draining() {
                continue;
            }
            self.mark_draining(cluster, &ci.ec2_instance_id).await?;
            let release = PendingRelease {
                cluster: cluster.to_string(),
                container_instance: ci.arn.clone(),
                instance_id: ci.ec2_instance_id.clone(),
                group: group.clone(),
                hook: hook.clone(),
                token: None,
            };
            if self.launch_watcher(release).await {
                info!(%cluster, instance = %ci.ec2_instance_id, "resumed drain watcher");
                started += 1;
            }
        }
        Ok(started)
    }

    async fn describe_instances(&self, cluster: &str) -> PlatformResult<Vec<ContainerInstance>> {
        let arns = self.platform.list_container_instances(cluster).await?;
        let mut out = Vec::with_capacity(arns.len());
        for chunk in arns.chunks(DESCRIBE_BATCH) {
            out.extend(self.platform.describe_container_instances(cluster, chunk).await?);
        }
        Ok(out)
    }

    async fn find_container_instance(&self, cluster: &str, instance: &str) -> DrainResult<String> {
        self.describe_instances(cluster)
            .await?
            .into_iter()
            .find(|ci| ci.ec2_instance_id == instance)
            .map(|ci| ci.arn)
            .ok_or_else(|| DrainError::InstanceNotRegistered {
                cluster: cluster.to_string(),
                instance: instance.to_string(),
            })
    }

    /// Flip the cached entry to DRAINING. Instances that are not cached
    /// are left for the next rebuild.
    async fn mark_draining(&self, cluster: &str, instance: &str) -> DrainResult<()> {
        let mut lease = self.cache.lock(cluster).await?;
        let now = epoch_millis();
        let already = lease
            .snapshot()
            .and_then(|s| s.entry(instance))
            .is_some_and(|e| e.status == InstanceStatus::Draining);
        if already {
            return Ok(());
        }
        if lease.set_status(instance, InstanceStatus::Draining, now) {
            lease.commit()?;
            debug!(%cluster, %instance, "cached status set to draining");
        } else {
            debug!(%cluster, %instance, "instance not cached");
        }
        Ok(())
    }

    async fn launch_watcher(&self, release: PendingRelease) -> bool {
        let key = release.instance_id.clone();
        let this = self.clone();
        self.watchers
            .spawn(&key, async move {
                this.watch(release).await;
            })
            .await
    }

    /// Poll the running-task count until it reaches zero or the attempt
    /// budget is spent, then release the hook with CONTINUE.
    async fn watch(&self, release: PendingRelease) {
        let cluster = release.cluster.as_str();
        let instance = release.instance_id.as_str();
        let max_attempts = self.config.max_attempts.max(1);

        let mut drained = false;
        for attempt in 1..=max_attempts {
            match self.running_tasks(&release).await {
                Ok(Some(0)) => {
                    drained = true;
                    break;
                }
                Ok(Some(count)) => {
                    debug!(
                        %cluster,
                        %instance,
                        attempt,
                        running = count,
                        "instance still has tasks"
                    );
                }
                Ok(None) => {
                    debug!(%cluster, %instance, "container instance no longer registered");
                    drained = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        %cluster,
                        %instance,
                        attempt,
                        error = %e,
                        "failed to poll running tasks"
                    );
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
        if !drained {
            warn!(
                %cluster,
                %instance,
                attempts = max_attempts,
                "instance did not drain in time, releasing hook anyway"
            );
        }

        match self.complete(&release).await {
            Ok(()) => info!(
                %cluster,
                %instance,
                hook = %release.hook,
                "drain complete, lifecycle action released"
            ),
            Err(e) => error!(
                %cluster,
                %instance,
                error = %e,
                "failed to complete lifecycle action"
            ),
        }
    }

    async fn running_tasks(&self, release: &PendingRelease) -> PlatformResult<Option<u32>> {
        let described = self
            .platform
            .describe_container_instances(
                &release.cluster,
                std::slice::from_ref(&release.container_instance),
            )
            .await?;
        Ok(described.first().map(|ci| ci.running_tasks_count))
    }

    async fn complete(&self, release: &PendingRelease) -> PlatformResult<()> {
        match &release.token {
            Some(token) => {
                self.fleet
                    .complete_lifecycle_action(
                        &release.group,
                        &release.instance_id,
                        &release.hook,
                        token,
                        LifecycleAction::Continue,
                    )
                    .await
            }
            None => {
                self.fleet
                    .complete_pending_lifecycle_action(
                        &release.group,
                        &release.instance_id,
                        &release.hook,
                        LifecycleAction::Continue,
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_platform::{FleetCapacity, MemoryPlatform, ResourcePair};
    use tokio::time::{Duration, Instant};

    const TERMINATING: &str = "autoscaling:EC2_INSTANCE_TERMINATING";

    fn pair(cpu: i64, memory: i64) -> ResourcePair {
        ResourcePair { cpu, memory }
    }

    async fn setup(config: DrainConfig) -> (DrainCoordinator, MemoryPlatform, StateStore) {
        let platform = MemoryPlatform::new();
        for (id, zone) in [("i-1", "eu-west-1a"), ("i-2", "eu-west-1b")] {
            platform
                .add_worker("prod", id, zone, pair(1024, 2048), pair(2048, 4096))
                .await;
        }
        platform
            .add_fleet_group("prod-asg", "prod", FleetCapacity { min: 1, desired: 2, max: 4 })
            .await;
        platform.add_lifecycle_hook("prod-asg", TERMINATING, "drain-hook").await;

        let store = StateStore::open_in_memory().unwrap();
        let shared = Arc::new(platform.clone());
        let cache = ResourceCache::new(store.clone(), shared.clone(), 240_000);
        cache.rebuild("prod", epoch_millis()).await.unwrap();
        let coordinator =
            DrainCoordinator::new(store.clone(), cache, shared.clone(), shared, config);
        (coordinator, platform, store)
    }

    fn termination(instance: &str, token: Option<&str>) -> TerminationEvent {
        TerminationEvent {
            instance_id: instance.to_string(),
            group: "prod-asg".to_string(),
            hook: "drain-hook".to_string(),
            token: token.map(str::to_string),
        }
    }

    fn cached_status(store: &StateStore, instance: &str) -> InstanceStatus {
        store
            .get_cluster_resources("prod")
            .unwrap()
            .unwrap()
            .entry(instance)
            .unwrap()
            .status
    }

    #[tokio::test(start_paused = true)]
    async fn hook_released_only_after_tasks_reach_zero() {
        let (coordinator, platform, store) = setup(DrainConfig::default()).await;
        // The lookup while handling the event reads the first count.
        platform.script_running_tasks("i-1", vec![2, 2, 1, 0]).await;

        let started = Instant::now();
        let result = coordinator
            .handle_termination(&termination("i-1", Some("tok-1")))
            .await
            .unwrap();
        assert_eq!(result.cluster, "prod");
        assert!(result.watcher_spawned);

        assert_eq!(platform.instance_status("i-1").await.as_deref(), Some("DRAINING"));
        assert_eq!(cached_status(&store, "i-1"), InstanceStatus::Draining);
        assert_eq!(cached_status(&store, "i-2"), InstanceStatus::Active);
        assert!(platform.completions().await.is_empty());

        assert!(coordinator.watchers().wait("i-1").await);
        assert!(started.elapsed() >= Duration::from_secs(30));

        let completions = platform.completions().await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].instance_id, "i-1");
        assert_eq!(completions[0].hook, "drain-hook");
        assert_eq!(completions[0].token.as_deref(), Some("tok-1"));
        assert_eq!(completions[0].action, LifecycleAction::Continue);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_uses_pending_hook_variant() {
        let (coordinator, platform, _) = setup(DrainConfig::default()).await;

        coordinator
            .handle_termination(&termination("i-2", None))
            .await
            .unwrap();
        coordinator.watchers().wait_all().await;

        let completions = platform.completions().await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].token, None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_still_releases_hook() {
        let config = DrainConfig {
            max_attempts: 3,
            ..Default::default()
        };
        let (coordinator, platform, _) = setup(config).await;
        platform.set_running_tasks("i-1", 4).await;

        let started = Instant::now();
        coordinator
            .handle_termination(&termination("i-1", Some("tok")))
            .await
            .unwrap();
        coordinator.watchers().wait_all().await;

        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(45));
        assert_eq!(platform.completions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_instance_mutates_nothing() {
        let (coordinator, platform, _) = setup(DrainConfig::default()).await;

        let err = coordinator
            .handle_termination(&termination("i-404", Some("tok")))
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::Platform(ref e) if e.is_not_found()));
        assert_eq!(platform.mutation_count().await, 0);
        assert!(coordinator.watchers().active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn uncached_instance_still_drains() {
        let (coordinator, platform, store) = setup(DrainConfig::default()).await;
        platform
            .add_worker("prod", "i-3", "eu-west-1c", pair(1, 1), pair(1, 1))
            .await;

        coordinator
            .handle_termination(&termination("i-3", Some("tok")))
            .await
            .unwrap();
        coordinator.watchers().wait_all().await;

        let snap = store.get_cluster_resources("prod").unwrap().unwrap();
        assert!(snap.entry("i-3").is_none());
        assert_eq!(platform.completions().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_reattaches_to_draining_instances() {
        let (coordinator, platform, store) = setup(DrainConfig::default()).await;
        platform.set_instance_status("i-2", "DRAINING").await;
        platform.script_running_tasks("i-2", vec![1, 1, 1, 0]).await;

        assert_eq!(coordinator.resume().await.unwrap(), 1);
        assert_eq!(cached_status(&store, "i-2"), InstanceStatus::Draining);
        // Already in flight.
        assert_eq!(coordinator.resume().await.unwrap(), 0);

        coordinator.watchers().wait_all().await;
        let completions = platform.completions().await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].instance_id, "i-2");
        assert_eq!(completions[0].hook, "drain-hook");
        assert_eq!(completions[0].token, None);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_continues_past_failing_cluster() {
        let (coordinator, platform, store) = setup(DrainConfig::default()).await;
        // "alpha" sorts before "prod", so its failure comes first.
        platform
            .add_worker("alpha", "i-7", "eu-west-1a", pair(1, 1), pair(1, 1))
            .await;
        platform.set_instance_status("i-7", "DRAINING").await;
        platform
            .add_fleet_group("alpha-asg", "alpha", FleetCapacity { min: 0, desired: 1, max: 2 })
            .await;
        platform.add_lifecycle_hook("alpha-asg", TERMINATING, "alpha-hook").await;
        let mut snap = store.get_cluster_resources("prod").unwrap().unwrap();
        snap.cluster = "alpha".to_string();
        snap.instances.clear();
        store.put_cluster_resources(&snap).unwrap();

        platform.set_instance_status("i-2", "DRAINING").await;
        platform.script_running_tasks("i-2", vec![1, 1, 1, 0]).await;
        platform.fail_for("lifecycle_hook_names", "alpha-asg").await;

        assert_eq!(coordinator.resume().await.unwrap(), 1);
        assert_eq!(coordinator.watchers().active().await, vec!["i-2".to_string()]);

        coordinator.watchers().wait_all().await;
        let completions = platform.completions().await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].instance_id, "i-2");
    }

    #[tokio::test(start_paused = true)]
    async fn resume_skips_clusters_without_hooks() {
        let (coordinator, platform, store) = setup(DrainConfig::default()).await;
        platform
            .add_worker("batch", "i-9", "eu-west-1a", pair(1, 1), pair(1, 1))
            .await;
        platform.set_instance_status("i-9", "DRAINING").await;
        platform
            .add_fleet_group("batch-asg", "batch", FleetCapacity { min: 0, desired: 1, max: 2 })
            .await;
        let mut snap = store.get_cluster_resources("prod").unwrap().unwrap();
        snap.cluster = "batch".to_string();
        snap.instances.clear();
        store.put_cluster_resources(&snap).unwrap();

        assert_eq!(coordinator.resume().await.unwrap(), 0);
        assert!(platform.completions().await.is_empty());
    }
}
