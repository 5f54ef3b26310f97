use std::collections::HashMap;
use std::sync::Arc;

use tidewater_platform::{ContainerInstance, OrchestrationPlatform, ResourcePair, availability_zone};
use tidewater_state::{
    ClusterResourceSnapshot, InstanceCapacity, InstanceStatus, ScalingAction, StateStore,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::CacheResult;

/// Container instances per describe call when rebuilding.
const DESCRIBE_BATCH: usize = 100;

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Fresh(ClusterResourceSnapshot),
    /// Absent or older than the TTL. Carries the outdated snapshot if any.
    Stale(Option<ClusterResourceSnapshot>),
}

#[derive(Clone)]
pub struct ResourceCache {
    store: StateStore,
    platform: Arc<dyn OrchestrationPlatform>,
    ttl_millis: u64,
    leases: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ResourceCache {
    pub fn new(
        store: StateStore,
        platform: Arc<dyn OrchestrationPlatform>,
        ttl_millis: u64,
    ) -> Self {
        Self {
            store,
            platform,
            ttl_millis,
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ttl_millis(&self) -> u64 {
        self.ttl_millis
    }

    /// Read the stored snapshot without taking the lease.
    pub fn get(&self, cluster: &str, now: u64) -> CacheResult<CacheLookup> {
        Ok(match self.store.get_cluster_resources(cluster)? {
            Some(snap) if !snap.is_stale(now, self.ttl_millis) => CacheLookup::Fresh(snap),
            other => CacheLookup::Stale(other),
        })
    }

    /// Take the single-writer lease for `cluster` and load its snapshot.
    ///
    /// Waits while another task holds the lease.
    pub async fn lock(&self, cluster: &str) -> CacheResult<ClusterLease> {
        let slot = {
            let mut leases = self.leases.lock().await;
            leases
                .entry(cluster.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = slot.lock_owned().await;
        let snapshot = self.store.get_cluster_resources(cluster)?;
        Ok(ClusterLease {
            cache: self.clone(),
            cluster: cluster.to_string(),
            snapshot,
            _guard: guard,
        })
    }

    /// Insert or replace one instance entry and persist. Rebuilds first
    /// when the snapshot is absent or stale.
    pub async fn upsert(
        &self,
        cluster: &str,
        entry: InstanceCapacity,
        now: u64,
    ) -> CacheResult<()> {
        let mut lease = self.lock(cluster).await?;
        lease.ensure_fresh(now).await?;
        lease.upsert(entry, now);
        lease.commit()
    }

    /// Replace the snapshot with a full platform query and persist.
    pub async fn rebuild(&self, cluster: &str, now: u64) -> CacheResult<ClusterResourceSnapshot> {
        let mut lease = self.lock(cluster).await?;
        lease.rebuild(now).await?;
        lease.commit()?;
        Ok(lease.snapshot().cloned().unwrap_or_else(|| {
            ClusterResourceSnapshot::rebuilt(cluster, Vec::new(), now)
        }))
    }

    async fn query_platform(&self, cluster: &str) -> CacheResult<Vec<InstanceCapacity>> {
        let arns = self.platform.list_container_instances(cluster).await?;
        let mut entries = Vec::with_capacity(arns.len());
        for chunk in arns.chunks(DESCRIBE_BATCH) {
            for ci in self.platform.describe_container_instances(cluster, chunk).await? {
                entries.push(capacity_from_instance(&ci)?);
            }
        }
        Ok(entries)
    }
}

/// Cache entry for a described container instance.
pub fn capacity_from_instance(ci: &ContainerInstance) -> CacheResult<InstanceCapacity> {
    let free = ResourcePair::from_resources(&ci.remaining_resources)?;
    Ok(InstanceCapacity {
        instance_id: ci.ec2_instance_id.clone(),
        availability_zone: availability_zone(&ci.attributes).unwrap_or_default(),
        free_cpu: free.cpu,
        free_memory: free.memory,
        status: if ci.is_draining() {
            InstanceStatus::Draining
        } else {
            InstanceStatus::Active
        },
    })
}

/// Exclusive access to one cluster's snapshot. Changes are only persisted
/// by [`ClusterLease::commit`]; dropping the lease discards them.
pub struct ClusterLease {
    cache: ResourceCache,
    cluster: String,
    snapshot: Option<ClusterResourceSnapshot>,
    _guard: OwnedMutexGuard<()>,
}

impl ClusterLease {
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn snapshot(&self) -> Option<&ClusterResourceSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn is_fresh(&self, now: u64) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|s| !s.is_stale(now, self.cache.ttl_millis))
    }

    /// Rebuild from the platform unless the held snapshot is fresh.
    /// Returns whether a rebuild happened.
    pub async fn ensure_fresh(&mut self, now: u64) -> CacheResult<bool> {
        if self.is_fresh(now) {
            return Ok(false);
        }
        self.rebuild(now).await?;
        Ok(true)
    }

    /// Replace the instance list with a full platform query. The last
    /// scaling action and its time carry over so cooldown survives.
    pub async fn rebuild(&mut self, now: u64) -> CacheResult<&mut ClusterResourceSnapshot> {
        let instances = self.cache.query_platform(&self.cluster).await?;
        let mut fresh = ClusterResourceSnapshot::rebuilt(&self.cluster, instances, now);
        if let Some(prev) = &self.snapshot {
            fresh.last_action = prev.last_action;
            fresh.last_scaled_at = prev.last_scaled_at;
        }
        info!(
            cluster = %self.cluster,
            instances = fresh.instances.len(),
            "cluster resources rebuilt"
        );
        Ok(self.snapshot.insert(fresh))
    }

    /// Insert or replace an entry. Starts an empty snapshot if none is held.
    pub fn upsert(&mut self, entry: InstanceCapacity, now: u64) {
        debug!(cluster = %self.cluster, instance = %entry.instance_id, "cache upsert");
        let cluster = self.cluster.clone();
        self.snapshot
            .get_or_insert_with(|| ClusterResourceSnapshot::rebuilt(&cluster, Vec::new(), now))
            .upsert(entry, now);
    }

    /// Change an existing entry's status. Returns `false` when the
    /// instance is not cached.
    pub fn set_status(&mut self, instance_id: &str, status: InstanceStatus, now: u64) -> bool {
        self.snapshot
            .as_mut()
            .is_some_and(|s| s.set_status(instance_id, status, now))
    }

    pub fn record_action(&mut self, action: ScalingAction, now: u64) {
        if let Some(s) = self.snapshot.as_mut() {
            s.record_action(action, now);
        }
    }

    /// Persist the held snapshot. A lease that never held one writes nothing.
    pub fn commit(&self) -> CacheResult<()> {
        if let Some(snap) = &self.snapshot {
            self.cache.store.put_cluster_resources(snap)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidewater_platform::MemoryPlatform;

    const TTL: u64 = 240_000;

    fn pair(cpu: i64, memory: i64) -> ResourcePair {
        ResourcePair { cpu, memory }
    }

    async fn setup() -> (ResourceCache, MemoryPlatform, StateStore) {
        let platform = MemoryPlatform::new();
        platform
            .add_worker("prod", "i-1", "eu-west-1a", pair(512, 1024), pair(2048, 4096))
            .await;
        platform
            .add_worker("prod", "i-2", "eu-west-1b", pair(256, 512), pair(2048, 4096))
            .await;
        let store = StateStore::open_in_memory().unwrap();
        let cache = ResourceCache::new(store.clone(), Arc::new(platform.clone()), TTL);
        (cache, platform, store)
    }

    #[tokio::test]
    async fn get_reports_absent_as_stale() {
        let (cache, _, _) = setup().await;
        assert_eq!(cache.get("prod", 0).unwrap(), CacheLookup::Stale(None));
    }

    #[tokio::test]
    async fn rebuild_reads_platform_and_ages_out() {
        let (cache, _, _) = setup().await;
        let snap = cache.rebuild("prod", 1_000).await.unwrap();
        assert_eq!(snap.instances.len(), 2);
        assert_eq!(snap.entry("i-2").unwrap().availability_zone, "eu-west-1b");

        assert!(matches!(cache.get("prod", 1_000 + TTL).unwrap(), CacheLookup::Fresh(_)));
        assert!(matches!(
            cache.get("prod", 1_001 + TTL).unwrap(),
            CacheLookup::Stale(Some(_))
        ));
    }

    #[tokio::test]
    async fn rebuild_keeps_cooldown_state() {
        let (cache, _, store) = setup().await;
        {
            let mut lease = cache.lock("prod").await.unwrap();
            lease.rebuild(0).await.unwrap();
            lease.record_action(ScalingAction::Up, 10);
            lease.commit().unwrap();
        }
        cache.rebuild("prod", 500_000).await.unwrap();

        let snap = store.get_cluster_resources("prod").unwrap().unwrap();
        assert_eq!(snap.captured_at, 500_000);
        assert_eq!(snap.last_scaled_at, Some(10));
        assert_eq!(snap.last_action, ScalingAction::Up);
    }

    #[tokio::test]
    async fn upsert_patches_fresh_snapshot_without_rebuild() {
        let (cache, platform, store) = setup().await;
        cache.rebuild("prod", 0).await.unwrap();
        platform
            .add_worker("prod", "i-3", "eu-west-1c", pair(1, 1), pair(1, 1))
            .await;

        let entry = InstanceCapacity {
            instance_id: "i-1".to_string(),
            availability_zone: "eu-west-1a".to_string(),
            free_cpu: 64,
            free_memory: 128,
            status: InstanceStatus::Active,
        };
        cache.upsert("prod", entry, 60_000).await.unwrap();

        let snap = store.get_cluster_resources("prod").unwrap().unwrap();
        assert_eq!(snap.instances.len(), 2);
        assert_eq!(snap.entry("i-1").unwrap().free_cpu, 64);
        assert_eq!(snap.captured_at, 0);
        assert_eq!(snap.updated_at, 60_000);
    }

    #[tokio::test]
    async fn dropped_lease_discards_changes() {
        let (cache, _, store) = setup().await;
        cache.rebuild("prod", 0).await.unwrap();
        {
            let mut lease = cache.lock("prod").await.unwrap();
            assert!(lease.set_status("i-1", InstanceStatus::Draining, 5));
            assert!(!lease.set_status("i-9", InstanceStatus::Draining, 5));
        }
        let snap = store.get_cluster_resources("prod").unwrap().unwrap();
        assert_eq!(snap.entry("i-1").unwrap().status, InstanceStatus::Active);
    }

    #[tokio::test]
    async fn lease_is_exclusive_per_cluster() {
        let (cache, _, _) = setup().await;
        let lease = cache.lock("prod").await.unwrap();

        let other = cache.clone();
        let waiter = tokio::spawn(async move {
            let _lease = other.lock("prod").await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different cluster is not blocked.
        let _staging = cache.lock("staging").await.unwrap();

        drop(lease);
        waiter.await.unwrap();
    }
}
