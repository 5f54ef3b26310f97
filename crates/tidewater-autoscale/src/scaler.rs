//! ScalingEngine — turns capacity-change events into fleet-size changes.
//!
//! The decision itself is the pure [`evaluate`] function; the engine
//! gathers its inputs (worst-case unit, refreshed snapshot, fleet bounds),
//! issues the mutation and persists the outcome under the cluster lease.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use tidewater_cache::ResourceCache;
use tidewater_core::{ScalingConfig, epoch_millis};
use tidewater_platform::{CapacityEvent, FleetCapacity, FleetGroup, PlatformError, ResourcePair};
use tidewater_state::{
    ClusterResourceSnapshot, InstanceCapacity, InstanceStatus, ScalingAction, ServiceRecord,
    StateStore,
};

use crate::error::{ScaleError, ScaleResult};

/// Largest single-service reservation on a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorstCase {
    pub cpu: i64,
    pub memory: i64,
}

impl WorstCase {
    /// `None` when no service runs on the cluster.
    pub fn of(services: &[ServiceRecord]) -> Option<Self> {
        if services.is_empty() {
            return None;
        }
        Some(Self {
            cpu: services.iter().map(|s| s.resources.cpu_reservation).max().unwrap_or(0),
            memory: services
                .iter()
                .map(|s| s.resources.memory_reservation)
                .max()
                .unwrap_or(0),
        })
    }
}

/// Outcome of one processed capacity event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDecision {
    pub cluster: String,
    pub action: ScalingAction,
    pub desired_before: u32,
    pub desired_after: u32,
}

/// Decide the fleet action for a cluster.
///
/// `registered` is the registered capacity of one worker node, taken from
/// the triggering event.
pub fn evaluate(
    snapshot: &ClusterResourceSnapshot,
    worst: WorstCase,
    registered: ResourcePair,
    capacity: FleetCapacity,
    in_cooldown: bool,
    buffer_ratio: f64,
) -> ScalingAction {
    let cluster = snapshot.cluster.as_str();
    let mut fits_everywhere = true;

    if capacity.desired < capacity.max {
        let mut zone_fits: BTreeMap<&str, bool> = BTreeMap::new();
        for i in &snapshot.instances {
            let fits = i.status != InstanceStatus::Draining
                && i.free_cpu > worst.cpu
                && i.free_memory > worst.memory;
            *zone_fits.entry(i.availability_zone.as_str()).or_insert(false) |= fits;
            if fits {
                debug!(
                    %cluster,
                    instance = %i.instance_id,
                    zone = %i.availability_zone,
                    free_cpu = i.free_cpu,
                    free_memory = i.free_memory,
                    "instance fits worst-case unit"
                );
            }
        }
        for (zone, fits) in &zone_fits {
            if !fits {
                fits_everywhere = false;
                info!(
                    %cluster,
                    %zone,
                    cpu = worst.cpu,
                    memory = worst.memory,
                    "no instance in zone can place the worst-case unit"
                );
            }
        }
        if !fits_everywhere && !in_cooldown {
            return ScalingAction::Up;
        }
    }

    if capacity.desired > capacity.min && fits_everywhere {
        let buffer = (worst.memory as f64 * buffer_ratio).ceil() as i64;
        let needed_memory = registered.memory + worst.memory + buffer;
        let needed_cpu = registered.cpu + worst.cpu;

        let mut totals: BTreeMap<&str, ResourcePair> = BTreeMap::new();
        for i in &snapshot.instances {
            let t = totals.entry(i.availability_zone.as_str()).or_default();
            t.cpu += i.free_cpu;
            t.memory += i.free_memory;
        }
        let spare_everywhere = !totals.is_empty()
            && totals.iter().all(|(zone, t)| {
                debug!(
                    %cluster,
                    %zone,
                    free_cpu = t.cpu,
                    needed_cpu,
                    free_memory = t.memory,
                    needed_memory,
                    "zone headroom"
                );
                t.cpu >= needed_cpu && t.memory >= needed_memory
            });
        if spare_everywhere && !in_cooldown {
            return ScalingAction::Down;
        }
    }

    ScalingAction::NoChange
}

/// Cache entry for the event's instance. Status and zone fall back to what
/// the cache already knows.
fn entry_from_event(
    event: &CapacityEvent,
    existing: Option<&InstanceCapacity>,
) -> ScaleResult<InstanceCapacity> {
    let free = ResourcePair::from_resources(&event.remaining_resources)?;
    let availability_zone = event
        .availability_zone()
        .or_else(|| existing.map(|e| e.availability_zone.clone()))
        .unwrap_or_default();
    let status = match existing {
        Some(e) => e.status,
        None if event.status.as_deref() == Some("DRAINING") => InstanceStatus::Draining,
        None => InstanceStatus::Active,
    };
    Ok(InstanceCapacity {
        instance_id: event.ec2_instance_id.clone(),
        availability_zone,
        free_cpu: free.cpu,
        free_memory: free.memory,
        status,
    })
}

/// Processes capacity events for every cluster.
#[derive(Clone)]
pub struct ScalingEngine {
    store: StateStore,
    cache: ResourceCache,
    fleet: Arc<dyn FleetGroup>,
    config: ScalingConfig,
}

impl ScalingEngine {
    pub fn new(
        store: StateStore,
        cache: ResourceCache,
        fleet: Arc<dyn FleetGroup>,
        config: ScalingConfig,
    ) -> Self {
        Self {
            store,
            cache,
            fleet,
            config,
        }
    }

    pub async fn process(&self, event: &CapacityEvent) -> ScaleResult<ScaleDecision> {
        self.process_at(event, epoch_millis()).await
    }

    /// Process an event as if the clock read `now` (epoch millis).
    pub async fn process_at(&self, event: &CapacityEvent, now: u64) -> ScaleResult<ScaleDecision> {
        let cluster = event.cluster_name()?;
        let services = self.store.list_services_for_cluster(&cluster)?;
        let worst =
            WorstCase::of(&services).ok_or_else(|| ScaleError::NoServices(cluster.clone()))?;

        let mut lease = self.cache.lock(&cluster).await?;
        lease.ensure_fresh(now).await?;
        let entry = entry_from_event(
            event,
            lease.snapshot().and_then(|s| s.entry(&event.ec2_instance_id)),
        )?;
        lease.upsert(entry, now);

        let group = self.fleet.group_for_cluster(&cluster).await?;
        let capacity = self.fleet.capacity(&group).await?;

        let registered = ResourcePair::from_resources(&event.registered_resources)?;
        let Some(snapshot) = lease.snapshot() else {
            return Ok(ScaleDecision {
                cluster,
                action: ScalingAction::NoChange,
                desired_before: capacity.desired,
                desired_after: capacity.desired,
            });
        };
        let in_cooldown = snapshot.in_cooldown(now, self.config.cooldown_millis());
        let mut action = evaluate(
            snapshot,
            worst,
            registered,
            capacity,
            in_cooldown,
            self.config.scale_down_buffer_ratio,
        );

        let mut desired_after = capacity.desired;
        let mut failure = None;
        let change = match action {
            ScalingAction::Up => 1,
            ScalingAction::Down => -1,
            ScalingAction::NoChange => 0,
        };
        if change != 0 {
            match self.fleet.scale(&group, change).await {
                Ok(desired) => {
                    info!(
                        %cluster,
                        %group,
                        from = capacity.desired,
                        to = desired,
                        ?action,
                        "fleet scaled"
                    );
                    desired_after = desired;
                }
                Err(PlatformError::CapacityBound { bound, desired, .. }) => {
                    warn!(%cluster, %group, bound, desired, "fleet already at bound, skipping");
                    action = ScalingAction::NoChange;
                }
                Err(e) => {
                    action = ScalingAction::NoChange;
                    failure = Some(e);
                }
            }
        }

        lease.record_action(action, now);
        lease.commit()?;
        if let Some(e) = failure {
            return Err(e.into());
        }

        Ok(ScaleDecision {
            cluster,
            action,
            desired_before: capacity.desired,
            desired_after,
        })
    }
}
