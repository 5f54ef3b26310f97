//! tidewater-cache — cluster resource snapshots.
//!
//! A [`ClusterResourceSnapshot`](tidewater_state::ClusterResourceSnapshot)
//! records the free cpu/memory, zone and status of every worker in one
//! cluster. Reads come from the state store; a snapshot older than the TTL
//! is reported stale and rebuilt from the platform by whoever next holds
//! the cluster's lease.
//!
//! Every mutation is read-modify-write under a per-cluster [`ClusterLease`],
//! so the scaling engine and the drain coordinator never overwrite each
//! other's changes.

pub mod cache;
pub mod error;

pub use cache::{CacheLookup, ClusterLease, ResourceCache, capacity_from_instance};
pub use error::{CacheError, CacheResult};
