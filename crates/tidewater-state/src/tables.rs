//! redb table definitions for the Tidewater state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Deployment records keyed by `{service}/{time:020}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Service records keyed by `{service}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Cluster resource snapshots keyed by `{cluster}`.
pub const CLUSTER_RESOURCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("cluster_resources");
