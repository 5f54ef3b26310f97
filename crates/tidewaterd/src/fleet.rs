//! Fleet seed file for standalone mode.
//!
//! Standalone mode runs against the in-memory platform, so the clusters,
//! fleet groups and workers it manages are described up front:
//!
//! ```toml
//! [[cluster]]
//! name = "prod"
//! listeners = ["https"]
//!
//! [cluster.group]
//! name = "prod-asg"
//! min = 1
//! desired = 2
//! max = 4
//! hooks = ["drain-hook"]
//!
//! [[cluster.worker]]
//! id = "i-0a1"
//! zone = "eu-west-1a"
//! cpu = 2048
//! memory = 4096
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use tidewater_platform::{FleetCapacity, MemoryPlatform, ResourcePair};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSeed {
    #[serde(rename = "cluster")]
    pub clusters: Vec<ClusterSeed>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSeed {
    pub name: String,
    pub listeners: Vec<String>,
    pub group: Option<GroupSeed>,
    #[serde(rename = "worker")]
    pub workers: Vec<WorkerSeed>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSeed {
    pub name: String,
    pub min: u32,
    pub desired: u32,
    pub max: u32,
    #[serde(default)]
    pub hooks: Vec<String>,
}

/// A worker node. Free capacity defaults to the registered capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSeed {
    pub id: String,
    pub zone: String,
    pub cpu: i64,
    pub memory: i64,
    #[serde(default)]
    pub free_cpu: Option<i64>,
    #[serde(default)]
    pub free_memory: Option<i64>,
}

impl FleetSeed {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let seed: FleetSeed = toml::from_str(content)?;
        for cluster in &seed.clusters {
            if cluster.name.is_empty() {
                anyhow::bail!("fleet seed: cluster without a name");
            }
            if let Some(g) = &cluster.group
                && !(g.min <= g.desired && g.desired <= g.max)
            {
                anyhow::bail!(
                    "fleet seed: group {} needs min <= desired <= max (got {}/{}/{})",
                    g.name,
                    g.min,
                    g.desired,
                    g.max
                );
            }
        }
        Ok(seed)
    }

    /// Register every cluster, group, hook and worker with `platform`.
    /// Hooks are attached to `transition`.
    pub async fn apply(&self, platform: &MemoryPlatform, transition: &str) {
        for cluster in &self.clusters {
            for listener in &cluster.listeners {
                platform.add_listener(&cluster.name, listener).await;
            }
            if let Some(g) = &cluster.group {
                let capacity = FleetCapacity {
                    min: g.min,
                    desired: g.desired,
                    max: g.max,
                };
                platform.add_fleet_group(&g.name, &cluster.name, capacity).await;
                for hook in &g.hooks {
                    platform.add_lifecycle_hook(&g.name, transition, hook).await;
                }
            }
            for w in &cluster.workers {
                let registered = ResourcePair {
                    cpu: w.cpu,
                    memory: w.memory,
                };
                let free = ResourcePair {
                    cpu: w.free_cpu.unwrap_or(w.cpu),
                    memory: w.free_memory.unwrap_or(w.memory),
                };
                platform
                    .add_worker(&cluster.name, &w.id, &w.zone, free, registered)
                    .await;
            }
            info!(cluster = %cluster.name, workers = cluster.workers.len(), "cluster seeded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_platform::{FleetGroup, OrchestrationPlatform};

    const SEED: &str = r#"
[[cluster]]
name = "prod"
listeners = ["https"]

[cluster.group]
name = "prod-asg"
min = 1
desired = 2
max = 4
hooks = ["drain-hook"]

[[cluster.worker]]
id = "i-1"
zone = "eu-west-1a"
cpu = 2048
memory = 4096
free_memory = 1024

[[cluster.worker]]
id = "i-2"
zone = "eu-west-1b"
cpu = 2048
memory = 4096
"#;

    #[test]
    fn parses_nested_tables() {
        let seed = FleetSeed::parse(SEED).unwrap();
        assert_eq!(seed.clusters.len(), 1);
        let prod = &seed.clusters[0];
        assert_eq!(prod.group.as_ref().unwrap().hooks, vec!["drain-hook".to_string()]);
        assert_eq!(prod.workers[0].free_memory, Some(1024));
        assert_eq!(prod.workers[1].free_cpu, None);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let bad = SEED.replace("desired = 2", "desired = 9");
        let err = FleetSeed::parse(&bad).unwrap_err();
        assert!(err.to_string().contains("prod-asg"));
    }

    #[tokio::test]
    async fn apply_registers_everything() {
        let platform = MemoryPlatform::new();
        FleetSeed::parse(SEED)
            .unwrap()
            .apply(&platform, "autoscaling:EC2_INSTANCE_TERMINATING")
            .await;

        assert_eq!(platform.group_for_cluster("prod").await.unwrap(), "prod-asg");
        assert_eq!(
            platform
                .lifecycle_hook_names("prod-asg", "autoscaling:EC2_INSTANCE_TERMINATING")
                .await
                .unwrap(),
            vec!["drain-hook".to_string()]
        );
        assert_eq!(platform.list_container_instances("prod").await.unwrap().len(), 2);
        assert_eq!(platform.cluster_for_instance("i-2").await.unwrap(), "prod");
    }
}
