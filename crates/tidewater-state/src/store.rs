//! StateStore — redb-backed state persistence for Tidewater.
//!
//! Provides typed operations over deployment records, service records and
//! cluster resource snapshots. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of a gated status write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The record moved to the requested status.
    Applied(DeploymentRecord),
    /// The record was no longer in a state that allows the move.
    Rejected { current: DeploymentStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(CLUSTER_RESOURCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Append a new deployment record.
    ///
    /// The record's `time` is bumped by one millisecond until its key is
    /// unused, inside the same write transaction. Returns the stored record.
    pub fn create_deployment(&self, record: &DeploymentRecord) -> StateResult<DeploymentRecord> {
        let mut record = record.clone();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            while table
                .get(record.table_key().as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                record.time += 1;
            }
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(record.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(key = %record.table_key(), "deployment record created");
        Ok(record)
    }

    /// Insert or overwrite a deployment record.
    pub fn put_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "deployment record stored");
        Ok(())
    }

    /// Get one deployment record by service and time.
    pub fn get_deployment(
        &self,
        service: &str,
        time: u64,
    ) -> StateResult<Option<DeploymentRecord>> {
        let key = deployment_key(service, time);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: DeploymentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All records of one service, oldest first.
    pub fn list_deployments_for_service(
        &self,
        service: &str,
    ) -> StateResult<Vec<DeploymentRecord>> {
        let prefix = format!("{service}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(prefix.as_str()..)
            .map_err(map_err!(Read))?
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// The `limit` most recent records of one service, newest first.
    pub fn recent_deployments(
        &self,
        service: &str,
        limit: usize,
    ) -> StateResult<Vec<DeploymentRecord>> {
        let mut all = self.list_deployments_for_service(service)?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    /// The newest record of one service.
    pub fn last_deployment(&self, service: &str) -> StateResult<Option<DeploymentRecord>> {
        Ok(self.recent_deployments(service, 1)?.into_iter().next())
    }

    /// Records of every service created in `[start, end]`, ordered by time.
    pub fn deployments_between(&self, start: u64, end: u64) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if (start..=end).contains(&record.time) {
                results.push(record);
            }
        }
        results.sort_by(|a, b| {
            a.time
                .cmp(&b.time)
                .then_with(|| a.service_name.cmp(&b.service_name))
        });
        Ok(results)
    }

    /// Every record still in `running` status, across all services.
    pub fn list_running_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.status == DeploymentStatus::Running {
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Move a record to `next` if its current status allows it.
    ///
    /// Read and write happen in one write transaction, so a concurrent
    /// writer cannot slip between the check and the update. `reason`
    /// replaces the stored reason only when the transition applies.
    pub fn transition_deployment(
        &self,
        service: &str,
        time: u64,
        next: DeploymentStatus,
        reason: Option<String>,
    ) -> StateResult<Transition> {
        let key = deployment_key(service, time);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut record: DeploymentRecord = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(key)),
            };
            if record.status.can_transition_to(next) {
                record.status = next;
                if reason.is_some() {
                    record.reason = reason;
                }
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                Transition::Applied(record)
            } else {
                Transition::Rejected {
                    current: record.status,
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %next, applied = outcome.is_applied(), "deployment transition");
        Ok(outcome)
    }

    /// Append `note` to the reason of a record without touching its status.
    pub fn annotate_deployment_reason(
        &self,
        service: &str,
        time: u64,
        note: &str,
    ) -> StateResult<DeploymentRecord> {
        let key = deployment_key(service, time);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut record: DeploymentRecord = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(key)),
            };
            record.reason = Some(match record.reason.take() {
                Some(existing) => format!("{existing}; {note}"),
                None => note.to_string(),
            });
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service record.
    pub fn put_service(&self, svc: &ServiceRecord) -> StateResult<()> {
        let value = serde_json::to_vec(svc).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table
                .insert(svc.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %svc.name, "service record stored");
        Ok(())
    }

    /// Get a service record by name.
    pub fn get_service(&self, name: &str) -> StateResult<Option<ServiceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let svc: ServiceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(svc))
            }
            None => Ok(None),
        }
    }

    /// List all service records.
    pub fn list_services(&self) -> StateResult<Vec<ServiceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let svc: ServiceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(svc);
        }
        Ok(results)
    }

    /// Service records placed on one cluster.
    pub fn list_services_for_cluster(&self, cluster: &str) -> StateResult<Vec<ServiceRecord>> {
        Ok(self
            .list_services()?
            .into_iter()
            .filter(|s| s.cluster == cluster)
            .collect())
    }

    // ── Cluster resources ──────────────────────────────────────────

    /// Insert or replace a cluster resource snapshot.
    pub fn put_cluster_resources(&self, snapshot: &ClusterResourceSnapshot) -> StateResult<()> {
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTER_RESOURCES).map_err(map_err!(Table))?;
            table
                .insert(snapshot.cluster.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            cluster = %snapshot.cluster,
            instances = snapshot.instances.len(),
            "cluster resources stored"
        );
        Ok(())
    }

    /// Get the resource snapshot of one cluster.
    pub fn get_cluster_resources(
        &self,
        cluster: &str,
    ) -> StateResult<Option<ClusterResourceSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTER_RESOURCES).map_err(map_err!(Table))?;
        match table.get(cluster).map_err(map_err!(Read))? {
            Some(guard) => {
                let snap: ClusterResourceSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snap))
            }
            None => Ok(None),
        }
    }

    /// List every stored cluster snapshot.
    pub fn list_cluster_resources(&self) -> StateResult<Vec<ClusterResourceSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTER_RESOURCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snap: ClusterResourceSnapshot =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(snap);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record(service: &str, time: u64, status: DeploymentStatus) -> DeploymentRecord {
        DeploymentRecord {
            service_name: service.to_string(),
            cluster: "prod".to_string(),
            time,
            task_definition: format!("{service}:{time}"),
            spec: DeploymentSpec {
                cluster: "prod".to_string(),
                desired_count: 1,
                ..Default::default()
            },
            status,
            reason: None,
        }
    }

    fn test_service(name: &str, cluster: &str, cpu: i64, memory: i64) -> ServiceRecord {
        ServiceRecord {
            name: name.to_string(),
            cluster: cluster.to_string(),
            listeners: vec![],
            resources: ResourceShape {
                cpu_reservation: cpu,
                cpu_limit: cpu,
                memory_reservation: memory,
                memory_limit: memory,
            },
            updated_at: 0,
        }
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn deployment_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let rec = test_record("api", 100, DeploymentStatus::Running);
        store.create_deployment(&rec).unwrap();

        let fetched = store.get_deployment("api", 100).unwrap().unwrap();
        assert_eq!(fetched, rec);
        assert!(store.get_deployment("api", 101).unwrap().is_none());
    }

    #[test]
    fn create_bumps_time_on_collision() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store
            .create_deployment(&test_record("api", 100, DeploymentStatus::Success))
            .unwrap();
        let second = store
            .create_deployment(&test_record("api", 100, DeploymentStatus::Running))
            .unwrap();

        assert_eq!(first.time, 100);
        assert_eq!(second.time, 101);
        assert_eq!(store.list_deployments_for_service("api").unwrap().len(), 2);
    }

    #[test]
    fn history_is_scoped_to_service_and_ordered() {
        let store = StateStore::open_in_memory().unwrap();
        for t in [300, 100, 200] {
            store
                .put_deployment(&test_record("api", t, DeploymentStatus::Success))
                .unwrap();
        }
        store
            .put_deployment(&test_record("api-gateway", 150, DeploymentStatus::Success))
            .unwrap();
        store
            .put_deployment(&test_record("web", 50, DeploymentStatus::Success))
            .unwrap();

        let times: Vec<u64> = store
            .list_deployments_for_service("api")
            .unwrap()
            .iter()
            .map(|r| r.time)
            .collect();
        assert_eq!(times, vec![100, 200, 300]);

        let recent: Vec<u64> = store
            .recent_deployments("api", 2)
            .unwrap()
            .iter()
            .map(|r| r.time)
            .collect();
        assert_eq!(recent, vec![300, 200]);
        assert_eq!(store.last_deployment("web").unwrap().unwrap().time, 50);
        assert!(store.last_deployment("nope").unwrap().is_none());
    }

    #[test]
    fn deployments_between_spans_services() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_record("api", 100, DeploymentStatus::Success)).unwrap();
        store.put_deployment(&test_record("web", 150, DeploymentStatus::Failed)).unwrap();
        store.put_deployment(&test_record("api", 300, DeploymentStatus::Running)).unwrap();

        let found = store.deployments_between(100, 200).unwrap();
        let ids: Vec<(&str, u64)> = found
            .iter()
            .map(|r| (r.service_name.as_str(), r.time))
            .collect();
        assert_eq!(ids, vec![("api", 100), ("web", 150)]);

        let running = store.list_running_deployments().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].time, 300);
    }

    #[test]
    fn transition_applies_from_running_only() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_record("api", 100, DeploymentStatus::Running)).unwrap();

        let out = store
            .transition_deployment("api", 100, DeploymentStatus::Aborted, None)
            .unwrap();
        assert!(out.is_applied());

        let late = store
            .transition_deployment("api", 100, DeploymentStatus::Failed, Some("boom".to_string()))
            .unwrap();
        assert_eq!(late, Transition::Rejected { current: DeploymentStatus::Aborted });

        let rec = store.get_deployment("api", 100).unwrap().unwrap();
        assert_eq!(rec.status, DeploymentStatus::Aborted);
        assert!(rec.reason.is_none());
    }

    #[test]
    fn transition_missing_record_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .transition_deployment("api", 1, DeploymentStatus::Success, None)
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn annotate_appends_to_reason() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_record("api", 100, DeploymentStatus::Running)).unwrap();
        store
            .transition_deployment(
                "api",
                100,
                DeploymentStatus::Failed,
                Some("timed out".to_string()),
            )
            .unwrap();

        let rec = store
            .annotate_deployment_reason("api", 100, "rollback failed: no stable version")
            .unwrap();
        assert_eq!(rec.status, DeploymentStatus::Failed);
        assert_eq!(
            rec.reason.as_deref(),
            Some("timed out; rollback failed: no stable version")
        );
    }

    // ── Services ───────────────────────────────────────────────────

    #[test]
    fn services_filtered_by_cluster() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_service(&test_service("api", "prod", 256, 512)).unwrap();
        store.put_service(&test_service("web", "prod", 128, 1024)).unwrap();
        store.put_service(&test_service("batch", "staging", 1024, 4096)).unwrap();

        let prod = store.list_services_for_cluster("prod").unwrap();
        assert_eq!(prod.len(), 2);
        assert_eq!(store.get_service("batch").unwrap().unwrap().cluster, "staging");
        assert!(store.get_service("nope").unwrap().is_none());
    }

    // ── Cluster resources ──────────────────────────────────────────

    #[test]
    fn cluster_resources_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let mut snap = ClusterResourceSnapshot::rebuilt("prod", vec![], 1_000);
        snap.record_action(ScalingAction::Up, 1_000);
        store.put_cluster_resources(&snap).unwrap();

        let fetched = store.get_cluster_resources("prod").unwrap().unwrap();
        assert_eq!(fetched.last_action, ScalingAction::Up);
        assert_eq!(fetched.last_scaled_at, Some(1_000));
        assert_eq!(store.list_cluster_resources().unwrap().len(), 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .create_deployment(&test_record("api", 100, DeploymentStatus::Running))
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let running = store.list_running_deployments().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].service_name, "api");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_deployments_for_service("any").unwrap().is_empty());
        assert!(store.deployments_between(0, u64::MAX).unwrap().is_empty());
        assert!(store.list_services().unwrap().is_empty());
        assert!(store.get_cluster_resources("any").unwrap().is_none());
    }
}
