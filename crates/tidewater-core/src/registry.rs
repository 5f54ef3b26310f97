//! Watcher registry — tracks fire-and-forget background tasks by key.
//!
//! Deployment watchers are keyed by deployment record key, drain watchers
//! by instance id. The registry lets the resume procedures tell an
//! in-flight watcher apart from one that must be restarted, without
//! cancelling anything: a watcher always runs to its own verdict.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// A registered watcher. `id` tells a watcher apart from a later one that
/// reused its key.
struct Slot {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct WatcherRegistry {
    kind: &'static str,
    watchers: Arc<Mutex<HashMap<String, Slot>>>,
    next_id: Arc<AtomicU64>,
}

impl WatcherRegistry {
    /// Create an empty registry. `kind` only appears in log lines.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            watchers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn `task` under `key` unless a watcher for that key is still running.
    ///
    /// Returns `false` when an in-flight watcher already owns the key. A
    /// watcher removes its own entry once `task` completes.
    pub async fn spawn<F>(&self, key: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut watchers = self.watchers.lock().await;
        if let Some(existing) = watchers.get(key)
            && !existing.handle.is_finished()
        {
            debug!(kind = self.kind, %key, "watcher already in flight");
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = self.watchers.clone();
        let owned_key = key.to_string();
        let kind = self.kind;
        let handle = tokio::spawn(async move {
            task.await;
            let mut watchers = registry.lock().await;
            if watchers.get(&owned_key).is_some_and(|slot| slot.id == id) {
                watchers.remove(&owned_key);
                debug!(kind, key = %owned_key, "watcher finished");
            }
        });
        watchers.insert(key.to_string(), Slot { id, handle });
        debug!(kind = self.kind, %key, "watcher spawned");
        true
    }

    /// Whether a watcher for `key` is still running.
    pub async fn is_active(&self, key: &str) -> bool {
        let watchers = self.watchers.lock().await;
        watchers.get(key).is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Keys of all watchers that are still running.
    pub async fn active(&self) -> Vec<String> {
        let watchers = self.watchers.lock().await;
        let mut keys: Vec<String> = watchers
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of tracked entries, running or not yet cleaned up.
    pub async fn len(&self) -> usize {
        self.watchers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait for the watcher under `key` to finish. Returns `false` if none
    /// was registered.
    pub async fn wait(&self, key: &str) -> bool {
        let slot = {
            let mut watchers = self.watchers.lock().await;
            watchers.remove(key)
        };
        match slot {
            Some(slot) => {
                let _ = slot.handle.await;
                true
            }
            None => false,
        }
    }

    /// Wait for every registered watcher to finish.
    pub async fn wait_all(&self) {
        let slots: Vec<Slot> = {
            let mut watchers = self.watchers.lock().await;
            watchers.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let _ = slot.handle.await;
        }
    }
}
