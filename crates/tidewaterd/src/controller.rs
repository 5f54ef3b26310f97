//! Controller — one instance of every subsystem over a shared store and
//! platform, plus the dispatch from control events to operations.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use tidewater_autoscale::ScalingEngine;
use tidewater_cache::ResourceCache;
use tidewater_core::ControllerConfig;
use tidewater_drain::DrainCoordinator;
use tidewater_platform::MemoryPlatform;
use tidewater_rollout::Orchestrator;
use tidewater_state::StateStore;

use crate::event::ControlEvent;

#[derive(Clone)]
pub struct Controller {
    store: StateStore,
    orchestrator: Orchestrator,
    scaling: ScalingEngine,
    drain: DrainCoordinator,
}

/// Watchers restarted by [`Controller::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resumed {
    pub deployments: usize,
    pub drains: usize,
}

impl Controller {
    /// Wire every subsystem to the in-memory platform.
    pub fn standalone(
        store: StateStore,
        platform: MemoryPlatform,
        config: &ControllerConfig,
    ) -> Self {
        let platform = Arc::new(platform);
        let cache = ResourceCache::new(
            store.clone(),
            platform.clone(),
            config.scaling.cache_ttl_millis(),
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            platform.clone(),
            platform.clone(),
            platform.clone(),
            config.rollout.clone(),
            config.provisioning.clone(),
        );
        let scaling = ScalingEngine::new(
            store.clone(),
            cache.clone(),
            platform.clone(),
            config.scaling.clone(),
        );
        let drain = DrainCoordinator::new(
            store.clone(),
            cache,
            platform.clone(),
            platform,
            config.drain.clone(),
        );
        Self {
            store,
            orchestrator,
            scaling,
            drain,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn drain(&self) -> &DrainCoordinator {
        &self.drain
    }

    /// Restart stability and drain watchers lost with the previous process.
    pub async fn resume(&self) -> anyhow::Result<Resumed> {
        let deployments = self.orchestrator.resume().await?;
        let drains = self.drain.resume().await?;
        info!(deployments, drains, "watchers resumed");
        Ok(Resumed {
            deployments,
            drains,
        })
    }

    /// Wait for every in-flight watcher.
    pub async fn settle(&self) {
        self.orchestrator.watchers().wait_all().await;
        self.drain.watchers().wait_all().await;
    }

    pub async fn handle(&self, event: ControlEvent) -> anyhow::Result<Value> {
        debug!(kind = event.kind(), "control event");
        let reply = match event {
            ControlEvent::Deploy { service, spec } => {
                json!(self.orchestrator.deploy(&service, spec).await?)
            }
            ControlEvent::Redeploy { service, time } => {
                json!(self.orchestrator.redeploy(&service, time).await?)
            }
            ControlEvent::Rollback { service } => {
                let target = self.orchestrator.rollback(&service).await?;
                json!({
                    "service_name": target.service_name,
                    "task_definition": target.task_definition,
                    "time": target.time,
                })
            }
            ControlEvent::Status { service, time } => {
                json!(self.orchestrator.deployment_status(&service, time)?)
            }
            ControlEvent::History { service } => {
                json!(self.orchestrator.list_deployments(&service)?)
            }
            ControlEvent::Between { start, end } => {
                json!(self.orchestrator.deployments_between(start, end)?)
            }
            ControlEvent::Capacity(event) => {
                let d = self.scaling.process(&event).await?;
                json!({
                    "cluster": d.cluster,
                    "action": d.action,
                    "desired_before": d.desired_before,
                    "desired_after": d.desired_after,
                })
            }
            ControlEvent::Termination(event) => {
                let started = self.drain.handle_termination(&event).await?;
                json!({
                    "cluster": started.cluster,
                    "container_instance": started.container_instance,
                    "watcher_spawned": started.watcher_spawned,
                })
            }
        };
        Ok(reply)
    }

    /// Handle one input line and render the reply line.
    pub async fn handle_line(&self, line: &str) -> String {
        let result = match ControlEvent::parse(line) {
            Ok(event) => self.handle(event).await,
            Err(e) => Err(e.context("malformed control event")),
        };
        let reply = match result {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => json!({ "ok": false, "error": format!("{e:#}") }),
        };
        reply.to_string()
    }
}
