//! Standalone controller tests.
//!
//! Drives the controller through NDJSON control lines against a seeded
//! in-memory platform: deploys with rollback, capacity-driven scaling,
//! termination drains and restart recovery.

use serde_json::Value;
use tidewater_core::ControllerConfig;
use tidewater_platform::{MemoryPlatform, RolloutMode};
use tidewater_state::{DeploymentStatus, InstanceStatus, StateStore};
use tidewaterd::{Controller, FleetSeed};

const FLEET: &str = r#"
[[cluster]]
name = "prod"
listeners = ["https"]

[cluster.group]
name = "prod-asg"
min = 1
desired = 3
max = 5
hooks = ["drain-hook"]

[[cluster.worker]]
id = "i-1"
zone = "eu-west-1a"
cpu = 2048
memory = 4096

[[cluster.worker]]
id = "i-2"
zone = "eu-west-1b"
cpu = 2048
memory = 4096
"#;

async fn seeded(store: StateStore) -> (Controller, MemoryPlatform) {
    let config = ControllerConfig::default();
    let platform = MemoryPlatform::new();
    FleetSeed::parse(FLEET)
        .unwrap()
        .apply(&platform, &config.drain.lifecycle_transition)
        .await;
    let controller = Controller::standalone(store, platform.clone(), &config);
    (controller, platform)
}

fn deploy_line(service: &str, tag: &str, memory_reservation: u32) -> String {
    format!(
        r#"{{"kind":"deploy","service":"{service}","spec":{{"cluster":"prod","servicePort":8080,"serviceProtocol":"HTTP","desiredCount":2,"containers":[{{"containerName":"{service}","containerTag":"{tag}","containerPort":8080,"cpu":256,"memoryReservation":{memory_reservation},"essential":true}}]}}}}"#
    )
}

async fn send(controller: &Controller, line: &str) -> Value {
    let reply: Value = serde_json::from_str(&controller.handle_line(line).await).unwrap();
    assert_eq!(reply["ok"], true, "control line failed: {reply}");
    reply["result"].clone()
}

fn capacity_line(instance: &str, zone: &str, free_cpu: i64, free_memory: i64) -> String {
    format!(
        r#"{{"kind":"capacity","clusterArn":"arn:aws:ecs:eu-west-1:123456789012:cluster/prod","ec2InstanceId":"{instance}","remainingResources":[{{"name":"CPU","type":"INTEGER","integerValue":{free_cpu}}},{{"name":"MEMORY","type":"INTEGER","integerValue":{free_memory}}}],"registeredResources":[{{"name":"CPU","type":"INTEGER","integerValue":2048}},{{"name":"MEMORY","type":"INTEGER","integerValue":4096}}],"attributes":[{{"name":"ecs.availability-zone","value":"{zone}"}}]}}"#
    )
}

#[tokio::test(start_paused = true)]
async fn deploy_then_failed_deploy_rolls_back() {
    let (controller, platform) = seeded(StateStore::open_in_memory().unwrap()).await;

    let d1 = send(&controller, &deploy_line("api", "v1", 256)).await;
    controller.settle().await;

    platform.set_rollout_mode("api", RolloutMode::Crash).await;
    let d2 = send(&controller, &deploy_line("api", "v2", 256)).await;
    controller.settle().await;

    let history = send(&controller, r#"{"kind":"history","service":"api"}"#).await;
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["time"], d2["time"]);
    assert_eq!(history[0]["status"], "failed");
    assert_eq!(history[1]["status"], "success");

    let updates = platform.service_updates().await;
    assert_eq!(
        Some(updates.last().unwrap().task_definition.as_str()),
        d1["task_definition"].as_str()
    );
}

#[tokio::test(start_paused = true)]
async fn status_and_range_queries() {
    let (controller, _) = seeded(StateStore::open_in_memory().unwrap()).await;
    let d1 = send(&controller, &deploy_line("api", "v1", 256)).await;
    send(&controller, &deploy_line("worker", "v1", 512)).await;
    controller.settle().await;

    let time = d1["time"].as_u64().unwrap();
    let status = send(
        &controller,
        &format!(r#"{{"kind":"status","service":"api","time":{time}}}"#),
    )
    .await;
    assert_eq!(status["status"], "success");

    let all = send(&controller, r#"{"kind":"between","start":0,"end":18446744073709551615}"#).await;
    assert_eq!(all.as_array().unwrap().len(), 2);

    let reply: Value = serde_json::from_str(
        &controller
            .handle_line(r#"{"kind":"status","service":"api","time":1}"#)
            .await,
    )
    .unwrap();
    assert_eq!(reply["ok"], false);
    assert!(reply["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test(start_paused = true)]
async fn malformed_and_invalid_lines_are_rejected() {
    let (controller, platform) = seeded(StateStore::open_in_memory().unwrap()).await;

    let reply: Value = serde_json::from_str(&controller.handle_line("{not json").await).unwrap();
    assert_eq!(reply["ok"], false);
    assert!(reply["error"].as_str().unwrap().starts_with("malformed control event"));

    let reply: Value =
        serde_json::from_str(&controller.handle_line(&deploy_line("api", "v1", 0)).await).unwrap();
    assert_eq!(reply["ok"], false);
    assert!(reply["error"].as_str().unwrap().contains("invalid deployment spec"));
    assert_eq!(platform.mutation_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn tight_capacity_scales_up_once_per_cooldown() {
    let (controller, platform) = seeded(StateStore::open_in_memory().unwrap()).await;
    send(&controller, &deploy_line("api", "v1", 1024)).await;
    controller.settle().await;

    // Zone b's only worker can no longer place the largest task.
    send(&controller, &capacity_line("i-1", "eu-west-1a", 2048, 4096)).await;
    let decision = send(&controller, &capacity_line("i-2", "eu-west-1b", 128, 512)).await;
    assert_eq!(decision["action"], "up");
    assert_eq!(decision["desired_after"], 4);

    let again = send(&controller, &capacity_line("i-2", "eu-west-1b", 128, 512)).await;
    assert_eq!(again["action"], "none");
    assert_eq!(platform.fleet_capacity("prod-asg").await.unwrap().desired, 4);
}

#[tokio::test(start_paused = true)]
async fn termination_drains_before_releasing_hook() {
    let (controller, platform) = seeded(StateStore::open_in_memory().unwrap()).await;
    send(&controller, &deploy_line("api", "v1", 256)).await;
    controller.settle().await;
    send(&controller, &capacity_line("i-1", "eu-west-1a", 2048, 4096)).await;

    // The instance lookup reads the first count.
    platform.script_running_tasks("i-1", vec![2, 2, 1, 0]).await;
    let started = send(
        &controller,
        r#"{"kind":"termination","EC2InstanceId":"i-1","AutoScalingGroupName":"prod-asg","LifecycleHookName":"drain-hook","LifecycleActionToken":"tok-1"}"#,
    )
    .await;
    assert_eq!(started["cluster"], "prod");
    assert_eq!(platform.instance_status("i-1").await.as_deref(), Some("DRAINING"));
    assert!(platform.completions().await.is_empty());

    let snap = controller.store().get_cluster_resources("prod").unwrap().unwrap();
    assert_eq!(snap.entry("i-1").unwrap().status, InstanceStatus::Draining);

    controller.settle().await;
    let completions = platform.completions().await;
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].token.as_deref(), Some("tok-1"));
}

#[tokio::test(start_paused = true)]
async fn restarted_controller_resumes_watchers() {
    let store = StateStore::open_in_memory().unwrap();
    let (before, platform) = seeded(store.clone()).await;
    platform.set_rollout_mode("api", RolloutMode::Hang).await;
    let d1 = send(&before, &deploy_line("api", "v1", 256)).await;
    platform.set_instance_status("i-2", "DRAINING").await;

    // Same store and platform, fresh watcher registries.
    let after =
        Controller::standalone(store.clone(), platform.clone(), &ControllerConfig::default());
    let resumed = after.resume().await.unwrap();
    assert_eq!(resumed.deployments, 1);
    assert_eq!(resumed.drains, 1);

    platform.finish_rollout("prod", "api").await;
    after.settle().await;
    before.settle().await;

    let time = d1["time"].as_u64().unwrap();
    let record = store.get_deployment("api", time).unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Success);
    let completions = platform.completions().await;
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].instance_id, "i-2");
    assert_eq!(completions[0].token, None);
}

#[tokio::test]
async fn history_survives_reopening_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tidewater.redb");

    let time = {
        let (controller, _) = seeded(StateStore::open(&path).unwrap()).await;
        let d1 = send(&controller, &deploy_line("api", "v1", 256)).await;
        controller.settle().await;
        d1["time"].as_u64().unwrap()
    };

    let store = StateStore::open(&path).unwrap();
    let record = store.get_deployment("api", time).unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Success);
    assert!(store.get_service("api").unwrap().is_some());
}
