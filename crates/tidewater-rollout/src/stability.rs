//! Stability verdicts for a rolled-out service.

use std::time::Duration;

use tidewater_platform::{ServiceDescription, TASK_RUNNING, TaskInfo};

use crate::error::{DeployError, DeployResult};

/// How long a watcher waits for a service to settle.
///
/// With a health-check grace period: `10 * (1 + ceil(grace / 600))`
/// minutes. Without one: `default_mins`.
pub fn watch_timeout(grace_period_seconds: u32, default_mins: u64) -> Duration {
    let minutes = if grace_period_seconds > 0 {
        10 * (1 + u64::from(grace_period_seconds).div_ceil(600))
    } else {
        default_mins
    };
    Duration::from_secs(minutes * 60)
}

/// Judge the final state of a rollout of `task_definition`.
///
/// Checks run in order and the first failing one names the reason. A
/// service that passes every check but never settled before the timeout
/// fails as timed out.
pub fn assess(
    service: &ServiceDescription,
    tasks: &[TaskInfo],
    task_definition: &str,
    timed_out: bool,
) -> DeployResult<()> {
    let fail = |reason: String| Err(DeployError::RolloutFailed(reason));

    let [generation] = service.deployments.as_slice() else {
        return fail("Deployment failed: deployment still running".to_string());
    };
    if generation.task_definition != task_definition {
        return fail("Deployment failed: still running old task definition".to_string());
    }
    if tasks.is_empty() {
        return fail("Deployment failed: no tasks running".to_string());
    }
    if let Some(t) = tasks
        .iter()
        .find(|t| t.task_definition == task_definition && t.last_status != TASK_RUNNING)
    {
        return fail(format!(
            "Deployment failed: found task with task definition {} and status {} (expected RUNNING)",
            t.task_definition, t.last_status
        ));
    }
    if timed_out {
        return fail("Deployment timed out".to_string());
    }
    Ok(())
}
