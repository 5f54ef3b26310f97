//! Control events accepted by the daemon, one JSON object per line.
//!
//! ```text
//! {"kind":"deploy","service":"api","spec":{"cluster":"prod",...}}
//! {"kind":"redeploy","service":"api","time":1718000000000}
//! {"kind":"rollback","service":"api"}
//! {"kind":"status","service":"api","time":1718000000000}
//! {"kind":"history","service":"api"}
//! {"kind":"between","start":0,"end":1718000000000}
//! {"kind":"capacity","clusterArn":"...","ec2InstanceId":"i-0a1",...}
//! {"kind":"termination","EC2InstanceId":"i-0a1","AutoScalingGroupName":"prod-asg",...}
//! ```

use serde::{Deserialize, Serialize};

use tidewater_platform::{CapacityEvent, TerminationEvent};
use tidewater_state::DeploymentSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEvent {
    Deploy { service: String, spec: DeploymentSpec },
    Redeploy { service: String, time: u64 },
    Rollback { service: String },
    Status { service: String, time: u64 },
    History { service: String },
    Between { start: u64, end: u64 },
    Capacity(CapacityEvent),
    Termination(TerminationEvent),
}

impl ControlEvent {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::Deploy { .. } => "deploy",
            ControlEvent::Redeploy { .. } => "redeploy",
            ControlEvent::Rollback { .. } => "rollback",
            ControlEvent::Status { .. } => "status",
            ControlEvent::History { .. } => "history",
            ControlEvent::Between { .. } => "between",
            ControlEvent::Capacity(_) => "capacity",
            ControlEvent::Termination(_) => "termination",
        }
    }
}
