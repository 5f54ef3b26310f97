use thiserror::Error;
use tidewater_platform::PlatformError;
use tidewater_state::StateError;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Rejected before any platform mutation; never retried.
    #[error("invalid deployment spec: {0}")]
    InvalidSpec(String),

    #[error("deployment not found: {0}")]
    NotFound(String),

    /// The rollout did not stabilise; carries the persisted reason.
    #[error("{0}")]
    RolloutFailed(String),

    #[error("could not roll back {0}: no stable version found")]
    NoRollbackTarget(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}
