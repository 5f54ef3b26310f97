use thiserror::Error;
use tidewater_cache::CacheError;
use tidewater_platform::PlatformError;
use tidewater_state::StateError;

pub type DrainResult<T> = Result<T, DrainError>;

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("instance {instance} is not registered with cluster {cluster}")]
    InstanceNotRegistered { cluster: String, instance: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("resource cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}
