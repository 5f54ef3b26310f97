use thiserror::Error;
use tidewater_cache::CacheError;
use tidewater_platform::PlatformError;
use tidewater_state::StateError;

pub type ScaleResult<T> = Result<T, ScaleError>;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("no services registered on cluster {0}")]
    NoServices(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("resource cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}
