use thiserror::Error;
use tidewater_platform::PlatformError;
use tidewater_state::StateError;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}
