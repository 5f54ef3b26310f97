//! Error types for platform calls.

use thiserror::Error;

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The fleet group is already at the bound the change would cross.
    #[error("fleet group {group} is at its {bound} capacity ({desired})")]
    CapacityBound {
        group: String,
        bound: &'static str,
        desired: u32,
    },

    #[error("invalid resource {name}: {reason}")]
    InvalidResource { name: String, reason: String },

    #[error("could not determine cluster name from arn: {0}")]
    MalformedArn(String),

    #[error("{operation} accepts at most {limit} identifiers per call, got {given}")]
    BatchTooLarge {
        operation: &'static str,
        limit: usize,
        given: usize,
    },
}

impl PlatformError {
    pub fn api(operation: &'static str, message: impl Into<String>) -> Self {
        PlatformError::Api {
            operation,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PlatformError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }
}
