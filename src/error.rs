//! Failure taxonomy shared by the producer and the dashboard.
//!
//! Transient network failures are retried and then queued, permanent input
//! failures are dropped and logged, capability failures stop the sampler and
//! reach its caller. Persistence failures stay `anyhow::Error` and are only
//! logged by the owning task.

use thiserror::Error;

/// Outcome of handing one reading to the remote sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("sink responded with status {status}")]
    Rejected { status: u16 },

    #[error("malformed reading: {0}")]
    Malformed(String),
}

impl SinkError {
    /// Transport failures, timeouts, throttling and server errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Transport(_) => true,
            SinkError::Rejected { status } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            SinkError::Malformed(_) => false,
        }
    }
}

/// The positioning source cannot be used at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("location permission not granted")]
    PermissionDenied,

    #[error("positioning is disabled: {0}")]
    PositioningDisabled(String),

    #[error("failed to register with position provider: {0}")]
    Registration(String),
}

/// A single fix request failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FixError {
    #[error("position temporarily unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Reasons an inbound broadcast record is rejected before touching any entity.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InboundError {
    #[error("record is not an object")]
    NotAnObject,

    #[error("record has no device identity")]
    MissingIdentity,

    #[error("record for {device_id} has no {field}")]
    MissingCoordinate {
        device_id: String,
        field: &'static str,
    },

    #[error("record for {device_id} has invalid {field}: {value}")]
    InvalidCoordinate {
        device_id: String,
        field: &'static str,
        value: String,
    },
}
