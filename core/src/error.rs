//! The one error type every broker operation returns.

use thiserror::Error;

/// Failure kinds surfaced to the outside, per spec: `NotFound`, `Forbidden`,
/// `CapacityExceeded`, `Conflict`, `Unavailable`. The core never retries on
/// any of these; retry policy belongs outside the broker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} does not belong to this user")]
    Forbidden(String),

    #[error("user {0} already has the maximum of {1} sessions")]
    CapacityExceeded(String, usize),

    #[error("session id {0} is already in use")]
    Conflict(String),

    #[error("underlying runtime failure: {0}")]
    Unavailable(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
