use thiserror::Error;

/// Faults raised by a remote management endpoint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The web service could not be reached or rejected the logon.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("object not found: {0}")]
    NotFound(String),

    /// The object exists but its current state forbids the call.
    #[error("invalid object state: {0}")]
    InvalidState(String),

    #[error("machine is locked by another session: {0}")]
    Locked(String),

    #[error("remote fault: {0}")]
    Fault(String),
}

impl EndpointError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

pub type EndpointResult<T> = Result<T, EndpointError>;
