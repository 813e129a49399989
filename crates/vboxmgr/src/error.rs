//! Error types for the VirtualBox management crate.

use std::fmt;

use vboxmgr_endpoint::{EndpointError, RedirectDecodeError};

/// Categorised error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VboxErrorKind {
    /// Malformed caller input (empty name, nil id, port out of range, …)
    InvalidArgument,
    /// Host unreachable, or not registered for the requested operation
    ConnectionFailure,
    /// Management API version differs from the supported one
    IncompatibleVersion,
    /// Guest id / name not found on the host
    UnknownGuest,
    /// Port rule name not present on the guest
    UnknownPortRule,
    /// Port rule name or host port already in use on the guest
    PortRuleDuplicity,
    /// Guest is in a state that forbids the operation, or is locked
    UnexpectedState,
    /// Host was not connected, or could not be revalidated on disconnect
    DisconnectionFailure,
    /// A wait exceeded the configured operation timeout
    Timeout,
    /// A wait was cancelled
    Cancelled,
    /// Remote fault with no more specific translation
    Endpoint,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct VboxError {
    pub kind: VboxErrorKind,
    pub message: String,
}

impl VboxError {
    pub fn new(kind: VboxErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::InvalidArgument, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::ConnectionFailure, msg)
    }

    pub fn incompatible_version(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::IncompatibleVersion, msg)
    }

    pub fn unknown_guest(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::UnknownGuest, msg)
    }

    pub fn unknown_port_rule(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::UnknownPortRule, msg)
    }

    pub fn port_rule_duplicity(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::PortRuleDuplicity, msg)
    }

    pub fn unexpected_state(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::UnexpectedState, msg)
    }

    pub fn disconnection(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::DisconnectionFailure, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::Timeout, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::Cancelled, msg)
    }

    pub fn endpoint(msg: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::Endpoint, msg)
    }

    /// Translates a fault raised while changing a guest's state.  Anything
    /// but an unreachable host means the guest refused the transition.
    pub fn state_fault(context: &str, err: EndpointError) -> Self {
        match err {
            EndpointError::Unreachable(_) => Self::connection(format!("{context}: {err}")),
            _ => Self::unexpected_state(format!("{context}: {err}")),
        }
    }

    /// Translates a lookup fault; `NotFound` becomes `UnknownGuest`.
    pub fn lookup_fault(what: &str, err: EndpointError) -> Self {
        match err {
            EndpointError::NotFound(_) => Self::unknown_guest(format!("{what} not found: {err}")),
            other => Self::from(other),
        }
    }
}

impl fmt::Display for VboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for VboxError {}

impl From<VboxError> for String {
    fn from(e: VboxError) -> String {
        e.to_string()
    }
}

impl From<EndpointError> for VboxError {
    fn from(e: EndpointError) -> Self {
        match e {
            EndpointError::Unreachable(_) => Self::connection(e.to_string()),
            EndpointError::InvalidState(_) | EndpointError::Locked(_) => {
                Self::unexpected_state(e.to_string())
            }
            EndpointError::NotFound(_) | EndpointError::Fault(_) => Self::endpoint(e.to_string()),
        }
    }
}

impl From<RedirectDecodeError> for VboxError {
    fn from(e: RedirectDecodeError) -> Self {
        Self::endpoint(format!("Malformed NAT redirect: {e}"))
    }
}

impl From<serde_json::Error> for VboxError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid_argument(format!("JSON parse error: {e}"))
    }
}

/// Convenience alias.
pub type VboxResult<T> = Result<T, VboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_message() {
        let err = VboxError::unknown_guest("no machine 'web'");
        assert_eq!(err.to_string(), "[UnknownGuest] no machine 'web'");
        let s: String = err.into();
        assert!(s.starts_with("[UnknownGuest]"));
    }

    #[test]
    fn endpoint_faults_translate_by_kind() {
        let e: VboxError = EndpointError::Unreachable("down".into()).into();
        assert_eq!(e.kind, VboxErrorKind::ConnectionFailure);
        let e: VboxError = EndpointError::Locked("vm".into()).into();
        assert_eq!(e.kind, VboxErrorKind::UnexpectedState);
        let e: VboxError = EndpointError::Fault("boom".into()).into();
        assert_eq!(e.kind, VboxErrorKind::Endpoint);
    }

    #[test]
    fn contextual_translations() {
        let e = VboxError::lookup_fault("guest 'web'", EndpointError::NotFound("web".into()));
        assert_eq!(e.kind, VboxErrorKind::UnknownGuest);
        let e = VboxError::lookup_fault("guest 'web'", EndpointError::Unreachable("x".into()));
        assert_eq!(e.kind, VboxErrorKind::ConnectionFailure);
        let e = VboxError::state_fault("launch", EndpointError::Fault("busy".into()));
        assert_eq!(e.kind, VboxErrorKind::UnexpectedState);
    }
}
