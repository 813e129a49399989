//! # vboxmgr – Remote Endpoint Contract
//!
//! The session-scoped surface of a VirtualBox management web service as the
//! core manager sees it.  Everything the managers ask of a remote host goes
//! through [`HypervisorConnector`] / [`HypervisorSession`]; long-running calls
//! hand back a [`ProgressHandle`] that the caller polls.
//!
//! ## Modules
//!
//! - **types**: machine, medium, snapshot and OS-type records plus the
//!   machine/session/lock/clone enums
//! - **redirect**: structured NAT redirect encoding (`NatRedirect`)
//! - **error**: `EndpointError`, the faults a remote host can raise
//! - **session**: the connector / session / progress traits
//! - **sim**: in-process simulated host (feature `sim`)

pub mod error;
pub mod redirect;
pub mod session;
pub mod types;

#[cfg(feature = "sim")]
pub mod sim;

pub use error::{EndpointError, EndpointResult};
pub use redirect::{NatProtocol, NatRedirect, RedirectDecodeError};
pub use session::{HypervisorConnector, HypervisorSession, ProgressHandle};
pub use types::*;
