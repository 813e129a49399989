//! # vboxmgr – Remote VirtualBox Management
//!
//! Manages VirtualBox hosts through their management web service: connection
//! validation with retry, guest power transitions, full and linked clones
//! with lineage-aware removal, NAT port rules, and inventory search across
//! every connected host.
//!
//! ## Modules
//!
//! - **types**: hosts, guests, port rules, clone and search types
//! - **error**: crate error type
//! - **config**: manager tunables (retry, polling, timeouts, disk slot)
//! - **registry**: set of currently connected hosts
//! - **connection**: session open/validate/retry, connect & disconnect
//! - **progress**: polling waits for progress handles and state changes
//! - **inventory**: guest listing and lookup
//! - **lifecycle**: start, shut down, read state
//! - **lineage**: disk medium parent/child graph
//! - **clone**: full/linked clone creation, guest removal
//! - **port_rules**: NAT port-forwarding rules
//! - **search**: multi-criterion precise/tolerant search
//! - **service**: aggregate façade

pub mod clone;
pub mod config;
pub mod connection;
pub mod error;
pub mod inventory;
pub mod lifecycle;
pub mod lineage;
pub mod port_rules;
pub mod progress;
pub mod registry;
pub mod search;
pub mod service;
pub mod types;

pub use config::{CloneStatePolicy, ManagerConfig};
pub use error::{VboxError, VboxErrorKind, VboxResult};
pub use service::{VboxService, VboxServiceState};
pub use types::*;
pub use vboxmgr_endpoint::{MachineState, NatProtocol};
