//! Set of hosts currently known to be reachable.

use log::debug;
use std::sync::{Mutex, MutexGuard};

use crate::types::Host;

/// Hosts with a validated session that has not been torn down, in the order
/// they were first registered.  At most one entry per host identity.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    hosts: Mutex<Vec<Host>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn hosts(&self) -> MutexGuard<'_, Vec<Host>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `host`.  Returns `false` if it was already present.
    pub fn add(&self, host: &Host) -> bool {
        let mut hosts = self.hosts();
        if hosts.contains(host) {
            return false;
        }
        debug!("Registering host {host}");
        hosts.push(host.clone());
        true
    }

    /// Unregisters `host`.  Returns `false` if it was not present.
    pub fn remove(&self, host: &Host) -> bool {
        let mut hosts = self.hosts();
        let before = hosts.len();
        hosts.retain(|h| h != host);
        let removed = hosts.len() != before;
        if removed {
            debug!("Unregistered host {host}");
        }
        removed
    }

    pub fn is_connected(&self, host: &Host) -> bool {
        self.hosts().contains(host)
    }

    pub fn list(&self) -> Vec<Host> {
        self.hosts().clone()
    }

    pub fn len(&self) -> usize {
        self.hosts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts().is_empty()
    }
}
