//! Aggregate service façade for the VirtualBox crate.
//!
//! `VboxService` owns the `ConnectionManager` (and through it the
//! connection registry) and exposes every domain operation.  All state is
//! internally synchronised, so the shared handle is a plain
//! `VboxServiceState = Arc<VboxService>`.

use std::sync::Arc;
use uuid::Uuid;

use vboxmgr_endpoint::{HypervisorConnector, MachineState};

use crate::clone::CloneManager;
use crate::config::ManagerConfig;
use crate::connection::ConnectionManager;
use crate::error::{VboxError, VboxResult};
use crate::inventory::InventoryManager;
use crate::lifecycle::LifecycleManager;
use crate::port_rules::PortRuleManager;
use crate::search::SearchEngine;
use crate::types::*;

/// Shared handle to the service.
pub type VboxServiceState = Arc<VboxService>;

/// Top-level service that aggregates all VirtualBox subsystems.
pub struct VboxService {
    connections: ConnectionManager,
}

impl VboxService {
    pub fn new(connector: Arc<dyn HypervisorConnector>, config: ManagerConfig) -> VboxResult<Self> {
        config.validate()?;
        Ok(Self {
            connections: ConnectionManager::new(connector, config),
        })
    }

    pub fn into_state(self) -> VboxServiceState {
        Arc::new(self)
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn config(&self) -> &ManagerConfig {
        self.connections.config()
    }

    /// Aborts every wait and retry pending right now; later calls run
    /// normally.
    pub fn cancel_pending(&self) {
        self.connections.cancel_pending()
    }

    // ── Connections ─────────────────────────────────────────────────

    pub async fn connect(&self, host: &Host) -> VboxResult<()> {
        self.connections.connect(host).await
    }

    pub async fn disconnect(&self, host: &Host) -> VboxResult<()> {
        self.connections.disconnect(host).await
    }

    /// Disconnects every host; the failures are returned, not raised.
    pub async fn disconnect_all(&self) -> Vec<(Host, VboxError)> {
        self.connections.disconnect_all().await
    }

    pub fn is_connected(&self, host: &Host) -> bool {
        self.connections.is_connected(host)
    }

    pub fn connected_hosts(&self) -> Vec<Host> {
        self.connections.registry().list()
    }

    // ── Inventory ───────────────────────────────────────────────────

    pub async fn list_guests(&self, host: &Host) -> VboxResult<Vec<Guest>> {
        InventoryManager::new(&self.connections).list_guests(host).await
    }

    pub async fn find_guest_by_id(&self, host: &Host, id: Uuid) -> VboxResult<Guest> {
        InventoryManager::new(&self.connections).find_by_id(host, id).await
    }

    pub async fn find_guest_by_name(&self, host: &Host, name: &str) -> VboxResult<Guest> {
        InventoryManager::new(&self.connections).find_by_name(host, name).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn start_guest(&self, guest: &Guest) -> VboxResult<()> {
        LifecycleManager::new(&self.connections).start(guest).await
    }

    pub async fn shut_down_guest(&self, guest: &Guest) -> VboxResult<()> {
        LifecycleManager::new(&self.connections).shut_down(guest).await
    }

    pub async fn guest_state(&self, guest: &Guest) -> VboxResult<MachineState> {
        LifecycleManager::new(&self.connections).state(guest).await
    }

    // ── Clones ──────────────────────────────────────────────────────

    pub async fn create_clone(&self, guest: &Guest, clone_type: CloneType) -> VboxResult<Guest> {
        CloneManager::new(&self.connections).create_clone(guest, clone_type).await
    }

    pub async fn remove_guest(&self, guest: &Guest) -> VboxResult<()> {
        CloneManager::new(&self.connections).remove_guest(guest).await
    }

    // ── Port rules ──────────────────────────────────────────────────

    pub async fn list_port_rules(&self, guest: &Guest) -> VboxResult<Vec<PortRule>> {
        PortRuleManager::new(&self.connections).list_rules(guest).await
    }

    pub async fn add_port_rule(&self, guest: &Guest, rule: &PortRule) -> VboxResult<()> {
        PortRuleManager::new(&self.connections).add_rule(guest, rule).await
    }

    pub async fn delete_port_rule(&self, guest: &Guest, name: &str) -> VboxResult<()> {
        PortRuleManager::new(&self.connections).delete_rule(guest, name).await
    }

    pub async fn delete_all_port_rules(&self, guest: &Guest) -> VboxResult<usize> {
        PortRuleManager::new(&self.connections).delete_all_rules(guest).await
    }

    // ── Search ──────────────────────────────────────────────────────

    pub async fn search(
        &self,
        criteria: &SearchCriteria,
        mode: SearchMode,
        order: &[SearchCriterion],
    ) -> VboxResult<Vec<Guest>> {
        SearchEngine::new(&self.connections).search(criteria, mode, order).await
    }
}
