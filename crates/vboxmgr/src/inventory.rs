//! Guest inventory: listing and lookup of a host's machines as [`Guest`]
//! descriptors.

use log::{debug, warn};
use uuid::Uuid;

use vboxmgr_endpoint::{HypervisorSession, MachineRecord};

use crate::config::ManagerConfig;
use crate::connection::ConnectionManager;
use crate::error::{VboxError, VboxResult};
use crate::types::{Guest, Host};

pub struct InventoryManager<'a> {
    connections: &'a ConnectionManager,
}

impl<'a> InventoryManager<'a> {
    pub fn new(connections: &'a ConnectionManager) -> Self {
        Self { connections }
    }

    /// Every accessible guest on `host`.  Machines whose attributes cannot
    /// be read are skipped.
    pub async fn list_guests(&self, host: &Host) -> VboxResult<Vec<Guest>> {
        self.connections.require_connected(host, "list guests")?;
        let session = self.connections.open(host).await?;
        let result = self.list_with(&*session, host).await;
        session.close().await;
        result
    }

    async fn list_with(&self, session: &dyn HypervisorSession, host: &Host) -> VboxResult<Vec<Guest>> {
        let machines = session.list_machines().await?;
        let mut guests = Vec::with_capacity(machines.len());
        for record in &machines {
            if !record.accessible {
                debug!("Skipping inaccessible machine '{}' on {host}", record.name);
                continue;
            }
            match describe(session, record, host, self.connections.config()).await {
                Ok(guest) => guests.push(guest),
                Err(e) => warn!("Skipping machine '{}' on {host}: {e}", record.name),
            }
        }
        Ok(guests)
    }

    pub async fn find_by_id(&self, host: &Host, id: Uuid) -> VboxResult<Guest> {
        if id.is_nil() {
            return Err(VboxError::invalid_argument("Guest id is nil"));
        }
        self.find(host, &id.to_string()).await
    }

    pub async fn find_by_name(&self, host: &Host, name: &str) -> VboxResult<Guest> {
        if name.trim().is_empty() {
            return Err(VboxError::invalid_argument("Guest name is empty"));
        }
        self.find(host, name).await
    }

    async fn find(&self, host: &Host, key: &str) -> VboxResult<Guest> {
        self.connections.require_connected(host, "look up a guest")?;
        let session = self.connections.open(host).await?;
        let result = async {
            let record = session
                .find_machine(key)
                .await
                .map_err(|e| VboxError::lookup_fault(&format!("Guest '{key}'"), e))?;
            require_accessible(&record)?;
            describe(&*session, &record, host, self.connections.config()).await
        }
        .await;
        session.close().await;
        result
    }
}

/// Looks the machine behind `guest` up by id.
pub(crate) async fn resolve(session: &dyn HypervisorSession, guest: &Guest) -> VboxResult<MachineRecord> {
    session
        .find_machine(&guest.id.to_string())
        .await
        .map_err(|e| VboxError::lookup_fault(&format!("Guest {guest}"), e))
}

pub(crate) fn require_accessible(record: &MachineRecord) -> VboxResult<()> {
    if record.accessible {
        return Ok(());
    }
    Err(VboxError::unexpected_state(format!(
        "Machine '{}' is inaccessible: {}",
        record.name,
        record.access_error.as_deref().unwrap_or("unknown reason")
    )))
}

/// Builds a guest descriptor from a machine record, its OS type and its
/// primary disk.
pub(crate) async fn describe(
    session: &dyn HypervisorSession,
    record: &MachineRecord,
    host: &Host,
    config: &ManagerConfig,
) -> VboxResult<Guest> {
    let os = session.guest_os_type(&record.os_type_id).await?;
    let disk = session.attached_medium(record.id, &config.disk_slot()).await?;
    let (disk_total, disk_free) = disk
        .map(|m| (m.logical_size, m.logical_size.saturating_sub(m.size)))
        .unwrap_or((0, 0));

    Ok(Guest {
        id: record.id,
        name: record.name.clone(),
        host: host.clone(),
        cpu_count: u64::from(record.cpu_count),
        monitor_count: u64::from(record.monitor_count),
        cpu_execution_cap: u64::from(record.cpu_execution_cap),
        disk_total,
        disk_free,
        ram_size: record.memory_mb,
        vram_size: record.vram_mb,
        os_type: os.family_id,
        os_identifier: os.id,
    })
}
