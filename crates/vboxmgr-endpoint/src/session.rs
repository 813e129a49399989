//! Session-scoped endpoint primitives.
//!
//! A session is opened per operation and must be closed by whoever opened
//! it.  Machine locks taken through [`HypervisorSession::lock_machine`] belong
//! to that session and are released with [`HypervisorSession::unlock_machine`].

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EndpointResult;
use crate::redirect::NatRedirect;
use crate::types::*;

/// Opens authenticated sessions against a management URL.
#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> EndpointResult<Box<dyn HypervisorSession>>;
}

/// Completion tracker for a long-running remote call.
#[async_trait]
pub trait ProgressHandle: Send + Sync {
    async fn completed(&self) -> EndpointResult<bool>;

    async fn percent(&self) -> EndpointResult<u32>;

    /// Failure text once completed, `None` on success.
    async fn error(&self) -> EndpointResult<Option<String>>;
}

#[async_trait]
pub trait HypervisorSession: Send + Sync {
    // ── Endpoint ──────────────────────────────────────────────────

    async fn api_version(&self) -> EndpointResult<String>;

    async fn guest_os_type(&self, os_type_id: &str) -> EndpointResult<GuestOsType>;

    // ── Machines ──────────────────────────────────────────────────

    /// Looks a registered machine up by id (hyphenated form) or by name.
    async fn find_machine(&self, name_or_id: &str) -> EndpointResult<MachineRecord>;

    async fn list_machines(&self) -> EndpointResult<Vec<MachineRecord>>;

    async fn machine_state(&self, machine: Uuid) -> EndpointResult<MachineState>;

    async fn create_machine(&self, name: &str, os_type_id: &str) -> EndpointResult<MachineRecord>;

    async fn save_settings(&self, machine: Uuid) -> EndpointResult<()>;

    async fn register_machine(&self, machine: Uuid) -> EndpointResult<()>;

    /// Unregisters the machine, detaching its hard disks, and returns the
    /// ids of the media it owned.
    async fn unregister_machine(&self, machine: Uuid) -> EndpointResult<Vec<Uuid>>;

    async fn delete_config(
        &self,
        machine: Uuid,
        media: &[Uuid],
    ) -> EndpointResult<Box<dyn ProgressHandle>>;

    // ── Locks & power ─────────────────────────────────────────────

    async fn lock_machine(&self, machine: Uuid, lock: LockType) -> EndpointResult<()>;

    async fn unlock_machine(&self) -> EndpointResult<()>;

    async fn session_state(&self) -> EndpointResult<SessionState>;

    async fn launch(&self, machine: Uuid, front_end: &str)
        -> EndpointResult<Box<dyn ProgressHandle>>;

    /// Powers down the machine locked by this session.
    async fn power_down(&self) -> EndpointResult<Box<dyn ProgressHandle>>;

    // ── Storage ───────────────────────────────────────────────────

    async fn attached_medium(
        &self,
        machine: Uuid,
        slot: &DiskSlot,
    ) -> EndpointResult<Option<MediumRecord>>;

    async fn medium(&self, id: Uuid) -> EndpointResult<MediumRecord>;

    // ── Snapshots & clones ────────────────────────────────────────

    /// Snapshots the machine locked by this session.
    async fn take_snapshot(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> EndpointResult<Box<dyn ProgressHandle>>;

    /// Deletes a snapshot of the machine locked by this session.
    async fn delete_snapshot(&self, snapshot: Uuid) -> EndpointResult<Box<dyn ProgressHandle>>;

    async fn snapshots(&self, machine: Uuid) -> EndpointResult<Vec<SnapshotRecord>>;

    async fn current_snapshot(&self, machine: Uuid) -> EndpointResult<Option<SnapshotRecord>>;

    async fn clone_to(
        &self,
        source: CloneSource,
        target: Uuid,
        mode: CloneMode,
        options: &[CloneOption],
    ) -> EndpointResult<Box<dyn ProgressHandle>>;

    // ── NAT ───────────────────────────────────────────────────────

    /// Encoded redirects of the NAT engine on adapter `slot`.
    async fn nat_redirects(&self, machine: Uuid, slot: u32) -> EndpointResult<Vec<String>>;

    async fn add_nat_redirect(
        &self,
        machine: Uuid,
        slot: u32,
        redirect: &NatRedirect,
    ) -> EndpointResult<()>;

    async fn remove_nat_redirect(&self, machine: Uuid, slot: u32, name: &str)
        -> EndpointResult<()>;

    // ── Teardown ──────────────────────────────────────────────────

    /// Logs off.  Never fails; errors are logged by the implementation.
    async fn close(&self);
}
