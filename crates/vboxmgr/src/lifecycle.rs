//! Guest power-state transitions.
//!
//! Start and shutdown each run in one session: resolve the machine, check
//! its state, lock, issue the call, wait for the progress handle and then
//! for the state to settle.  The lock is released on every path.

use log::{debug, info};

use vboxmgr_endpoint::{HypervisorSession, LockType, MachineRecord, MachineState, SessionState};

use crate::connection::{release_lock, ConnectionManager};
use crate::error::{VboxError, VboxResult};
use crate::inventory::{require_accessible, resolve};
use crate::types::Guest;

pub struct LifecycleManager<'a> {
    connections: &'a ConnectionManager,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(connections: &'a ConnectionManager) -> Self {
        Self { connections }
    }

    /// Current state of the guest's machine.
    pub async fn state(&self, guest: &Guest) -> VboxResult<MachineState> {
        guest.check()?;
        self.connections.require_connected(&guest.host, "read guest state")?;
        let session = self.connections.open(&guest.host).await?;
        let result = async {
            let machine = resolve(&*session, guest).await?;
            require_accessible(&machine)?;
            Ok::<_, VboxError>(session.machine_state(machine.id).await?)
        }
        .await;
        session.close().await;
        result
    }

    // ── Start ─────────────────────────────────────────────────────

    pub async fn start(&self, guest: &Guest) -> VboxResult<()> {
        guest.check()?;
        self.connections.require_connected(&guest.host, "start a guest")?;
        info!("Starting {guest}");

        let session = self.connections.open(&guest.host).await?;
        let result = self.start_with(&*session, guest).await;
        session.close().await;

        if result.is_ok() {
            info!("{guest} is running");
        }
        result
    }

    async fn start_with(&self, session: &dyn HypervisorSession, guest: &Guest) -> VboxResult<()> {
        let machine = resolve(session, guest).await?;
        require_accessible(&machine)?;
        if matches!(machine.state, MachineState::Running | MachineState::Paused) {
            return Err(VboxError::unexpected_state(format!(
                "{guest} is already {}",
                machine.state
            )));
        }

        session
            .lock_machine(machine.id, LockType::Shared)
            .await
            .map_err(|e| VboxError::state_fault(&format!("Cannot lock {guest}"), e))?;
        let outcome = self.launch_and_settle(session, &machine).await;
        release_lock(session, "start").await;
        outcome
    }

    async fn launch_and_settle(&self, session: &dyn HypervisorSession, machine: &MachineRecord) -> VboxResult<()> {
        let front_end = &self.connections.config().launch_front_end;
        let progress = session
            .launch(machine.id, front_end)
            .await
            .map_err(|e| VboxError::state_fault(&format!("Cannot launch '{}'", machine.name), e))?;
        self.connections
            .progress_waiter()
            .progress(&format!("Launch of '{}'", machine.name), progress.as_ref())
            .await?;

        debug!("Waiting for '{}' to reach Running", machine.name);
        let id = machine.id;
        self.connections
            .state_waiter()
            .until(&format!("Start of '{}'", machine.name), || async move {
                Ok::<_, VboxError>(session.machine_state(id).await? == MachineState::Running)
            })
            .await
    }

    // ── Shutdown ──────────────────────────────────────────────────

    pub async fn shut_down(&self, guest: &Guest) -> VboxResult<()> {
        guest.check()?;
        self.connections.require_connected(&guest.host, "shut down a guest")?;
        info!("Shutting down {guest}");

        let session = self.connections.open(&guest.host).await?;
        let result = self.shut_down_with(&*session, guest).await;
        session.close().await;

        if result.is_ok() {
            info!("{guest} is powered off");
        }
        result
    }

    async fn shut_down_with(&self, session: &dyn HypervisorSession, guest: &Guest) -> VboxResult<()> {
        let machine = resolve(session, guest).await?;
        require_accessible(&machine)?;
        if !machine.state.is_active() {
            return Err(VboxError::unexpected_state(format!(
                "{guest} is {}, nothing to shut down",
                machine.state
            )));
        }

        session
            .lock_machine(machine.id, LockType::Shared)
            .await
            .map_err(|e| VboxError::state_fault(&format!("Cannot lock {guest}"), e))?;
        let powered_down = self.power_down(session, &machine).await;
        if powered_down.is_err() {
            release_lock(session, "shutdown").await;
            return powered_down;
        }
        session
            .unlock_machine()
            .await
            .map_err(|e| VboxError::state_fault(&format!("Cannot unlock {guest}"), e))?;

        debug!("Waiting for '{}' to power off and unlock", machine.name);
        let id = machine.id;
        self.connections
            .state_waiter()
            .until(&format!("Shutdown of '{}'", machine.name), || async move {
                let state = session.machine_state(id).await?;
                let lock = session.session_state().await?;
                Ok::<_, VboxError>(state == MachineState::PoweredOff && lock == SessionState::Unlocked)
            })
            .await
    }

    async fn power_down(&self, session: &dyn HypervisorSession, machine: &MachineRecord) -> VboxResult<()> {
        let progress = session
            .power_down()
            .await
            .map_err(|e| VboxError::state_fault(&format!("Cannot power down '{}'", machine.name), e))?;
        self.connections
            .progress_waiter()
            .progress(&format!("Power-down of '{}'", machine.name), progress.as_ref())
            .await
    }
}
