//! Session establishment, validation and teardown.
//!
//! Every manager goes through [`ConnectionManager::open`] for a short-lived,
//! version-checked session and closes it before returning.  `connect` and
//! `disconnect` maintain the [`ConnectionRegistry`].

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use vboxmgr_endpoint::{HypervisorConnector, HypervisorSession, SessionState};

use crate::config::ManagerConfig;
use crate::error::{VboxError, VboxErrorKind, VboxResult};
use crate::inventory::InventoryManager;
use crate::lifecycle::LifecycleManager;
use crate::progress::Waiter;
use crate::registry::ConnectionRegistry;
use crate::types::Host;

/// An open endpoint session.  Whoever opens it closes it.
pub type SessionHandle = Box<dyn HypervisorSession>;

pub struct ConnectionManager {
    connector: Arc<dyn HypervisorConnector>,
    registry: Arc<ConnectionRegistry>,
    config: ManagerConfig,
    /// Shared by every wait and retry started since the last `cancel_pending`.
    cancel: Mutex<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn HypervisorConnector>, config: ManagerConfig) -> Self {
        Self::with_registry(connector, Arc::new(ConnectionRegistry::new()), config)
    }

    pub fn with_registry(
        connector: Arc<dyn HypervisorConnector>,
        registry: Arc<ConnectionRegistry>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            connector,
            registry,
            config,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Aborts every wait and retry pending right now with `Cancelled`.
    /// Operations started afterwards are unaffected.
    pub fn cancel_pending(&self) {
        let pending = {
            let mut current = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, CancellationToken::new())
        };
        info!("Cancelling pending waits and retries");
        pending.cancel();
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self, host: &Host) -> bool {
        self.registry.is_connected(host)
    }

    pub(crate) fn require_connected(&self, host: &Host, action: &str) -> VboxResult<()> {
        if self.registry.is_connected(host) {
            Ok(())
        } else {
            Err(VboxError::connection(format!(
                "Cannot {action}: host {host} is not connected"
            )))
        }
    }

    pub(crate) fn progress_waiter(&self) -> Waiter {
        Waiter::new(
            self.config.progress_poll_interval(),
            self.config.operation_timeout(),
            self.cancel_token(),
        )
    }

    pub(crate) fn state_waiter(&self) -> Waiter {
        Waiter::new(
            self.config.state_poll_interval(),
            self.config.operation_timeout(),
            self.cancel_token(),
        )
    }

    // ── Sessions ──────────────────────────────────────────────────

    /// One connection attempt plus API version check.
    async fn attempt(&self, host: &Host) -> VboxResult<SessionHandle> {
        let url = host.url();
        let session = self
            .connector
            .connect(&url, host.username(), host.password())
            .await
            .map_err(|e| VboxError::connection(format!("Cannot connect to {url}: {e}")))?;

        let required = &self.config.required_api_version;
        match session.api_version().await {
            Ok(version) if &version == required => Ok(session),
            Ok(version) => {
                session.close().await;
                Err(VboxError::incompatible_version(format!(
                    "Host {host} speaks API {version}, {required} is required"
                )))
            }
            Err(e) => {
                session.close().await;
                Err(VboxError::connection(format!(
                    "Cannot read API version of {host}: {e}"
                )))
            }
        }
    }

    /// Opens a validated session, retrying transient connection failures.
    /// A host that cannot be reached, or speaks the wrong API version, is
    /// dropped from the registry.
    pub async fn open(&self, host: &Host) -> VboxResult<SessionHandle> {
        let attempts = self.config.connect_attempts.max(1);
        let delay = self.config.retry_delay();
        let cancel = self.cancel_token();
        let mut attempt = 1;
        loop {
            match self.attempt(host).await {
                Ok(session) => {
                    debug!("Session opened to {host} (attempt {attempt}/{attempts})");
                    return Ok(session);
                }
                Err(e) if e.kind == VboxErrorKind::ConnectionFailure && attempt < attempts => {
                    warn!("Attempt {attempt}/{attempts} to reach {host} failed: {e}; retrying in {delay:?}");
                    tokio::select! {
                        biased;
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(VboxError::cancelled(format!("Connecting to {host} was cancelled")));
                        }
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if self.registry.remove(host) {
                        warn!("Host {host} dropped from registry: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }

    // ── Registry maintenance ──────────────────────────────────────

    /// Validates `host` and registers it.  Connecting an already registered
    /// host only revalidates it.
    pub async fn connect(&self, host: &Host) -> VboxResult<()> {
        info!("Connecting to {host}");
        let session = self.open(host).await?;
        session.close().await;
        if self.registry.add(host) {
            info!("Connected to {host}");
        } else {
            debug!("Host {host} revalidated");
        }
        Ok(())
    }

    /// Shuts down the host's active guests and unregisters it.  A host that
    /// fails revalidation is unregistered anyway and reported as a failure.
    pub async fn disconnect(&self, host: &Host) -> VboxResult<()> {
        if !self.registry.is_connected(host) {
            return Err(VboxError::disconnection(format!(
                "Host {host} is not connected"
            )));
        }
        info!("Disconnecting from {host}");

        match self.attempt(host).await {
            Ok(session) => session.close().await,
            Err(e) => {
                self.registry.remove(host);
                return Err(VboxError::disconnection(format!(
                    "Host {host} could not be revalidated: {e}"
                )));
            }
        }

        self.stop_active_guests(host).await;
        self.registry.remove(host);
        info!("Disconnected from {host}");
        Ok(())
    }

    /// Disconnects every registered host and returns the ones that failed.
    pub async fn disconnect_all(&self) -> Vec<(Host, VboxError)> {
        let mut failures = Vec::new();
        for host in self.registry.list() {
            if let Err(e) = self.disconnect(&host).await {
                warn!("Disconnecting {host} failed: {e}");
                failures.push((host, e));
            }
        }
        failures
    }

    async fn stop_active_guests(&self, host: &Host) {
        let guests = match InventoryManager::new(self).list_guests(host).await {
            Ok(guests) => guests,
            Err(e) => {
                warn!("Cannot list guests of {host} before disconnecting: {e}");
                return;
            }
        };

        let lifecycle = LifecycleManager::new(self);
        for guest in &guests {
            match lifecycle.state(guest).await {
                Ok(state) if state.is_active() => {
                    info!("Shutting down {guest} ({state}) before disconnecting");
                    if let Err(e) = lifecycle.shut_down(guest).await {
                        warn!("Could not shut down {guest}: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Cannot read state of {guest}: {e}"),
            }
        }
    }
}

/// Unlocks the session's machine if the session still holds it.
pub(crate) async fn release_lock(session: &dyn HypervisorSession, what: &str) {
    match session.session_state().await {
        Ok(SessionState::Locked) => {
            if let Err(e) = session.unlock_machine().await {
                warn!("Could not unlock machine after {what}: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Cannot read session state after {what}: {e}"),
    }
}
