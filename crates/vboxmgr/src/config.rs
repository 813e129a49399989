//! Manager configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use vboxmgr_endpoint::DiskSlot;

use crate::error::{VboxError, VboxResult};

/// Which machine states allow a clone to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloneStatePolicy {
    /// PoweredOff, Saved, Running and Paused machines may be cloned.
    AllowListed,
    /// Every clone request is rejected.
    Disabled,
}

impl Default for CloneStatePolicy {
    fn default() -> Self { Self::AllowListed }
}

/// Tunables shared by every manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Connection attempts before a host is given up on (default 3)
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Pause between connection attempts, ms (default 5000)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Progress-handle poll interval, ms (default 200)
    #[serde(default = "default_progress_poll_ms")]
    pub progress_poll_ms: u64,
    /// Machine/session state poll interval, ms (default 200)
    #[serde(default = "default_progress_poll_ms")]
    pub state_poll_ms: u64,
    /// Upper bound for any single wait, seconds.  `None` waits forever.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: Option<u64>,
    /// Management API version a host must report (default "4_3")
    #[serde(default = "default_api_version")]
    pub required_api_version: String,
    /// Front-end requested when launching a guest (default "gui")
    #[serde(default = "default_front_end")]
    pub launch_front_end: String,
    /// Controller holding the primary disk (default "SATA")
    #[serde(default = "default_disk_controller")]
    pub disk_controller: String,
    #[serde(default)]
    pub disk_port: i32,
    #[serde(default)]
    pub disk_device: i32,
    /// Network adapter whose NAT engine carries port rules (default 0)
    #[serde(default)]
    pub nat_adapter_slot: u32,
    #[serde(default)]
    pub clone_state_policy: CloneStatePolicy,
}

fn default_connect_attempts() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 5_000 }
fn default_progress_poll_ms() -> u64 { 200 }
fn default_operation_timeout_secs() -> Option<u64> { Some(600) }
fn default_api_version() -> String { "4_3".into() }
fn default_front_end() -> String { "gui".into() }
fn default_disk_controller() -> String { "SATA".into() }

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            progress_poll_ms: default_progress_poll_ms(),
            state_poll_ms: default_progress_poll_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            required_api_version: default_api_version(),
            launch_front_end: default_front_end(),
            disk_controller: default_disk_controller(),
            disk_port: 0,
            disk_device: 0,
            nat_adapter_slot: 0,
            clone_state_policy: CloneStatePolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_json_str(json: &str) -> VboxResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> VboxResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VboxError::invalid_argument(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> VboxResult<()> {
        if self.connect_attempts == 0 {
            return Err(VboxError::invalid_argument("connectAttempts must be at least 1"));
        }
        if self.progress_poll_ms == 0 || self.state_poll_ms == 0 {
            return Err(VboxError::invalid_argument("poll intervals must be non-zero"));
        }
        if self.required_api_version.trim().is_empty() {
            return Err(VboxError::invalid_argument("requiredApiVersion is empty"));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_ms)
    }

    pub fn state_poll_interval(&self) -> Duration {
        Duration::from_millis(self.state_poll_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    pub fn disk_slot(&self) -> DiskSlot {
        DiskSlot {
            controller: self.disk_controller.clone(),
            port: self.disk_port,
            device: self.disk_device,
        }
    }
}
