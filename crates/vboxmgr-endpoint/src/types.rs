use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ─── Machine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    PoweredOff,
    Saved,
    Aborted,
    Running,
    Paused,
    Stuck,
    Starting,
    Stopping,
}

impl MachineState {
    /// States from which a power-down is meaningful.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Stuck)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PoweredOff => "PoweredOff",
            Self::Saved => "Saved",
            Self::Aborted => "Aborted",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stuck => "Stuck",
            Self::Starting => "Starting",
            Self::Stopping => "Stopping",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A machine as reported by the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    pub id: Uuid,
    pub name: String,
    pub os_type_id: String,
    pub accessible: bool,
    pub access_error: Option<String>,
    pub state: MachineState,
    pub cpu_count: u32,
    pub cpu_execution_cap: u32,
    pub monitor_count: u32,
    pub memory_mb: u64,
    pub vram_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestOsType {
    pub id: String,
    pub family_id: String,
}

// ─── Storage ────────────────────────────────────────────────────────

/// A disk image.  `machine_ids[0]` is the owning machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediumRecord {
    pub id: Uuid,
    pub parent: Option<Uuid>,
    pub children: Vec<Uuid>,
    pub machine_ids: Vec<Uuid>,
    pub logical_size: u64,
    pub size: u64,
}

impl MediumRecord {
    pub fn owner(&self) -> Option<Uuid> {
        self.machine_ids.first().copied()
    }
}

/// Controller/port/device triple naming an attachment point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSlot {
    pub controller: String,
    pub port: i32,
    pub device: i32,
}

// ─── Snapshots ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub machine_id: Uuid,
    pub parent: Option<Uuid>,
    pub taken_at: DateTime<Utc>,
}

// ─── Sessions & locks ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Unlocked,
    Locked,
    Spawning,
    Unlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockType {
    Shared,
    Write,
}

// ─── Cloning ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloneMode {
    MachineState,
    MachineAndChildStates,
    AllStates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloneOption {
    /// Share the source disk copy-on-write instead of copying it.
    Link,
}

/// What a clone is taken from: the machine's live view or a snapshot's
/// frozen view of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneSource {
    Machine(Uuid),
    Snapshot { machine: Uuid, snapshot: Uuid },
}

impl CloneSource {
    pub fn machine(&self) -> Uuid {
        match *self {
            Self::Machine(id) => id,
            Self::Snapshot { machine, .. } => machine,
        }
    }
}
