//! In-process simulated host.
//!
//! [`SimulatedHypervisor`] keeps a small machine/medium/snapshot model behind
//! a mutex and serves it through the session traits.  Snapshots freeze the
//! machine's current disk and give it a fresh differencing child; linked
//! clones hang their disk off the frozen medium.  Deleting a medium that
//! still has foreign children, or a snapshot a linked clone depends on, is
//! refused the way a real host refuses it.
//!
//! Every state-changing call is appended to a journal so tests can assert
//! ordering.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{EndpointError, EndpointResult};
use crate::redirect::NatRedirect;
use crate::session::{HypervisorConnector, HypervisorSession, ProgressHandle};
use crate::types::*;

const GIB: u64 = 1024 * 1024 * 1024;

// ─── Machine builder ────────────────────────────────────────────────

/// Description of a machine to seed into the simulated host.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    name: String,
    os_type_id: String,
    state: MachineState,
    accessible: bool,
    cpu_count: u32,
    cpu_execution_cap: u32,
    monitor_count: u32,
    memory_mb: u64,
    vram_mb: u64,
    disk: Option<(u64, u64)>,
}

impl MachineSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            os_type_id: "Ubuntu_64".into(),
            state: MachineState::PoweredOff,
            accessible: true,
            cpu_count: 1,
            cpu_execution_cap: 100,
            monitor_count: 1,
            memory_mb: 1024,
            vram_mb: 16,
            disk: Some((20 * GIB, 4 * GIB)),
        }
    }

    pub fn state(mut self, state: MachineState) -> Self {
        self.state = state;
        self
    }

    pub fn os_type(mut self, os_type_id: impl Into<String>) -> Self {
        self.os_type_id = os_type_id.into();
        self
    }

    pub fn cpus(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn execution_cap(mut self, cap: u32) -> Self {
        self.cpu_execution_cap = cap;
        self
    }

    pub fn monitors(mut self, count: u32) -> Self {
        self.monitor_count = count;
        self
    }

    pub fn memory(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn vram(mut self, mb: u64) -> Self {
        self.vram_mb = mb;
        self
    }

    /// Primary disk with the given logical size and allocated bytes.
    pub fn disk(mut self, logical_size: u64, allocated: u64) -> Self {
        self.disk = Some((logical_size, allocated));
        self
    }

    pub fn without_disk(mut self) -> Self {
        self.disk = None;
        self
    }

    pub fn inaccessible(mut self) -> Self {
        self.accessible = false;
        self
    }
}

// ─── Model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Snapshot {
    record: SnapshotRecord,
    frozen: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct Machine {
    record: MachineRecord,
    registered: bool,
    disk: Option<Uuid>,
    snapshots: Vec<Snapshot>,
    current_snapshot: Option<Uuid>,
    redirects: HashMap<u32, Vec<String>>,
    /// Target state and the number of state reads before it is reached.
    settle: Option<(MachineState, u32)>,
}

impl Machine {
    fn new(record: MachineRecord, registered: bool) -> Self {
        Self {
            record,
            registered,
            disk: None,
            snapshots: Vec::new(),
            current_snapshot: None,
            redirects: HashMap::new(),
            settle: None,
        }
    }
}

struct SimState {
    api_version: String,
    failing_connects: u32,
    connect_attempts: u32,
    next_session: u64,
    open_sessions: u32,
    machines: Vec<Machine>,
    media: HashMap<Uuid, MediumRecord>,
    os_families: HashMap<String, String>,
    locks: HashMap<u64, (Uuid, LockType)>,
    unlocking: HashMap<u64, u32>,
    progress_polls: u32,
    settle_reads: u32,
    unlock_lag: u32,
    launches: u32,
    power_downs: u32,
    journal: Vec<String>,
}

impl SimState {
    fn new() -> Self {
        let os_families = [
            ("Ubuntu_64", "Linux"),
            ("Debian_64", "Linux"),
            ("Windows7_64", "Windows"),
            ("Windows10_64", "Windows"),
            ("FreeBSD_64", "BSD"),
        ]
        .into_iter()
        .map(|(id, family)| (id.to_string(), family.to_string()))
        .collect();

        Self {
            api_version: "4_3".into(),
            failing_connects: 0,
            connect_attempts: 0,
            next_session: 0,
            open_sessions: 0,
            machines: Vec::new(),
            media: HashMap::new(),
            os_families,
            locks: HashMap::new(),
            unlocking: HashMap::new(),
            progress_polls: 0,
            settle_reads: 0,
            unlock_lag: 0,
            launches: 0,
            power_downs: 0,
            journal: Vec::new(),
        }
    }

    fn machine(&self, id: Uuid) -> EndpointResult<&Machine> {
        self.machines
            .iter()
            .find(|m| m.record.id == id)
            .ok_or_else(|| EndpointError::NotFound(format!("machine {id}")))
    }

    fn machine_mut(&mut self, id: Uuid) -> EndpointResult<&mut Machine> {
        self.machines
            .iter_mut()
            .find(|m| m.record.id == id)
            .ok_or_else(|| EndpointError::NotFound(format!("machine {id}")))
    }

    fn registered(&self, key: &str) -> Option<&Machine> {
        let by_id = Uuid::parse_str(key).ok();
        self.machines
            .iter()
            .filter(|m| m.registered)
            .find(|m| Some(m.record.id) == by_id || m.record.name == key)
    }

    fn held_lock(&self, session: u64) -> EndpointResult<(Uuid, LockType)> {
        self.locks
            .get(&session)
            .copied()
            .ok_or_else(|| EndpointError::InvalidState("session has no machine locked".into()))
    }

    fn name_of(&self, id: Uuid) -> String {
        self.machine(id)
            .map(|m| m.record.name.clone())
            .unwrap_or_else(|_| id.to_string())
    }

    fn new_medium(&mut self, parent: Option<Uuid>, owner: Uuid, logical: u64, size: u64) -> Uuid {
        let id = Uuid::new_v4();
        self.media.insert(
            id,
            MediumRecord {
                id,
                parent,
                children: Vec::new(),
                machine_ids: vec![owner],
                logical_size: logical,
                size,
            },
        );
        if let Some(parent) = parent.and_then(|p| self.media.get_mut(&p)) {
            parent.children.push(id);
        }
        id
    }

    fn observe_state(&mut self, id: Uuid) -> EndpointResult<MachineState> {
        let machine = self.machine_mut(id)?;
        if let Some((target, left)) = machine.settle {
            if left == 0 {
                machine.record.state = target;
                machine.settle = None;
            } else {
                machine.settle = Some((target, left - 1));
            }
        }
        Ok(machine.record.state)
    }

    fn progress(&self) -> Box<dyn ProgressHandle> {
        Box::new(SimProgress::new(self.progress_polls))
    }

    fn record(&mut self, event: String) {
        debug!("sim: {event}");
        self.journal.push(event);
    }
}

// ─── Host handle ────────────────────────────────────────────────────

/// One simulated host.  Cloning shares the same model.
#[derive(Clone)]
pub struct SimulatedHypervisor {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Knobs ─────────────────────────────────────────────────────

    pub fn set_api_version(&self, version: impl Into<String>) {
        self.lock().api_version = version.into();
    }

    /// Makes the next `count` connection attempts fail.  `u32::MAX` fails
    /// forever.
    pub fn fail_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Number of `completed()` polls a progress handle answers `false` to.
    pub fn set_progress_polls(&self, polls: u32) {
        self.lock().progress_polls = polls;
    }

    /// Number of state reads a started/stopped machine stays transient.
    pub fn set_settle_reads(&self, reads: u32) {
        self.lock().settle_reads = reads;
    }

    /// Number of session-state reads reporting `Unlocking` after an unlock.
    pub fn set_unlock_lag(&self, reads: u32) {
        self.lock().unlock_lag = reads;
    }

    pub fn add_os_type(&self, id: impl Into<String>, family: impl Into<String>) {
        self.lock().os_families.insert(id.into(), family.into());
    }

    pub fn add_machine(&self, spec: MachineSpec) -> Uuid {
        let mut st = self.lock();
        let id = Uuid::new_v4();
        let record = MachineRecord {
            id,
            name: spec.name,
            os_type_id: spec.os_type_id,
            accessible: spec.accessible,
            access_error: (!spec.accessible).then(|| "settings file missing".to_string()),
            state: spec.state,
            cpu_count: spec.cpu_count,
            cpu_execution_cap: spec.cpu_execution_cap,
            monitor_count: spec.monitor_count,
            memory_mb: spec.memory_mb,
            vram_mb: spec.vram_mb,
        };
        let mut machine = Machine::new(record, true);
        if let Some((logical, allocated)) = spec.disk {
            machine.disk = Some(st.new_medium(None, id, logical, allocated));
        }
        st.machines.push(machine);
        id
    }

    pub fn set_state(&self, id: Uuid, state: MachineState) {
        if let Ok(machine) = self.lock().machine_mut(id) {
            machine.record.state = state;
            machine.settle = None;
        }
    }

    pub fn push_raw_redirect(&self, id: Uuid, raw: impl Into<String>) {
        if let Ok(machine) = self.lock().machine_mut(id) {
            machine.redirects.entry(0).or_default().push(raw.into());
        }
    }

    // ── Inspection ────────────────────────────────────────────────

    pub fn machine(&self, name: &str) -> Option<MachineRecord> {
        self.lock().registered(name).map(|m| m.record.clone())
    }

    pub fn machine_names(&self) -> Vec<String> {
        self.lock()
            .machines
            .iter()
            .filter(|m| m.registered)
            .map(|m| m.record.name.clone())
            .collect()
    }

    pub fn disk_of(&self, id: Uuid) -> Option<MediumRecord> {
        let st = self.lock();
        let disk = st.machine(id).ok()?.disk?;
        st.media.get(&disk).cloned()
    }

    pub fn medium(&self, id: Uuid) -> Option<MediumRecord> {
        self.lock().media.get(&id).cloned()
    }

    pub fn medium_count(&self) -> usize {
        self.lock().media.len()
    }

    pub fn snapshot_names(&self, id: Uuid) -> Vec<String> {
        self.lock()
            .machine(id)
            .map(|m| m.snapshots.iter().map(|s| s.record.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn redirects(&self, id: Uuid) -> Vec<String> {
        self.lock()
            .machine(id)
            .ok()
            .and_then(|m| m.redirects.get(&0).cloned())
            .unwrap_or_default()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn open_sessions(&self) -> u32 {
        self.lock().open_sessions
    }

    pub fn held_locks(&self) -> usize {
        self.lock().locks.len()
    }

    pub fn launches(&self) -> u32 {
        self.lock().launches
    }

    pub fn power_downs(&self) -> u32 {
        self.lock().power_downs
    }

    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }
}

#[async_trait]
impl HypervisorConnector for SimulatedHypervisor {
    async fn connect(
        &self,
        url: &str,
        _username: &str,
        _password: &str,
    ) -> EndpointResult<Box<dyn HypervisorSession>> {
        let mut st = self.lock();
        st.connect_attempts += 1;
        if st.failing_connects > 0 {
            if st.failing_connects != u32::MAX {
                st.failing_connects -= 1;
            }
            return Err(EndpointError::Unreachable(format!("cannot reach {url}")));
        }
        st.next_session += 1;
        st.open_sessions += 1;
        Ok(Box::new(SimSession {
            id: st.next_session,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Routes connections to simulated hosts by URL.
#[derive(Default)]
pub struct SimNetwork {
    hosts: Mutex<HashMap<String, SimulatedHypervisor>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, url: impl Into<String>, host: SimulatedHypervisor) {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.into(), host);
    }
}

#[async_trait]
impl HypervisorConnector for SimNetwork {
    async fn connect(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> EndpointResult<Box<dyn HypervisorSession>> {
        let host = self
            .hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned();
        match host {
            Some(host) => host.connect(url, username, password).await,
            None => Err(EndpointError::Unreachable(format!("no route to {url}"))),
        }
    }
}

// ─── Progress ───────────────────────────────────────────────────────

struct SimProgress {
    total: u32,
    left: AtomicU32,
}

impl SimProgress {
    fn new(polls: u32) -> Self {
        Self {
            total: polls,
            left: AtomicU32::new(polls),
        }
    }
}

#[async_trait]
impl ProgressHandle for SimProgress {
    async fn completed(&self) -> EndpointResult<bool> {
        let left = self.left.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(true);
        }
        self.left.store(left - 1, Ordering::SeqCst);
        Ok(false)
    }

    async fn percent(&self) -> EndpointResult<u32> {
        if self.total == 0 {
            return Ok(100);
        }
        let done = u64::from(self.total - self.left.load(Ordering::SeqCst));
        Ok((done * 100 / u64::from(self.total)) as u32)
    }

    async fn error(&self) -> EndpointResult<Option<String>> {
        Ok(None)
    }
}

// ─── Session ────────────────────────────────────────────────────────

struct SimSession {
    id: u64,
    state: Arc<Mutex<SimState>>,
    closed: AtomicBool,
}

impl SimSession {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl HypervisorSession for SimSession {
    async fn api_version(&self) -> EndpointResult<String> {
        Ok(self.lock().api_version.clone())
    }

    async fn guest_os_type(&self, os_type_id: &str) -> EndpointResult<GuestOsType> {
        let st = self.lock();
        let family_id = st
            .os_families
            .get(os_type_id)
            .cloned()
            .unwrap_or_else(|| "Other".to_string());
        Ok(GuestOsType {
            id: os_type_id.to_string(),
            family_id,
        })
    }

    async fn find_machine(&self, name_or_id: &str) -> EndpointResult<MachineRecord> {
        self.lock()
            .registered(name_or_id)
            .map(|m| m.record.clone())
            .ok_or_else(|| EndpointError::NotFound(format!("no machine '{name_or_id}'")))
    }

    async fn list_machines(&self) -> EndpointResult<Vec<MachineRecord>> {
        Ok(self
            .lock()
            .machines
            .iter()
            .filter(|m| m.registered)
            .map(|m| m.record.clone())
            .collect())
    }

    async fn machine_state(&self, machine: Uuid) -> EndpointResult<MachineState> {
        self.lock().observe_state(machine)
    }

    async fn create_machine(&self, name: &str, os_type_id: &str) -> EndpointResult<MachineRecord> {
        let mut st = self.lock();
        if st.registered(name).is_some() {
            return Err(EndpointError::InvalidState(format!(
                "machine '{name}' already exists"
            )));
        }
        let record = MachineRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            os_type_id: os_type_id.to_string(),
            accessible: true,
            access_error: None,
            state: MachineState::PoweredOff,
            cpu_count: 1,
            cpu_execution_cap: 100,
            monitor_count: 1,
            memory_mb: 128,
            vram_mb: 8,
        };
        st.machines.push(Machine::new(record.clone(), false));
        st.record(format!("create:{name}"));
        Ok(record)
    }

    async fn save_settings(&self, machine: Uuid) -> EndpointResult<()> {
        self.lock().machine(machine).map(|_| ())
    }

    async fn register_machine(&self, machine: Uuid) -> EndpointResult<()> {
        let mut st = self.lock();
        let name = st.machine(machine)?.record.name.clone();
        if st.registered(&name).is_some() {
            return Err(EndpointError::InvalidState(format!(
                "a machine named '{name}' is already registered"
            )));
        }
        st.machine_mut(machine)?.registered = true;
        st.record(format!("register:{name}"));
        Ok(())
    }

    async fn unregister_machine(&self, machine: Uuid) -> EndpointResult<Vec<Uuid>> {
        let mut st = self.lock();
        let target = st.machine(machine)?;
        if !target.registered {
            return Err(EndpointError::NotFound(format!("machine {machine} is not registered")));
        }
        if target.record.state.is_active() {
            return Err(EndpointError::InvalidState(format!(
                "machine '{}' is {}",
                target.record.name, target.record.state
            )));
        }
        if st.locks.values().any(|(id, _)| *id == machine) {
            return Err(EndpointError::Locked(target.record.name.clone()));
        }
        let name = target.record.name.clone();
        st.machine_mut(machine)?.registered = false;
        let owned = st
            .media
            .values()
            .filter(|m| m.owner() == Some(machine))
            .map(|m| m.id)
            .collect();
        st.record(format!("unregister:{name}"));
        Ok(owned)
    }

    async fn delete_config(
        &self,
        machine: Uuid,
        media: &[Uuid],
    ) -> EndpointResult<Box<dyn ProgressHandle>> {
        let mut st = self.lock();
        let target = st.machine(machine)?;
        if target.registered {
            return Err(EndpointError::InvalidState(format!(
                "machine '{}' is still registered",
                target.record.name
            )));
        }
        let doomed: HashSet<Uuid> = media.iter().copied().collect();
        for id in media {
            let medium = st
                .media
                .get(id)
                .ok_or_else(|| EndpointError::NotFound(format!("medium {id}")))?;
            if let Some(child) = medium.children.iter().find(|c| !doomed.contains(*c)) {
                return Err(EndpointError::InvalidState(format!(
                    "medium {id} still has child {child}"
                )));
            }
        }
        for id in media {
            if let Some(medium) = st.media.remove(id) {
                if let Some(parent) = medium.parent.and_then(|p| st.media.get_mut(&p)) {
                    parent.children.retain(|c| c != id);
                }
            }
        }
        let name = st.name_of(machine);
        st.machines.retain(|m| m.record.id != machine);
        st.locks.retain(|_, (id, _)| *id != machine);
        st.record(format!("delete:{name}"));
        Ok(st.progress())
    }

    async fn lock_machine(&self, machine: Uuid, lock: LockType) -> EndpointResult<()> {
        let mut st = self.lock();
        let name = st.machine(machine)?.record.name.clone();
        if st.locks.contains_key(&self.id) {
            return Err(EndpointError::InvalidState("session is already locked".into()));
        }
        let contended = st
            .locks
            .values()
            .any(|(id, held)| *id == machine && (lock == LockType::Write || *held == LockType::Write));
        if contended {
            return Err(EndpointError::Locked(name));
        }
        st.locks.insert(self.id, (machine, lock));
        st.unlocking.remove(&self.id);
        Ok(())
    }

    async fn unlock_machine(&self) -> EndpointResult<()> {
        let mut st = self.lock();
        if st.locks.remove(&self.id).is_none() {
            return Err(EndpointError::InvalidState("session is not locked".into()));
        }
        let lag = st.unlock_lag;
        if lag > 0 {
            st.unlocking.insert(self.id, lag);
        }
        Ok(())
    }

    async fn session_state(&self) -> EndpointResult<SessionState> {
        let mut st = self.lock();
        if st.locks.contains_key(&self.id) {
            return Ok(SessionState::Locked);
        }
        match st.unlocking.get_mut(&self.id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Ok(SessionState::Unlocking)
            }
            _ => Ok(SessionState::Unlocked),
        }
    }

    async fn launch(
        &self,
        machine: Uuid,
        front_end: &str,
    ) -> EndpointResult<Box<dyn ProgressHandle>> {
        let mut st = self.lock();
        let settle = st.settle_reads;
        let target = st.machine_mut(machine)?;
        if matches!(
            target.record.state,
            MachineState::Running | MachineState::Paused | MachineState::Starting
        ) {
            return Err(EndpointError::InvalidState(format!(
                "machine '{}' is {}",
                target.record.name, target.record.state
            )));
        }
        target.record.state = MachineState::Starting;
        target.settle = Some((MachineState::Running, settle));
        let name = target.record.name.clone();
        st.launches += 1;
        st.record(format!("launch:{name}:{front_end}"));
        Ok(st.progress())
    }

    async fn power_down(&self) -> EndpointResult<Box<dyn ProgressHandle>> {
        let mut st = self.lock();
        let (machine, _) = st.held_lock(self.id)?;
        let settle = st.settle_reads;
        let target = st.machine_mut(machine)?;
        if !target.record.state.is_active() {
            return Err(EndpointError::InvalidState(format!(
                "machine '{}' is {}",
                target.record.name, target.record.state
            )));
        }
        target.record.state = MachineState::Stopping;
        target.settle = Some((MachineState::PoweredOff, settle));
        let name = target.record.name.clone();
        st.power_downs += 1;
        st.record(format!("power_down:{name}"));
        Ok(st.progress())
    }

    async fn attached_medium(
        &self,
        machine: Uuid,
        slot: &DiskSlot,
    ) -> EndpointResult<Option<MediumRecord>> {
        let st = self.lock();
        let target = st.machine(machine)?;
        if slot.controller != "SATA" || slot.port != 0 || slot.device != 0 {
            return Ok(None);
        }
        Ok(target.disk.and_then(|d| st.media.get(&d).cloned()))
    }

    async fn medium(&self, id: Uuid) -> EndpointResult<MediumRecord> {
        self.lock()
            .media
            .get(&id)
            .cloned()
            .ok_or_else(|| EndpointError::NotFound(format!("medium {id}")))
    }

    async fn take_snapshot(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> EndpointResult<Box<dyn ProgressHandle>> {
        let mut st = self.lock();
        let (machine, _) = st.held_lock(self.id)?;
        let (frozen, parent) = {
            let target = st.machine(machine)?;
            (target.disk, target.current_snapshot)
        };
        let diff = match frozen.and_then(|d| st.media.get(&d).map(|m| m.logical_size)) {
            Some(logical) => Some(st.new_medium(frozen, machine, logical, 0)),
            None => None,
        };
        let snapshot = Snapshot {
            record: SnapshotRecord {
                id: Uuid::new_v4(),
                name: name.to_string(),
                description: description.map(str::to_string),
                machine_id: machine,
                parent,
                taken_at: Utc::now(),
            },
            frozen,
        };
        let target = st.machine_mut(machine)?;
        if diff.is_some() {
            target.disk = diff;
        }
        target.current_snapshot = Some(snapshot.record.id);
        target.snapshots.push(snapshot);
        let owner = target.record.name.clone();
        st.record(format!("snapshot:{owner}:{name}"));
        Ok(st.progress())
    }

    async fn delete_snapshot(&self, snapshot: Uuid) -> EndpointResult<Box<dyn ProgressHandle>> {
        let mut st = self.lock();
        let (machine, lock) = st.held_lock(self.id)?;
        if lock != LockType::Write {
            return Err(EndpointError::InvalidState(
                "deleting a snapshot needs a write lock".into(),
            ));
        }
        let target = st.machine(machine)?;
        let found = target
            .snapshots
            .iter()
            .find(|s| s.record.id == snapshot)
            .cloned()
            .ok_or_else(|| EndpointError::NotFound(format!("snapshot {snapshot}")))?;
        if let Some(frozen) = found.frozen.and_then(|f| st.media.get(&f)) {
            let dependent = frozen
                .children
                .iter()
                .filter_map(|c| st.media.get(c))
                .any(|c| c.owner() != Some(machine));
            if dependent {
                return Err(EndpointError::InvalidState(format!(
                    "snapshot '{}' has dependent linked clones",
                    found.record.name
                )));
            }
        }
        let target = st.machine_mut(machine)?;
        target.snapshots.retain(|s| s.record.id != snapshot);
        if target.current_snapshot == Some(snapshot) {
            target.current_snapshot = found.record.parent;
        }
        let owner = target.record.name.clone();
        st.record(format!("delete_snapshot:{owner}:{}", found.record.name));
        Ok(st.progress())
    }

    async fn snapshots(&self, machine: Uuid) -> EndpointResult<Vec<SnapshotRecord>> {
        let st = self.lock();
        Ok(st
            .machine(machine)?
            .snapshots
            .iter()
            .map(|s| s.record.clone())
            .collect())
    }

    async fn current_snapshot(&self, machine: Uuid) -> EndpointResult<Option<SnapshotRecord>> {
        let st = self.lock();
        let target = st.machine(machine)?;
        Ok(target.current_snapshot.and_then(|id| {
            target
                .snapshots
                .iter()
                .find(|s| s.record.id == id)
                .map(|s| s.record.clone())
        }))
    }

    async fn clone_to(
        &self,
        source: CloneSource,
        target: Uuid,
        mode: CloneMode,
        options: &[CloneOption],
    ) -> EndpointResult<Box<dyn ProgressHandle>> {
        let mut st = self.lock();
        let origin = st.machine(source.machine())?.clone();
        st.machine(target)?;
        let linked = options.contains(&CloneOption::Link);

        let source_disk = match source {
            CloneSource::Machine(_) => {
                if linked {
                    return Err(EndpointError::InvalidState(
                        "a linked clone must be taken from a snapshot".into(),
                    ));
                }
                origin.disk
            }
            CloneSource::Snapshot { snapshot, .. } => origin
                .snapshots
                .iter()
                .find(|s| s.record.id == snapshot)
                .ok_or_else(|| EndpointError::NotFound(format!("snapshot {snapshot}")))?
                .frozen,
        };

        let disk = match source_disk.and_then(|d| st.media.get(&d).cloned()) {
            Some(medium) if linked => Some(st.new_medium(Some(medium.id), target, medium.logical_size, 0)),
            Some(medium) => Some(st.new_medium(None, target, medium.logical_size, medium.size)),
            None => None,
        };

        let clone = st.machine_mut(target)?;
        clone.disk = disk;
        clone.record.os_type_id = origin.record.os_type_id.clone();
        clone.record.cpu_count = origin.record.cpu_count;
        clone.record.cpu_execution_cap = origin.record.cpu_execution_cap;
        clone.record.monitor_count = origin.record.monitor_count;
        clone.record.memory_mb = origin.record.memory_mb;
        clone.record.vram_mb = origin.record.vram_mb;
        let clone_name = clone.record.name.clone();
        st.record(format!(
            "clone:{}:{mode:?}{}:{clone_name}",
            origin.record.name,
            if linked { "+Link" } else { "" }
        ));
        Ok(st.progress())
    }

    async fn nat_redirects(&self, machine: Uuid, slot: u32) -> EndpointResult<Vec<String>> {
        let st = self.lock();
        Ok(st
            .machine(machine)?
            .redirects
            .get(&slot)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_nat_redirect(
        &self,
        machine: Uuid,
        slot: u32,
        redirect: &NatRedirect,
    ) -> EndpointResult<()> {
        let mut st = self.lock();
        let rules = st.machine_mut(machine)?.redirects.entry(slot).or_default();
        let prefix = format!("{},", redirect.name);
        if rules.iter().any(|r| r.starts_with(&prefix)) {
            return Err(EndpointError::InvalidState(format!(
                "redirect '{}' already exists",
                redirect.name
            )));
        }
        rules.push(redirect.encode());
        Ok(())
    }

    async fn remove_nat_redirect(
        &self,
        machine: Uuid,
        slot: u32,
        name: &str,
    ) -> EndpointResult<()> {
        let mut st = self.lock();
        let rules = st.machine_mut(machine)?.redirects.entry(slot).or_default();
        let prefix = format!("{name},");
        let before = rules.len();
        rules.retain(|r| !r.starts_with(&prefix));
        if rules.len() == before {
            return Err(EndpointError::NotFound(format!("redirect '{name}'")));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut st = self.lock();
        st.locks.remove(&self.id);
        st.unlocking.remove(&self.id);
        st.open_sessions = st.open_sessions.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(hv: &SimulatedHypervisor) -> Box<dyn HypervisorSession> {
        hv.connect("http://sim:18083", "u", "p").await.unwrap()
    }

    #[tokio::test]
    async fn failing_connects_count_down() {
        let hv = SimulatedHypervisor::new();
        hv.fail_connects(2);
        assert!(hv.connect("http://sim", "u", "p").await.is_err());
        assert!(hv.connect("http://sim", "u", "p").await.is_err());
        let s = hv.connect("http://sim", "u", "p").await.unwrap();
        assert_eq!(hv.connect_attempts(), 3);
        assert_eq!(hv.open_sessions(), 1);
        s.close().await;
        s.close().await;
        assert_eq!(hv.open_sessions(), 0);
    }

    #[tokio::test]
    async fn snapshot_freezes_disk_and_linked_clone_hangs_off_it() {
        let hv = SimulatedHypervisor::new();
        let base = hv.add_machine(MachineSpec::new("Base"));
        let original_disk = hv.disk_of(base).unwrap().id;
        let s = session(&hv).await;

        s.lock_machine(base, LockType::Shared).await.unwrap();
        s.take_snapshot("snap", None).await.unwrap();
        s.unlock_machine().await.unwrap();

        let current = hv.disk_of(base).unwrap();
        assert_eq!(current.parent, Some(original_disk));

        let snap = s.current_snapshot(base).await.unwrap().unwrap();
        let clone = s.create_machine("Base_LinkClone1", "Ubuntu_64").await.unwrap();
        s.clone_to(
            CloneSource::Snapshot { machine: base, snapshot: snap.id },
            clone.id,
            CloneMode::MachineState,
            &[CloneOption::Link],
        )
        .await
        .unwrap();
        s.register_machine(clone.id).await.unwrap();

        let linked = hv.disk_of(clone.id).unwrap();
        assert_eq!(linked.parent, Some(original_disk));
        assert_eq!(linked.owner(), Some(clone.id));

        // The snapshot cannot go while the clone depends on it.
        s.lock_machine(base, LockType::Write).await.unwrap();
        assert!(s.delete_snapshot(snap.id).await.is_err());
        s.close().await;
        assert_eq!(hv.held_locks(), 0);
    }

    #[tokio::test]
    async fn delete_config_refuses_media_with_foreign_children() {
        let hv = SimulatedHypervisor::new();
        let base = hv.add_machine(MachineSpec::new("Base"));
        let s = session(&hv).await;
        s.lock_machine(base, LockType::Shared).await.unwrap();
        s.take_snapshot("snap", None).await.unwrap();
        s.unlock_machine().await.unwrap();
        let snap = s.current_snapshot(base).await.unwrap().unwrap();
        let clone = s.create_machine("Clone", "Ubuntu_64").await.unwrap();
        s.clone_to(
            CloneSource::Snapshot { machine: base, snapshot: snap.id },
            clone.id,
            CloneMode::MachineState,
            &[CloneOption::Link],
        )
        .await
        .unwrap();
        s.register_machine(clone.id).await.unwrap();

        let media = s.unregister_machine(base).await.unwrap();
        assert_eq!(media.len(), 2);
        assert!(s.delete_config(base, &media).await.is_err());
    }

    #[tokio::test]
    async fn state_settles_after_configured_reads() {
        let hv = SimulatedHypervisor::new();
        hv.set_settle_reads(2);
        let vm = hv.add_machine(MachineSpec::new("vm"));
        let s = session(&hv).await;
        s.launch(vm, "headless").await.unwrap();
        assert_eq!(s.machine_state(vm).await.unwrap(), MachineState::Starting);
        assert_eq!(s.machine_state(vm).await.unwrap(), MachineState::Starting);
        assert_eq!(s.machine_state(vm).await.unwrap(), MachineState::Running);
        assert_eq!(hv.journal(), vec!["launch:vm:headless".to_string()]);
    }

    #[tokio::test]
    async fn network_routes_by_url() {
        let net = SimNetwork::new();
        net.add_host("http://a:18083", SimulatedHypervisor::new());
        assert!(net.connect("http://a:18083", "u", "p").await.is_ok());
        assert!(matches!(
            net.connect("http://b:18083", "u", "p").await,
            Err(EndpointError::Unreachable(_))
        ));
    }
}
