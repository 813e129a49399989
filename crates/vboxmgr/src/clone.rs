//! Full and linked clones, and guest removal with linked-clone bookkeeping.
//!
//! A linked clone is taken from a fresh snapshot of its original, named
//! `Linked Base For {original} and {clone}`.  Removing a guest first removes
//! every machine whose disk hangs below the guest's own disk chain, deepest
//! first.  For a linked clone the base snapshot is deleted last, once
//! nothing depends on it.

use log::{debug, info, warn};
use uuid::Uuid;

use vboxmgr_endpoint::{CloneSource, HypervisorSession, LockType, MachineRecord, MachineState};

use crate::config::CloneStatePolicy;
use crate::connection::{release_lock, ConnectionManager};
use crate::error::{VboxError, VboxResult};
use crate::inventory::{describe, require_accessible, resolve};
use crate::lineage::MediumGraph;
use crate::types::{CloneType, Guest, LINKED_CLONE_SUFFIX};

/// Name of the snapshot a linked clone is taken from.
pub fn link_snapshot_name(original: &str, clone: &str) -> String {
    format!("Linked Base For {original} and {clone}")
}

fn is_link_snapshot_for(snapshot_name: &str, clone: &str) -> bool {
    snapshot_name.starts_with("Linked Base For ") && snapshot_name.ends_with(&format!(" and {clone}"))
}

pub struct CloneManager<'a> {
    connections: &'a ConnectionManager,
}

impl<'a> CloneManager<'a> {
    pub fn new(connections: &'a ConnectionManager) -> Self {
        Self { connections }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Creation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Clones `guest` and returns the registered clone.
    pub async fn create_clone(&self, guest: &Guest, clone_type: CloneType) -> VboxResult<Guest> {
        guest.check()?;
        self.connections.require_connected(&guest.host, "clone a guest")?;
        info!("Cloning {guest} ({clone_type:?})");

        let session = self.connections.open(&guest.host).await?;
        let result = self.clone_with(&*session, guest, clone_type).await;
        session.close().await;

        if let Ok(clone) = &result {
            info!("Created clone '{}' of {guest}", clone.name);
        }
        result
    }

    async fn clone_with(
        &self,
        session: &dyn HypervisorSession,
        guest: &Guest,
        clone_type: CloneType,
    ) -> VboxResult<Guest> {
        let machine = resolve(session, guest).await?;
        require_accessible(&machine)?;
        self.check_clone_state(&machine)?;

        let name = next_clone_name(session, &machine.name, clone_type).await?;
        let source = if clone_type.is_linked() {
            self.take_link_snapshot(session, &machine, &name).await?
        } else {
            CloneSource::Machine(machine.id)
        };

        let target = session.create_machine(&name, &machine.os_type_id).await?;
        let progress = session
            .clone_to(source, target.id, clone_type.mode(), &clone_type.options())
            .await?;
        self.connections
            .progress_waiter()
            .progress(&format!("Clone of '{}' into '{name}'", machine.name), progress.as_ref())
            .await?;
        session.save_settings(target.id).await?;
        session.register_machine(target.id).await?;

        let record = session.find_machine(&target.id.to_string()).await?;
        describe(session, &record, &guest.host, self.connections.config()).await
    }

    fn check_clone_state(&self, machine: &MachineRecord) -> VboxResult<()> {
        match self.connections.config().clone_state_policy {
            CloneStatePolicy::Disabled => Err(VboxError::unexpected_state(format!(
                "Cloning is disabled; '{}' cannot be cloned",
                machine.name
            ))),
            CloneStatePolicy::AllowListed => match machine.state {
                MachineState::PoweredOff
                | MachineState::Saved
                | MachineState::Running
                | MachineState::Paused => Ok(()),
                other => Err(VboxError::unexpected_state(format!(
                    "'{}' cannot be cloned while {other}",
                    machine.name
                ))),
            },
        }
    }

    /// Snapshots the original under a shared lock and returns the
    /// snapshot's view of it as the clone source.
    async fn take_link_snapshot(
        &self,
        session: &dyn HypervisorSession,
        machine: &MachineRecord,
        clone_name: &str,
    ) -> VboxResult<CloneSource> {
        let snapshot_name = link_snapshot_name(&machine.name, clone_name);
        debug!("Taking snapshot '{snapshot_name}'");

        session
            .lock_machine(machine.id, LockType::Shared)
            .await
            .map_err(|e| VboxError::state_fault(&format!("Cannot lock '{}'", machine.name), e))?;
        let taken = async {
            let progress = session
                .take_snapshot(&snapshot_name, Some("Base image of a linked clone"))
                .await
                .map_err(|e| VboxError::state_fault(&format!("Cannot snapshot '{}'", machine.name), e))?;
            self.connections
                .progress_waiter()
                .progress(&format!("Snapshot '{snapshot_name}'"), progress.as_ref())
                .await
        }
        .await;
        release_lock(session, "snapshot").await;
        taken?;

        let snapshot = session
            .current_snapshot(machine.id)
            .await?
            .ok_or_else(|| VboxError::endpoint(format!("'{}' has no current snapshot", machine.name)))?;
        Ok(CloneSource::Snapshot {
            machine: machine.id,
            snapshot: snapshot.id,
        })
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Removal
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Unregisters `guest` and deletes its files, together with every
    /// linked clone that depends on its disks.
    pub async fn remove_guest(&self, guest: &Guest) -> VboxResult<()> {
        guest.check()?;
        self.connections.require_connected(&guest.host, "remove a guest")?;
        info!("Removing {guest}");

        let session = self.connections.open(&guest.host).await?;
        let result = self.remove_with(&*session, guest).await;
        session.close().await;

        if result.is_ok() {
            info!("Removed {guest}");
        }
        result
    }

    async fn remove_with(&self, session: &dyn HypervisorSession, guest: &Guest) -> VboxResult<()> {
        let machine = resolve(session, guest).await?;

        if !machine.accessible {
            warn!("'{}' is inaccessible; unregistering only", machine.name);
            if let Err(e) = session.unregister_machine(machine.id).await {
                debug!("Ignoring unregister failure for '{}': {e}", machine.name);
            }
            return Ok(());
        }
        if machine.state != MachineState::PoweredOff {
            return Err(VboxError::unexpected_state(format!(
                "{guest} must be powered off to be removed, it is {}",
                machine.state
            )));
        }

        let slot = self.connections.config().disk_slot();
        let Some(disk) = session.attached_medium(machine.id, &slot).await? else {
            return self.unregister_and_delete(session, &machine).await;
        };

        let mut graph = MediumGraph::ancestry(session, disk.id).await?;
        let base_owner = graph.owner(graph.base(disk.id));
        let linked = machine.name.contains(LINKED_CLONE_SUFFIX)
            || base_owner.is_some_and(|owner| owner != machine.id);
        let sweep_root = graph.climb_while_owned(disk.id, machine.id);
        let base_medium = graph.parent(sweep_root);

        graph.load_subtree(session, sweep_root).await?;
        for dependent in graph.dependents(sweep_root, machine.id) {
            match session.find_machine(&dependent.to_string()).await {
                Ok(record) => {
                    info!("Removing '{}', which depends on '{}'", record.name, machine.name);
                    self.unregister_and_delete(session, &record).await?;
                }
                Err(e) if e.is_not_found() => {
                    debug!("Dependent machine {dependent} is already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.unregister_and_delete(session, &machine).await?;

        if linked {
            let base_machine = base_medium.and_then(|m| graph.owner(m));
            match base_machine {
                Some(owner) => self.delete_link_snapshot(session, owner, &machine.name).await?,
                None => debug!("'{}' has no base image to clean up", machine.name),
            }
        }
        Ok(())
    }

    async fn unregister_and_delete(&self, session: &dyn HypervisorSession, machine: &MachineRecord) -> VboxResult<()> {
        let media = session
            .unregister_machine(machine.id)
            .await
            .map_err(|e| VboxError::state_fault(&format!("Cannot unregister '{}'", machine.name), e))?;
        let progress = session.delete_config(machine.id, &media).await?;
        self.connections
            .progress_waiter()
            .progress(&format!("Deletion of '{}'", machine.name), progress.as_ref())
            .await?;
        debug!("Deleted '{}' and {} medium(s)", machine.name, media.len());
        Ok(())
    }

    /// Deletes, on the machine owning the base image, the snapshot a linked
    /// clone named `clone_name` was taken from.
    async fn delete_link_snapshot(&self, session: &dyn HypervisorSession, owner: Uuid, clone_name: &str) -> VboxResult<()> {
        let base = match session.find_machine(&owner.to_string()).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!("Base machine {owner} of '{clone_name}' is gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let tagged: Vec<_> = session
            .snapshots(base.id)
            .await?
            .into_iter()
            .filter(|s| is_link_snapshot_for(&s.name, clone_name))
            .collect();
        if tagged.is_empty() {
            debug!("No base snapshot of '{}' is tagged for '{clone_name}'", base.name);
            return Ok(());
        }

        session
            .lock_machine(base.id, LockType::Write)
            .await
            .map_err(|e| VboxError::state_fault(&format!("Cannot lock '{}'", base.name), e))?;
        let deleted = async {
            for snapshot in &tagged {
                info!("Deleting snapshot '{}' of '{}'", snapshot.name, base.name);
                let progress = session
                    .delete_snapshot(snapshot.id)
                    .await
                    .map_err(|e| VboxError::state_fault(&format!("Cannot delete snapshot '{}'", snapshot.name), e))?;
                self.connections
                    .progress_waiter()
                    .progress(&format!("Deletion of snapshot '{}'", snapshot.name), progress.as_ref())
                    .await?;
            }
            Ok::<_, VboxError>(())
        }
        .await;
        release_lock(session, "snapshot deletion").await;
        deleted
    }
}

/// First free `{original}{suffix}{n}` name, counting from 1.
async fn next_clone_name(session: &dyn HypervisorSession, original: &str, clone_type: CloneType) -> VboxResult<String> {
    let mut n: u32 = 1;
    loop {
        let candidate = format!("{original}{}{n}", clone_type.suffix());
        match session.find_machine(&candidate).await {
            Err(e) if e.is_not_found() => return Ok(candidate),
            Err(e) => return Err(e.into()),
            Ok(_) => {
                n = n
                    .checked_add(1)
                    .ok_or_else(|| VboxError::unexpected_state(format!("No free clone name for '{original}'")))?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::error::VboxErrorKind;
    use crate::inventory::InventoryManager;
    use crate::types::Host;
    use std::sync::Arc;
    use vboxmgr_endpoint::sim::{MachineSpec, SimulatedHypervisor};

    fn host() -> Host {
        Host::new("10.0.0.5", 18083, "admin", "secret").unwrap()
    }

    async fn connected(sim: &SimulatedHypervisor, config: ManagerConfig) -> ConnectionManager {
        let mgr = ConnectionManager::new(Arc::new(sim.clone()), config);
        mgr.connect(&host()).await.unwrap();
        mgr
    }

    async fn guest(mgr: &ConnectionManager, name: &str) -> Guest {
        InventoryManager::new(mgr).find_by_name(&host(), name).await.unwrap()
    }

    #[test]
    fn link_snapshot_tag_matches_exact_clone() {
        let name = link_snapshot_name("Base", "Base_LinkClone1");
        assert_eq!(name, "Linked Base For Base and Base_LinkClone1");
        assert!(is_link_snapshot_for(&name, "Base_LinkClone1"));
        assert!(!is_link_snapshot_for(&link_snapshot_name("Base", "Base_LinkClone10"), "Base_LinkClone1"));
        assert!(!is_link_snapshot_for("nightly and Base_LinkClone1", "Base_LinkClone1"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_clones_get_consecutive_names() {
        let sim = SimulatedHypervisor::new();
        sim.add_machine(MachineSpec::new("Base").memory(2048).cpus(2));
        let mgr = connected(&sim, ManagerConfig::default()).await;
        let base = guest(&mgr, "Base").await;
        let clones = CloneManager::new(&mgr);

        let first = clones.create_clone(&base, CloneType::FullFromState).await.unwrap();
        let second = clones.create_clone(&base, CloneType::FullFromAllStates).await.unwrap();

        assert_eq!(first.name, "Base_FullClone1");
        assert_eq!(second.name, "Base_FullClone2");
        assert_eq!(first.ram_size, 2048);
        assert_eq!(first.cpu_count, 2);
        assert_eq!(first.disk_total, base.disk_total);
        assert!(sim.journal().contains(&"clone:Base:AllStates:Base_FullClone2".to_string()));
        assert_eq!(sim.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn name_probe_skips_taken_names() {
        let sim = SimulatedHypervisor::new();
        sim.add_machine(MachineSpec::new("Base"));
        sim.add_machine(MachineSpec::new("Base_FullClone1"));
        let mgr = connected(&sim, ManagerConfig::default()).await;
        let base = guest(&mgr, "Base").await;

        let clone = CloneManager::new(&mgr)
            .create_clone(&base, CloneType::FullFromStateAndChildren)
            .await
            .unwrap();

        assert_eq!(clone.name, "Base_FullClone2");
    }

    #[tokio::test(start_paused = true)]
    async fn linked_clone_shares_snapshot_disk() {
        let sim = SimulatedHypervisor::new();
        let base_id = sim.add_machine(MachineSpec::new("Base"));
        let base_disk = sim.disk_of(base_id).unwrap().id;
        let mgr = connected(&sim, ManagerConfig::default()).await;
        let base = guest(&mgr, "Base").await;

        let clone = CloneManager::new(&mgr).create_clone(&base, CloneType::Linked).await.unwrap();

        assert_eq!(clone.name, "Base_LinkClone1");
        assert_eq!(
            sim.snapshot_names(base_id),
            vec!["Linked Base For Base and Base_LinkClone1".to_string()]
        );
        let clone_disk = sim.disk_of(clone.id).unwrap();
        assert_eq!(clone_disk.parent, Some(base_disk));
        assert_eq!(clone_disk.owner(), Some(clone.id));
        assert!(sim.journal().contains(&"clone:Base:MachineState+Link:Base_LinkClone1".to_string()));
        assert_eq!(sim.held_locks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clone_state_policy_is_enforced() {
        let sim = SimulatedHypervisor::new();
        sim.add_machine(MachineSpec::new("Base").state(MachineState::Running));
        sim.add_machine(MachineSpec::new("Stuck").state(MachineState::Stuck));
        let mgr = connected(&sim, ManagerConfig::default()).await;

        let running = guest(&mgr, "Base").await;
        CloneManager::new(&mgr).create_clone(&running, CloneType::FullFromState).await.unwrap();

        let stuck = guest(&mgr, "Stuck").await;
        let err = CloneManager::new(&mgr)
            .create_clone(&stuck, CloneType::FullFromState)
            .await
            .unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::UnexpectedState);

        let config = ManagerConfig { clone_state_policy: CloneStatePolicy::Disabled, ..Default::default() };
        let locked_down = connected(&sim, config).await;
        let err = CloneManager::new(&locked_down)
            .create_clone(&running, CloneType::Linked)
            .await
            .unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::UnexpectedState);
        assert!(sim.snapshot_names(running.id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_linked_clone_removes_descendants_first() {
        let sim = SimulatedHypervisor::new();
        let base_id = sim.add_machine(MachineSpec::new("Base"));
        let mgr = connected(&sim, ManagerConfig::default()).await;
        let clones = CloneManager::new(&mgr);

        let base = guest(&mgr, "Base").await;
        let l1 = clones.create_clone(&base, CloneType::Linked).await.unwrap();
        let l1a = clones.create_clone(&l1, CloneType::Linked).await.unwrap();
        let l1a1 = clones.create_clone(&l1a, CloneType::Linked).await.unwrap();
        let l2 = clones.create_clone(&base, CloneType::Linked).await.unwrap();
        let start = sim.journal().len();

        clones.remove_guest(&l1).await.unwrap();

        let removal: Vec<String> = sim.journal()[start..].to_vec();
        assert_eq!(
            removal,
            vec![
                format!("unregister:{}", l1a1.name),
                format!("delete:{}", l1a1.name),
                format!("unregister:{}", l1a.name),
                format!("delete:{}", l1a.name),
                format!("unregister:{}", l1.name),
                format!("delete:{}", l1.name),
                format!("delete_snapshot:Base:{}", link_snapshot_name("Base", &l1.name)),
            ]
        );
        assert_eq!(sim.machine_names(), vec!["Base".to_string(), l2.name.clone()]);
        assert_eq!(
            sim.snapshot_names(base_id),
            vec![link_snapshot_name("Base", &l2.name)]
        );
        assert_eq!(sim.held_locks(), 0);
        assert_eq!(sim.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn removing_the_base_sweeps_every_clone() {
        let sim = SimulatedHypervisor::new();
        sim.add_machine(MachineSpec::new("Base"));
        let mgr = connected(&sim, ManagerConfig::default()).await;
        let clones = CloneManager::new(&mgr);
        let base = guest(&mgr, "Base").await;
        let l1 = clones.create_clone(&base, CloneType::Linked).await.unwrap();
        clones.create_clone(&l1, CloneType::Linked).await.unwrap();
        clones.create_clone(&base, CloneType::FullFromState).await.unwrap();

        clones.remove_guest(&base).await.unwrap();

        assert_eq!(sim.machine_names(), vec!["Base_FullClone1".to_string()]);
        assert_eq!(sim.medium_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_requires_powered_off() {
        let sim = SimulatedHypervisor::new();
        sim.add_machine(MachineSpec::new("web").state(MachineState::Saved));
        let mgr = connected(&sim, ManagerConfig::default()).await;
        let web = guest(&mgr, "web").await;

        let err = CloneManager::new(&mgr).remove_guest(&web).await.unwrap_err();

        assert_eq!(err.kind, VboxErrorKind::UnexpectedState);
        assert_eq!(sim.machine_names(), vec!["web".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn inaccessible_guest_is_only_unregistered() {
        let sim = SimulatedHypervisor::new();
        let id = sim.add_machine(MachineSpec::new("broken").inaccessible());
        let mgr = connected(&sim, ManagerConfig::default()).await;
        let broken = Guest::reference(id, "broken", host());

        CloneManager::new(&mgr).remove_guest(&broken).await.unwrap();

        assert!(sim.machine_names().is_empty());
        assert_eq!(sim.journal(), vec!["unregister:broken".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn diskless_guest_is_removed_alone() {
        let sim = SimulatedHypervisor::new();
        sim.add_machine(MachineSpec::new("pxe").without_disk());
        sim.add_machine(MachineSpec::new("other"));
        let mgr = connected(&sim, ManagerConfig::default()).await;
        let pxe = guest(&mgr, "pxe").await;

        CloneManager::new(&mgr).remove_guest(&pxe).await.unwrap();

        assert_eq!(sim.machine_names(), vec!["other".to_string()]);
    }
}
