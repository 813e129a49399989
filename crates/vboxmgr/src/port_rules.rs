//! NAT port-forwarding rules on a guest's first network adapter.

use log::{info, warn};

use vboxmgr_endpoint::{EndpointError, HypervisorSession, MachineRecord, NatRedirect};

use crate::connection::ConnectionManager;
use crate::error::{VboxError, VboxResult};
use crate::inventory::resolve;
use crate::types::{Guest, PortRule};

pub struct PortRuleManager<'a> {
    connections: &'a ConnectionManager,
}

impl<'a> PortRuleManager<'a> {
    pub fn new(connections: &'a ConnectionManager) -> Self {
        Self { connections }
    }

    fn slot(&self) -> u32 {
        self.connections.config().nat_adapter_slot
    }

    async fn rules_of(&self, session: &dyn HypervisorSession, machine: &MachineRecord) -> VboxResult<Vec<PortRule>> {
        let raw = session.nat_redirects(machine.id, self.slot()).await?;
        raw.iter()
            .map(|r| NatRedirect::decode(r).map(PortRule::from).map_err(VboxError::from))
            .collect()
    }

    pub async fn list_rules(&self, guest: &Guest) -> VboxResult<Vec<PortRule>> {
        guest.check()?;
        self.connections.require_connected(&guest.host, "list port rules")?;
        let session = self.connections.open(&guest.host).await?;
        let result = async {
            let machine = resolve(&*session, guest).await?;
            self.rules_of(&*session, &machine).await
        }
        .await;
        session.close().await;
        result
    }

    /// Installs `rule` unless its name or host port is already taken.  The
    /// name is stored without surrounding whitespace.
    pub async fn add_rule(&self, guest: &Guest, rule: &PortRule) -> VboxResult<()> {
        guest.check()?;
        let redirect = NatRedirect::try_from(rule)?;
        self.connections.require_connected(&guest.host, "add a port rule")?;

        let session = self.connections.open(&guest.host).await?;
        let result = self.add_with(&*session, guest, &redirect).await;
        session.close().await;

        if result.is_ok() {
            info!("Added port rule '{}' ({}) to {guest}", redirect.name, redirect.encode());
        }
        result
    }

    async fn add_with(&self, session: &dyn HypervisorSession, guest: &Guest, redirect: &NatRedirect) -> VboxResult<()> {
        let machine = resolve(session, guest).await?;
        let existing = self.rules_of(session, &machine).await?;

        if existing.iter().any(|r| r.name == redirect.name) {
            return Err(VboxError::port_rule_duplicity(format!(
                "{guest} already has a port rule named '{}'",
                redirect.name
            )));
        }
        let host_port = i32::from(redirect.host_port);
        if let Some(clash) = existing.iter().find(|r| r.host_port == host_port) {
            return Err(VboxError::port_rule_duplicity(format!(
                "Host port {host_port} of {guest} is already used by rule '{}'",
                clash.name
            )));
        }

        session.add_nat_redirect(machine.id, self.slot(), redirect).await?;
        Ok(())
    }

    /// Deletes the rule named exactly `name`; surrounding whitespace is part
    /// of the name.
    pub async fn delete_rule(&self, guest: &Guest, name: &str) -> VboxResult<()> {
        guest.check()?;
        if name.trim().is_empty() {
            return Err(VboxError::invalid_argument("Port rule name is empty"));
        }
        self.connections.require_connected(&guest.host, "delete a port rule")?;

        let session = self.connections.open(&guest.host).await?;
        let result = async {
            let machine = resolve(&*session, guest).await?;
            self.remove(&*session, &machine, guest, name).await
        }
        .await;
        session.close().await;

        if result.is_ok() {
            info!("Deleted port rule '{name}' from {guest}");
        }
        result
    }

    /// Deletes every rule and returns how many were removed.
    pub async fn delete_all_rules(&self, guest: &Guest) -> VboxResult<usize> {
        guest.check()?;
        self.connections.require_connected(&guest.host, "delete port rules")?;

        let session = self.connections.open(&guest.host).await?;
        let result = async {
            let machine = resolve(&*session, guest).await?;
            let rules = self.rules_of(&*session, &machine).await?;
            for rule in &rules {
                self.remove(&*session, &machine, guest, &rule.name).await?;
            }
            Ok::<_, VboxError>(rules.len())
        }
        .await;
        session.close().await;

        match &result {
            Ok(count) => info!("Deleted {count} port rule(s) from {guest}"),
            Err(e) => warn!("Deleting port rules of {guest} stopped: {e}"),
        }
        result
    }

    async fn remove(&self, session: &dyn HypervisorSession, machine: &MachineRecord, guest: &Guest, name: &str) -> VboxResult<()> {
        session
            .remove_nat_redirect(machine.id, self.slot(), name)
            .await
            .map_err(|e| removal_fault(guest, name, e))
    }
}

/// A missing redirect is an unknown rule; other faults keep their kind.
fn removal_fault(guest: &Guest, name: &str, err: EndpointError) -> VboxError {
    if err.is_not_found() {
        VboxError::unknown_port_rule(format!("{guest} has no port rule '{name}': {err}"))
    } else {
        VboxError::from(err)
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

    async fn setup() -> (SimulatedHypervisor, ConnectionManager, Guest) {
        let sim = SimulatedHypervisor::new();
        sim.add_machine(MachineSpec::new("web"));
        let mgr = ConnectionManager::new(Arc::new(sim.clone()), ManagerConfig::default());
        mgr.connect(&host()).await.unwrap();
        let web = InventoryManager::new(&mgr).find_by_name(&host(), "web").await.unwrap();
        (sim, mgr, web)
    }

    #[tokio::test]
    async fn duplicate_name_or_host_port_is_rejected() {
        let (sim, mgr, web) = setup().await;
        let rules = PortRuleManager::new(&mgr);

        rules.add_rule(&web, &PortRule::tcp("ssh", 2222, 22)).await.unwrap();

        let err = rules.add_rule(&web, &PortRule::tcp("ssh", 3333, 22)).await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::PortRuleDuplicity);
        let err = rules.add_rule(&web, &PortRule::udp("x", 2222, 53)).await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::PortRuleDuplicity);

        assert_eq!(sim.redirects(web.id), vec!["ssh,1,,2222,,22".to_string()]);
        assert_eq!(sim.open_sessions(), 0);
    }

    #[tokio::test]
    async fn malformed_rules_fail_before_any_session() {
        let (sim, mgr, web) = setup().await;
        let rules = PortRuleManager::new(&mgr);
        let attempts = sim.connect_attempts();

        for bad in [
            PortRule::tcp("", 2222, 22),
            PortRule::tcp("ssh", 70_000, 22),
            PortRule::tcp("ssh", 2222, -5),
        ] {
            let err = rules.add_rule(&web, &bad).await.unwrap_err();
            assert_eq!(err.kind, VboxErrorKind::InvalidArgument);
        }
        let err = rules.delete_rule(&web, "  ").await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::InvalidArgument);
        assert_eq!(sim.connect_attempts(), attempts);
    }

    #[tokio::test]
    async fn comma_in_an_address_is_rejected_and_rules_stay_readable() {
        let (sim, mgr, web) = setup().await;
        let rules = PortRuleManager::new(&mgr);

        for bad in [
            PortRule::tcp("bad", 2222, 22).with_host_ip("1.2.3.4,5"),
            PortRule::tcp("bad", 2222, 22).with_guest_ip("10.0.2.15,"),
        ] {
            let err = rules.add_rule(&web, &bad).await.unwrap_err();
            assert_eq!(err.kind, VboxErrorKind::InvalidArgument);
        }
        assert!(sim.redirects(web.id).is_empty());

        rules.add_rule(&web, &PortRule::tcp("ok", 8080, 80)).await.unwrap();
        assert_eq!(rules.list_rules(&web).await.unwrap(), vec![PortRule::tcp("ok", 8080, 80)]);
    }

    #[tokio::test]
    async fn delete_matches_the_exact_name() {
        let (sim, mgr, web) = setup().await;
        let rules = PortRuleManager::new(&mgr);
        rules.add_rule(&web, &PortRule::tcp("ssh", 2222, 22)).await.unwrap();

        let err = rules.delete_rule(&web, " ssh ").await.unwrap_err();

        assert_eq!(err.kind, VboxErrorKind::UnknownPortRule);
        assert_eq!(sim.redirects(web.id), vec!["ssh,1,,2222,,22".to_string()]);
    }

    #[test]
    fn only_a_missing_redirect_is_an_unknown_rule() {
        let web = Guest::reference(uuid::Uuid::new_v4(), "web", host());
        let kind = |e| removal_fault(&web, "ssh", e).kind;

        assert_eq!(kind(EndpointError::NotFound("redirect 'ssh'".into())), VboxErrorKind::UnknownPortRule);
        assert_eq!(kind(EndpointError::Unreachable("down".into())), VboxErrorKind::ConnectionFailure);
        assert_eq!(kind(EndpointError::Locked("web".into())), VboxErrorKind::UnexpectedState);
    }

    #[tokio::test]
    async fn list_decodes_and_delete_removes() {
        let (sim, mgr, web) = setup().await;
        let rules = PortRuleManager::new(&mgr);
        rules
            .add_rule(&web, &PortRule::tcp("http", 8080, 80).with_host_ip("127.0.0.1"))
            .await
            .unwrap();
        rules.add_rule(&web, &PortRule::udp("dns", 5353, 53)).await.unwrap();

        let listed = rules.list_rules(&web).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], PortRule::tcp("http", 8080, 80).with_host_ip("127.0.0.1"));

        rules.delete_rule(&web, "http").await.unwrap();
        assert_eq!(sim.redirects(web.id), vec!["dns,0,,5353,,53".to_string()]);

        let err = rules.delete_rule(&web, "http").await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::UnknownPortRule);
    }

    #[tokio::test]
    async fn delete_all_clears_the_adapter() {
        let (sim, mgr, web) = setup().await;
        let rules = PortRuleManager::new(&mgr);
        for (i, port) in [2222, 8080, 9090].into_iter().enumerate() {
            rules.add_rule(&web, &PortRule::tcp(format!("r{i}"), port, 80)).await.unwrap();
        }

        assert_eq!(rules.delete_all_rules(&web).await.unwrap(), 3);
        assert!(sim.redirects(web.id).is_empty());
        assert_eq!(rules.delete_all_rules(&web).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_redirect_is_reported() {
        let (sim, mgr, web) = setup().await;
        sim.push_raw_redirect(web.id, "garbage");

        let err = PortRuleManager::new(&mgr).list_rules(&web).await.unwrap_err();

        assert_eq!(err.kind, VboxErrorKind::Endpoint);
    }
}
