//! Multi-criterion guest search across every connected host.
//!
//! Criteria are applied one after another in an effective order, each step
//! narrowing the previous step's result.  In precise mode a step that
//! matches nothing ends the search with an empty result; in tolerant mode
//! such a step is skipped, and magnitudes (RAM, VRAM, disk sizes) match a
//! value `v` when `criterion <= v <= criterion + v / 100`.

use futures::future::join_all;
use log::{debug, warn};

use crate::connection::ConnectionManager;
use crate::error::{VboxError, VboxResult};
use crate::inventory::InventoryManager;
use crate::types::{Guest, SearchCriteria, SearchCriterion, SearchMode};

/// Caller order, deduplicated, then the remaining default criteria, keeping
/// only criteria whose field is set.
pub fn effective_order(requested: &[SearchCriterion], criteria: &SearchCriteria) -> Vec<SearchCriterion> {
    let mut order: Vec<SearchCriterion> = Vec::with_capacity(SearchCriterion::DEFAULT_ORDER.len());
    for criterion in requested.iter().chain(SearchCriterion::DEFAULT_ORDER.iter()) {
        if !order.contains(criterion) {
            order.push(*criterion);
        }
    }
    order.retain(|c| criteria.is_set(*c));
    order
}

fn within(wanted: u64, value: u64, mode: SearchMode) -> bool {
    match mode {
        SearchMode::Precise => value == wanted,
        SearchMode::Tolerant => wanted <= value && value <= wanted.saturating_add(value / 100),
    }
}

fn same_text(wanted: &Option<String>, value: &str) -> bool {
    wanted.as_deref().is_some_and(|w| w == value)
}

/// Whether `guest` satisfies one criterion.  Unset criteria never match.
pub fn matches(guest: &Guest, criteria: &SearchCriteria, criterion: SearchCriterion, mode: SearchMode) -> bool {
    use SearchCriterion::*;
    let (wanted, value) = match criterion {
        Id => return criteria.id == Some(guest.id),
        Name => return same_text(&criteria.name, &guest.name),
        OsType => return same_text(&criteria.os_type, &guest.os_type),
        OsIdentifier => return same_text(&criteria.os_identifier, &guest.os_identifier),
        CpuCount => (criteria.cpu_count, guest.cpu_count),
        CpuExecCap => (criteria.cpu_execution_cap, guest.cpu_execution_cap),
        MonitorCount => (criteria.monitor_count, guest.monitor_count),
        Ram => (criteria.ram_size, guest.ram_size),
        Vram => (criteria.vram_size, guest.vram_size),
        HddFreeSpace => (criteria.disk_free, guest.disk_free),
        HddTotalSize => (criteria.disk_total, guest.disk_total),
    };
    let mode = if criterion.is_magnitude() { mode } else { SearchMode::Precise };
    wanted.is_some_and(|w| within(w, value, mode))
}

/// Sequential refinement of `guests`.  Returns an empty list when no step
/// matched anything.
pub fn filter_guests(
    guests: Vec<Guest>,
    criteria: &SearchCriteria,
    mode: SearchMode,
    order: &[SearchCriterion],
) -> Vec<Guest> {
    let mut current = guests;
    let mut matched_any = false;

    for &criterion in order {
        let step: Vec<Guest> = current
            .iter()
            .filter(|g| matches(g, criteria, criterion, mode))
            .cloned()
            .collect();
        debug!("{criterion:?}: {} of {} guest(s) match", step.len(), current.len());

        if step.is_empty() {
            match mode {
                SearchMode::Precise => return Vec::new(),
                SearchMode::Tolerant => continue,
            }
        }
        matched_any = true;
        current = step;
    }

    if matched_any { current } else { Vec::new() }
}

pub struct SearchEngine<'a> {
    connections: &'a ConnectionManager,
}

impl<'a> SearchEngine<'a> {
    pub fn new(connections: &'a ConnectionManager) -> Self {
        Self { connections }
    }

    /// Searches the guests of every connected host, whose inventories are
    /// read concurrently.  A host whose inventory cannot be read is skipped.
    pub async fn search(
        &self,
        criteria: &SearchCriteria,
        mode: SearchMode,
        order: &[SearchCriterion],
    ) -> VboxResult<Vec<Guest>> {
        let hosts = self.connections.registry().list();
        if hosts.is_empty() {
            return Err(VboxError::connection("Cannot search: no host is connected"));
        }
        if criteria.is_empty() {
            return Err(VboxError::invalid_argument("Search criteria are all unset"));
        }

        let inventory = InventoryManager::new(self.connections);
        let listings = join_all(hosts.iter().map(|host| inventory.list_guests(host))).await;
        let mut guests = Vec::new();
        for (host, listing) in hosts.iter().zip(listings) {
            match listing {
                Ok(found) => guests.extend(found),
                Err(e) => warn!("Skipping {host} in search: {e}"),
            }
        }

        let order = effective_order(order, criteria);
        debug!("Searching {} guest(s) on {} host(s) by {order:?} ({mode:?})", guests.len(), hosts.len());
        Ok(filter_guests(guests, criteria, mode, &order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::error::VboxErrorKind;
    use crate::types::Host;
    use std::sync::Arc;
    use uuid::Uuid;
    use vboxmgr_endpoint::sim::{MachineSpec, SimNetwork, SimulatedHypervisor};
    use SearchCriterion::*;

    fn host() -> Host {
        Host::new("10.0.0.5", 18083, "admin", "secret").unwrap()
    }

    fn guest(name: &str, ram: u64) -> Guest {
        let mut g = Guest::reference(Uuid::new_v4(), name, host());
        g.ram_size = ram;
        g.cpu_count = 2;
        g.os_type = "Linux".into();
        g
    }

    fn names(guests: &[Guest]) -> Vec<&str> {
        guests.iter().map(|g| g.name.as_str()).collect()
    }

    #[test]
    fn effective_order_dedupes_and_appends_defaults() {
        let criteria = SearchCriteria {
            name: Some("web".into()),
            ram_size: Some(1024),
            cpu_count: Some(2),
            ..Default::default()
        };
        assert_eq!(effective_order(&[Ram, Ram, Vram], &criteria), vec![Ram, Name, CpuCount]);
        assert_eq!(effective_order(&[], &criteria), vec![Name, CpuCount, Ram]);
    }

    #[test]
    fn ram_window_is_asymmetric() {
        let guests = vec![guest("a", 4096), guest("b", 4100), guest("c", 5000)];
        let criteria = SearchCriteria { ram_size: Some(4096), ..Default::default() };
        let order = effective_order(&[], &criteria);

        let precise = filter_guests(guests.clone(), &criteria, SearchMode::Precise, &order);
        assert_eq!(names(&precise), vec!["a"]);

        let tolerant = filter_guests(guests, &criteria, SearchMode::Tolerant, &order);
        assert_eq!(names(&tolerant), vec!["a", "b"]);

        assert!(!within(4096, 4000, SearchMode::Tolerant));
        assert!(within(100, 101, SearchMode::Tolerant));
        assert!(!within(100, 102, SearchMode::Tolerant));
    }

    #[test]
    fn identity_fields_are_exact_in_tolerant_mode() {
        let mut wide = guest("wide", 1024);
        wide.cpu_count = 101;
        let criteria = SearchCriteria { cpu_count: Some(100), ..Default::default() };
        let found = filter_guests(vec![wide], &criteria, SearchMode::Tolerant, &[CpuCount]);
        assert!(found.is_empty());
    }

    #[test]
    fn precise_stops_at_first_empty_step() {
        let guests = vec![guest("a", 1024), guest("b", 2048)];
        let criteria = SearchCriteria {
            os_type: Some("Windows".into()),
            ram_size: Some(1024),
            ..Default::default()
        };
        let order = effective_order(&[], &criteria);
        assert!(filter_guests(guests, &criteria, SearchMode::Precise, &order).is_empty());
    }

    #[test]
    fn tolerant_skips_empty_steps() {
        let guests = vec![guest("a", 1024), guest("b", 2048)];
        let criteria = SearchCriteria {
            os_type: Some("Windows".into()),
            ram_size: Some(2048),
            ..Default::default()
        };
        let order = effective_order(&[], &criteria);
        let found = filter_guests(guests, &criteria, SearchMode::Tolerant, &order);
        assert_eq!(names(&found), vec!["b"]);
    }

    #[test]
    fn nothing_matching_anywhere_is_empty() {
        let criteria = SearchCriteria {
            name: Some("ghost".into()),
            ..Default::default()
        };
        let found = filter_guests(vec![guest("a", 1)], &criteria, SearchMode::Tolerant, &[Name]);
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn search_requires_hosts_and_criteria() {
        let sim = SimulatedHypervisor::new();
        let mgr = ConnectionManager::new(Arc::new(sim.clone()), ManagerConfig::default());
        let engine = SearchEngine::new(&mgr);
        let criteria = SearchCriteria { ram_size: Some(1024), ..Default::default() };

        let err = engine.search(&criteria, SearchMode::Precise, &[]).await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::ConnectionFailure);

        mgr.connect(&host()).await.unwrap();
        let blank = SearchCriteria { name: Some(" ".into()), ..Default::default() };
        let err = engine.search(&blank, SearchMode::Precise, &[]).await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn search_spans_every_connected_host() {
        let east = SimulatedHypervisor::new();
        east.add_machine(MachineSpec::new("east-web").memory(4096));
        east.add_machine(MachineSpec::new("east-db").memory(8192));
        let west = SimulatedHypervisor::new();
        west.add_machine(MachineSpec::new("west-web").memory(4100));
        let net = SimNetwork::new();
        net.add_host("http://east:18083", east);
        net.add_host("http://west:18083", west);

        let mgr = ConnectionManager::new(Arc::new(net), ManagerConfig::default());
        mgr.connect(&Host::new("east", 18083, "u", "p").unwrap()).await.unwrap();
        mgr.connect(&Host::new("west", 18083, "u", "p").unwrap()).await.unwrap();

        let criteria = SearchCriteria {
            ram_size: Some(4096),
            os_type: Some("Linux".into()),
            ..Default::default()
        };
        let found = SearchEngine::new(&mgr)
            .search(&criteria, SearchMode::Tolerant, &[Ram])
            .await
            .unwrap();

        assert_eq!(names(&found), vec!["east-web", "west-web"]);
        assert_eq!(found[1].host.address(), "west");
    }
}
