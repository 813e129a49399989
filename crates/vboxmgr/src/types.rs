//! Shared types for VirtualBox host and guest management.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use vboxmgr_endpoint::{CloneMode, CloneOption, NatProtocol, NatRedirect};

use crate::error::{VboxError, VboxResult};

/// Default port of the VirtualBox web service.
pub const DEFAULT_WEB_SERVICE_PORT: u16 = 18083;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Host
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A remote machine running the management web service.  Two hosts are the
/// same host when address and port match.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    address: String,
    port: u16,
    username: String,
    #[serde(skip_serializing, default)]
    password: String,
}

impl Host {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> VboxResult<Self> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(VboxError::invalid_argument("Host address is empty"));
        }
        Ok(Self {
            address,
            port,
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Web service URL, e.g. `http://10.0.0.5:18083`.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Guest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Snapshot of a guest's identity and hardware as read from its host.
/// Two descriptors name the same guest when id and name match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guest {
    pub id: Uuid,
    pub name: String,
    pub host: Host,
    pub cpu_count: u64,
    pub monitor_count: u64,
    pub cpu_execution_cap: u64,
    /// Logical size of the primary disk, bytes
    pub disk_total: u64,
    /// Logical minus allocated size of the primary disk, bytes
    pub disk_free: u64,
    /// RAM, MB
    pub ram_size: u64,
    /// Video RAM, MB
    pub vram_size: u64,
    /// OS family id, e.g. "Linux"
    pub os_type: String,
    /// OS type id, e.g. "Ubuntu_64"
    pub os_identifier: String,
}

impl Guest {
    /// A descriptor carrying only identity, for addressing a known guest.
    pub fn reference(id: Uuid, name: impl Into<String>, host: Host) -> Self {
        Self {
            id,
            name: name.into(),
            host,
            cpu_count: 0,
            monitor_count: 0,
            cpu_execution_cap: 0,
            disk_total: 0,
            disk_free: 0,
            ram_size: 0,
            vram_size: 0,
            os_type: String::new(),
            os_identifier: String::new(),
        }
    }

    /// Rejects descriptors that cannot address a guest.
    pub fn check(&self) -> VboxResult<()> {
        if self.id.is_nil() {
            return Err(VboxError::invalid_argument("Guest id is nil"));
        }
        if self.name.trim().is_empty() {
            return Err(VboxError::invalid_argument("Guest name is empty"));
        }
        Ok(())
    }
}

impl PartialEq for Guest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name
    }
}

impl Eq for Guest {}

impl Hash for Guest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for Guest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({}) on {}", self.name, self.id, self.host)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const MAX_PORT: i32 = 65_535;

/// NAT port-forwarding rule.  Empty IPs mean "any".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRule {
    pub name: String,
    pub protocol: NatProtocol,
    #[serde(default)]
    pub host_ip: String,
    pub host_port: i32,
    #[serde(default)]
    pub guest_ip: String,
    pub guest_port: i32,
}

impl PortRule {
    pub fn new(name: impl Into<String>, protocol: NatProtocol, host_port: i32, guest_port: i32) -> Self {
        Self {
            name: name.into(),
            protocol,
            host_ip: String::new(),
            host_port,
            guest_ip: String::new(),
            guest_port,
        }
    }

    pub fn tcp(name: impl Into<String>, host_port: i32, guest_port: i32) -> Self {
        Self::new(name, NatProtocol::Tcp, host_port, guest_port)
    }

    pub fn udp(name: impl Into<String>, host_port: i32, guest_port: i32) -> Self {
        Self::new(name, NatProtocol::Udp, host_port, guest_port)
    }

    pub fn with_host_ip(mut self, ip: impl Into<String>) -> Self {
        self.host_ip = ip.into();
        self
    }

    pub fn with_guest_ip(mut self, ip: impl Into<String>) -> Self {
        self.guest_ip = ip.into();
        self
    }

    /// Shape checks that need no remote state.
    pub fn check(&self) -> VboxResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(VboxError::invalid_argument("Port rule name is empty"));
        }
        for (label, field) in [("name", &self.name), ("host IP", &self.host_ip), ("guest IP", &self.guest_ip)] {
            if field.contains(',') {
                return Err(VboxError::invalid_argument(format!(
                    "Port rule {label} '{field}' contains a comma"
                )));
            }
        }
        for (label, port) in [("host", self.host_port), ("guest", self.guest_port)] {
            if !(0..=MAX_PORT).contains(&port) {
                return Err(VboxError::invalid_argument(format!(
                    "Port rule '{}': {label} port {port} is outside 0..={MAX_PORT}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<&PortRule> for NatRedirect {
    type Error = VboxError;

    fn try_from(rule: &PortRule) -> VboxResult<Self> {
        rule.check()?;
        let port = |p: i32| {
            u16::try_from(p).map_err(|_| VboxError::invalid_argument(format!("port {p} out of range")))
        };
        Ok(NatRedirect {
            name: rule.name.trim().to_string(),
            protocol: rule.protocol,
            host_ip: rule.host_ip.clone(),
            host_port: port(rule.host_port)?,
            guest_ip: rule.guest_ip.clone(),
            guest_port: port(rule.guest_port)?,
        })
    }
}

impl From<NatRedirect> for PortRule {
    fn from(r: NatRedirect) -> Self {
        Self {
            name: r.name,
            protocol: r.protocol,
            host_ip: r.host_ip,
            host_port: i32::from(r.host_port),
            guest_ip: r.guest_ip,
            guest_port: i32::from(r.guest_port),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Cloning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const FULL_CLONE_SUFFIX: &str = "_FullClone";
pub const LINKED_CLONE_SUFFIX: &str = "_LinkClone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloneType {
    /// Current state only
    FullFromState,
    /// Current state and the snapshots below it
    FullFromStateAndChildren,
    /// Every state the machine has
    FullFromAllStates,
    /// Copy-on-write child of a fresh snapshot
    Linked,
}

impl CloneType {
    pub fn is_linked(self) -> bool {
        self == Self::Linked
    }

    pub fn suffix(self) -> &'static str {
        if self.is_linked() { LINKED_CLONE_SUFFIX } else { FULL_CLONE_SUFFIX }
    }

    pub fn mode(self) -> CloneMode {
        match self {
            Self::FullFromState | Self::Linked => CloneMode::MachineState,
            Self::FullFromStateAndChildren => CloneMode::MachineAndChildStates,
            Self::FullFromAllStates => CloneMode::AllStates,
        }
    }

    pub fn options(self) -> Vec<CloneOption> {
        if self.is_linked() { vec![CloneOption::Link] } else { Vec::new() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchMode {
    /// Every criterion must match exactly.
    Precise,
    /// Magnitudes match within a window; steps that match nothing are skipped.
    Tolerant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchCriterion {
    Id,
    Name,
    OsType,
    OsIdentifier,
    CpuCount,
    CpuExecCap,
    Ram,
    HddFreeSpace,
    Vram,
    MonitorCount,
    HddTotalSize,
}

impl SearchCriterion {
    pub const DEFAULT_ORDER: [SearchCriterion; 11] = [
        Self::Id,
        Self::Name,
        Self::OsType,
        Self::OsIdentifier,
        Self::CpuCount,
        Self::CpuExecCap,
        Self::Ram,
        Self::HddFreeSpace,
        Self::Vram,
        Self::MonitorCount,
        Self::HddTotalSize,
    ];

    /// Magnitudes get a tolerance window in tolerant mode.
    pub fn is_magnitude(self) -> bool {
        matches!(self, Self::Ram | Self::Vram | Self::HddFreeSpace | Self::HddTotalSize)
    }
}

/// Attribute values to look for.  `None` (or a blank string) leaves the
/// attribute out of the search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchCriteria {
    pub id: Option<Uuid>,
    pub name: Option<String>,
    pub os_type: Option<String>,
    pub os_identifier: Option<String>,
    pub cpu_count: Option<u64>,
    pub cpu_execution_cap: Option<u64>,
    pub ram_size: Option<u64>,
    pub disk_free: Option<u64>,
    pub vram_size: Option<u64>,
    pub monitor_count: Option<u64>,
    pub disk_total: Option<u64>,
}

impl SearchCriteria {
    pub fn is_set(&self, criterion: SearchCriterion) -> bool {
        fn text(value: &Option<String>) -> bool {
            value.as_deref().is_some_and(|s| !s.trim().is_empty())
        }
        match criterion {
            SearchCriterion::Id => self.id.is_some(),
            SearchCriterion::Name => text(&self.name),
            SearchCriterion::OsType => text(&self.os_type),
            SearchCriterion::OsIdentifier => text(&self.os_identifier),
            SearchCriterion::CpuCount => self.cpu_count.is_some(),
            SearchCriterion::CpuExecCap => self.cpu_execution_cap.is_some(),
            SearchCriterion::Ram => self.ram_size.is_some(),
            SearchCriterion::HddFreeSpace => self.disk_free.is_some(),
            SearchCriterion::Vram => self.vram_size.is_some(),
            SearchCriterion::MonitorCount => self.monitor_count.is_some(),
            SearchCriterion::HddTotalSize => self.disk_total.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !SearchCriterion::DEFAULT_ORDER.iter().any(|c| self.is_set(*c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host::new("10.0.0.5", DEFAULT_WEB_SERVICE_PORT, "admin", "s3cret").unwrap()
    }

    #[test]
    fn host_rejects_empty_address() {
        let err = Host::new("  ", 18083, "u", "p").unwrap_err();
        assert_eq!(err.kind, crate::error::VboxErrorKind::InvalidArgument);
    }

    #[test]
    fn host_identity_ignores_credentials() {
        let other = Host::new("10.0.0.5", 18083, "someone", "else").unwrap();
        assert_eq!(host(), other);
        assert_ne!(host(), Host::new("10.0.0.5", 18084, "admin", "s3cret").unwrap());
        assert_eq!(host().url(), "http://10.0.0.5:18083");
    }

    #[test]
    fn host_never_leaks_password() {
        let debug = format!("{:?}", host());
        assert!(!debug.contains("s3cret"));
        let json = serde_json::to_string(&host()).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(json.contains("\"username\":\"admin\""));
    }

    #[test]
    fn guest_identity_is_id_and_name() {
        let id = Uuid::new_v4();
        let mut a = Guest::reference(id, "web", host());
        let b = Guest::reference(id, "web", host());
        a.ram_size = 4096;
        assert_eq!(a, b);
        assert_ne!(a, Guest::reference(id, "db", host()));
        assert!(Guest::reference(Uuid::nil(), "web", host()).check().is_err());
        assert!(Guest::reference(id, " ", host()).check().is_err());
    }

    #[test]
    fn port_rule_shape_checks() {
        assert!(PortRule::tcp("ssh", 2222, 22).check().is_ok());
        assert!(PortRule::tcp("", 2222, 22).check().is_err());
        assert!(PortRule::tcp("a,b", 2222, 22).check().is_err());
        assert!(PortRule::tcp("ssh", 2222, 22).with_host_ip("1.2.3.4,5").check().is_err());
        assert!(PortRule::tcp("ssh", 2222, 22).with_guest_ip("10.0.2.15,").check().is_err());
        assert!(PortRule::tcp("ssh", 65_536, 22).check().is_err());
        assert!(PortRule::udp("dns", 53, -1).check().is_err());
        assert!(PortRule::tcp("edge", 0, MAX_PORT).check().is_ok());
    }

    #[test]
    fn port_rule_converts_to_redirect() {
        let rule = PortRule::tcp("ssh", 2222, 22).with_guest_ip("10.0.2.15");
        let redirect = NatRedirect::try_from(&rule).unwrap();
        assert_eq!(redirect.encode(), "ssh,1,,2222,10.0.2.15,22");
        assert_eq!(PortRule::from(redirect), rule);
    }

    #[test]
    fn clone_type_mapping() {
        assert_eq!(CloneType::FullFromState.mode(), CloneMode::MachineState);
        assert_eq!(CloneType::FullFromStateAndChildren.mode(), CloneMode::MachineAndChildStates);
        assert_eq!(CloneType::FullFromAllStates.mode(), CloneMode::AllStates);
        assert_eq!(CloneType::Linked.mode(), CloneMode::MachineState);
        assert_eq!(CloneType::Linked.options(), vec![CloneOption::Link]);
        assert!(CloneType::FullFromAllStates.options().is_empty());
        assert_eq!(CloneType::Linked.suffix(), "_LinkClone");
    }

    #[test]
    fn blank_strings_count_as_unset() {
        let criteria = SearchCriteria {
            name: Some("   ".into()),
            os_type: Some(String::new()),
            ..Default::default()
        };
        assert!(!criteria.is_set(SearchCriterion::Name));
        assert!(criteria.is_empty());
        let criteria = SearchCriteria { ram_size: Some(0), ..Default::default() };
        assert!(criteria.is_set(SearchCriterion::Ram));
        assert!(!criteria.is_empty());
    }
}
