//! Device data model
//!
//! - [`DeviceIdentity`]: stable cache key (MAC if known, else IP)
//! - [`DeviceRecord`]: last-known state, owned by the state cache
//! - [`DeviceTarget`]: what the inventory knows about a device to probe it
//! - [`DeviceUpdate`]: partial metadata update applied through `upsert`

use crate::error::{Error, ProbeError};
use crate::traits::probe_driver::CommandOutput;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

/// Stable identity of a device
///
/// MAC addresses are stored normalized (`aa:bb:cc:dd:ee:ff`), IP addresses in
/// canonical form (IPv4-mapped IPv6 collapses to IPv4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceIdentity {
    /// Hardware address
    Mac(String),
    /// Network address, used when no MAC is known
    Ip(IpAddr),
}

impl DeviceIdentity {
    /// Build a MAC identity, normalizing separators and case
    pub fn mac(raw: &str) -> Result<Self, Error> {
        normalize_mac(raw).map(DeviceIdentity::Mac)
    }

    /// Build an IP identity
    pub fn ip(addr: IpAddr) -> Self {
        DeviceIdentity::Ip(addr.to_canonical())
    }

    /// MAC identity when a MAC is known, IP identity otherwise
    pub fn resolve(mac: Option<&str>, addr: IpAddr) -> Result<Self, Error> {
        match mac {
            Some(mac) if !mac.trim().is_empty() => Self::mac(mac),
            _ => Ok(Self::ip(addr)),
        }
    }

    /// The IP address, if this identity is address-based
    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            DeviceIdentity::Ip(addr) => Some(*addr),
            DeviceIdentity::Mac(_) => None,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdentity::Mac(mac) => f.write_str(mac),
            DeviceIdentity::Ip(addr) => write!(f, "{}", addr),
        }
    }
}

impl FromStr for DeviceIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(Self::ip(addr));
        }
        Self::mac(s)
    }
}

impl TryFrom<String> for DeviceIdentity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceIdentity> for String {
    fn from(identity: DeviceIdentity) -> Self {
        identity.to_string()
    }
}

fn normalize_mac(raw: &str) -> Result<String, Error> {
    let hex: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();

    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::invalid_input(format!("malformed MAC address: {}", raw)));
    }

    let hex = hex.to_ascii_lowercase();
    let octets: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    Ok(octets.join(":"))
}

/// Derived health of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every previously working protocol answered this round
    Online,
    /// Some previously working protocol failed, or failures are below threshold
    Degraded,
    /// Consecutive whole-device failures reached the threshold
    Offline,
    /// No probe has ever succeeded
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Online => "online",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Offline => "offline",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Probe protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Ping-style round trip
    Reachability,
    /// SNMP GET of a fixed OID set
    Snmp,
    /// Remote command over a secure shell
    Command,
    /// TCP connect port scan
    Ports,
}

impl Protocol {
    /// All protocols in merge order
    pub const ALL: [Protocol; 4] = [
        Protocol::Reachability,
        Protocol::Snmp,
        Protocol::Command,
        Protocol::Ports,
    ];
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Reachability => "reachability",
            Protocol::Snmp => "snmp",
            Protocol::Command => "command",
            Protocol::Ports => "ports",
        };
        f.write_str(s)
    }
}

/// Per-protocol history on a device record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolState {
    /// Timestamp of the most recent merged result
    pub last_probed_at: Option<DateTime<Utc>>,
    /// Timestamp of the most recent success
    pub last_success_at: Option<DateTime<Utc>>,
    /// Latency of the most recent success
    pub last_latency_ms: Option<u64>,
    /// Most recent failure, cleared on success
    pub last_error: Option<ProbeError>,
    /// Total merged successes
    pub successes: u64,
    /// Total merged failures
    pub failures: u64,
}

impl ProtocolState {
    /// Whether this protocol has ever answered for the device
    pub fn ever_succeeded(&self) -> bool {
        self.last_success_at.is_some()
    }
}

/// Protocol-specific attributes collected from successful probes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    /// SNMP values keyed by OID
    pub snmp: BTreeMap<String, String>,
    /// Open TCP ports (None until the first port scan)
    pub open_ports: Option<BTreeSet<u16>>,
    /// Output of the last successful remote command
    pub last_command: Option<CommandOutput>,
    /// Last reachability round trip
    pub latency_ms: Option<u64>,
    /// Vendor hint from discovery (SNMP sysDescr and friends)
    pub vendor_hint: Option<String>,
}

/// Last-known state of one device
///
/// Owned by [`crate::cache::DeviceStateCache`]; collaborators only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub display_name: String,
    pub address: IpAddr,
    pub device_type: String,
    pub status: HealthStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub protocols: BTreeMap<Protocol, ProtocolState>,
    pub attributes: DeviceAttributes,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Create an empty record in `unknown` state
    pub(crate) fn new(identity: DeviceIdentity, address: IpAddr) -> Self {
        let now = Utc::now();
        Self {
            display_name: address.to_string(),
            identity,
            address,
            device_type: "unknown".to_string(),
            status: HealthStatus::Unknown,
            last_seen_at: None,
            protocols: BTreeMap::new(),
            attributes: DeviceAttributes::default(),
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Seed a record for an identity with no known address yet
    pub(crate) fn seed(identity: DeviceIdentity, address: Option<IpAddr>) -> Self {
        let address = address
            .or_else(|| identity.as_ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Self::new(identity, address)
    }

    /// Timestamp of the last merged result for a protocol
    pub fn last_probed_at(&self, protocol: Protocol) -> Option<DateTime<Utc>> {
        self.protocols
            .get(&protocol)
            .and_then(|state| state.last_probed_at)
    }

    /// Most recent probe timestamp across all protocols
    pub fn last_probed(&self) -> Option<DateTime<Utc>> {
        self.protocols
            .values()
            .filter_map(|state| state.last_probed_at)
            .max()
    }

    /// Check if the record is stale (not probed within `max_age`)
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        match self.last_probed() {
            Some(at) => Utc::now().signed_duration_since(at) >= max_age,
            None => true,
        }
    }

    /// Whether the protocol has ever answered for this device
    pub fn protocol_ever_succeeded(&self, protocol: Protocol) -> bool {
        self.protocols
            .get(&protocol)
            .is_some_and(ProtocolState::ever_succeeded)
    }
}

/// Partial metadata update used by `DeviceStateCache::upsert`
///
/// Health fields are not part of this: they only change through the merge step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub display_name: Option<String>,
    pub address: Option<IpAddr>,
    pub device_type: Option<String>,
    pub vendor_hint: Option<String>,
}

impl DeviceUpdate {
    /// Update carrying only an address
    pub fn address(address: IpAddr) -> Self {
        Self {
            address: Some(address),
            ..Self::default()
        }
    }

    /// Metadata update derived from an inventory target
    pub fn from_target(target: &DeviceTarget) -> Self {
        Self {
            display_name: target.display_name.clone(),
            address: Some(target.address),
            device_type: target.device_type.clone(),
            vendor_hint: None,
        }
    }

    /// Whether the update changes anything on the record
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.address.is_none()
            && self.device_type.is_none()
            && self.vendor_hint.is_none()
    }

    pub(crate) fn apply(self, record: &mut DeviceRecord) {
        if self.is_empty() {
            return;
        }
        if let Some(address) = self.address {
            // Keep display names that were derived from the old address in sync
            if record.display_name == record.address.to_string() {
                record.display_name = address.to_string();
            }
            record.address = address;
        }
        if let Some(name) = self.display_name {
            record.display_name = name;
        }
        if let Some(device_type) = self.device_type {
            record.device_type = device_type;
        }
        if let Some(vendor) = self.vendor_hint {
            record.attributes.vendor_hint = Some(vendor);
        }
        record.updated_at = Utc::now();
    }
}

/// Credentials for authenticated probes (remote command sessions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login user
    pub username: String,
    /// Session port override
    #[serde(default)]
    pub port: Option<u16>,
    /// Private key used for the session
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
}

/// A device the engine should poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub identity: DeviceIdentity,
    pub address: IpAddr,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    /// Restrict polling to these protocols (None = every applicable driver)
    #[serde(default)]
    pub protocols: Option<BTreeSet<Protocol>>,
    #[serde(default)]
    pub snmp_community: Option<String>,
    /// Command to run instead of the configured default
    #[serde(default)]
    pub command: Option<String>,
    /// Ports that are allowed to be open; anything else raises an alert
    #[serde(default)]
    pub expected_ports: Option<BTreeSet<u16>>,
}

impl DeviceTarget {
    /// Target with only an identity and address
    pub fn new(identity: DeviceIdentity, address: IpAddr) -> Self {
        Self {
            identity,
            address,
            display_name: None,
            device_type: None,
            protocols: None,
            snmp_community: None,
            command: None,
            expected_ports: None,
        }
    }

    /// Target derived from a cached record (discovered devices)
    pub fn from_record(record: &DeviceRecord) -> Self {
        Self::new(record.identity.clone(), record.address)
    }

    /// Whether the protocol should be probed for this device
    pub fn wants(&self, protocol: Protocol) -> bool {
        self.protocols
            .as_ref()
            .is_none_or(|set| set.contains(&protocol))
    }
}

/// Filter for `list_device_states`
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// Keep only these statuses
    pub statuses: Option<Vec<HealthStatus>>,
    /// Keep only this device type
    pub device_type: Option<String>,
    /// Keep only devices whose current address falls in this range
    pub range: Option<crate::discovery::AddressRange>,
}

impl DeviceFilter {
    /// Filter matching every device
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter on a single status
    pub fn with_status(status: HealthStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Self::default()
        }
    }

    /// Whether the record passes the filter
    pub fn matches(&self, record: &DeviceRecord) -> bool {
        if let Some(statuses) = &self.statuses
            && !statuses.contains(&record.status)
        {
            return false;
        }
        if let Some(device_type) = &self.device_type
            && &record.device_type != device_type
        {
            return false;
        }
        if let Some(range) = &self.range
            && !range.contains(record.address)
        {
            return false;
        }
        true
    }
}
