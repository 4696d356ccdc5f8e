//! Configuration types for the monitoring engine
//!
//! Configuration is passed to the engine once at construction and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::device::Protocol;
use crate::discovery::AddressRange;

/// Main monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Default per-probe timeout in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Per-protocol timeout overrides in milliseconds
    #[serde(default)]
    pub protocol_timeouts_ms: HashMap<Protocol, u64>,

    /// Consecutive whole-device failing cycles before a device is `offline`
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Maximum number of probes in flight at once
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Address ranges swept by discovery (CIDR, `a-b` span, or single address)
    #[serde(default)]
    pub discovery_ranges: Vec<String>,

    /// Discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Staleness window in milliseconds (default: 2 x poll interval)
    #[serde(default)]
    pub device_ttl_ms: Option<u64>,

    /// Overall poll cycle deadline in milliseconds (default: poll interval)
    #[serde(default)]
    pub cycle_deadline_ms: Option<u64>,

    /// Protocol options shared by all devices
    #[serde(default)]
    pub probes: ProbeSettings,

    /// Event delivery settings
    #[serde(default)]
    pub events: EventConfig,

    /// Drivers to instantiate through the registry
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
}

impl MonitorConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            protocol_timeouts_ms: HashMap::new(),
            failure_threshold: default_failure_threshold(),
            worker_pool_size: default_worker_pool_size(),
            discovery_ranges: Vec::new(),
            discovery: DiscoveryConfig::default(),
            device_ttl_ms: None,
            cycle_deadline_ms: None,
            probes: ProbeSettings::default(),
            events: EventConfig::default(),
            drivers: Vec::new(),
        }
    }

    /// Validate the configuration
    ///
    /// Any error here is fatal: the engine refuses to start.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.poll_interval_secs == 0 {
            return Err(crate::Error::config("poll_interval_secs must be > 0"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(crate::Error::config("probe_timeout_ms must be > 0"));
        }
        if let Some((protocol, _)) = self.protocol_timeouts_ms.iter().find(|(_, ms)| **ms == 0) {
            return Err(crate::Error::config(format!(
                "timeout for protocol {} must be > 0",
                protocol
            )));
        }
        if self.failure_threshold == 0 {
            return Err(crate::Error::config("failure_threshold must be > 0"));
        }
        if self.worker_pool_size == 0 {
            return Err(crate::Error::config("worker_pool_size must be > 0"));
        }
        if self.cycle_deadline_ms == Some(0) {
            return Err(crate::Error::config("cycle_deadline_ms must be > 0"));
        }
        if self.events.channel_capacity == 0 {
            return Err(crate::Error::config("events.channel_capacity must be > 0"));
        }

        self.address_ranges()?;

        for driver in &self.drivers {
            driver.validate()?;
        }

        Ok(())
    }

    /// Parse every discovery range, failing on the first malformed one
    pub fn address_ranges(&self) -> Result<Vec<AddressRange>, crate::Error> {
        self.discovery_ranges
            .iter()
            .map(|raw| {
                let range: AddressRange = raw.parse()?;
                if range.len() > self.discovery.max_hosts_per_range as u128 {
                    return Err(crate::Error::config(format!(
                        "address range {} has {} addresses (max {})",
                        raw,
                        range.len(),
                        self.discovery.max_hosts_per_range
                    )));
                }
                Ok(range)
            })
            .collect()
    }

    /// Interval between poll cycles
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Timeout applied to one probe of the given protocol
    pub fn timeout_for(&self, protocol: Protocol) -> Duration {
        let ms = self
            .protocol_timeouts_ms
            .get(&protocol)
            .copied()
            .unwrap_or(self.probe_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Staleness window for device records
    pub fn device_ttl(&self) -> Duration {
        self.device_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.poll_interval() * 2)
    }

    /// Overall deadline for one poll cycle
    pub fn cycle_deadline(&self) -> Duration {
        self.cycle_deadline_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.poll_interval())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Whether the engine sweeps `discovery_ranges` on its own
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between discovery sweeps
    #[serde(default = "default_discovery_interval_secs")]
    pub interval_secs: u64,

    /// Largest range accepted by validation
    #[serde(default = "default_max_hosts_per_range")]
    pub max_hosts_per_range: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_discovery_interval_secs(),
            max_hosts_per_range: default_max_hosts_per_range(),
        }
    }
}

/// Protocol options shared by every device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Default SNMP community (inventory may override per device)
    #[serde(default = "default_snmp_community")]
    pub snmp_community: String,

    /// OIDs read by the SNMP probe
    #[serde(default = "default_snmp_oids")]
    pub snmp_oids: Vec<String>,

    /// Command run by the remote command probe (None disables it)
    #[serde(default)]
    pub command: Option<String>,

    /// Ports checked by the TCP probe
    #[serde(default = "default_tcp_ports")]
    pub tcp_ports: Vec<u16>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            snmp_community: default_snmp_community(),
            snmp_oids: default_snmp_oids(),
            command: None,
            tcp_ports: default_tcp_ports(),
        }
    }
}

/// Event delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Capacity of the sink queue and the subscriber broadcast channel
    ///
    /// When the sink queue is full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub channel_capacity: usize,

    /// Time allowed for one `EventSink::publish` call
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl EventConfig {
    /// Publish timeout as a duration
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_event_channel_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

/// Probe driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverConfig {
    /// ICMP echo reachability
    Icmp {
        /// Echo requests per probe
        #[serde(default = "default_icmp_attempts")]
        attempts: u8,
    },

    /// SNMP v2c GET
    Snmp {
        /// Agent UDP port
        #[serde(default = "default_snmp_port")]
        port: u16,
    },

    /// Remote command over the system OpenSSH client
    Ssh {
        /// Default session port
        #[serde(default = "default_ssh_port")]
        port: u16,
        /// Path to the `ssh` binary
        #[serde(default)]
        binary: Option<String>,
    },

    /// TCP connect port scan
    Tcp,

    /// Custom driver
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl DriverConfig {
    /// Validate the driver configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            DriverConfig::Icmp { attempts } => {
                if *attempts == 0 {
                    return Err(crate::Error::config("ICMP attempts must be > 0"));
                }
                Ok(())
            }
            DriverConfig::Snmp { port } | DriverConfig::Ssh { port, .. } => {
                if *port == 0 {
                    return Err(crate::Error::config(format!(
                        "{} driver port must be > 0",
                        self.type_name()
                    )));
                }
                Ok(())
            }
            DriverConfig::Tcp => Ok(()),
            DriverConfig::Custom { factory, .. } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom driver factory cannot be empty"));
                }
                Ok(())
            }
        }
    }

    /// Get the driver type name
    pub fn type_name(&self) -> &str {
        match self {
            DriverConfig::Icmp { .. } => "icmp",
            DriverConfig::Snmp { .. } => "snmp",
            DriverConfig::Ssh { .. } => "ssh",
            DriverConfig::Tcp => "tcp",
            DriverConfig::Custom { factory, .. } => factory,
        }
    }

    /// Built-in driver with default settings, by type name
    pub fn builtin(type_name: &str) -> Option<Self> {
        match type_name {
            "icmp" => Some(DriverConfig::Icmp {
                attempts: default_icmp_attempts(),
            }),
            "snmp" => Some(DriverConfig::Snmp {
                port: default_snmp_port(),
            }),
            "ssh" => Some(DriverConfig::Ssh {
                port: default_ssh_port(),
                binary: None,
            }),
            "tcp" => Some(DriverConfig::Tcp),
            _ => None,
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_worker_pool_size() -> usize {
    32
}

fn default_enabled() -> bool {
    true
}

fn default_discovery_interval_secs() -> u64 {
    300
}

fn default_max_hosts_per_range() -> u32 {
    4096
}

fn default_snmp_community() -> String {
    "public".to_string()
}

fn default_snmp_oids() -> Vec<String> {
    vec![
        "1.3.6.1.2.1.1.1.0".to_string(), // sysDescr
        "1.3.6.1.2.1.1.2.0".to_string(), // sysObjectID
        "1.3.6.1.2.1.1.3.0".to_string(), // sysUpTime
        "1.3.6.1.2.1.1.5.0".to_string(), // sysName
    ]
}

fn default_tcp_ports() -> Vec<u16> {
    vec![22, 23, 80, 161, 443, 8080]
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_publish_timeout_ms() -> u64 {
    2000
}

fn default_icmp_attempts() -> u8 {
    2
}

fn default_snmp_port() -> u16 {
    161
}

fn default_ssh_port() -> u16 {
    22
}
