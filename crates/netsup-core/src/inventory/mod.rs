//! Static inventory
//!
//! A read-only [`InventoryProvider`] backed by a fixed device list, typically
//! loaded from a JSON file:
//!
//! ```json
//! [
//!   {
//!     "mac": "aa:bb:cc:dd:ee:ff",
//!     "address": "192.168.1.10",
//!     "name": "core-switch",
//!     "device_type": "switch",
//!     "protocols": ["reachability", "snmp"],
//!     "snmp_community": "monitoring",
//!     "expected_ports": [22, 161, 443]
//!   },
//!   {
//!     "address": "192.168.1.20",
//!     "command": "uptime",
//!     "credentials": { "username": "netops", "private_key_path": "/etc/netsup/id_ed25519" }
//!   }
//! ]
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::Path;

use crate::device::{Credentials, DeviceIdentity, DeviceTarget, Protocol};
use crate::traits::InventoryProvider;
use crate::Error;

/// One inventory file entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    #[serde(default)]
    pub mac: Option<String>,
    pub address: IpAddr,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub protocols: Option<BTreeSet<Protocol>>,
    #[serde(default)]
    pub snmp_community: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub expected_ports: Option<BTreeSet<u16>>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

/// Inventory with a fixed set of devices
#[derive(Clone, Default)]
pub struct StaticInventory {
    devices: Vec<DeviceTarget>,
    credentials: HashMap<DeviceIdentity, Credentials>,
}

impl StaticInventory {
    /// An inventory with no devices (discovery only)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from entries, rejecting malformed MACs and duplicate identities
    pub fn from_entries(entries: Vec<InventoryEntry>) -> Result<Self, Error> {
        let mut devices = Vec::with_capacity(entries.len());
        let mut credentials = HashMap::new();
        let mut seen = BTreeSet::new();

        for entry in entries {
            let identity = DeviceIdentity::resolve(entry.mac.as_deref(), entry.address)
                .map_err(|e| Error::inventory(e.to_string()))?;
            if !seen.insert(identity.clone()) {
                return Err(Error::inventory(format!(
                    "duplicate inventory device: {}",
                    identity
                )));
            }

            if let Some(creds) = entry.credentials {
                credentials.insert(identity.clone(), creds);
            }
            devices.push(DeviceTarget {
                identity,
                address: entry.address.to_canonical(),
                display_name: entry.name,
                device_type: entry.device_type,
                protocols: entry.protocols,
                snmp_community: entry.snmp_community,
                command: entry.command,
                expected_ports: entry.expected_ports,
            });
        }

        Ok(Self {
            devices,
            credentials,
        })
    }

    /// Parse a JSON array of entries
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let entries: Vec<InventoryEntry> = serde_json::from_str(json)?;
        Self::from_entries(entries)
    }

    /// Load a JSON inventory file
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::inventory(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the inventory has no devices
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// Credentials stay out of debug output
impl std::fmt::Debug for StaticInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticInventory")
            .field("devices", &self.devices)
            .field("credentials", &format!("<{} redacted>", self.credentials.len()))
            .finish()
    }
}

#[async_trait]
impl InventoryProvider for StaticInventory {
    async fn devices(&self) -> Result<Vec<DeviceTarget>, Error> {
        Ok(self.devices.clone())
    }

    async fn credentials(&self, identity: &DeviceIdentity) -> Result<Option<Credentials>, Error> {
        Ok(self.credentials.get(identity).cloned())
    }
}
