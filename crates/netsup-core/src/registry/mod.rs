//! Plugin-based probe driver registry
//!
//! Driver crates register a factory under a type name; the daemon then builds
//! drivers from [`DriverConfig`] entries without knowing the concrete types.
//!
//! ## Registration
//!
//! Driver crates expose a `register` function:
//!
//! ```rust,ignore
//! # use netsup_core::registry::DriverRegistry;
//!
//! // In the netsup-probe-icmp crate
//! pub fn register(registry: &DriverRegistry) {
//!     registry.register_driver("icmp", Box::new(IcmpFactory));
//! }
//! ```

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::traits::{ProbeDriver, ProbeDriverFactory};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Registry of probe driver factories keyed by type name
///
/// ## Thread Safety
///
/// Interior mutability with RwLock allows concurrent reads and exclusive
/// writes. A poisoned lock is recovered; registrations are plain inserts and
/// cannot leave the map half-written.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Box<dyn ProbeDriverFactory>>>,
}

impl DriverRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver factory
    ///
    /// # Parameters
    ///
    /// - `name`: Driver type name (e.g., "icmp", "snmp")
    /// - `factory`: Factory object for creating driver instances
    ///
    /// Registering the same name twice replaces the earlier factory.
    pub fn register_driver(&self, name: impl Into<String>, factory: Box<dyn ProbeDriverFactory>) {
        let mut drivers = self.drivers.write().unwrap_or_else(PoisonError::into_inner);
        drivers.insert(name.into(), factory);
    }

    /// Create a driver from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn ProbeDriver>)`: Created driver instance
    /// - `Err(Error)`: If the driver type is not registered or creation fails
    pub fn create_driver(&self, config: &DriverConfig) -> Result<Box<dyn ProbeDriver>> {
        config.validate()?;

        let driver_type = config.type_name();
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);

        let factory = drivers
            .get(driver_type)
            .ok_or_else(|| Error::driver(format!("Unknown driver type: {}", driver_type)))?;

        factory.create(config)
    }

    /// Create every configured driver, failing on the first error
    pub fn create_all(&self, configs: &[DriverConfig]) -> Result<Vec<Box<dyn ProbeDriver>>> {
        configs.iter().map(|c| self.create_driver(c)).collect()
    }

    /// List all registered driver types, sorted
    pub fn list_drivers(&self) -> Vec<String> {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a driver type is registered
    pub fn has_driver(&self, name: &str) -> bool {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        drivers.contains_key(name)
    }
}
