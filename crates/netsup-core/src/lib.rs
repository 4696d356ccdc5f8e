// # netsup-core
//
// Core library for network device discovery and health monitoring.
//
// ## Architecture Overview
//
// - **ProbeDriver**: Trait for one protocol check against one address
// - **DiscoveryScanner**: Sweeps address ranges and streams live hosts
// - **DeviceStateCache**: In-memory device records, serialized per identity
// - **MonitorEngine**: Poll scheduler that fans out probes, merges results
//   and detects transitions
// - **AlertEmitter**: Classifies findings and publishes them to an EventSink
//   and to subscribers
// - **DriverRegistry**: Plugin-based registry for probe drivers
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Protocol code lives in driver crates
// 2. **Failures are facts**: Probe errors land on the device record, never
//    abort a cycle
// 3. **Plugin-Based**: Drivers are registered dynamically
// 4. **Library-First**: The daemon is a thin wrapper around this crate

pub mod alerts;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod registry;
pub mod traits;

// Re-export core types for convenience
pub use alerts::{
    AlertEmitter, ChannelSink, EventKind, HealthTransition, LogSink, MonitorEvent, Severity,
};
pub use cache::DeviceStateCache;
pub use cancel::{CancelHandle, CancelToken, cancel_pair};
pub use config::{DriverConfig, MonitorConfig};
pub use device::{
    Credentials, DeviceFilter, DeviceIdentity, DeviceRecord, DeviceTarget, HealthStatus, Protocol,
};
pub use discovery::{AddressRange, CandidateDevice, DiscoveryScanner};
pub use engine::{CycleReport, MonitorEngine};
pub use error::{Error, ProbeError, Result};
pub use inventory::StaticInventory;
pub use registry::DriverRegistry;
pub use traits::{
    EventSink, InventoryProvider, ProbeDriver, ProbeDriverFactory, ProbeOptions, ProbePayload,
    ProbeResult,
};
