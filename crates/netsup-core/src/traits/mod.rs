//! Core traits for the monitoring engine
//!
//! This module defines the abstract interfaces at the engine's boundaries.
//!
//! - [`ProbeDriver`]: Probe one address over one protocol
//! - [`InventoryProvider`]: Known devices and credentials (read-only)
//! - [`EventSink`]: Publish normalized events

pub mod event_sink;
pub mod inventory;
pub mod probe_driver;

pub use event_sink::EventSink;
pub use inventory::InventoryProvider;
pub use probe_driver::{
    CommandOutput, ProbeDriver, ProbeDriverFactory, ProbeOptions, ProbePayload, ProbeResult,
    validate_target,
};
