//! Error types for the monitoring engine
//!
//! Two families live here:
//! - [`Error`]: crate-level failures (configuration, inventory, sinks, lookups)
//! - [`ProbeError`]: the per-probe failure taxonomy. These are facts recorded on
//!   a device, never failures of a poll cycle.

use crate::device::Protocol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the monitoring engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Probe driver construction or registry errors
    #[error("Driver error: {0}")]
    Driver(String),

    /// Inventory provider errors
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// Event sink errors
    #[error("Event sink error: {0}")]
    Sink(String),

    /// Device not found
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors converted from `anyhow`
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a driver error
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Create an inventory error
    pub fn inventory(msg: impl Into<String>) -> Self {
        Self::Inventory(msg.into())
    }

    /// Create an event sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// Failure of a single probe invocation
///
/// Every variant is recoverable by the next poll cycle. The scheduler folds
/// them into failure counters on the device record.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeError {
    /// No reply to any reachability check within the timeout
    #[error("host unreachable")]
    Unreachable,

    /// Address cannot be probed (unspecified, multicast, wrong family)
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// SNMP agent did not answer or the session could not be opened
    #[error("SNMP agent unreachable: {0}")]
    AgentUnreachable(String),

    /// SNMP agent refused the community / credentials
    #[error("SNMP authentication rejected")]
    AuthenticationRejected,

    /// SNMP request timed out
    #[error("SNMP request timed out")]
    Timeout,

    /// Remote shell connection refused or could not be established
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Remote shell rejected the credentials
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Remote command did not finish within the timeout
    #[error("command timed out")]
    CommandTimeout,

    /// Remote command finished with a non-zero exit code
    #[error("command exited with code {code}")]
    NonZeroExit {
        /// Exit code reported by the remote side
        code: i32,
        /// Captured stderr (truncated)
        stderr: String,
    },

    /// Probe aborted by its caller (cycle deadline, shutdown, scan cancel)
    #[error("probe cancelled")]
    Cancelled,

    /// Local driver fault (socket permissions, missing binary, ...)
    #[error("driver fault: {0}")]
    Driver(String),
}

impl ProbeError {
    /// The error a probe reports when the scheduler's timeout fires first
    pub fn timeout_for(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Reachability | Protocol::Ports => ProbeError::Unreachable,
            Protocol::Snmp => ProbeError::Timeout,
            Protocol::Command => ProbeError::CommandTimeout,
        }
    }

    /// Whether the failure means the device rejected our credentials
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            ProbeError::AuthenticationFailed | ProbeError::AuthenticationRejected
        )
    }

    /// Whether the probe was aborted rather than answered
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Cancelled)
    }
}
