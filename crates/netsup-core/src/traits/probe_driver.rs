// # Probe Driver Trait
//
// Defines the uniform capability every protocol implements: given a target
// address, a timeout and options, produce a typed payload or a typed failure.
//
// ## Implementations
//
// - ICMP reachability: `netsup-probe-icmp` crate
// - SNMP GET: `netsup-probe-snmp` crate
// - Remote command: `netsup-probe-ssh` crate
// - TCP ports: `netsup-probe-tcp` crate
//
// ## Usage
//
// ```rust,ignore
// use netsup_core::ProbeDriver;
//
// let driver = /* ProbeDriver implementation */;
// let payload = driver
//     .probe("10.0.0.1".parse()?, Duration::from_secs(2), &ProbeOptions::default())
//     .await?;
// ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use crate::device::{Credentials, DeviceIdentity, Protocol};
use crate::error::ProbeError;

/// Captured result of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Successful probe payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProbePayload {
    /// At least one round trip answered
    Reachability {
        /// Best round-trip time observed
        rtt: Duration,
        /// Replies received out of attempts sent
        replies: u8,
        /// IP TTL of the reply, when the driver can read it
        ttl: Option<u8>,
    },
    /// SNMP values keyed by OID
    Snmp { values: BTreeMap<String, String> },
    /// Remote command output (exit code 0)
    Command(CommandOutput),
    /// TCP ports that accepted a connection
    Ports { open: BTreeSet<u16> },
}

impl ProbePayload {
    /// Protocol that produced this payload
    pub fn protocol(&self) -> Protocol {
        match self {
            ProbePayload::Reachability { .. } => Protocol::Reachability,
            ProbePayload::Snmp { .. } => Protocol::Snmp,
            ProbePayload::Command(_) => Protocol::Command,
            ProbePayload::Ports { .. } => Protocol::Ports,
        }
    }
}

/// Per-invocation probe options
///
/// Built by the scheduler from configuration plus inventory data. Drivers read
/// only the fields relevant to their protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOptions {
    /// SNMP community string
    pub snmp_community: String,
    /// OIDs to read, dotted notation
    pub snmp_oids: Vec<String>,
    /// Remote command to execute
    pub command: Option<String>,
    /// Session credentials
    pub credentials: Option<Credentials>,
    /// TCP ports to check
    pub ports: Vec<u16>,
}

/// Outcome of one probe invocation
///
/// Transient: produced by a driver call, consumed by the merge step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub identity: DeviceIdentity,
    pub protocol: Protocol,
    pub outcome: Result<ProbePayload, ProbeError>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    /// Create a result stamped now
    pub fn new(
        identity: DeviceIdentity,
        protocol: Protocol,
        outcome: Result<ProbePayload, ProbeError>,
        latency: Duration,
    ) -> Self {
        Self {
            identity,
            protocol,
            outcome,
            latency,
            timestamp: Utc::now(),
        }
    }

    /// Whether the probe succeeded
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Whether the probe was aborted before answering
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.outcome, Err(e) if e.is_cancelled())
    }
}

/// Trait for protocol probe drivers
///
/// # Contract
///
/// - One invocation probes one address once; no retries, no background tasks
/// - Safe to call concurrently against different targets
/// - Dropping the returned future must release sockets, sessions and child
///   processes promptly. The scheduler relies on this to cancel probes.
/// - Failures are returned as [`ProbeError`], never panics
///
/// Retry, backoff and scheduling are owned by the engine: a failed probe is
/// simply tried again on the next poll cycle.
#[async_trait]
pub trait ProbeDriver: Send + Sync {
    /// Protocol implemented by this driver
    fn protocol(&self) -> Protocol;

    /// Probe one address
    ///
    /// # Parameters
    ///
    /// - `address`: Target address
    /// - `timeout`: Budget for the whole invocation
    /// - `options`: Protocol options (community, OIDs, command, credentials, ports)
    async fn probe(
        &self,
        address: IpAddr,
        timeout: Duration,
        options: &ProbeOptions,
    ) -> Result<ProbePayload, ProbeError>;

    /// Whether the driver can run with these options
    ///
    /// Inapplicable probes are skipped and never count as failures.
    fn applies_to(&self, _options: &ProbeOptions) -> bool {
        true
    }

    /// Driver name (for logging/debugging)
    fn driver_name(&self) -> &'static str;
}

/// Helper trait for constructing drivers from configuration
pub trait ProbeDriverFactory: Send + Sync {
    /// Create a driver instance from configuration
    fn create(
        &self,
        config: &crate::config::DriverConfig,
    ) -> Result<Box<dyn ProbeDriver>, crate::Error>;
}

/// Reject addresses no driver can meaningfully probe
pub fn validate_target(address: IpAddr) -> Result<(), ProbeError> {
    if address.is_unspecified() {
        return Err(ProbeError::InvalidTarget(format!(
            "{} is the unspecified address",
            address
        )));
    }
    if address.is_multicast() {
        return Err(ProbeError::InvalidTarget(format!(
            "{} is a multicast address",
            address
        )));
    }
    if let IpAddr::V4(v4) = address
        && v4.is_broadcast()
    {
        return Err(ProbeError::InvalidTarget(format!(
            "{} is the broadcast address",
            address
        )));
    }
    Ok(())
}
