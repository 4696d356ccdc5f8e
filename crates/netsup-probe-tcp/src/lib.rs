// # TCP Port Driver
//
// This crate provides the port probe: a plain TCP connect to each configured
// port. It supplies the device's open-port set, which the engine compares
// across cycles to raise `OpenPortDetected`.
//
// A refused connection still proves the host is up, so the probe succeeds
// when at least one port connected or was refused, and fails with
// `Unreachable` only when every port stayed silent.
//
// ## Budget
//
// All connects finish before the caller's timeout, with some headroom, so a
// filtered port can never turn a partial answer into a timeout. With more
// ports than `MAX_PARALLEL_CONNECTS` the budget is split between the rounds
// of connects; a port not answered by the deadline counts as silent.

use async_trait::async_trait;
use futures::StreamExt;
use netsup_core::config::DriverConfig;
use netsup_core::device::Protocol;
use netsup_core::error::ProbeError;
use netsup_core::traits::{ProbeDriver, ProbeDriverFactory, ProbeOptions, ProbePayload};
use netsup_core::{DriverRegistry, Error, Result};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Ports connected to at once for one host
const MAX_PARALLEL_CONNECTS: usize = 16;

// Headroom left to the caller's timer: a tenth of the budget, within bounds
const MIN_HEADROOM: Duration = Duration::from_millis(2);
const MAX_HEADROOM: Duration = Duration::from_millis(100);

/// What one connect attempt told us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    Open,
    Closed,
    Silent,
}

/// TCP connect driver
#[derive(Debug, Clone, Default)]
pub struct TcpDriver;

impl TcpDriver {
    /// Create a driver; the ports come from each probe's options
    pub fn new() -> Self {
        Self
    }
}

async fn check_port(
    address: IpAddr,
    port: u16,
    per_port: Duration,
    deadline: Instant,
) -> (u16, PortState) {
    let target = SocketAddr::new(address, port);
    let limit = (Instant::now() + per_port).min(deadline);
    let state = match tokio::time::timeout_at(limit, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => PortState::Open,
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => PortState::Closed,
        Ok(Err(e)) => {
            debug!("Connect to {} failed: {}", target, e);
            PortState::Silent
        }
        Err(_) => PortState::Silent,
    };
    (port, state)
}

/// Time all connects of one probe may take
fn connect_budget(timeout: Duration) -> Duration {
    let headroom = (timeout / 10).clamp(MIN_HEADROOM, MAX_HEADROOM);
    timeout.saturating_sub(headroom)
}

/// Limit of one connect when `ports` connects share `budget`
fn per_port_timeout(budget: Duration, ports: usize) -> Duration {
    let rounds = ports.div_ceil(MAX_PARALLEL_CONNECTS).max(1);
    budget / u32::try_from(rounds).unwrap_or(u32::MAX)
}

/// Fold per-port states into the probe outcome
fn summarize(states: &[(u16, PortState)]) -> std::result::Result<ProbePayload, ProbeError> {
    if states.iter().all(|(_, state)| *state == PortState::Silent) {
        return Err(ProbeError::Unreachable);
    }
    let open: BTreeSet<u16> = states
        .iter()
        .filter(|(_, state)| *state == PortState::Open)
        .map(|(port, _)| *port)
        .collect();
    Ok(ProbePayload::Ports { open })
}

#[async_trait]
impl ProbeDriver for TcpDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Ports
    }

    async fn probe(
        &self,
        address: IpAddr,
        timeout: Duration,
        options: &ProbeOptions,
    ) -> std::result::Result<ProbePayload, ProbeError> {
        let ports: BTreeSet<u16> = options.ports.iter().copied().filter(|p| *p != 0).collect();
        if ports.is_empty() {
            return Err(ProbeError::Driver("no ports to check".to_string()));
        }

        let budget = connect_budget(timeout);
        let per_port = per_port_timeout(budget, ports.len());
        let deadline = Instant::now() + budget;

        let states: Vec<(u16, PortState)> = futures::stream::iter(ports)
            .map(|port| check_port(address, port, per_port, deadline))
            .buffer_unordered(MAX_PARALLEL_CONNECTS)
            .collect()
            .await;

        summarize(&states)
    }

    fn applies_to(&self, options: &ProbeOptions) -> bool {
        !options.ports.is_empty()
    }

    fn driver_name(&self) -> &'static str {
        "tcp"
    }
}

/// Factory for creating TCP drivers
pub struct TcpFactory;

impl ProbeDriverFactory for TcpFactory {
    fn create(&self, config: &DriverConfig) -> Result<Box<dyn ProbeDriver>> {
        match config {
            DriverConfig::Tcp => Ok(Box::new(TcpDriver::new())),
            _ => Err(Error::config("Invalid config for TCP driver")),
        }
    }
}

/// Register the TCP driver with a registry
pub fn register(registry: &DriverRegistry) {
    registry.register_driver("tcp", Box::new(TcpFactory));
}
