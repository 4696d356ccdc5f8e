//! Test doubles and common utilities for contract tests
//!
//! Everything here is in-process: scripted drivers stand in for the network,
//! sinks record or refuse events. No test needs sockets or privileges.

#![allow(dead_code)]

use async_trait::async_trait;
use netsup_core::alerts::{EventStream, MonitorEvent};
use netsup_core::config::{DiscoveryConfig, EventConfig, MonitorConfig};
use netsup_core::device::{Credentials, DeviceIdentity, DeviceTarget, HealthStatus, Protocol};
use netsup_core::error::{Error, ProbeError};
use netsup_core::traits::{
    CommandOutput, EventSink, InventoryProvider, ProbeDriver, ProbeOptions, ProbePayload,
};
use netsup_core::{HealthTransition, MonitorEngine};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

pub type Outcome = Result<ProbePayload, ProbeError>;

/// Successful payload for a protocol
pub fn ok_payload(protocol: Protocol) -> ProbePayload {
    match protocol {
        Protocol::Reachability => ProbePayload::Reachability {
            rtt: Duration::from_millis(2),
            replies: 1,
            ttl: Some(64),
        },
        Protocol::Snmp => ProbePayload::Snmp {
            values: BTreeMap::from([
                ("1.3.6.1.2.1.1.1.0".to_string(), "Test switch".to_string()),
                ("1.3.6.1.2.1.1.3.0".to_string(), "123456".to_string()),
            ]),
        },
        Protocol::Command => ProbePayload::Command(CommandOutput {
            command: "uptime".to_string(),
            stdout: "Mock command output".to_string(),
            stderr: String::new(),
            exit_code: 0,
        }),
        Protocol::Ports => ProbePayload::Ports {
            open: BTreeSet::from([22]),
        },
    }
}

/// Ports payload with the given open set
pub fn ports_payload(open: &[u16]) -> ProbePayload {
    ProbePayload::Ports {
        open: open.iter().copied().collect(),
    }
}

/// A probe driver whose answers are scripted by the test
///
/// Clones share the script and counters, so a test keeps one clone to steer
/// the driver after handing the other to the engine.
#[derive(Clone)]
pub struct ScriptedDriver {
    protocol: Protocol,
    per_address: Arc<Mutex<HashMap<IpAddr, Outcome>>>,
    default: Arc<Mutex<Outcome>>,
    delay: Arc<Mutex<Duration>>,
    queued_delays: Arc<Mutex<VecDeque<Duration>>>,
    requires_credentials: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    seen_options: Arc<Mutex<Vec<ProbeOptions>>>,
}

impl ScriptedDriver {
    /// Driver that succeeds everywhere
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            per_address: Arc::new(Mutex::new(HashMap::new())),
            default: Arc::new(Mutex::new(Ok(ok_payload(protocol)))),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            queued_delays: Arc::new(Mutex::new(VecDeque::new())),
            requires_credentials: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            seen_options: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Driver that fails everywhere with `error`
    pub fn failing(protocol: Protocol, error: ProbeError) -> Self {
        let driver = Self::new(protocol);
        driver.set_default(Err(error));
        driver
    }

    /// Answer for addresses without a specific script
    pub fn set_default(&self, outcome: Outcome) {
        *self.default.lock().unwrap() = outcome;
    }

    /// Answer for one address
    pub fn set_outcome(&self, address: IpAddr, outcome: Outcome) {
        self.per_address.lock().unwrap().insert(address, outcome);
    }

    /// Delay applied to every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Delays for the next calls, in order, before falling back to `set_delay`
    pub fn queue_delays(&self, delays: &[Duration]) {
        self.queued_delays.lock().unwrap().extend(delays.iter().copied());
    }

    /// Only apply when credentials are present (like the command driver)
    pub fn require_credentials(&self) {
        self.requires_credentials.store(true, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn seen_options(&self) -> Vec<ProbeOptions> {
        self.seen_options.lock().unwrap().clone()
    }

    pub fn boxed(&self) -> Box<dyn ProbeDriver> {
        Box::new(self.clone())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProbeDriver for ScriptedDriver {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn probe(
        &self,
        address: IpAddr,
        _timeout: Duration,
        options: &ProbeOptions,
    ) -> Result<ProbePayload, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_options.lock().unwrap().push(options.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = self
            .queued_delays
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| *self.delay.lock().unwrap());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.per_address.lock().unwrap().get(&address).cloned();
        scripted.unwrap_or_else(|| self.default.lock().unwrap().clone())
    }

    fn applies_to(&self, options: &ProbeOptions) -> bool {
        !self.requires_credentials.load(Ordering::SeqCst) || options.credentials.is_some()
    }

    fn driver_name(&self) -> &'static str {
        "scripted"
    }
}

/// Sink that records every published event
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<MonitorEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn transitions(&self) -> Vec<HealthTransition> {
        self.events()
            .iter()
            .filter_map(|e| e.transition().cloned())
            .collect()
    }

    pub fn boxed(&self) -> Box<dyn EventSink> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: &MonitorEvent) -> Result<(), Error> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn sink_name(&self) -> &'static str {
        "recording"
    }
}

/// Sink that is always unavailable
#[derive(Clone, Default)]
pub struct FailingSink {
    calls: Arc<AtomicUsize>,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Create a new FailingSink that shares counters with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            calls: Arc::clone(&other.calls),
        }
    }
}

#[async_trait]
impl EventSink for FailingSink {
    async fn publish(&self, _event: &MonitorEvent) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::sink("sink unavailable"))
    }

    fn sink_name(&self) -> &'static str {
        "failing"
    }
}

/// Sink that never returns
#[derive(Clone, Default)]
pub struct HangingSink {
    calls: Arc<AtomicUsize>,
}

impl HangingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for HangingSink {
    async fn publish(&self, _event: &MonitorEvent) -> Result<(), Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }

    fn sink_name(&self) -> &'static str {
        "hanging"
    }
}

/// Inventory backed by a mutable list, with an on/off switch
#[derive(Clone, Default)]
pub struct TestInventory {
    devices: Arc<Mutex<Vec<DeviceTarget>>>,
    credentials: Arc<Mutex<HashMap<DeviceIdentity, Credentials>>>,
    unavailable: Arc<AtomicBool>,
}

impl TestInventory {
    pub fn with_devices(devices: Vec<DeviceTarget>) -> Self {
        let inventory = Self::default();
        *inventory.devices.lock().unwrap() = devices;
        inventory
    }

    pub fn set_credentials(&self, identity: DeviceIdentity, credentials: Credentials) {
        self.credentials.lock().unwrap().insert(identity, credentials);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn boxed(&self) -> Box<dyn InventoryProvider> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl InventoryProvider for TestInventory {
    async fn devices(&self) -> Result<Vec<DeviceTarget>, Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::inventory("inventory offline"));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn credentials(&self, identity: &DeviceIdentity) -> Result<Option<Credentials>, Error> {
        Ok(self.credentials.lock().unwrap().get(identity).cloned())
    }
}

/// Configuration where every known device is due on every cycle
pub fn minimal_config() -> MonitorConfig {
    MonitorConfig {
        poll_interval_secs: 1,
        probe_timeout_ms: 500,
        failure_threshold: 3,
        worker_pool_size: 8,
        device_ttl_ms: Some(0),
        cycle_deadline_ms: Some(5_000),
        discovery: DiscoveryConfig {
            enabled: false,
            ..DiscoveryConfig::default()
        },
        events: EventConfig {
            channel_capacity: 256,
            publish_timeout_ms: 100,
        },
        ..MonitorConfig::default()
    }
}

/// The D1 test device
pub fn d1() -> DeviceTarget {
    DeviceTarget::new(
        DeviceIdentity::mac("aa:bb:cc:dd:ee:ff").unwrap(),
        "10.0.0.10".parse().unwrap(),
    )
}

/// An address-identified device
pub fn device(address: &str) -> DeviceTarget {
    let address: IpAddr = address.parse().unwrap();
    DeviceTarget::new(DeviceIdentity::ip(address), address)
}

/// Build an engine from scripted drivers
pub fn engine_with(
    drivers: &[&ScriptedDriver],
    inventory: &TestInventory,
    sink: Box<dyn EventSink>,
    config: MonitorConfig,
) -> MonitorEngine {
    MonitorEngine::new(
        drivers.iter().map(|d| d.boxed()).collect(),
        inventory.boxed(),
        sink,
        config,
    )
    .expect("engine construction succeeds")
}

/// Current status of a device
pub async fn status_of(engine: &MonitorEngine, identity: &DeviceIdentity) -> HealthStatus {
    engine
        .get_device_state(identity)
        .await
        .map(|record| record.status)
        .expect("device is cached")
}

/// Collect everything a subscriber has received so far
pub async fn drain(stream: &mut EventStream) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), stream.next()).await
    {
        events.push(event);
    }
    events
}

/// Transitions among a batch of events
pub fn transitions(events: &[MonitorEvent]) -> Vec<(HealthStatus, HealthStatus)> {
    events
        .iter()
        .filter_map(|e| e.transition())
        .map(|t| (t.previous, t.new))
        .collect()
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
