//! Health poll scheduler
//!
//! The [`MonitorEngine`] is responsible for:
//! - Selecting devices due for polling (inventory, discoveries, stale records)
//! - Fanning out protocol probes under a global worker-pool bound
//! - Merging each device's results into the state cache
//! - Emitting transitions and security findings
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   targets    ┌──────────────┐   probes    ┌──────────────┐
//! │ Inventory │─────────────▶│ MonitorEngine│────────────▶│ ProbeDrivers │
//! └───────────┘              └──────────────┘◀────────────└──────────────┘
//!                                │      ▲        results
//! ┌───────────┐   candidates     │      │
//! │ Discovery │──────────────────┘      │ merge (per-identity lock)
//! └───────────┘                         ▼
//!                                ┌──────────────┐  events  ┌─────────────┐
//!                                │ StateCache   │─────────▶│ AlertEmitter│──▶ sink / subscribers
//!                                └──────────────┘          └─────────────┘
//! ```
//!
//! ## Cycle Flow
//!
//! 1. Compute the due set (inventory targets, pending discoveries, stale records)
//! 2. Spawn one task per device; each runs its probes concurrently
//! 3. Each probe waits for a pool slot, then runs under its protocol timeout
//! 4. Probes still running at the cycle deadline are cancelled and left out
//! 5. The device's results are merged under its record lock
//! 6. Transitions and findings go to the emitter

pub mod merge;
pub(crate) mod probe;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertEmitter, EventKind, EventStream, MonitorEvent};
use crate::cache::DeviceStateCache;
use crate::cancel::{CancelToken, cancel_pair};
use crate::config::MonitorConfig;
use crate::device::{
    DeviceFilter, DeviceIdentity, DeviceRecord, DeviceTarget, DeviceUpdate, Protocol,
};
use crate::discovery::{AddressRange, CandidateDevice, CandidateStream, DiscoveryScanner};
use crate::error::{Error, Result};
use crate::traits::{EventSink, InventoryProvider, ProbeDriver, ProbeOptions};

use merge::{MergeOutcome, merge_results};
use probe::{ProbeJob, run_probe};

/// Summary of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Monotonic cycle counter, starting at 1
    pub cycle_number: u64,
    /// Devices that were due and polled
    pub devices_polled: usize,
    /// Probes that finished (success or failure)
    pub probes_completed: usize,
    /// Probes cut off by the deadline or cancellation
    pub probes_cancelled: usize,
    /// Status transitions emitted
    pub transitions: usize,
    /// Wall-clock time of the cycle
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct DevicePoll {
    completed: usize,
    cancelled: usize,
    transitioned: bool,
}

/// Device discovery and health monitoring engine
///
/// Cheap to clone; clones share the same cache, pool and emitter.
///
/// ## Lifecycle
///
/// 1. Create with [`MonitorEngine::new()`]
/// 2. Start with [`MonitorEngine::run()`], or drive cycles yourself with
///    [`MonitorEngine::run_cycle()`]
/// 3. The run loop exits on SIGINT (or the test shutdown channel)
#[derive(Clone)]
pub struct MonitorEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    drivers: Vec<Arc<dyn ProbeDriver>>,
    inventory: Arc<dyn InventoryProvider>,
    sink: Arc<dyn EventSink>,
    config: Arc<MonitorConfig>,
    ranges: Vec<AddressRange>,
    scanner: Option<DiscoveryScanner>,
    cache: DeviceStateCache,
    emitter: AlertEmitter,
    pool: Arc<Semaphore>,
    /// Freshly discovered identities, due on the next cycle
    pending: Mutex<HashSet<DeviceIdentity>>,
    /// Last inventory snapshot, used when the inventory is unavailable
    targets: RwLock<HashMap<DeviceIdentity, DeviceTarget>>,
    cycles: AtomicU64,
}

impl MonitorEngine {
    /// Create a new monitoring engine
    ///
    /// # Parameters
    ///
    /// - `drivers`: Probe drivers, at most one per protocol
    /// - `inventory`: Source of known devices and credentials
    /// - `sink`: Destination for emitted events
    /// - `config`: Monitoring configuration (validated here)
    ///
    /// # Errors
    ///
    /// `Error::Config` for invalid configuration, no drivers, two drivers for
    /// one protocol, or enabled discovery ranges without a reachability driver.
    pub fn new(
        drivers: Vec<Box<dyn ProbeDriver>>,
        inventory: Box<dyn InventoryProvider>,
        sink: Box<dyn EventSink>,
        config: MonitorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ranges = config.address_ranges()?;

        if drivers.is_empty() {
            return Err(Error::config("at least one probe driver is required"));
        }
        let mut protocols = BTreeSet::new();
        for driver in &drivers {
            if !protocols.insert(driver.protocol()) {
                return Err(Error::config(format!(
                    "more than one driver for protocol {}",
                    driver.protocol()
                )));
            }
        }

        let mut drivers: Vec<Arc<dyn ProbeDriver>> = drivers.into_iter().map(Arc::from).collect();
        drivers.sort_by_key(|d| d.protocol());

        let config = Arc::new(config);
        let pool = Arc::new(Semaphore::new(config.worker_pool_size));

        let scanner = if protocols.contains(&Protocol::Reachability) {
            Some(DiscoveryScanner::new(&drivers, pool.clone(), config.clone())?)
        } else if config.discovery.enabled && !ranges.is_empty() {
            return Err(Error::config(
                "discovery ranges are configured but no reachability driver is available",
            ));
        } else {
            None
        };

        let inner = EngineInner {
            emitter: AlertEmitter::new(&config.events),
            drivers,
            inventory: Arc::from(inventory),
            sink: Arc::from(sink),
            ranges,
            scanner,
            cache: DeviceStateCache::new(),
            pool,
            pending: Mutex::new(HashSet::new()),
            targets: RwLock::new(HashMap::new()),
            cycles: AtomicU64::new(0),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// The engine's configuration
    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// The device state cache (read access for embedders)
    pub fn cache(&self) -> &DeviceStateCache {
        &self.inner.cache
    }

    /// Run the engine until SIGINT
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run with a controlled shutdown signal
    ///
    /// Used by tests, the daemon and embedders that own their own signal
    /// handling. [`MonitorEngine::run()`] listens for CTRL-C itself.
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(
        &self,
        shutdown_rx: Option<tokio::sync::oneshot::Receiver<()>>,
    ) -> Result<()> {
        info!(
            "Monitor engine started: {} drivers, poll interval {}s, pool size {}",
            self.inner.drivers.len(),
            self.inner.config.poll_interval_secs,
            self.inner.config.worker_pool_size
        );
        self.ensure_dispatcher().await;

        let shutdown = async move {
            match shutdown_rx {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
        };
        tokio::pin!(shutdown);

        let (stop, stop_token) = cancel_pair();
        let discovery_task = (self.inner.config.discovery.enabled
            && !self.inner.ranges.is_empty())
        .then(|| tokio::spawn(self.clone().discovery_loop(stop_token)));

        let mut ticker = tokio::time::interval(self.inner.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }

                _ = ticker.tick() => {
                    let (cycle_handle, cycle_token) = cancel_pair();
                    let cycle = self.run_cycle_with_cancel(cycle_token);
                    tokio::pin!(cycle);

                    tokio::select! {
                        report = &mut cycle => log_report(&report),
                        _ = &mut shutdown => {
                            info!("Shutdown signal received, cancelling in-flight probes");
                            cycle_handle.cancel();
                            log_report(&cycle.await);
                            break;
                        }
                    }
                }
            }
        }

        stop.cancel();
        if let Some(task) = discovery_task {
            task.abort();
        }
        info!("Monitor engine stopped");

        Ok(())
    }

    /// Run one poll cycle now
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_with_cancel(CancelToken::never()).await
    }

    /// Run one poll cycle that can be cancelled from outside
    ///
    /// Cancellation (or the cycle deadline) aborts in-flight probes; they are
    /// left out of the merge and the cache stays consistent.
    pub async fn run_cycle_with_cancel(&self, cancel: CancelToken) -> CycleReport {
        self.ensure_dispatcher().await;

        let cycle_number = self.inner.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let deadline = started + self.inner.config.cycle_deadline();

        let due = self.due_targets().await;
        debug!("Poll cycle {}: {} devices due", cycle_number, due.len());

        let mut report = CycleReport {
            cycle_number,
            devices_polled: due.len(),
            ..CycleReport::default()
        };

        let mut polls = JoinSet::new();
        for target in due {
            let engine = self.clone();
            let cancel = cancel.clone();
            polls.spawn(async move { engine.poll_device(target, &cancel, Some(deadline)).await });
        }

        while let Some(joined) = polls.join_next().await {
            match joined {
                Ok(poll) => {
                    report.probes_completed += poll.completed;
                    report.probes_cancelled += poll.cancelled;
                    report.transitions += usize::from(poll.transitioned);
                }
                Err(e) => error!("Device poll task failed: {}", e),
            }
        }

        report.duration = started.elapsed();
        report
    }

    /// Last-known state of one device
    pub async fn get_device_state(&self, identity: &DeviceIdentity) -> Option<DeviceRecord> {
        self.inner.cache.get(identity).await
    }

    /// Last-known state of every device matching the filter
    pub async fn list_device_states(&self, filter: &DeviceFilter) -> Vec<DeviceRecord> {
        self.inner.cache.list(filter).await
    }

    /// Probe one device now, outside the regular cycle
    ///
    /// Safe to call while a scheduled cycle is polling the same device: the
    /// merges are serialized and the older round is dropped.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` if the device is neither cached nor in the inventory.
    pub async fn trigger_immediate_probe(&self, identity: &DeviceIdentity) -> Result<DeviceRecord> {
        self.ensure_dispatcher().await;

        let target = match self.find_target(identity).await {
            Some(target) => target,
            None => return Err(Error::not_found(identity.to_string())),
        };

        info!("Immediate probe of {} requested", identity);
        self.poll_device(target, &CancelToken::never(), None).await;

        self.inner
            .cache
            .get(identity)
            .await
            .ok_or_else(|| Error::not_found(identity.to_string()))
    }

    /// Evict a device on external request
    ///
    /// Emits `DeviceRemoved`. Results of polls already in flight for the
    /// device are dropped. A device still listed by the inventory comes back
    /// on the next cycle.
    pub async fn remove_device(&self, identity: &DeviceIdentity) -> Result<DeviceRecord> {
        self.ensure_dispatcher().await;

        let record = self
            .inner
            .cache
            .remove(identity)
            .await
            .ok_or_else(|| Error::not_found(identity.to_string()))?;
        self.inner.pending.lock().await.remove(identity);

        info!("Device {} removed", identity);
        self.emit(MonitorEvent::new(identity.clone(), EventKind::DeviceRemoved));
        Ok(record)
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> EventStream {
        self.inner.emitter.subscribe()
    }

    /// Sweep a range, ingesting candidates as they stream in
    ///
    /// Each candidate is upserted into the cache (its discovery probes are
    /// merged) before the stream yields it.
    ///
    /// # Errors
    ///
    /// `Error::Config` if no reachability driver is available.
    pub async fn discover(
        &self,
        range: AddressRange,
        cancel: CancelToken,
    ) -> Result<CandidateStream> {
        self.ensure_dispatcher().await;

        let scanner = self
            .inner
            .scanner
            .as_ref()
            .ok_or_else(|| Error::config("discovery requires a reachability driver"))?;

        let engine = self.clone();
        let stream = scanner.scan(range, cancel).then(move |candidate| {
            let engine = engine.clone();
            async move {
                engine.ingest_candidate(&candidate).await;
                candidate
            }
        });
        Ok(Box::pin(stream))
    }

    /// Sweep every configured range once
    ///
    /// # Returns
    ///
    /// Number of live hosts found
    pub async fn run_discovery(&self, cancel: CancelToken) -> Result<usize> {
        let mut found = 0;
        for range in &self.inner.ranges {
            if cancel.is_cancelled() {
                break;
            }
            let mut candidates = self.discover(range.clone(), cancel.clone()).await?;
            while candidates.next().await.is_some() {
                found += 1;
            }
        }
        Ok(found)
    }

    async fn discovery_loop(self, stop: CancelToken) {
        let period = Duration::from_secs(self.inner.config.discovery.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.run_discovery(stop.clone()).await {
                Ok(found) => info!("Discovery found {} live hosts", found),
                Err(e) => warn!("Discovery failed: {}", e),
            }
        }
    }

    /// Fold a discovered host into the cache
    async fn ingest_candidate(&self, candidate: &CandidateDevice) {
        // A known device may have a MAC identity for this address
        let identity = self
            .inner
            .cache
            .identity_for_address(candidate.address)
            .await
            .unwrap_or_else(|| candidate.identity.clone());

        let update = DeviceUpdate {
            address: Some(candidate.address),
            vendor_hint: candidate.vendor_hint.clone(),
            ..DeviceUpdate::default()
        };
        let (_, created) = self.inner.cache.upsert(&identity, update).await;

        if created {
            info!("Discovered new device {} at {}", identity, candidate.address);
            self.inner.pending.lock().await.insert(identity.clone());
            self.emit(MonitorEvent::new(
                identity.clone(),
                EventKind::DeviceDiscovered {
                    address: candidate.address,
                    vendor_hint: candidate.vendor_hint.clone(),
                },
            ));
        }

        let results = candidate
            .probe_results
            .iter()
            .cloned()
            .map(|mut result| {
                result.identity = identity.clone();
                result
            })
            .collect();
        let expected = self.expected_ports(&identity).await;
        let threshold = self.inner.config.failure_threshold;
        let outcome = self
            .inner
            .cache
            .merge_existing(&identity, |record| {
                merge_results(record, results, expected.as_ref(), threshold)
            })
            .await;
        match outcome {
            Some(outcome) => self.publish_outcome(&identity, outcome),
            None => debug!("{} was removed during discovery, results dropped", identity),
        }
    }

    /// Probe one device with every applicable driver and merge the round
    async fn poll_device(
        &self,
        target: DeviceTarget,
        cancel: &CancelToken,
        deadline: Option<Instant>,
    ) -> DevicePoll {
        // A record that exists now must still exist at merge time
        let known = self.inner.cache.get(&target.identity).await.is_some();
        let options = self.probe_options(&target).await;
        let drivers: Vec<&Arc<dyn ProbeDriver>> = self
            .inner
            .drivers
            .iter()
            .filter(|d| target.wants(d.protocol()) && d.applies_to(&options))
            .collect();

        if drivers.is_empty() {
            debug!("No applicable probes for {}", target.identity);
            return DevicePoll::default();
        }

        let probes = drivers.iter().map(|driver| {
            run_probe(
                ProbeJob {
                    driver: driver.as_ref(),
                    identity: &target.identity,
                    address: target.address,
                    options: &options,
                    timeout: self.inner.config.timeout_for(driver.protocol()),
                },
                &self.inner.pool,
                None,
                cancel,
                deadline,
            )
        });
        let results = futures::future::join_all(probes).await;

        let cancelled = results.iter().filter(|r| r.is_cancelled()).count();
        let mut poll = DevicePoll {
            completed: results.len() - cancelled,
            cancelled,
            transitioned: false,
        };

        if !known && poll.completed == 0 {
            debug!("All probes of new device {} were cancelled", target.identity);
            return poll;
        }

        let update = DeviceUpdate::from_target(&target);
        let threshold = self.inner.config.failure_threshold;
        let merge = |record: &mut DeviceRecord| {
            update.apply(record);
            merge_results(record, results, target.expected_ports.as_ref(), threshold)
        };
        let outcome = if known {
            self.inner.cache.merge_existing(&target.identity, merge).await
        } else {
            Some(
                self.inner
                    .cache
                    .merge_with(&target.identity, Some(target.address), merge)
                    .await,
            )
        };
        let Some(outcome) = outcome else {
            debug!("{} was removed while being polled, results dropped", target.identity);
            return poll;
        };

        if outcome.merged == 0 && cancelled > 0 {
            debug!("All probes of {} were cancelled", target.identity);
        }
        poll.transitioned = outcome.transition.is_some();
        self.publish_outcome(&target.identity, outcome);
        poll
    }

    fn publish_outcome(&self, identity: &DeviceIdentity, outcome: MergeOutcome) {
        if let Some(transition) = outcome.transition {
            info!(
                "Device {} {} -> {} (cause: {})",
                identity, transition.previous, transition.new, transition.cause
            );
            self.emit(transition.into());
        }
        for kind in outcome.findings {
            warn!("Security finding on {}: {:?}", identity, kind);
            self.emit(MonitorEvent::new(identity.clone(), kind));
        }
    }

    fn emit(&self, event: MonitorEvent) {
        self.inner.emitter.emit(event);
    }

    /// Start the sink dispatcher on first use
    async fn ensure_dispatcher(&self) {
        let timeout = self.inner.config.events.publish_timeout();
        if let Some(dispatcher) = self
            .inner
            .emitter
            .take_dispatcher(self.inner.sink.clone(), timeout)
            .await
        {
            debug!("Starting event dispatcher for sink {}", self.inner.sink.sink_name());
            tokio::spawn(dispatcher.run());
        }
    }

    /// Devices to poll this cycle
    async fn due_targets(&self) -> Vec<DeviceTarget> {
        let targets = match self.inner.inventory.devices().await {
            Ok(devices) => {
                let snapshot: HashMap<DeviceIdentity, DeviceTarget> = devices
                    .into_iter()
                    .map(|t| (t.identity.clone(), t))
                    .collect();
                *self.inner.targets.write().await = snapshot.clone();
                snapshot
            }
            Err(e) => {
                warn!("Inventory unavailable, using last known device list: {}", e);
                self.inner.targets.read().await.clone()
            }
        };

        let pending: HashSet<DeviceIdentity> = std::mem::take(&mut *self.inner.pending.lock().await);
        let stale: HashSet<DeviceIdentity> = self
            .inner
            .cache
            .all_stale(self.freshness_window())
            .await
            .into_iter()
            .map(|record| record.identity)
            .collect();

        let mut due = Vec::new();
        let mut inventory_addresses: HashSet<IpAddr> = HashSet::new();
        for target in targets.values() {
            inventory_addresses.insert(target.address);
            let known = self.inner.cache.get(&target.identity).await.is_some();
            if !known || stale.contains(&target.identity) || pending.contains(&target.identity) {
                due.push(target.clone());
            }
        }

        // Discovered devices that the inventory does not list
        for record in self.inner.cache.list(&DeviceFilter::all()).await {
            if targets.contains_key(&record.identity)
                || inventory_addresses.contains(&record.address)
            {
                continue;
            }
            if stale.contains(&record.identity) || pending.contains(&record.identity) {
                due.push(DeviceTarget::from_record(&record));
            }
        }

        due.sort_by(|a, b| a.identity.cmp(&b.identity));
        due
    }

    /// Records probed more recently than this are skipped
    ///
    /// Leaves 1.5 poll intervals of headroom before the TTL expires.
    fn freshness_window(&self) -> Duration {
        let config = &self.inner.config;
        config
            .device_ttl()
            .saturating_sub(config.poll_interval().mul_f64(1.5))
    }

    async fn find_target(&self, identity: &DeviceIdentity) -> Option<DeviceTarget> {
        if let Some(target) = self.inner.targets.read().await.get(identity) {
            return Some(target.clone());
        }
        match self.inner.inventory.devices().await {
            Ok(devices) => {
                if let Some(target) = devices.into_iter().find(|t| &t.identity == identity) {
                    return Some(target);
                }
            }
            Err(e) => warn!("Inventory unavailable: {}", e),
        }
        self.inner
            .cache
            .get(identity)
            .await
            .map(|record| DeviceTarget::from_record(&record))
    }

    async fn expected_ports(&self, identity: &DeviceIdentity) -> Option<BTreeSet<u16>> {
        self.inner
            .targets
            .read()
            .await
            .get(identity)
            .and_then(|t| t.expected_ports.clone())
    }

    /// Probe options for one device: configuration plus inventory data
    async fn probe_options(&self, target: &DeviceTarget) -> ProbeOptions {
        let settings = &self.inner.config.probes;
        let command = target.command.clone().or_else(|| settings.command.clone());

        let mut ports: BTreeSet<u16> = settings.tcp_ports.iter().copied().collect();
        if let Some(expected) = &target.expected_ports {
            ports.extend(expected.iter().copied());
        }

        let has_command_driver = self
            .inner
            .drivers
            .iter()
            .any(|d| d.protocol() == Protocol::Command);
        let credentials = if has_command_driver
            && command.is_some()
            && target.wants(Protocol::Command)
        {
            match self.inner.inventory.credentials(&target.identity).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!("Could not fetch credentials for {}: {}", target.identity, e);
                    None
                }
            }
        } else {
            None
        };

        ProbeOptions {
            snmp_community: target
                .snmp_community
                .clone()
                .unwrap_or_else(|| settings.snmp_community.clone()),
            snmp_oids: settings.snmp_oids.clone(),
            command,
            credentials,
            ports: ports.into_iter().collect(),
        }
    }
}

fn log_report(report: &CycleReport) {
    info!(
        "Poll cycle {} finished in {:?}: {} devices, {} probes, {} cancelled, {} transitions",
        report.cycle_number,
        report.duration,
        report.devices_polled,
        report.probes_completed,
        report.probes_cancelled,
        report.transitions
    );
}
