//! Discovery scanner
//!
//! Sweeps an [`AddressRange`] and streams [`CandidateDevice`]s as live hosts
//! are found. Every address gets one cheap reachability probe; only hosts
//! that answer are probed further (SNMP, ports). Remote command probes are
//! never part of discovery: they need credentials for a known device.
//!
//! ## Cancellation
//!
//! Cancelling the token stops the sweep from starting new hosts. Probes
//! already in flight complete or time out normally and their candidates are
//! still delivered. Dropping the stream has the same effect.

pub mod range;

pub use range::AddressRange;

use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::MonitorConfig;
use crate::device::{DeviceIdentity, Protocol};
use crate::engine::probe::{ProbeJob, run_probe};
use crate::traits::{ProbeDriver, ProbeOptions, ProbePayload, ProbeResult};

const SYS_DESCR_OID: &str = "1.3.6.1.2.1.1.1.0";

/// A live host found by a sweep
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateDevice {
    /// Address-based identity (no MAC is known at discovery time)
    pub identity: DeviceIdentity,
    pub address: IpAddr,
    /// Reachability result followed by any capability probe results
    pub probe_results: Vec<ProbeResult>,
    /// Open ports, when a port probe ran
    pub open_ports: Option<BTreeSet<u16>>,
    /// SNMP sysDescr, when the agent answered
    pub vendor_hint: Option<String>,
}

/// Incremental stream of candidates
pub type CandidateStream = Pin<Box<dyn Stream<Item = CandidateDevice> + Send>>;

/// Range sweeper
///
/// Cheap to clone; clones share drivers and the worker pool.
#[derive(Clone)]
pub struct DiscoveryScanner {
    reachability: Arc<dyn ProbeDriver>,
    capabilities: Vec<Arc<dyn ProbeDriver>>,
    pool: Arc<Semaphore>,
    config: Arc<MonitorConfig>,
    options: Arc<ProbeOptions>,
}

impl DiscoveryScanner {
    /// Create a scanner from the engine's drivers
    ///
    /// Fails when no reachability driver is available.
    pub fn new(
        drivers: &[Arc<dyn ProbeDriver>],
        pool: Arc<Semaphore>,
        config: Arc<MonitorConfig>,
    ) -> Result<Self, crate::Error> {
        let reachability = drivers
            .iter()
            .find(|d| d.protocol() == Protocol::Reachability)
            .cloned()
            .ok_or_else(|| crate::Error::config("discovery requires a reachability driver"))?;

        let options = ProbeOptions {
            snmp_community: config.probes.snmp_community.clone(),
            snmp_oids: config.probes.snmp_oids.clone(),
            command: None,
            credentials: None,
            ports: config.probes.tcp_ports.clone(),
        };

        let capabilities = drivers
            .iter()
            .filter(|d| matches!(d.protocol(), Protocol::Snmp | Protocol::Ports))
            .filter(|d| d.applies_to(&options))
            .cloned()
            .collect();

        Ok(Self {
            reachability,
            capabilities,
            pool,
            config,
            options: Arc::new(options),
        })
    }

    /// Sweep a range, streaming candidates as they are found
    ///
    /// Must be called from within a Tokio runtime.
    pub fn scan(&self, range: AddressRange, cancel: CancelToken) -> CandidateStream {
        let (tx, rx) = mpsc::channel(64);
        let scanner = self.clone();
        tokio::spawn(async move { scanner.sweep(range, cancel, tx).await });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn sweep(
        self,
        range: AddressRange,
        cancel: CancelToken,
        tx: mpsc::Sender<CandidateDevice>,
    ) {
        info!("Discovery sweep of {} ({} addresses) started", range, range.len());

        let mut tasks = JoinSet::new();
        let mut seen = HashSet::new();
        let mut issued = 0usize;

        for address in range.iter() {
            if cancel.is_cancelled() || tx.is_closed() {
                info!("Discovery sweep of {} stopped after {} addresses", range, issued);
                break;
            }
            if !seen.insert(address) {
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.pool.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            issued += 1;
            let scanner = self.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Some(candidate) = scanner.probe_host(address, permit, &cancel).await {
                    // Receiver gone means nobody wants candidates any more
                    let _ = tx.send(candidate).await;
                }
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    warn!("Discovery task failed: {}", e);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Discovery task failed: {}", e);
            }
        }

        info!("Discovery sweep of {} finished", range);
    }

    /// Probe one address; `None` if it did not answer
    async fn probe_host(
        &self,
        address: IpAddr,
        permit: OwnedSemaphorePermit,
        cancel: &CancelToken,
    ) -> Option<CandidateDevice> {
        let identity = DeviceIdentity::ip(address);
        let never = CancelToken::never();

        let reach = run_probe(
            ProbeJob {
                driver: self.reachability.as_ref(),
                identity: &identity,
                address,
                options: &self.options,
                timeout: self.config.timeout_for(Protocol::Reachability),
            },
            &self.pool,
            Some(permit),
            &never,
            None,
        )
        .await;

        if !reach.is_success() {
            return None;
        }
        debug!("Discovery: {} is alive", address);

        let mut probe_results = vec![reach];

        // No new probes once the sweep is cancelled
        if !cancel.is_cancelled() {
            let probes = self.capabilities.iter().map(|driver| {
                run_probe(
                    ProbeJob {
                        driver: driver.as_ref(),
                        identity: &identity,
                        address,
                        options: &self.options,
                        timeout: self.config.timeout_for(driver.protocol()),
                    },
                    &self.pool,
                    None,
                    &never,
                    None,
                )
            });
            probe_results.extend(futures::future::join_all(probes).await);
        }

        let mut open_ports = None;
        let mut vendor_hint = None;
        for result in &probe_results {
            match &result.outcome {
                Ok(ProbePayload::Ports { open }) => open_ports = Some(open.clone()),
                Ok(ProbePayload::Snmp { values }) => {
                    vendor_hint = values.get(SYS_DESCR_OID).cloned();
                }
                _ => {}
            }
        }

        Some(CandidateDevice {
            identity,
            address,
            probe_results,
            open_ports,
            vendor_hint,
        })
    }
}
