//! Contract Test: Discovery
//!
//! Constraints verified:
//! - Every address of a range gets one reachability probe
//! - Only live hosts are probed further and reported as candidates
//! - Candidates are upserted once per identity, re-discovery is idempotent
//! - An address already known under another identity is not duplicated
//! - Cancelling a sweep stops it from starting new hosts
//! - Discovered devices are polled on the next cycle

mod common;

use common::*;
use netsup_core::alerts::{EventKind, MonitorEvent};
use netsup_core::cancel::{CancelToken, cancel_pair};
use netsup_core::device::{DeviceIdentity, HealthStatus, Protocol};
use netsup_core::discovery::{AddressRange, CandidateDevice};
use netsup_core::error::{Error, ProbeError};
use netsup_core::MonitorEngine;
use std::net::IpAddr;
use std::time::Duration;
use tokio_stream::StreamExt;

fn live_only(address: &str) -> ScriptedDriver {
    let reach = ScriptedDriver::failing(Protocol::Reachability, ProbeError::Unreachable);
    reach.set_outcome(address.parse().unwrap(), Ok(ok_payload(Protocol::Reachability)));
    reach
}

fn discovered(events: &[MonitorEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::DeviceDiscovered { .. }))
        .count()
}

async fn sweep(engine: &MonitorEngine, range: &str) -> Vec<CandidateDevice> {
    let range: AddressRange = range.parse().unwrap();
    engine
        .discover(range, CancelToken::never())
        .await
        .unwrap()
        .collect()
        .await
}

#[tokio::test]
async fn sweep_reports_only_live_hosts() {
    let reach = live_only("10.20.0.2");
    let snmp = ScriptedDriver::new(Protocol::Snmp);
    let engine = engine_with(
        &[&reach, &snmp],
        &TestInventory::default(),
        RecordingSink::new().boxed(),
        minimal_config(),
    );
    let mut events = engine.subscribe();

    let candidates = sweep(&engine, "10.20.0.0/30").await;

    assert_eq!(reach.call_count(), 4);
    assert_eq!(snmp.call_count(), 1, "only the live host is probed further");
    assert_eq!(candidates.len(), 1);

    let address: IpAddr = "10.20.0.2".parse().unwrap();
    let candidate = &candidates[0];
    assert_eq!(candidate.address, address);
    assert_eq!(candidate.identity, DeviceIdentity::ip(address));
    assert_eq!(candidate.vendor_hint.as_deref(), Some("Test switch"));
    assert_eq!(candidate.probe_results.len(), 2);

    let record = engine.get_device_state(&candidate.identity).await.unwrap();
    assert_eq!(record.status, HealthStatus::Online);
    assert_eq!(record.attributes.vendor_hint.as_deref(), Some("Test switch"));
    assert_eq!(engine.cache().len().await, 1);

    let events = drain(&mut events).await;
    assert_eq!(discovered(&events), 1);
    assert_eq!(
        transitions(&events),
        vec![(HealthStatus::Unknown, HealthStatus::Online)]
    );
}

#[tokio::test]
async fn rediscovery_is_idempotent() {
    let reach = live_only("10.20.0.2");
    let engine = engine_with(
        &[&reach],
        &TestInventory::default(),
        RecordingSink::new().boxed(),
        minimal_config(),
    );
    let mut events = engine.subscribe();

    sweep(&engine, "10.20.0.0/30").await;
    sweep(&engine, "10.20.0.0/30").await;

    assert_eq!(engine.cache().len().await, 1);
    let events = drain(&mut events).await;
    assert_eq!(discovered(&events), 1);
    assert_eq!(transitions(&events).len(), 1);
}

#[tokio::test]
async fn known_address_keeps_its_identity() {
    let reach = ScriptedDriver::new(Protocol::Reachability);
    let inventory = TestInventory::with_devices(vec![d1()]);
    let engine = engine_with(
        &[&reach],
        &inventory,
        RecordingSink::new().boxed(),
        minimal_config(),
    );
    engine.run_cycle().await;
    let mut events = engine.subscribe();

    let candidates = sweep(&engine, "10.0.0.10/32").await;

    assert_eq!(candidates.len(), 1);
    assert_eq!(engine.cache().len().await, 1);
    assert!(engine.get_device_state(&d1().identity).await.is_some());
    assert_eq!(discovered(&drain(&mut events).await), 0);
}

#[tokio::test]
async fn cancelled_sweep_stops_issuing_probes() {
    let reach = ScriptedDriver::failing(Protocol::Reachability, ProbeError::Unreachable);
    reach.set_delay(Duration::from_millis(50));
    let mut config = minimal_config();
    config.worker_pool_size = 1;
    let engine = engine_with(
        &[&reach],
        &TestInventory::default(),
        RecordingSink::new().boxed(),
        config,
    );

    let range: AddressRange = "10.40.0.0/28".parse().unwrap();
    let (handle, token) = cancel_pair();
    let stream = engine.discover(range, token).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    handle.cancel();

    let candidates: Vec<CandidateDevice> = tokio::time::timeout(Duration::from_secs(2), stream.collect())
        .await
        .expect("sweep ends after cancel");
    assert!(candidates.is_empty());
    assert!(reach.call_count() < 16, "made {} calls", reach.call_count());
}

#[tokio::test]
async fn discovered_device_is_polled_next_cycle() {
    let reach = live_only("10.20.0.1");
    let mut config = minimal_config();
    config.device_ttl_ms = None;
    let engine = engine_with(
        &[&reach],
        &TestInventory::default(),
        RecordingSink::new().boxed(),
        config,
    );

    sweep(&engine, "10.20.0.0/30").await;
    let calls_after_sweep = reach.call_count();

    let report = engine.run_cycle().await;
    assert_eq!(report.devices_polled, 1);
    assert_eq!(reach.call_count(), calls_after_sweep + 1);

    // Fresh again: not due until its record ages
    let report = engine.run_cycle().await;
    assert_eq!(report.devices_polled, 0);
}

#[tokio::test]
async fn run_discovery_sweeps_configured_ranges() {
    let reach = live_only("10.30.0.3");
    let mut config = minimal_config();
    config.discovery_ranges = vec!["10.30.0.0/30".to_string(), "10.31.0.1-10.31.0.2".to_string()];
    let engine = engine_with(
        &[&reach],
        &TestInventory::default(),
        RecordingSink::new().boxed(),
        config,
    );

    let found = engine.run_discovery(CancelToken::never()).await.unwrap();

    assert_eq!(found, 1);
    assert_eq!(reach.call_count(), 6);
}

#[tokio::test]
async fn discovery_without_reachability_driver_is_rejected() {
    let snmp = ScriptedDriver::new(Protocol::Snmp);
    let engine = engine_with(
        &[&snmp],
        &TestInventory::default(),
        RecordingSink::new().boxed(),
        minimal_config(),
    );

    let range: AddressRange = "10.20.0.0/30".parse().unwrap();
    let result = engine.discover(range, CancelToken::never()).await;
    assert!(matches!(result.err(), Some(Error::Config(_))));

    let mut config = minimal_config();
    config.discovery.enabled = true;
    config.discovery_ranges = vec!["10.20.0.0/30".to_string()];
    let built = MonitorEngine::new(
        vec![snmp.boxed()],
        TestInventory::default().boxed(),
        RecordingSink::new().boxed(),
        config,
    );
    assert!(matches!(built.err(), Some(Error::Config(_))));
}
