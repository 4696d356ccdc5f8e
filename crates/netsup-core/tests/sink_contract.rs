//! Contract Test: Event Sinks
//!
//! Constraints verified:
//! - A failing or slow sink never blocks polling
//! - Subscribers receive every event regardless of the sink
//! - Events carry the severity of what they report

mod common;

use common::*;
use netsup_core::alerts::{EventKind, Severity};
use netsup_core::device::{HealthStatus, Protocol};
use netsup_core::error::ProbeError;
use std::collections::BTreeSet;
use std::time::Duration;

#[tokio::test]
async fn failing_sink_does_not_block_cycles() {
    let reach = ScriptedDriver::new(Protocol::Reachability);
    let sink = FailingSink::new();
    let inventory = TestInventory::with_devices(vec![d1(), device("10.0.0.11")]);
    let engine = engine_with(
        &[&reach],
        &inventory,
        Box::new(FailingSink::sharing_counters_with(&sink)),
        minimal_config(),
    );
    let mut events = engine.subscribe();

    engine.run_cycle().await;
    reach.set_default(Err(ProbeError::Unreachable));
    for _ in 0..3 {
        let report = engine.run_cycle().await;
        assert_eq!(report.devices_polled, 2);
    }

    // unknown -> online, online -> degraded, degraded -> offline, per device
    let received = drain(&mut events).await;
    assert_eq!(transitions(&received).len(), 6);
    assert!(wait_until(|| sink.call_count() == 6).await);
}

#[tokio::test]
async fn hanging_sink_is_timed_out() {
    let reach = ScriptedDriver::new(Protocol::Reachability);
    let sink = HangingSink::new();
    let inventory = TestInventory::with_devices(vec![d1(), device("10.0.0.11")]);
    let mut config = minimal_config();
    config.events.publish_timeout_ms = 50;
    let engine = engine_with(&[&reach], &inventory, Box::new(sink.clone()), config);
    let mut events = engine.subscribe();

    let report = engine.run_cycle().await;
    assert_eq!(report.transitions, 2);
    assert!(report.duration < Duration::from_millis(500));

    assert_eq!(transitions(&drain(&mut events).await).len(), 2);
    // The dispatcher gives up on the first event and moves to the second
    assert!(wait_until(|| sink.call_count() == 2).await);
}

#[tokio::test]
async fn sink_receives_classified_events() {
    let reach = ScriptedDriver::new(Protocol::Reachability);
    let snmp = ScriptedDriver::new(Protocol::Snmp);
    let ports = ScriptedDriver::new(Protocol::Ports);
    ports.set_default(Ok(ports_payload(&[22, 23])));

    let mut target = d1();
    target.expected_ports = Some(BTreeSet::from([22]));
    let inventory = TestInventory::with_devices(vec![target]);
    let sink = RecordingSink::new();
    let engine = engine_with(
        &[&reach, &snmp, &ports],
        &inventory,
        sink.boxed(),
        minimal_config(),
    );

    engine.run_cycle().await;
    snmp.set_default(Err(ProbeError::AuthenticationRejected));
    engine.run_cycle().await;
    engine.run_cycle().await;

    assert!(wait_until(|| sink.events().len() == 4).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = sink.events();
    assert_eq!(events.len(), 4, "got {:?}", events);

    let open_port = events
        .iter()
        .find(|e| matches!(e.kind, EventKind::OpenPortDetected { port: 23 }))
        .expect("unexpected port is reported");
    assert_eq!(open_port.severity, Severity::High);

    let auth = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::AuthenticationFailure { .. }))
        .collect::<Vec<_>>();
    assert_eq!(auth.len(), 1, "reported once per streak");
    assert_eq!(auth[0].severity, Severity::High);

    let degraded = events
        .iter()
        .find(|e| e.transition().is_some_and(|t| t.new == HealthStatus::Degraded))
        .expect("degraded transition is published");
    assert_eq!(degraded.severity, Severity::Warning);
    assert_eq!(degraded.transition().map(|t| t.cause), Some(Protocol::Snmp));
}
