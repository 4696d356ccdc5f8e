//! Minimal embedding example for netsup-core
//!
//! Drives the engine from application code with in-process drivers: no
//! sockets, no privileges. One device goes dark after the first cycle and the
//! example prints the transitions the engine reports.

use netsup_core::device::Protocol;
use netsup_core::error::ProbeError;
use netsup_core::traits::{ProbeDriver, ProbeOptions, ProbePayload};
use netsup_core::{DeviceFilter, LogSink, MonitorConfig, MonitorEngine, Result, StaticInventory};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::Level;

const INVENTORY: &str = r#"[
    { "address": "192.0.2.10", "name": "core-switch", "device_type": "switch" },
    { "mac": "00:1B:44:11:3A:B7", "address": "192.0.2.20", "name": "edge-router",
      "device_type": "router", "expected_ports": [22] }
]"#;

/// Reachability driver answering from a shared set of "live" addresses
#[derive(Clone)]
struct SimulatedPing {
    live: Arc<Mutex<HashSet<IpAddr>>>,
}

#[async_trait::async_trait]
impl ProbeDriver for SimulatedPing {
    fn protocol(&self) -> Protocol {
        Protocol::Reachability
    }

    async fn probe(
        &self,
        address: IpAddr,
        _timeout: Duration,
        _options: &ProbeOptions,
    ) -> std::result::Result<ProbePayload, ProbeError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let live = self.live.lock().map(|l| l.contains(&address)).unwrap_or(false);
        if live {
            Ok(ProbePayload::Reachability {
                rtt: Duration::from_millis(5),
                replies: 1,
                ttl: Some(64),
            })
        } else {
            Err(ProbeError::Unreachable)
        }
    }

    fn driver_name(&self) -> &'static str {
        "simulated-ping"
    }
}

/// Port driver reporting a fixed open set
struct SimulatedPorts;

#[async_trait::async_trait]
impl ProbeDriver for SimulatedPorts {
    fn protocol(&self) -> Protocol {
        Protocol::Ports
    }

    async fn probe(
        &self,
        _address: IpAddr,
        _timeout: Duration,
        _options: &ProbeOptions,
    ) -> std::result::Result<ProbePayload, ProbeError> {
        Ok(ProbePayload::Ports {
            open: [22, 8080].into_iter().collect(),
        })
    }

    fn applies_to(&self, options: &ProbeOptions) -> bool {
        !options.ports.is_empty()
    }

    fn driver_name(&self) -> &'static str {
        "simulated-ports"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    println!("=== Embedded netsup-core Example ===\n");

    let ping = SimulatedPing {
        live: Arc::new(Mutex::new(
            ["192.0.2.10", "192.0.2.20"]
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect(),
        )),
    };

    let mut config = MonitorConfig::new();
    config.poll_interval_secs = 1;
    config.failure_threshold = 2;
    // Freshness window of zero: every device is due on every cycle
    config.device_ttl_ms = Some(1500);
    config.probes.tcp_ports = vec![22, 8080];

    println!("1. Creating engine...");
    let inventory = StaticInventory::from_json_str(INVENTORY)?;
    let engine = MonitorEngine::new(
        vec![Box::new(ping.clone()), Box::new(SimulatedPorts)],
        Box::new(inventory),
        Box::new(LogSink::new()),
        config,
    )?;

    let mut events = engine.subscribe();
    let listener = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            println!("[Event] {} {:?}: {:?}", event.identity, event.severity, event.kind);
        }
    });

    println!("2. Running cycles by hand...");
    for cycle in 0..4 {
        if cycle == 1 {
            println!("   core-switch stops answering");
            if let Ok(mut live) = ping.live.lock() {
                live.retain(|a| a.to_string() != "192.0.2.10");
            }
        }
        let report = engine.run_cycle().await;
        println!(
            "   cycle {}: {} device(s), {} probe(s), {} transition(s)",
            report.cycle_number, report.devices_polled, report.probes_completed, report.transitions
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("\n3. Device states:");
    for record in engine.list_device_states(&DeviceFilter::all()).await {
        println!(
            "   {} ({}) {} failures={}",
            record.display_name, record.identity, record.status, record.consecutive_failures
        );
    }

    println!("\n4. Running the scheduler until told to stop...");
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_with_shutdown(Some(shutdown_rx)).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    let _ = shutdown_tx.send(());
    match runner.await {
        Ok(result) => result?,
        Err(e) => println!("   scheduler task failed: {}", e),
    }

    drop(engine);
    let _ = tokio::time::timeout(Duration::from_millis(100), listener).await;

    println!("\n=== Embedding Successful ===");
    Ok(())
}
