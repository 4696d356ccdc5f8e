// # netsupd - Device Monitoring Daemon
//
// This daemon is a THIN integration layer over netsup-core. It does not
// contain monitoring logic; it only:
// 1. Reads configuration from environment variables
// 2. Initializes logging and the runtime
// 3. Registers the compiled-in probe drivers
// 4. Loads the device inventory
// 5. Runs the engine until SIGTERM/SIGINT
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Scheduling
// - `NETSUP_POLL_INTERVAL_SECS`: Seconds between poll cycles (default 60)
// - `NETSUP_PROBE_TIMEOUT_MS`: Per-probe timeout (default 2000)
// - `NETSUP_FAILURE_THRESHOLD`: Failing cycles before `offline` (default 3)
// - `NETSUP_WORKER_POOL_SIZE`: Probes in flight at once (default 32)
//
// ### Discovery
// - `NETSUP_DISCOVERY_RANGES`: Comma-separated ranges (CIDR, `a-b`, single address)
// - `NETSUP_DISCOVERY_INTERVAL_SECS`: Seconds between sweeps (default 300)
//
// ### Devices and drivers
// - `NETSUP_INVENTORY_PATH`: JSON inventory file
// - `NETSUP_DRIVERS`: Comma-separated driver list (default: all compiled in)
// - `NETSUP_SNMP_COMMUNITY`: Default SNMP community (default "public")
// - `NETSUP_SNMP_OIDS`: Comma-separated OIDs to read
// - `NETSUP_COMMAND`: Command run by the remote command probe
// - `NETSUP_TCP_PORTS`: Comma-separated ports checked by the TCP probe
//
// ### Logging
// - `NETSUP_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export NETSUP_INVENTORY_PATH=/etc/netsup/inventory.json
// export NETSUP_DISCOVERY_RANGES=10.0.0.0/24
// export NETSUP_DRIVERS=icmp,snmp,tcp
//
// netsupd
// ```

use anyhow::{Result, anyhow};
use netsup_core::config::DriverConfig;
use netsup_core::{DriverRegistry, LogSink, MonitorConfig, MonitorEngine, StaticInventory};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Time the engine gets to stop after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum NetsupExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<NetsupExitCode> for ExitCode {
    fn from(code: NetsupExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration, as read from the environment
#[derive(Debug, Clone, Default)]
struct Config {
    poll_interval_secs: Option<u64>,
    probe_timeout_ms: Option<u64>,
    failure_threshold: Option<u32>,
    worker_pool_size: Option<usize>,
    discovery_ranges: Vec<String>,
    discovery_interval_secs: Option<u64>,
    inventory_path: Option<PathBuf>,
    drivers: Vec<String>,
    snmp_community: Option<String>,
    snmp_oids: Vec<String>,
    command: Option<String>,
    tcp_ports: Option<Vec<u16>>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through a variable lookup
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let value = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let list = |name: &str| -> Vec<String> {
            value(name)
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };

        let tcp_ports = match value("NETSUP_TCP_PORTS") {
            Some(_) => Some(
                list("NETSUP_TCP_PORTS")
                    .iter()
                    .map(|p| parse_value("NETSUP_TCP_PORTS", p))
                    .collect::<Result<Vec<u16>>>()?,
            ),
            None => None,
        };

        let drivers = match list("NETSUP_DRIVERS") {
            names if names.is_empty() => compiled_drivers().iter().map(|d| d.to_string()).collect(),
            names => names.into_iter().map(|n| n.to_lowercase()).collect(),
        };

        Ok(Self {
            poll_interval_secs: parse_opt("NETSUP_POLL_INTERVAL_SECS", value("NETSUP_POLL_INTERVAL_SECS"))?,
            probe_timeout_ms: parse_opt("NETSUP_PROBE_TIMEOUT_MS", value("NETSUP_PROBE_TIMEOUT_MS"))?,
            failure_threshold: parse_opt("NETSUP_FAILURE_THRESHOLD", value("NETSUP_FAILURE_THRESHOLD"))?,
            worker_pool_size: parse_opt("NETSUP_WORKER_POOL_SIZE", value("NETSUP_WORKER_POOL_SIZE"))?,
            discovery_ranges: list("NETSUP_DISCOVERY_RANGES"),
            discovery_interval_secs: parse_opt(
                "NETSUP_DISCOVERY_INTERVAL_SECS",
                value("NETSUP_DISCOVERY_INTERVAL_SECS"),
            )?,
            inventory_path: value("NETSUP_INVENTORY_PATH").map(PathBuf::from),
            drivers,
            snmp_community: value("NETSUP_SNMP_COMMUNITY"),
            snmp_oids: list("NETSUP_SNMP_OIDS"),
            command: value("NETSUP_COMMAND"),
            tcp_ports,
            log_level: value("NETSUP_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Checks what only the daemon knows about (log level, compiled-in
    /// drivers, inventory file), then everything the engine will check.
    fn validate(&self) -> Result<()> {
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "NETSUP_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        if self.drivers.is_empty() {
            anyhow::bail!(
                "No probe drivers available. Build with at least one of the \
                icmp, snmp, ssh, tcp features"
            );
        }
        let compiled = compiled_drivers();
        for name in &self.drivers {
            if DriverConfig::builtin(name).is_none() {
                anyhow::bail!(
                    "NETSUP_DRIVERS entry '{}' is not supported. \
                    Supported drivers: icmp, snmp, ssh, tcp",
                    name
                );
            }
            if !compiled.contains(&name.as_str()) {
                anyhow::bail!(
                    "Driver '{}' is not compiled into this build (enable the '{}' feature)",
                    name,
                    name
                );
            }
        }

        if let Some(path) = &self.inventory_path
            && !path.is_file()
        {
            anyhow::bail!(
                "NETSUP_INVENTORY_PATH does not point to a file: {}",
                path.display()
            );
        }

        if self.command.is_some() && !self.drivers.iter().any(|d| d == "ssh") {
            eprintln!("WARNING: NETSUP_COMMAND is set but the ssh driver is not enabled");
        }

        self.monitor_config().validate()?;
        Ok(())
    }

    /// Engine configuration: defaults overlaid with what was set
    fn monitor_config(&self) -> MonitorConfig {
        let mut config = MonitorConfig::new();

        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval_secs = secs;
        }
        if let Some(ms) = self.probe_timeout_ms {
            config.probe_timeout_ms = ms;
        }
        if let Some(threshold) = self.failure_threshold {
            config.failure_threshold = threshold;
        }
        if let Some(size) = self.worker_pool_size {
            config.worker_pool_size = size;
        }

        config.discovery_ranges = self.discovery_ranges.clone();
        config.discovery.enabled = !self.discovery_ranges.is_empty();
        if let Some(secs) = self.discovery_interval_secs {
            config.discovery.interval_secs = secs;
        }

        if let Some(community) = &self.snmp_community {
            config.probes.snmp_community = community.clone();
        }
        if !self.snmp_oids.is_empty() {
            config.probes.snmp_oids = self.snmp_oids.clone();
        }
        config.probes.command = self.command.clone();
        if let Some(ports) = &self.tcp_ports {
            config.probes.tcp_ports = ports.clone();
        }

        config.drivers = self
            .drivers
            .iter()
            .filter_map(|name| DriverConfig::builtin(name))
            .collect();

        config
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| anyhow!("{} has an invalid value '{}': {}", name, raw, e))
}

fn parse_opt<T>(name: &str, raw: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    raw.map(|raw| parse_value(name, &raw)).transpose()
}

/// Drivers compiled into this build
fn compiled_drivers() -> Vec<&'static str> {
    let mut drivers = Vec::new();
    #[cfg(feature = "icmp")]
    drivers.push("icmp");
    #[cfg(feature = "snmp")]
    drivers.push("snmp");
    #[cfg(feature = "ssh")]
    drivers.push("ssh");
    #[cfg(feature = "tcp")]
    drivers.push("tcp");
    drivers
}

fn register_drivers(registry: &DriverRegistry) {
    #[cfg(feature = "icmp")]
    netsup_probe_icmp::register(registry);
    #[cfg(feature = "snmp")]
    netsup_probe_snmp::register(registry);
    #[cfg(feature = "ssh")]
    netsup_probe_ssh::register(registry);
    #[cfg(feature = "tcp")]
    netsup_probe_tcp::register(registry);
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return NetsupExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return NetsupExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return NetsupExitCode::ConfigError.into();
    }

    info!("Starting netsupd daemon");
    info!(
        "Configuration loaded: drivers [{}], {} discovery range(s)",
        config.drivers.join(", "),
        config.discovery_ranges.len()
    );

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return NetsupExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        let engine = match build_engine(&config).await {
            Ok(engine) => engine,
            Err(e) => {
                error!("Startup error: {}", e);
                return NetsupExitCode::ConfigError;
            }
        };

        if let Err(e) = run_daemon(engine).await {
            error!("Daemon error: {}", e);
            NetsupExitCode::RuntimeError
        } else {
            NetsupExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Wire drivers, inventory and sink into an engine
async fn build_engine(config: &Config) -> Result<MonitorEngine> {
    let registry = DriverRegistry::new();
    register_drivers(&registry);
    info!("Registered drivers: {}", registry.list_drivers().join(", "));

    let monitor_config = config.monitor_config();
    let drivers = registry.create_all(&monitor_config.drivers)?;

    let inventory = match &config.inventory_path {
        Some(path) => {
            let inventory = StaticInventory::from_path(path).await?;
            info!(
                "Inventory loaded from {}: {} device(s)",
                path.display(),
                inventory.len()
            );
            inventory
        }
        None => {
            warn!("NETSUP_INVENTORY_PATH is not set, only discovered devices will be monitored");
            StaticInventory::empty()
        }
    };

    if inventory.is_empty() && monitor_config.discovery_ranges.is_empty() {
        warn!("No inventory devices and no discovery ranges: nothing to monitor");
    }

    let engine = MonitorEngine::new(
        drivers,
        Box::new(inventory),
        Box::new(LogSink::new()),
        monitor_config,
    )?;
    Ok(engine)
}

/// Run the engine until a shutdown signal
async fn run_daemon(engine: MonitorEngine) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let mut run = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_with_shutdown(Some(shutdown_rx)).await }
    });

    info!("Daemon initialized successfully");

    tokio::select! {
        joined = &mut run => {
            // The engine only stops by itself on a fatal error
            return match joined {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(e) => Err(anyhow!("Engine task failed: {}", e)),
            };
        }
        signal = wait_for_shutdown() => {
            info!("Received shutdown signal: {}", signal?);
        }
    }

    info!("Shutting down daemon");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE, run).await {
        Ok(Ok(result)) => result.map_err(anyhow::Error::from),
        Ok(Err(e)) => Err(anyhow!("Engine task failed: {}", e)),
        Err(_) => Err(anyhow!("Shutdown timeout after {:?}", SHUTDOWN_GRACE)),
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// # Returns
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
