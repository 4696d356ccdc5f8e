// # SNMP Driver
//
// This crate provides the SNMP probe: one v2c GET per configured OID against
// the device's agent, collected into an OID -> value map.
//
// ## Failure mapping
//
// - Session cannot be opened, transport error: `AgentUnreachable`
// - Agent reports `authorizationError`/`noAccess`, community mismatch:
//   `AuthenticationRejected`
// - No answer within the budget: `Timeout` (applied by the engine)
//
// An OID the agent does not know (`noSuchObject`, `noSuchInstance`) is left
// out of the map; it does not fail the probe.

use async_trait::async_trait;
use netsup_core::config::DriverConfig;
use netsup_core::device::Protocol;
use netsup_core::error::ProbeError;
use netsup_core::traits::{ProbeDriver, ProbeDriverFactory, ProbeOptions, ProbePayload};
use netsup_core::{DriverRegistry, Error, Result};
use snmp2::{AsyncSession, Oid, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// Standard SNMP agent port
pub const DEFAULT_SNMP_PORT: u16 = 161;

// SNMP error-status codes (RFC 3416)
const STATUS_NO_ERROR: u32 = 0;
const STATUS_NO_SUCH_NAME: u32 = 2;
const STATUS_NO_ACCESS: u32 = 6;
const STATUS_AUTHORIZATION_ERROR: u32 = 16;

/// SNMP v2c GET driver
#[derive(Debug, Clone)]
pub struct SnmpDriver {
    port: u16,
}

impl SnmpDriver {
    /// Create a driver talking to agents on `port`
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for SnmpDriver {
    fn default() -> Self {
        Self::new(DEFAULT_SNMP_PORT)
    }
}

#[async_trait]
impl ProbeDriver for SnmpDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Snmp
    }

    async fn probe(
        &self,
        address: IpAddr,
        _timeout: Duration,
        options: &ProbeOptions,
    ) -> std::result::Result<ProbePayload, ProbeError> {
        let oids = options
            .snmp_oids
            .iter()
            .map(|raw| parse_oid(raw))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let target = SocketAddr::new(address, self.port).to_string();
        let mut session =
            AsyncSession::new_v2c(&target, options.snmp_community.as_bytes(), 0)
                .await
                .map_err(|e| ProbeError::AgentUnreachable(e.to_string()))?;

        let mut values = BTreeMap::new();
        for parts in &oids {
            let key = canonical_oid(parts);
            let oid = Oid::from(parts.as_slice())
                .map_err(|e| ProbeError::Driver(format!("invalid OID {}: {:?}", key, e)))?;

            let mut response = session
                .get(&oid)
                .await
                .map_err(|e| classify_snmp_error(&format!("{:?}", e)))?;

            if let Some(error) = status_error(response.error_status) {
                return Err(error);
            }
            match response.varbinds.next() {
                Some((_, value)) => match format_value(&value) {
                    Some(text) => {
                        values.insert(key, text);
                    }
                    None => debug!("{} has no value for {}", address, key),
                },
                None => debug!("{} returned no varbind for {}", address, key),
            }
        }

        Ok(ProbePayload::Snmp { values })
    }

    fn applies_to(&self, options: &ProbeOptions) -> bool {
        !options.snmp_oids.is_empty()
    }

    fn driver_name(&self) -> &'static str {
        "snmp"
    }
}

/// Parse a dotted OID (`1.3.6.1.2.1.1.1.0`, leading dot allowed)
pub fn parse_oid(raw: &str) -> std::result::Result<Vec<u64>, ProbeError> {
    let trimmed = raw.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return Err(ProbeError::Driver("empty OID".to_string()));
    }
    let parts = trimmed
        .split('.')
        .map(|arc| arc.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| ProbeError::Driver(format!("invalid OID: {}", raw)))?;
    if parts.len() < 2 {
        return Err(ProbeError::Driver(format!("OID too short: {}", raw)));
    }
    Ok(parts)
}

fn canonical_oid(parts: &[u64]) -> String {
    parts
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Map a transport-level SNMP error description to a probe error
pub fn classify_snmp_error(detail: &str) -> ProbeError {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("community") || lower.contains("auth") {
        ProbeError::AuthenticationRejected
    } else if lower.contains("timedout") || lower.contains("timed out") || lower.contains("timeout")
    {
        ProbeError::Timeout
    } else {
        ProbeError::AgentUnreachable(detail.to_string())
    }
}

/// Map a response error-status to a probe error
///
/// `noSuchName` is tolerated like the v2 `noSuch*` values.
fn status_error(status: u32) -> Option<ProbeError> {
    match status {
        STATUS_NO_ERROR | STATUS_NO_SUCH_NAME => None,
        STATUS_NO_ACCESS | STATUS_AUTHORIZATION_ERROR => Some(ProbeError::AuthenticationRejected),
        other => Some(ProbeError::AgentUnreachable(format!(
            "agent returned error status {}",
            other
        ))),
    }
}

/// Render a varbind value; `None` for the "no such" markers
pub fn format_value(value: &Value<'_>) -> Option<String> {
    match value {
        Value::OctetString(bytes) => Some(String::from_utf8_lossy(bytes).trim().to_string()),
        Value::Integer(n) => Some(n.to_string()),
        Value::Counter32(n) | Value::Unsigned32(n) | Value::Timeticks(n) => Some(n.to_string()),
        Value::Counter64(n) => Some(n.to_string()),
        Value::IpAddress(octets) => Some(Ipv4Addr::from(*octets).to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Null | Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView => None,
        other => Some(format!("{:?}", other)),
    }
}

/// Factory for creating SNMP drivers
pub struct SnmpFactory;

impl ProbeDriverFactory for SnmpFactory {
    fn create(&self, config: &DriverConfig) -> Result<Box<dyn ProbeDriver>> {
        match config {
            DriverConfig::Snmp { port } => Ok(Box::new(SnmpDriver::new(*port))),
            _ => Err(Error::config("Invalid config for SNMP driver")),
        }
    }
}

/// Register the SNMP driver with a registry
pub fn register(registry: &DriverRegistry) {
    registry.register_driver("snmp", Box::new(SnmpFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_oid() {
        assert_eq!(
            parse_oid("1.3.6.1.2.1.1.1.0").unwrap(),
            vec![1, 3, 6, 1, 2, 1, 1, 1, 0]
        );
        assert_eq!(parse_oid(".1.3.6.1").unwrap(), vec![1, 3, 6, 1]);
        assert!(parse_oid("").is_err());
        assert!(parse_oid("1").is_err());
        assert!(parse_oid("1.3.six.1").is_err());
        assert!(parse_oid("1..3").is_err());
    }

    #[test]
    fn test_canonical_oid_drops_leading_dot() {
        let parts = parse_oid(".1.3.6.1.2.1.1.5.0").unwrap();
        assert_eq!(canonical_oid(&parts), "1.3.6.1.2.1.1.5.0");
    }

    #[test]
    fn test_classify_snmp_error() {
        assert_eq!(
            classify_snmp_error("CommunityMismatch"),
            ProbeError::AuthenticationRejected
        );
        assert_eq!(
            classify_snmp_error("Os { code: 110, kind: TimedOut }"),
            ProbeError::Timeout
        );
        assert!(matches!(
            classify_snmp_error("Receive"),
            ProbeError::AgentUnreachable(_)
        ));
    }

    #[test]
    fn test_status_error() {
        assert_eq!(status_error(0), None);
        assert_eq!(status_error(2), None);
        assert_eq!(status_error(16), Some(ProbeError::AuthenticationRejected));
        assert_eq!(status_error(6), Some(ProbeError::AuthenticationRejected));
        assert!(matches!(
            status_error(5),
            Some(ProbeError::AgentUnreachable(_))
        ));
    }

    #[test]
    fn test_format_value() {
        assert_eq!(
            format_value(&Value::OctetString(&b"Cisco IOS 15.2 "[..])).as_deref(),
            Some("Cisco IOS 15.2")
        );
        assert_eq!(format_value(&Value::Integer(-4)).as_deref(), Some("-4"));
        assert_eq!(format_value(&Value::Timeticks(123456)).as_deref(), Some("123456"));
        assert_eq!(
            format_value(&Value::IpAddress([10, 0, 0, 1])).as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(format_value(&Value::NoSuchInstance), None);
        assert_eq!(format_value(&Value::EndOfMibView), None);
    }

    #[test]
    fn test_applies_only_with_oids() {
        let driver = SnmpDriver::default();
        assert!(!driver.applies_to(&ProbeOptions::default()));

        let options = ProbeOptions {
            snmp_oids: vec!["1.3.6.1.2.1.1.1.0".to_string()],
            ..ProbeOptions::default()
        };
        assert!(driver.applies_to(&options));
    }

    #[test]
    fn test_factory_creation() {
        let factory = SnmpFactory;
        let driver = factory.create(&DriverConfig::Snmp { port: 1161 }).unwrap();
        assert_eq!(driver.protocol(), Protocol::Snmp);
        assert!(factory.create(&DriverConfig::Tcp).is_err());

        let registry = DriverRegistry::new();
        register(&registry);
        assert!(registry.has_driver("snmp"));
    }

    #[tokio::test]
    async fn test_malformed_oid_fails_before_network() {
        let driver = SnmpDriver::new(DEFAULT_SNMP_PORT);
        let options = ProbeOptions {
            snmp_community: "public".to_string(),
            snmp_oids: vec!["not-an-oid".to_string()],
            ..ProbeOptions::default()
        };
        let result = driver
            .probe("192.0.2.1".parse().unwrap(), Duration::from_millis(100), &options)
            .await;
        assert!(matches!(result, Err(ProbeError::Driver(_))));
    }
}
