// # ICMP Reachability Driver
//
// This crate provides the reachability probe: a few ICMP echo requests to the
// target, success when at least one reply arrives within the budget.
//
// ## Sockets
//
// `surge-ping` opens a raw socket, or an unprivileged datagram socket where
// the kernel allows it (`net.ipv4.ping_group_range` on Linux). The socket is
// opened on first use, so constructing the driver never needs privileges. A
// socket that cannot be opened is reported as `ProbeError::Driver` on every
// probe instead of failing the whole daemon.
//
// ## Attempts
//
// The probe budget is split evenly between attempts. Every attempt is sent,
// and the best round trip is reported.

use async_trait::async_trait;
use netsup_core::config::DriverConfig;
use netsup_core::device::Protocol;
use netsup_core::error::ProbeError;
use netsup_core::traits::{ProbeDriver, ProbeDriverFactory, ProbeOptions, ProbePayload};
use netsup_core::{DriverRegistry, Error, Result};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use surge_ping::{Client, Config, ICMP, IcmpPacket, PingIdentifier, PingSequence, SurgeError};
use tokio::sync::OnceCell;
use tracing::debug;

/// Echo payload size, same as the classic `ping`
const PAYLOAD_SIZE: usize = 56;

/// Shortest per-attempt budget
const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(10);

/// One echo reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reply {
    rtt: Duration,
    ttl: Option<u8>,
}

/// ICMP echo driver
pub struct IcmpDriver {
    attempts: u8,
    v4: OnceCell<Client>,
    v6: OnceCell<Client>,
    next_identifier: AtomicU16,
}

impl std::fmt::Debug for IcmpDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcmpDriver")
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl IcmpDriver {
    /// Create a driver sending `attempts` echo requests per probe
    pub fn new(attempts: u8) -> Self {
        Self {
            attempts: attempts.max(1),
            v4: OnceCell::new(),
            v6: OnceCell::new(),
            next_identifier: AtomicU16::new(std::process::id() as u16),
        }
    }

    async fn client(&self, address: IpAddr) -> std::result::Result<&Client, ProbeError> {
        let (cell, config) = match address {
            IpAddr::V4(_) => (&self.v4, Config::default()),
            IpAddr::V6(_) => (&self.v6, Config::builder().kind(ICMP::V6).build()),
        };
        cell.get_or_try_init(|| async move { Client::new(&config) })
            .await
            .map_err(|e| ProbeError::Driver(format!("ICMP socket unavailable: {}", e)))
    }

    fn identifier(&self) -> PingIdentifier {
        PingIdentifier(self.next_identifier.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl ProbeDriver for IcmpDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Reachability
    }

    async fn probe(
        &self,
        address: IpAddr,
        timeout: Duration,
        _options: &ProbeOptions,
    ) -> std::result::Result<ProbePayload, ProbeError> {
        let client = self.client(address).await?;
        let mut pinger = client.pinger(address, self.identifier()).await;
        pinger.timeout(attempt_timeout(timeout, self.attempts));

        let payload = [0u8; PAYLOAD_SIZE];
        let mut replies = Vec::with_capacity(self.attempts as usize);
        for seq in 0..self.attempts {
            match pinger.ping(PingSequence(u16::from(seq)), &payload).await {
                Ok((packet, rtt)) => {
                    let ttl = match packet {
                        IcmpPacket::V4(p) => p.get_ttl(),
                        IcmpPacket::V6(_) => None,
                    };
                    replies.push(Reply { rtt, ttl });
                }
                Err(SurgeError::Timeout { .. }) => {}
                Err(e) => debug!("Echo {} to {} failed: {}", seq, address, e),
            }
        }

        summarize(&replies)
    }

    fn driver_name(&self) -> &'static str {
        "icmp"
    }
}

/// Budget of one attempt
fn attempt_timeout(total: Duration, attempts: u8) -> Duration {
    (total / u32::from(attempts.max(1))).max(MIN_ATTEMPT_TIMEOUT)
}

/// Fold the replies of one probe into a payload
fn summarize(replies: &[Reply]) -> std::result::Result<ProbePayload, ProbeError> {
    let best = replies
        .iter()
        .min_by_key(|r| r.rtt)
        .ok_or(ProbeError::Unreachable)?;
    Ok(ProbePayload::Reachability {
        rtt: best.rtt,
        replies: u8::try_from(replies.len()).unwrap_or(u8::MAX),
        ttl: best.ttl,
    })
}

/// Factory for creating ICMP drivers
pub struct IcmpFactory;

impl ProbeDriverFactory for IcmpFactory {
    fn create(&self, config: &DriverConfig) -> Result<Box<dyn ProbeDriver>> {
        match config {
            DriverConfig::Icmp { attempts } => Ok(Box::new(IcmpDriver::new(*attempts))),
            _ => Err(Error::config("Invalid config for ICMP driver")),
        }
    }
}

/// Register the ICMP driver with a registry
pub fn register(registry: &DriverRegistry) {
    registry.register_driver("icmp", Box::new(IcmpFactory));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(ms: u64, ttl: Option<u8>) -> Reply {
        Reply {
            rtt: Duration::from_millis(ms),
            ttl,
        }
    }

    #[test]
    fn test_attempt_timeout_splits_budget() {
        assert_eq!(
            attempt_timeout(Duration::from_secs(2), 2),
            Duration::from_secs(1)
        );
        assert_eq!(
            attempt_timeout(Duration::from_millis(1), 4),
            MIN_ATTEMPT_TIMEOUT
        );
        assert_eq!(
            attempt_timeout(Duration::from_millis(300), 0),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn test_no_reply_is_unreachable() {
        assert_eq!(summarize(&[]), Err(ProbeError::Unreachable));
    }

    #[test]
    fn test_best_reply_wins() {
        let payload = summarize(&[reply(12, Some(63)), reply(4, Some(64))]).unwrap();
        assert_eq!(
            payload,
            ProbePayload::Reachability {
                rtt: Duration::from_millis(4),
                replies: 2,
                ttl: Some(64),
            }
        );
    }

    #[test]
    fn test_factory_creation() {
        let factory = IcmpFactory;
        let driver = factory.create(&DriverConfig::Icmp { attempts: 3 }).unwrap();
        assert_eq!(driver.protocol(), Protocol::Reachability);
        assert_eq!(driver.driver_name(), "icmp");

        assert!(factory.create(&DriverConfig::Tcp).is_err());
    }

    #[test]
    fn test_register() {
        let registry = DriverRegistry::new();
        register(&registry);
        assert!(registry.has_driver("icmp"));
    }

    #[test]
    fn test_new_is_lazy() {
        let driver = IcmpDriver::new(0);
        assert_eq!(driver.attempts, 1);
        assert!(driver.v4.get().is_none());
        assert!(driver.v6.get().is_none());
    }
}
