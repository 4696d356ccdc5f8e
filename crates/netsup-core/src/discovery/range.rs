// # Address Ranges
//
// Discovery sweeps a range of addresses. Three notations are accepted:
//
// - CIDR: `192.168.1.0/24` (every address in the block, network and
//   broadcast included; unreachable ones simply produce no candidate)
// - Span: `10.0.0.10-10.0.0.20` (inclusive)
// - Single address: `10.0.0.1`

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::Error;

/// An inclusive, single-family range of addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    start: IpAddr,
    end: IpAddr,
    label: String,
}

impl AddressRange {
    /// Build a range from two addresses of the same family
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self, Error> {
        let label = if start == end {
            start.to_string()
        } else {
            format!("{}-{}", start, end)
        };
        Self::with_label(start, end, label)
    }

    fn with_label(start: IpAddr, end: IpAddr, label: String) -> Result<Self, Error> {
        match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) if u32::from(s) > u32::from(e) => Err(Error::config(
                format!("address range {} has start after end", label),
            )),
            (IpAddr::V6(s), IpAddr::V6(e)) if u128::from(s) > u128::from(e) => Err(
                Error::config(format!("address range {} has start after end", label)),
            ),
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                Ok(Self { start, end, label })
            }
            _ => Err(Error::config(format!(
                "address range {} mixes IPv4 and IPv6",
                label
            ))),
        }
    }

    /// First address
    pub fn start(&self) -> IpAddr {
        self.start
    }

    /// Last address
    pub fn end(&self) -> IpAddr {
        self.end
    }

    /// Number of addresses in the range
    pub fn len(&self) -> u128 {
        match (self.start, self.end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => u128::from(u32::from(e) - u32::from(s)) + 1,
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                (u128::from(e) - u128::from(s)).saturating_add(1)
            }
            _ => 0,
        }
    }

    /// Ranges always hold at least one address
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the address lies within the range
    pub fn contains(&self, address: IpAddr) -> bool {
        match (self.start, self.end, address.to_canonical()) {
            (IpAddr::V4(s), IpAddr::V4(e), IpAddr::V4(a)) => {
                (u32::from(s)..=u32::from(e)).contains(&u32::from(a))
            }
            (IpAddr::V6(s), IpAddr::V6(e), IpAddr::V6(a)) => {
                (u128::from(s)..=u128::from(e)).contains(&u128::from(a))
            }
            _ => false,
        }
    }

    /// Iterate every address in order
    pub fn iter(&self) -> Box<dyn Iterator<Item = IpAddr> + Send> {
        match (self.start, self.end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => Box::new(
                (u32::from(s)..=u32::from(e)).map(|n| IpAddr::V4(Ipv4Addr::from(n))),
            ),
            (IpAddr::V6(s), IpAddr::V6(e)) => Box::new(
                (u128::from(s)..=u128::from(e)).map(|n| IpAddr::V6(Ipv6Addr::from(n))),
            ),
            _ => Box::new(std::iter::empty()),
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl FromStr for AddressRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err(Error::config("address range cannot be empty"));
        }

        if raw.contains('/') {
            let network: IpNetwork = raw
                .parse()
                .map_err(|e| Error::config(format!("invalid CIDR range {}: {}", raw, e)))?;
            let (start, end) = match network {
                IpNetwork::V4(net) => (IpAddr::V4(net.network()), IpAddr::V4(net.broadcast())),
                IpNetwork::V6(net) => {
                    let first = u128::from(net.network());
                    let host_bits = 128 - u32::from(net.prefix());
                    let last = if host_bits >= 128 {
                        u128::MAX
                    } else {
                        first | ((1u128 << host_bits) - 1)
                    };
                    (
                        IpAddr::V6(Ipv6Addr::from(first)),
                        IpAddr::V6(Ipv6Addr::from(last)),
                    )
                }
            };
            return Self::with_label(start, end, raw.to_string());
        }

        if let Some((a, b)) = raw.split_once('-') {
            let start = parse_addr(a, raw)?;
            let end = parse_addr(b, raw)?;
            return Self::with_label(start, end, raw.to_string());
        }

        let single = parse_addr(raw, raw)?;
        Self::with_label(single, single, raw.to_string())
    }
}

fn parse_addr(part: &str, whole: &str) -> Result<IpAddr, Error> {
    part.trim()
        .parse::<IpAddr>()
        .map(|addr| addr.to_canonical())
        .map_err(|e| Error::config(format!("invalid address in range {}: {}", whole, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_covers_whole_block() {
        let range: AddressRange = "192.168.1.0/30".parse().unwrap();
        let all: Vec<IpAddr> = range.iter().collect();

        assert_eq!(range.len(), 4);
        assert_eq!(all.first(), Some(&ip("192.168.1.0")));
        assert_eq!(all.last(), Some(&ip("192.168.1.3")));
        assert_eq!(range.to_string(), "192.168.1.0/30");
    }

    #[test]
    fn test_cidr_with_host_bits_uses_network() {
        let range: AddressRange = "10.1.2.77/24".parse().unwrap();
        assert_eq!(range.start(), ip("10.1.2.0"));
        assert_eq!(range.end(), ip("10.1.2.255"));
    }

    #[test]
    fn test_span_and_single() {
        let span: AddressRange = "10.0.0.10 - 10.0.0.12".parse().unwrap();
        assert_eq!(span.len(), 3);
        assert!(span.contains(ip("10.0.0.11")));
        assert!(!span.contains(ip("10.0.0.13")));

        let single: AddressRange = "10.0.0.1".parse().unwrap();
        assert_eq!(single.iter().collect::<Vec<_>>(), vec![ip("10.0.0.1")]);
    }

    #[test]
    fn test_ipv6_cidr() {
        let range: AddressRange = "fd00::/126".parse().unwrap();
        assert_eq!(range.len(), 4);
        assert_eq!(range.end(), ip("fd00::3"));
        assert!(!range.contains(ip("10.0.0.1")));
    }

    #[test]
    fn test_malformed_ranges() {
        assert!("".parse::<AddressRange>().is_err());
        assert!("10.0.0.0/40".parse::<AddressRange>().is_err());
        assert!("10.0.0.9-10.0.0.1".parse::<AddressRange>().is_err());
        assert!("10.0.0.1-fd00::1".parse::<AddressRange>().is_err());
        assert!("not-an-address".parse::<AddressRange>().is_err());
    }
}
