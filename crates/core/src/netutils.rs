use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::errors::{SnerError, SnerResult};

/// Upper bound on addresses a single enumeration call may yield.
const ENUM_LIMIT: u128 = 1 << 24;

/// Computes the rate-limit heatmap bucket key. Parseable IPv4 addresses
/// map to their /24 network, IPv6 to /48; anything else (URLs, hostnames,
/// sixenum specs) hashes to itself.
pub fn hashval(value: &str) -> String {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => {
            let network = Ipv4Addr::from(u32::from(addr) & v4_mask(24));
            format!("{network}/24")
        }
        Ok(IpAddr::V6(addr)) => {
            let network = Ipv6Addr::from(u128::from(addr) & v6_mask(48));
            format!("{network}/48")
        }
        Err(_) => value.to_string(),
    }
}

/// Wrap IPv6 addresses in brackets for proto://host:port specs.
pub fn format_host_address(address: &str) -> String {
    if address.contains(':') {
        format!("[{address}]")
    } else {
        address.to_string()
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// CIDR network; parsing is non-strict, host bits are masked away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrNet {
    network: IpAddr,
    prefix: u8,
}

impl CidrNet {
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(network), IpAddr::V4(addr)) => {
                u32::from(*addr) & v4_mask(self.prefix) == u32::from(network)
            }
            (IpAddr::V6(network), IpAddr::V6(addr)) => {
                u128::from(*addr) & v6_mask(self.prefix) == u128::from(network)
            }
            _ => false,
        }
    }
}

impl std::str::FromStr for CidrNet {
    type Err = SnerError;

    fn from_str(value: &str) -> SnerResult<Self> {
        let (addr_part, prefix_part) = match value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (value, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|_| SnerError::Parse(format!("invalid network: {value}")))?;
        let max_prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix: u8 = match prefix_part {
            Some(prefix) => prefix
                .parse()
                .map_err(|_| SnerError::Parse(format!("invalid prefix: {value}")))?,
            None => max_prefix,
        };
        if prefix > max_prefix {
            return Err(SnerError::Parse(format!("invalid prefix: {value}")));
        }
        let network = match addr {
            IpAddr::V4(addr) => IpAddr::V4(Ipv4Addr::from(u32::from(addr) & v4_mask(prefix))),
            IpAddr::V6(addr) => IpAddr::V6(Ipv6Addr::from(u128::from(addr) & v6_mask(prefix))),
        };
        Ok(CidrNet { network, prefix })
    }
}

impl std::fmt::Display for CidrNet {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{}/{}", self.network, self.prefix)
    }
}

/// Enumerate all addresses of a network. Single addresses yield themselves,
/// point-to-point links both ends, anything larger the full range including
/// network and broadcast addresses.
pub fn enumerate_network(arg: &str) -> SnerResult<Vec<String>> {
    let net: CidrNet = arg.parse()?;

    match net.network {
        IpAddr::V4(network) => {
            let count = 1u128 << (32 - u32::from(net.prefix));
            if count > ENUM_LIMIT {
                return Err(SnerError::Parse(format!("network too large: {arg}")));
            }
            let base = u32::from(network);
            Ok((0..count as u32)
                .map(|offset| Ipv4Addr::from(base + offset).to_string())
                .collect())
        }
        IpAddr::V6(network) => {
            let count = if net.prefix >= 128 {
                1
            } else {
                1u128
                    .checked_shl(u32::from(128 - net.prefix))
                    .unwrap_or(u128::MAX)
            };
            if count > ENUM_LIMIT {
                return Err(SnerError::Parse(format!("network too large: {arg}")));
            }
            let base = u128::from(network);
            Ok((0..count)
                .map(|offset| Ipv6Addr::from(base + offset).to_string())
                .collect())
        }
    }
}

/// Summarize an address range into the minimal list of CIDR networks.
pub fn range_to_cidrs(start: &str, end: &str) -> SnerResult<Vec<String>> {
    let start: IpAddr = start
        .parse()
        .map_err(|_| SnerError::Parse(format!("invalid address: {start}")))?;
    let end: IpAddr = end
        .parse()
        .map_err(|_| SnerError::Parse(format!("invalid address: {end}")))?;

    match (start, end) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            Ok(summarize(u32::from(start) as u128, u32::from(end) as u128, 32)
                .into_iter()
                .map(|(addr, prefix)| format!("{}/{}", Ipv4Addr::from(addr as u32), prefix))
                .collect())
        }
        (IpAddr::V6(start), IpAddr::V6(end)) => {
            Ok(summarize(u128::from(start), u128::from(end), 128)
                .into_iter()
                .map(|(addr, prefix)| format!("{}/{}", Ipv6Addr::from(addr), prefix))
                .collect())
        }
        _ => Err(SnerError::Parse("mixed address families".to_string())),
    }
}

fn summarize(mut start: u128, end: u128, bits: u8) -> Vec<(u128, u8)> {
    let mut cidrs = Vec::new();
    if start > end {
        return cidrs;
    }
    if start == 0 && end == u128::MAX {
        cidrs.push((0, 0));
        return cidrs;
    }

    loop {
        // largest aligned block starting at `start` that fits in the range
        let align = if start == 0 {
            u32::from(bits)
        } else {
            start.trailing_zeros().min(u32::from(bits))
        };
        let remaining = end - start + 1;
        let span = 128 - remaining.leading_zeros() - 1; // floor(log2(remaining))
        let block = align.min(span);
        cidrs.push((start, bits - block as u8));

        let size = 1u128 << block;
        if end - start + 1 == size {
            break;
        }
        start += size;
    }

    cidrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashval_buckets() {
        assert_eq!(hashval("127.0.0.1"), "127.0.0.0/24");
        assert_eq!(hashval("127.0.1.20"), "127.0.1.0/24");
        assert_eq!(
            hashval("2001:db8:aa:bb::1"),
            "2001:db8:aa::/48"
        );
        assert_eq!(hashval("tcp://127.0.0.1:443"), "tcp://127.0.0.1:443");
        assert_eq!(hashval("hostname.example.com"), "hostname.example.com");
    }

    #[test]
    fn format_host_address_wraps_v6() {
        assert_eq!(format_host_address("127.0.0.1"), "127.0.0.1");
        assert_eq!(format_host_address("::1"), "[::1]");
    }

    #[test]
    fn cidr_contains() {
        let net: CidrNet = "127.66.66.0/26".parse().unwrap();
        assert!(net.contains(&"127.66.66.1".parse().unwrap()));
        assert!(net.contains(&"127.66.66.63".parse().unwrap()));
        assert!(!net.contains(&"127.66.66.64".parse().unwrap()));
        assert!(!net.contains(&"::1".parse().unwrap()));

        let net: CidrNet = "2001:db8::/32".parse().unwrap();
        assert!(net.contains(&"2001:db8::1".parse().unwrap()));
        assert!(!net.contains(&"2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn cidr_masks_host_bits() {
        let net: CidrNet = "10.0.0.20/24".parse().unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/24");
        assert!("10.0.0.0/33".parse::<CidrNet>().is_err());
        assert!("notanet".parse::<CidrNet>().is_err());
    }

    #[test]
    fn enumerate_single_and_p2p() {
        assert_eq!(enumerate_network("10.0.0.1/32").unwrap(), vec!["10.0.0.1"]);
        assert_eq!(
            enumerate_network("10.0.0.0/31").unwrap(),
            vec!["10.0.0.0", "10.0.0.1"]
        );
    }

    #[test]
    fn enumerate_full_range() {
        let addrs = enumerate_network("192.0.2.0/30").unwrap();
        assert_eq!(
            addrs,
            vec!["192.0.2.0", "192.0.2.1", "192.0.2.2", "192.0.2.3"]
        );

        let addrs = enumerate_network("2001:db8::/126").unwrap();
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[0], "2001:db8::");
    }

    #[test]
    fn enumerate_refuses_huge_networks() {
        assert!(enumerate_network("2001:db8::/48").is_err());
    }

    #[test]
    fn range_summarization() {
        assert_eq!(
            range_to_cidrs("192.0.2.0", "192.0.2.255").unwrap(),
            vec!["192.0.2.0/24"]
        );
        assert_eq!(
            range_to_cidrs("192.0.2.1", "192.0.2.2").unwrap(),
            vec!["192.0.2.1/32", "192.0.2.2/32"]
        );
        assert_eq!(
            range_to_cidrs("10.0.0.0", "10.0.1.127").unwrap(),
            vec!["10.0.0.0/24", "10.0.1.0/25"]
        );
    }
}
