//! Address encoding and CIDR arithmetic.
//!
//! Storage keys never contain the usual textual address forms: dotted IPv4
//! and compressed IPv6 do not sort lexicographically in address order. Keys
//! use a canonical form instead — zero-padded decimal octets for IPv4 and
//! fixed-width hex byte pairs for IPv6, separated by `/` — which sorts the
//! same way the addresses do.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;

use crate::error::{Error, Result};

/// Smallest IPv4 subnet tracked by a single bitmap block.
pub const MIN_IPV4_BLOCK_PREFIX: u8 = 24;
/// Smallest IPv6 subnet tracked by a single bitmap block.
pub const MIN_IPV6_BLOCK_PREFIX: u8 = 112;

/// Canonical textual form used inside storage keys.
///
/// IPv4 `10.0.0.1` becomes `010/000/000/001`; IPv6 `2001:db8::1` becomes
/// `2001/0db8/0000/0000/0000/0000/0000/0001`.
pub fn canonical_addr(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{:03}/{:03}/{:03}/{:03}", o[0], o[1], o[2], o[3])
        }
        IpAddr::V6(v6) => v6
            .octets()
            .chunks(2)
            .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
            .collect::<Vec<_>>()
            .join("/"),
    }
}

/// Inverse of [`canonical_addr`].
pub fn parse_canonical(s: &str) -> Result<IpAddr> {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.len() {
        4 => {
            let mut octets = [0u8; 4];
            for (i, part) in parts.iter().enumerate() {
                octets[i] = part.parse::<u8>().map_err(|_| {
                    Error::invalid_argument("address", format!("bad canonical octet '{part}'"))
                })?;
            }
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        8 => {
            let mut segments = [0u16; 8];
            for (i, part) in parts.iter().enumerate() {
                segments[i] = u16::from_str_radix(part, 16).map_err(|_| {
                    Error::invalid_argument("address", format!("bad canonical group '{part}'"))
                })?;
            }
            Ok(IpAddr::V6(Ipv6Addr::from(segments)))
        }
        _ => Err(Error::invalid_argument(
            "address",
            format!("'{s}' is not a canonical address"),
        )),
    }
}

/// Parse an IP literal, rejecting the empty string with a typed error.
pub fn parse_ip(s: &str) -> Result<IpAddr> {
    s.parse::<IpAddr>()
        .map_err(|_| Error::invalid_argument("address", format!("'{s}' is not an IP address")))
}

/// Parse a CIDR literal. The prefix must already be masked: `10.0.1.0/16`
/// is rejected, `10.0.0.0/16` accepted.
pub fn parse_cidr(s: &str) -> Result<IpNet> {
    let net = s
        .parse::<IpNet>()
        .map_err(|_| Error::invalid_argument("cidr", format!("'{s}' is not a CIDR")))?;
    if net != net.trunc() {
        return Err(Error::invalid_argument(
            "cidr",
            format!("'{s}' has host bits set"),
        ));
    }
    Ok(net)
}

/// Number of bits in the address family (32 or 128).
pub fn family_bits(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Prefix length of the bitmap blocks a network is carved into. Networks
/// smaller than the minimum block size get a single block of their own size.
pub fn block_prefix(net: &IpNet) -> u8 {
    let min = match net {
        IpNet::V4(_) => MIN_IPV4_BLOCK_PREFIX,
        IpNet::V6(_) => MIN_IPV6_BLOCK_PREFIX,
    };
    min.max(net.prefix_len())
}

/// The address interpreted as an unsigned integer.
pub fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Rebuild an address of the same family as `family` from an integer.
pub fn u128_to_addr(family: IpAddr, value: u128) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// `addr + n`, or `None` when the family's address space overflows.
pub fn addr_add(addr: IpAddr, n: u128) -> Option<IpAddr> {
    let value = addr_to_u128(addr).checked_add(n)?;
    match addr {
        IpAddr::V4(_) if value > u32::MAX as u128 => None,
        _ => Some(u128_to_addr(addr, value)),
    }
}

/// Mask `addr` down to the network address of its containing `prefix` block.
pub fn mask_to_prefix(addr: IpAddr, prefix: u8) -> IpAddr {
    let bits = family_bits(addr);
    let host_bits = u32::from(bits - prefix);
    let value = addr_to_u128(addr);
    let masked = if host_bits >= 128 {
        0
    } else {
        value >> host_bits << host_bits
    };
    u128_to_addr(addr, masked)
}

/// First (network) address of a CIDR.
pub fn first_addr(net: &IpNet) -> IpAddr {
    net.network()
}

/// Last (broadcast) address of a CIDR.
pub fn last_addr(net: &IpNet) -> IpAddr {
    net.broadcast()
}

/// Iterator over every address in a CIDR, network and broadcast included.
/// Used by the bulk-allocate walk.
pub struct CidrWalk {
    next: Option<IpAddr>,
    last: IpAddr,
}

impl CidrWalk {
    pub fn new(net: &IpNet) -> Self {
        Self {
            next: Some(net.network()),
            last: net.broadcast(),
        }
    }
}

impl Iterator for CidrWalk {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let current = self.next?;
        self.next = if current == self.last {
            None
        } else {
            addr_add(current, 1)
        };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn canonical_ipv4() {
        let addr = IpAddr::from_str("10.0.2.15").unwrap();
        assert_eq!(canonical_addr(addr), "010/000/002/015");
        assert_eq!(parse_canonical("010/000/002/015").unwrap(), addr);
    }

    #[test]
    fn canonical_ipv6() {
        let addr = IpAddr::from_str("2001:db8::1").unwrap();
        assert_eq!(
            canonical_addr(addr),
            "2001/0db8/0000/0000/0000/0000/0000/0001"
        );
        assert_eq!(
            parse_canonical("2001/0db8/0000/0000/0000/0000/0000/0001").unwrap(),
            addr
        );
    }

    #[test]
    fn canonical_sorts_in_address_order() {
        let a = IpAddr::from_str("10.0.2.9").unwrap();
        let b = IpAddr::from_str("10.0.10.1").unwrap();
        // Dotted form would sort these the wrong way round.
        assert!(canonical_addr(a) < canonical_addr(b));
    }

    #[test]
    fn cidr_must_be_masked() {
        assert!(parse_cidr("10.0.0.0/16").is_ok());
        assert!(parse_cidr("10.0.1.0/16").is_err());
        assert!(parse_cidr("not-a-cidr").is_err());
    }

    #[test]
    fn block_prefix_clamps_to_network_size() {
        let wide = IpNet::from_str("10.0.0.0/16").unwrap();
        let narrow = IpNet::from_str("10.0.0.8/29").unwrap();
        let v6 = IpNet::from_str("2001:db8::/64").unwrap();
        assert_eq!(block_prefix(&wide), 24);
        assert_eq!(block_prefix(&narrow), 29);
        assert_eq!(block_prefix(&v6), 112);
    }

    #[test]
    fn mask_and_add() {
        let addr = IpAddr::from_str("10.0.3.77").unwrap();
        assert_eq!(
            mask_to_prefix(addr, 24),
            IpAddr::from_str("10.0.3.0").unwrap()
        );
        assert_eq!(
            addr_add(IpAddr::from_str("10.0.3.0").unwrap(), 256).unwrap(),
            IpAddr::from_str("10.0.4.0").unwrap()
        );
        assert!(addr_add(IpAddr::from_str("255.255.255.255").unwrap(), 1).is_none());
    }

    #[test]
    fn cidr_walk_covers_whole_block() {
        let net = IpNet::from_str("192.168.1.0/30").unwrap();
        let addrs: Vec<IpAddr> = CidrWalk::new(&net).collect();
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[0], IpAddr::from_str("192.168.1.0").unwrap());
        assert_eq!(addrs[3], IpAddr::from_str("192.168.1.3").unwrap());
    }
}
