//! Bitmap block: the in-memory allocator for one minimum-size subnet.
//!
//! A block tracks every address of its subnet in a packed bit array, one bit
//! per address, MSB of byte 0 being the lowest address. The `tick` cursor
//! remembers where the last allocation happened so scans resume past it; it
//! is only a hint and never affects correctness. Blocks serialize to
//! `{subnet, bitset (hex), tick, allocated}` — this JSON form is the exact
//! value stored under the allocator's `allocations/` keys.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::addr::{addr_to_u128, family_bits, u128_to_addr};
use crate::error::{Error, Result};

/// In-memory allocator state for one fixed-size subnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BlockRepr", into = "BlockRepr")]
pub struct BitmapBlock {
    subnet: IpNet,
    bitset: Vec<u8>,
    tick: usize,
    allocated: usize,
}

/// Wire form of a block.
#[derive(Debug, Serialize, Deserialize)]
struct BlockRepr {
    subnet: String,
    bitset: String,
    tick: u64,
    allocated: u64,
}

impl From<BitmapBlock> for BlockRepr {
    fn from(block: BitmapBlock) -> Self {
        BlockRepr {
            subnet: block.subnet.to_string(),
            bitset: hex::encode(&block.bitset),
            tick: block.tick as u64,
            allocated: block.allocated as u64,
        }
    }
}

impl TryFrom<BlockRepr> for BitmapBlock {
    type Error = Error;

    fn try_from(repr: BlockRepr) -> Result<Self> {
        let subnet: IpNet = repr
            .subnet
            .parse()
            .map_err(|_| Error::invalid_argument("subnet", format!("'{}'", repr.subnet)))?;
        if BitmapBlock::host_bits(&subnet) > 16 {
            return Err(Error::invalid_argument(
                "subnet",
                format!("'{}' is larger than a minimum-size block", subnet),
            ));
        }
        let bitset = hex::decode(&repr.bitset)
            .map_err(|_| Error::invalid_argument("bitset", "not valid hex"))?;
        let expected = BitmapBlock::bitset_len(&subnet);
        if bitset.len() != expected {
            return Err(Error::invalid_argument(
                "bitset",
                format!(
                    "length {} does not match subnet {} (expected {})",
                    bitset.len(),
                    subnet,
                    expected
                ),
            ));
        }
        let bits = 1u64 << BitmapBlock::host_bits(&subnet);
        if repr.allocated > bits {
            return Err(Error::invalid_argument(
                "allocated",
                format!("{} exceeds block size {}", repr.allocated, bits),
            ));
        }
        Ok(BitmapBlock {
            subnet,
            bitset,
            tick: repr.tick as usize,
            allocated: repr.allocated as usize,
        })
    }
}

impl BitmapBlock {
    fn host_bits(subnet: &IpNet) -> u8 {
        subnet.max_prefix_len() - subnet.prefix_len()
    }

    fn bitset_len(subnet: &IpNet) -> usize {
        (1usize << Self::host_bits(subnet)).div_ceil(8)
    }

    /// Create an empty block. `set_first`/`set_last` pre-mark the network's
    /// first and last addresses when they fall inside this subnet, keeping
    /// the usual network and broadcast addresses out of circulation.
    pub fn new(subnet: IpNet, set_first: Option<IpAddr>, set_last: Option<IpAddr>) -> Self {
        let mut block = Self {
            subnet,
            bitset: vec![0u8; Self::bitset_len(&subnet)],
            tick: 0,
            allocated: 0,
        };
        if let Some(addr) = set_first {
            if block.contains(addr) {
                let pos = block.bit_position(addr);
                block.set_bit(pos);
                block.allocated += 1;
            }
        }
        if let Some(addr) = set_last {
            if block.contains(addr) {
                let pos = block.bit_position(addr);
                if !block.test_bit(pos) {
                    block.set_bit(pos);
                    block.allocated += 1;
                }
            }
        }
        block
    }

    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.subnet.contains(&addr)
    }

    /// Total number of addresses the block tracks.
    pub fn size(&self) -> usize {
        1usize << Self::host_bits(&self.subnet)
    }

    /// Number of unallocated addresses left.
    pub fn available(&self) -> usize {
        self.size() - self.allocated
    }

    /// Hand out the first free address found after the tick cursor,
    /// wrapping to a front-scan when the tail is exhausted. Returns `None`
    /// iff every bit is set.
    pub fn request(&mut self) -> Option<IpAddr> {
        if self.available() == 0 {
            return None;
        }

        for pos in (self.tick + 1)..self.size() {
            if !self.test_bit(pos) {
                self.set_bit(pos);
                self.tick = pos;
                self.allocated += 1;
                return Some(self.addr_at(pos));
            }
        }

        for pos in 0..self.size() {
            if !self.test_bit(pos) {
                self.set_bit(pos);
                self.tick = pos;
                self.allocated += 1;
                return Some(self.addr_at(pos));
            }
        }

        None
    }

    /// All-or-nothing bulk form of [`request`](Self::request).
    pub fn bulk_request(&mut self, count: usize) -> Option<Vec<IpAddr>> {
        if count > self.available() {
            return None;
        }
        let mut addrs = Vec::with_capacity(count);
        for _ in 0..count {
            // Available was checked up front, so this cannot run dry.
            match self.request() {
                Some(addr) => addrs.push(addr),
                None => return None,
            }
        }
        Some(addrs)
    }

    /// Mark a specific address as owned. Fails when the address is outside
    /// the subnet or already taken.
    pub fn claim(&mut self, addr: IpAddr) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let pos = self.bit_position(addr);
        if self.test_bit(pos) {
            return false;
        }
        self.set_bit(pos);
        self.allocated += 1;
        true
    }

    /// Return an address to the free set. Idempotent; releasing a free or
    /// out-of-subnet address is a no-op.
    pub fn release(&mut self, addr: IpAddr) {
        if !self.contains(addr) {
            return;
        }
        let pos = self.bit_position(addr);
        if self.test_bit(pos) {
            self.clear_bit(pos);
            self.allocated -= 1;
        }
    }

    /// Bit index of an address: its host suffix interpreted as an integer.
    fn bit_position(&self, addr: IpAddr) -> usize {
        let host_bits = self.subnet.max_prefix_len() - self.subnet.prefix_len();
        let mask = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        (addr_to_u128(addr) & mask) as usize
    }

    /// Address at a bit index: the host bits OR-ed into the subnet base.
    fn addr_at(&self, pos: usize) -> IpAddr {
        let base = self.subnet.network();
        debug_assert_eq!(family_bits(base), self.subnet.max_prefix_len());
        u128_to_addr(base, addr_to_u128(base) | pos as u128)
    }

    fn test_bit(&self, pos: usize) -> bool {
        self.bitset[pos / 8] & (1 << (7 - (pos % 8))) != 0
    }

    fn set_bit(&mut self, pos: usize) {
        self.bitset[pos / 8] |= 1 << (7 - (pos % 8));
    }

    fn clear_bit(&mut self, pos: usize) {
        self.bitset[pos / 8] &= !(1 << (7 - (pos % 8)));
    }

    #[cfg(test)]
    fn popcount(&self) -> usize {
        self.bitset.iter().map(|b| b.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn block(cidr: &str) -> BitmapBlock {
        BitmapBlock::new(IpNet::from_str(cidr).unwrap(), None, None)
    }

    fn ip(s: &str) -> IpAddr {
        IpAddr::from_str(s).unwrap()
    }

    #[test]
    fn request_skips_released_until_wraparound() {
        let mut b = block("192.168.0.0/24");
        for i in 1..25 {
            assert_eq!(b.request(), Some(ip(&format!("192.168.0.{i}"))));
        }

        b.release(ip("192.168.0.1"));
        b.release(ip("192.168.0.11"));

        // The cursor keeps moving forward; released holes are only found
        // again after the scan wraps.
        assert_eq!(b.request(), Some(ip("192.168.0.25")));
        assert_eq!(b.request(), Some(ip("192.168.0.26")));
    }

    #[test]
    fn ticking_wraps_to_front() {
        let mut b = block("10.0.0.0/29");
        assert_eq!(b.size(), 8);

        assert_eq!(b.request(), Some(ip("10.0.0.1")));
        assert_eq!(b.request(), Some(ip("10.0.0.2")));

        b.release(ip("10.0.0.1"));
        assert_eq!(b.request(), Some(ip("10.0.0.3")));
        assert_eq!(b.request(), Some(ip("10.0.0.4")));
        assert_eq!(b.request(), Some(ip("10.0.0.5")));
        assert_eq!(b.request(), Some(ip("10.0.0.6")));
        assert_eq!(b.request(), Some(ip("10.0.0.7")));

        // Tail exhausted: the wrap pass finds the hole at the front.
        assert_eq!(b.request(), Some(ip("10.0.0.0")));

        b.release(ip("10.0.0.1"));
        b.release(ip("10.0.0.3"));
        assert_eq!(b.request(), Some(ip("10.0.0.1")));
        assert_eq!(b.request(), Some(ip("10.0.0.3")));
        assert_eq!(b.request(), None);
    }

    #[test]
    fn ticking_wraps_ipv6() {
        let mut b = block("2001:db8::/125");
        assert_eq!(b.request(), Some(ip("2001:db8::1")));
        assert_eq!(b.request(), Some(ip("2001:db8::2")));

        b.release(ip("2001:db8::1"));
        assert_eq!(b.request(), Some(ip("2001:db8::3")));
        for expected in ["2001:db8::4", "2001:db8::5", "2001:db8::6", "2001:db8::7"] {
            assert_eq!(b.request(), Some(ip(expected)));
        }
        assert_eq!(b.request(), Some(ip("2001:db8::")));
        assert_eq!(b.request(), Some(ip("2001:db8::1")));
        assert_eq!(b.request(), None);
    }

    #[test]
    fn claim_marks_and_rejects() {
        let mut b = block("10.10.2.0/24");
        assert!(b.claim(ip("10.10.2.1")));
        assert!(!b.claim(ip("10.10.2.1")));
        // Outside the subnet.
        assert!(!b.claim(ip("10.220.2.1")));
        // The claimed address is skipped by request.
        assert_ne!(b.request(), Some(ip("10.10.2.1")));
    }

    #[test]
    fn release_is_idempotent() {
        let mut b = block("10.0.0.0/24");
        let addr = b.request().unwrap();
        assert_eq!(b.available(), 255);
        b.release(addr);
        assert_eq!(b.available(), 256);
        b.release(addr);
        assert_eq!(b.available(), 256);
        b.release(ip("172.16.0.1"));
        assert_eq!(b.available(), 256);
    }

    #[test]
    fn bulk_request_never_partially_succeeds() {
        let mut b = block("10.0.0.0/29");
        assert!(b.bulk_request(9).is_none());
        assert_eq!(b.available(), 8);
        let addrs = b.bulk_request(8).unwrap();
        assert_eq!(addrs.len(), 8);
        assert_eq!(b.available(), 0);
        assert!(b.bulk_request(1).is_none());
    }

    #[test]
    fn first_and_last_preset() {
        let net = IpNet::from_str("10.0.0.0/16").unwrap();
        let first_block = BitmapBlock::new(
            IpNet::from_str("10.0.0.0/24").unwrap(),
            Some(net.network()),
            Some(net.broadcast()),
        );
        assert_eq!(first_block.available(), 255);
        let mut probe = first_block.clone();
        assert!(!probe.claim(ip("10.0.0.0")));

        let last_block = BitmapBlock::new(
            IpNet::from_str("10.0.255.0/24").unwrap(),
            Some(net.network()),
            Some(net.broadcast()),
        );
        assert_eq!(last_block.available(), 255);
        let mut probe = last_block;
        assert!(!probe.claim(ip("10.0.255.255")));

        let middle_block = BitmapBlock::new(
            IpNet::from_str("10.0.7.0/24").unwrap(),
            Some(net.network()),
            Some(net.broadcast()),
        );
        assert_eq!(middle_block.available(), 256);
    }

    #[test]
    fn serialized_form_matches_wire_layout() {
        let mut b = block("10.0.0.0/29");
        b.claim(ip("10.0.0.0"));
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["subnet"], "10.0.0.0/29");
        assert_eq!(json["bitset"], "80");
        assert_eq!(json["allocated"], 1);
    }

    #[test]
    fn rejects_bitset_of_wrong_length() {
        let bad = r#"{"subnet":"10.0.0.0/24","bitset":"ff","tick":0,"allocated":8}"#;
        assert!(serde_json::from_str::<BitmapBlock>(bad).is_err());
    }

    proptest! {
        #[test]
        fn round_trip_preserves_state(taken in prop::collection::btree_set(0u8..=255, 0..64), tick in 0usize..256) {
            let mut b = block("10.0.9.0/24");
            b.tick = tick;
            for suffix in &taken {
                let addr = format!("10.0.9.{}", suffix);
                let claimed = b.claim(ip(&addr));
                prop_assert!(claimed);
            }

            let json = serde_json::to_string(&b).unwrap();
            let back: BitmapBlock = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(&back, &b);
            prop_assert_eq!(back.popcount(), back.allocated);
        }
    }
}
