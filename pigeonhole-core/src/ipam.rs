//! Network-level address allocator.
//!
//! An [`Ipam`] owns one network CIDR and lazily carves it into bitmap
//! blocks, materializing each block in the store the first time it is
//! needed. Every mutation is a conditional transaction guarded on the
//! per-key version observed at read time; the compare-and-swap is the only
//! correctness mechanism, and guard failures simply re-read and retry up to
//! a bound. The in-process `next_key` cache is a latency optimization, never
//! a correctness device.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::addr::{
    addr_add, block_prefix, canonical_addr, family_bits, first_addr, last_addr, mask_to_prefix,
    parse_canonical, parse_cidr,
};
use crate::block::BitmapBlock;
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::keys::{ipam_block_key, ipam_blocks_prefix, ipam_cidr_key, ipam_next_key};
use crate::kv::{Compare, KvStore, TxnOp};

/// A block together with the store version it was read at. Committing the
/// block back is only valid while that version still holds.
struct TrackedBlock {
    block: BitmapBlock,
    key: String,
    version: i64,
}

impl TrackedBlock {
    fn compare(&self) -> Compare {
        Compare::VersionEq(self.key.clone(), self.version)
    }

    fn put_op(&self) -> Result<TxnOp> {
        let value = serde_json::to_vec(&self.block)
            .map_err(|e| Error::serialization("encode block", e))?;
        Ok(TxnOp::Put {
            key: self.key.clone(),
            value,
            lease: None,
        })
    }
}

/// Allocator for one network's address space.
pub struct Ipam {
    id: String,
    cidr: IpNet,
    kv: Arc<dyn KvStore>,
    /// Cached copy of the `nextKey` high-water mark.
    next_key: Mutex<IpAddr>,
    config: AllocatorConfig,
}

impl Ipam {
    /// Create a fresh allocator for `cidr` and persist its root keys. The
    /// transaction is guarded on the `nextKey` never having existed, so an
    /// id collision cannot clobber another allocator.
    pub async fn create(
        kv: Arc<dyn KvStore>,
        cidr: &str,
        config: AllocatorConfig,
    ) -> Result<Ipam> {
        let net = parse_cidr(cidr)?;
        let id = Uuid::new_v4().to_string();
        let start = first_addr(&net);

        let committed = kv
            .txn(
                vec![Compare::VersionEq(ipam_next_key(&id), 0)],
                vec![
                    TxnOp::Put {
                        key: ipam_next_key(&id),
                        value: canonical_addr(start).into_bytes(),
                        lease: None,
                    },
                    TxnOp::Put {
                        key: ipam_cidr_key(&id),
                        value: net.to_string().into_bytes(),
                        lease: None,
                    },
                ],
            )
            .await?;
        if !committed {
            return Err(Error::internal(format!(
                "allocator {id} already present in store"
            )));
        }

        debug!(ipam = %id, cidr = %net, "created allocator");
        Ok(Ipam {
            id,
            cidr: net,
            kv,
            next_key: Mutex::new(start),
            config,
        })
    }

    /// Attach to an allocator previously persisted under `id`.
    pub async fn fetch(kv: Arc<dyn KvStore>, id: &str, config: AllocatorConfig) -> Result<Ipam> {
        let cidr_kv = kv
            .get(&ipam_cidr_key(id))
            .await?
            .ok_or_else(|| Error::not_found(format!("allocator {id}")))?;
        let cidr_str = String::from_utf8(cidr_kv.value)
            .map_err(|e| Error::serialization("decode allocator cidr", e))?;
        let cidr = parse_cidr(&cidr_str)?;

        let next_kv = kv
            .get(&ipam_next_key(id))
            .await?
            .ok_or_else(|| Error::not_found(format!("allocator {id} nextKey")))?;
        let next_str = String::from_utf8(next_kv.value)
            .map_err(|e| Error::serialization("decode allocator nextKey", e))?;
        let next = parse_canonical(&next_str)?;

        Ok(Ipam {
            id: id.to_string(),
            cidr,
            kv,
            next_key: Mutex::new(next),
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cidr(&self) -> IpNet {
        self.cidr
    }

    /// Count of all addresses the allocator tracks.
    pub fn size(&self) -> u128 {
        let host_bits = self.cidr.max_prefix_len() - self.cidr.prefix_len();
        if host_bits >= 128 {
            u128::MAX
        } else {
            1u128 << host_bits
        }
    }

    /// Free address count: free bits across materialized blocks plus the
    /// capacity of blocks not yet materialized. Approximate under
    /// contention, eventually consistent.
    pub async fn available(&self) -> Result<u128> {
        let blocks = self.fetch_blocks().await?;
        let allocated: u128 = blocks.iter().map(|b| b.block.size() as u128).sum::<u128>()
            - blocks.iter().map(|b| b.block.available() as u128).sum::<u128>();
        Ok(self.size() - allocated)
    }

    /// Allocate exactly `count` addresses, never inside `reserved`.
    ///
    /// Reads every materialized block, greedily drains available ones in
    /// memory, materializes new blocks as needed, then commits all touched
    /// blocks in one guarded transaction. A guard failure restarts from the
    /// read step.
    pub async fn allocate(&self, count: usize, reserved: &[IpNet]) -> Result<Vec<IpAddr>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        for attempt in 0..self.config.retry_max {
            let blocks = self.fetch_blocks().await?;
            let mut allocated: Vec<IpAddr> = Vec::with_capacity(count);
            let mut to_commit: Vec<TrackedBlock> = Vec::new();

            for mut tracked in blocks {
                if allocated.len() == count {
                    break;
                }
                if tracked.block.available() == 0 {
                    continue;
                }
                if block_fully_reserved(tracked.block.subnet(), reserved) {
                    continue;
                }
                let taken = take_from_block(
                    &mut tracked.block,
                    count - allocated.len(),
                    reserved,
                    &mut allocated,
                );
                if taken > 0 {
                    to_commit.push(tracked);
                }
            }

            let mut restart = false;
            while allocated.len() < count {
                match self.next_block().await {
                    Ok(mut tracked) => {
                        if block_fully_reserved(tracked.block.subnet(), reserved) {
                            continue;
                        }
                        let taken = take_from_block(
                            &mut tracked.block,
                            count - allocated.len(),
                            reserved,
                            &mut allocated,
                        );
                        if taken > 0 {
                            to_commit.push(tracked);
                        }
                    }
                    // A competing allocator may have just materialized the
                    // block we wanted; re-read before concluding anything.
                    Err(e) if e.is_retryable() || matches!(e, Error::Exhausted { .. }) => {
                        if attempt + 1 == self.config.retry_max {
                            return Err(e);
                        }
                        restart = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if restart {
                continue;
            }

            let mut compares = Vec::with_capacity(to_commit.len());
            let mut ops = Vec::with_capacity(to_commit.len());
            for tracked in &to_commit {
                compares.push(tracked.compare());
                ops.push(tracked.put_op()?);
            }

            if self.kv.txn(compares, ops).await? {
                trace!(ipam = %self.id, count, "allocation committed");
                return Ok(allocated);
            }
            debug!(ipam = %self.id, attempt, "allocation guard failed, retrying");
        }

        Err(Error::Conflict {
            operation: format!("allocate {count} addresses from {}", self.id),
        })
    }

    /// Atomically mark one specific address allocated.
    pub async fn claim(&self, addr: IpAddr) -> Result<()> {
        if !self.cidr.contains(&addr) {
            return Err(Error::invalid_argument(
                "address",
                format!("{addr} is outside network {}", self.cidr),
            ));
        }

        for _ in 0..self.config.retry_max {
            let mut tracked = self.fetch_block_for(addr).await?;
            if !tracked.block.claim(addr) {
                return Err(Error::already_exists(format!("address {addr}")));
            }
            if self
                .kv
                .txn(vec![tracked.compare()], vec![tracked.put_op()?])
                .await?
            {
                trace!(ipam = %self.id, %addr, "claim committed");
                return Ok(());
            }
        }

        Err(Error::Conflict {
            operation: format!("claim {addr}"),
        })
    }

    /// Free one address. Idempotent: releasing a free address succeeds.
    pub async fn release(&self, addr: IpAddr) -> Result<()> {
        if !self.cidr.contains(&addr) {
            return Err(Error::invalid_argument(
                "address",
                format!("{addr} is outside network {}", self.cidr),
            ));
        }

        for _ in 0..self.config.retry_max {
            let mut tracked = self.fetch_block_for(addr).await?;
            tracked.block.release(addr);
            if self
                .kv
                .txn(vec![tracked.compare()], vec![tracked.put_op()?])
                .await?
            {
                trace!(ipam = %self.id, %addr, "release committed");
                return Ok(());
            }
        }

        Err(Error::Conflict {
            operation: format!("release {addr}"),
        })
    }

    fn block_prefix(&self) -> u8 {
        block_prefix(&self.cidr)
    }

    /// Empty block for the subnet at `block_addr`, with the network's first
    /// and last addresses pre-marked when they fall inside it.
    fn new_block(&self, block_addr: IpAddr) -> Result<TrackedBlock> {
        let subnet = IpNet::new(block_addr, self.block_prefix())
            .map_err(|e| Error::serialization("build block subnet", e))?
            .trunc();
        let block = BitmapBlock::new(
            subnet,
            Some(first_addr(&self.cidr)),
            Some(last_addr(&self.cidr)),
        );
        Ok(TrackedBlock {
            key: ipam_block_key(&self.id, block_addr),
            block,
            version: 0,
        })
    }

    /// Read all materialized blocks with their versions.
    async fn fetch_blocks(&self) -> Result<Vec<TrackedBlock>> {
        let kvs = self.kv.get_prefix(&ipam_blocks_prefix(&self.id)).await?;
        let mut blocks = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let block: BitmapBlock = serde_json::from_slice(&kv.value)
                .map_err(|e| Error::serialization("decode block", e))?;
            blocks.push(TrackedBlock {
                block,
                key: kv.key,
                version: kv.version,
            });
        }
        Ok(blocks)
    }

    /// Fetch the block containing `addr`, materializing it if absent.
    async fn fetch_block_for(&self, addr: IpAddr) -> Result<TrackedBlock> {
        let block_addr = mask_to_prefix(addr, self.block_prefix());
        let key = ipam_block_key(&self.id, block_addr);

        if let Some(kv) = self.kv.get(&key).await? {
            let block: BitmapBlock = serde_json::from_slice(&kv.value)
                .map_err(|e| Error::serialization("decode block", e))?;
            return Ok(TrackedBlock {
                block,
                key: kv.key,
                version: kv.version,
            });
        }

        // First touch of this block: persist the empty form guarded on the
        // key never having existed, then re-read to pick up whichever copy
        // won.
        let tracked = self.new_block(block_addr)?;
        let committed = self
            .kv
            .txn(vec![tracked.compare()], vec![tracked.put_op()?])
            .await?;
        if committed {
            return Ok(TrackedBlock {
                version: 1,
                ..tracked
            });
        }

        let kv = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| Error::Conflict {
                operation: format!("materialize block {block_addr}"),
            })?;
        let block: BitmapBlock = serde_json::from_slice(&kv.value)
            .map_err(|e| Error::serialization("decode block", e))?;
        Ok(TrackedBlock {
            block,
            key: kv.key,
            version: kv.version,
        })
    }

    /// Materialize the block at the `nextKey` high-water mark and advance
    /// the mark by one block, both in one guarded transaction.
    async fn next_block(&self) -> Result<TrackedBlock> {
        let block_span = 1u128 << (family_bits(first_addr(&self.cidr)) - self.block_prefix());

        let mut candidate = *self.next_key.lock().await;

        for _ in 0..self.config.retry_max {
            if !self.cidr.contains(&candidate) {
                return Err(Error::Exhausted {
                    resource: format!("network {}", self.cidr),
                });
            }

            let advanced = addr_add(candidate, block_span).unwrap_or(candidate);
            let tracked = self.new_block(candidate)?;

            let committed = self
                .kv
                .txn(
                    vec![
                        tracked.compare(),
                        Compare::ValueEq(
                            ipam_next_key(&self.id),
                            canonical_addr(candidate).into_bytes(),
                        ),
                    ],
                    vec![
                        tracked.put_op()?,
                        TxnOp::Put {
                            key: ipam_next_key(&self.id),
                            value: canonical_addr(advanced).into_bytes(),
                            lease: None,
                        },
                    ],
                )
                .await?;

            if committed {
                let mut cached = self.next_key.lock().await;
                *cached = advanced;
                debug!(ipam = %self.id, block = %candidate, "materialized next block");
                return Ok(TrackedBlock {
                    version: 1,
                    ..tracked
                });
            }

            // Another allocator advanced the mark; chase the stored value.
            let next_kv = self
                .kv
                .get(&ipam_next_key(&self.id))
                .await?
                .ok_or_else(|| Error::not_found(format!("allocator {} nextKey", self.id)))?;
            let next_str = String::from_utf8(next_kv.value)
                .map_err(|e| Error::serialization("decode allocator nextKey", e))?;
            candidate = parse_canonical(&next_str)?;
        }

        Err(Error::Conflict {
            operation: format!("provision next block for {}", self.id),
        })
    }
}

fn addr_in_any(addr: IpAddr, nets: &[IpNet]) -> bool {
    nets.iter().any(|net| net.contains(&addr))
}

/// Whole-block fast path: a block entirely inside a reservation is skipped
/// without scanning it. Partially covered blocks go through the per-address
/// skip in [`take_from_block`].
fn block_fully_reserved(subnet: IpNet, reserved: &[IpNet]) -> bool {
    reserved.iter().any(|net| net.contains(&subnet))
}

/// Drain up to `want` non-reserved addresses out of `block` into `out`.
///
/// Addresses that land inside a reserved CIDR are kept marked while the
/// drain runs (so the scan cannot hand them out twice) and returned to the
/// block afterwards, which keeps them out of the committed state.
fn take_from_block(
    block: &mut BitmapBlock,
    want: usize,
    reserved: &[IpNet],
    out: &mut Vec<IpAddr>,
) -> usize {
    let mut skipped: Vec<IpAddr> = Vec::new();
    let mut taken = 0;
    while taken < want && block.available() > 0 {
        let Some(addr) = block.request() else {
            break;
        };
        if addr_in_any(addr, reserved) {
            skipped.push(addr);
        } else {
            out.push(addr);
            taken += 1;
        }
    }
    for addr in skipped {
        block.release(addr);
    }
    taken
}
