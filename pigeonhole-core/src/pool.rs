//! Pool manager: binding-level policy over a network's allocator.
//!
//! A pool never owns addresses — the allocator does. What the pool owns is
//! the binding lifecycle: ALLOCATED records reserve an address for later
//! use, BOUND records hand it to a consumer, RELEASED records await either
//! re-binding (fixed pools) or lease expiry and reclamation (dynamic
//! pools). Every binding write is one conditional transaction over the
//! per-id record and the network's per-address index, guarded on the
//! version of the per-id key observed at read time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::addr::parse_ip;
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::filter::FilterSet;
use crate::ipam::Ipam;
use crate::keys::{binding_addr_key, binding_id_key, pool_bindings_prefix, pool_meta_key};
use crate::kv::{Compare, KvStore, TxnOp};
use crate::network::reserved_nets;
use crate::types::{now_nanos, Annotations, Binding, Pool, PoolType};

/// A binding together with the store version its per-id key was read at.
struct TrackedBinding {
    binding: Binding,
    version: i64,
}

/// How a binding write treats key lifetime.
enum WriteMode {
    /// Plain put; keys stay until explicitly changed.
    Keep,
    /// Put both keys under a fresh lease of this many seconds.
    Lease(i64),
    /// Delete both keys immediately.
    HardDelete,
}

/// Manager for one pool's bindings.
pub struct PoolManager {
    kv: Arc<dyn KvStore>,
    pool: Pool,
    ipam: Arc<Ipam>,
    config: AllocatorConfig,
}

impl PoolManager {
    pub(crate) fn new(
        kv: Arc<dyn KvStore>,
        pool: Pool,
        ipam: Arc<Ipam>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            kv,
            pool,
            ipam,
            config,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn max_size(&self) -> u64 {
        self.pool.maximum
    }

    /// Number of bindings currently persisted in the pool, whatever their
    /// state.
    pub async fn current_size(&self) -> Result<u64> {
        let prefix = pool_bindings_prefix(&self.pool.id.network_id, &self.pool.id.id);
        Ok(self.kv.get_prefix(&prefix).await?.len() as u64)
    }

    /// Persist a new maximum. Refused when the pool already holds more
    /// bindings; linearized against concurrent meta updates by a
    /// value-compare on the stored pool record.
    pub async fn set_max_size(&mut self, maximum: u64) -> Result<()> {
        let size = self.current_size().await?;
        if size > maximum {
            return Err(Error::invalid_argument(
                "maximum",
                format!("pool {} holds {size} bindings, more than {maximum}", self.pool.id),
            ));
        }

        let key = pool_meta_key(&self.pool.id.network_id, &self.pool.id.id);
        let old = serde_json::to_vec(&self.pool)
            .map_err(|e| Error::serialization("encode pool", e))?;
        let mut updated = self.pool.clone();
        updated.maximum = maximum;
        let new = serde_json::to_vec(&updated)
            .map_err(|e| Error::serialization("encode pool", e))?;

        let committed = self
            .kv
            .txn(
                vec![Compare::ValueEq(key.clone(), old)],
                vec![TxnOp::Put {
                    key,
                    value: new,
                    lease: None,
                }],
            )
            .await?;
        if !committed {
            return Err(Error::Conflict {
                operation: format!("set maximum on pool {}", self.pool.id),
            });
        }
        self.pool = updated;
        Ok(())
    }

    /// Reserve an address inside the pool without handing it out: produces
    /// an ALLOCATED binding. With an explicit address the allocator claims
    /// it; without one the allocator picks.
    pub async fn allocate(
        &self,
        annotations: Annotations,
        addr: Option<IpAddr>,
    ) -> Result<Binding> {
        self.check_capacity().await?;
        let reserved = reserved_nets(&self.kv, &self.pool.id.network_id).await?;

        let addr = match addr {
            Some(addr) => {
                if addr.is_unspecified() {
                    return Err(Error::invalid_argument("address", "unspecified address"));
                }
                if reserved.iter().any(|net| net.contains(&addr)) {
                    return Err(Error::invalid_argument(
                        "address",
                        format!("{addr} is reserved"),
                    ));
                }
                let addr_key = binding_addr_key(&self.pool.id.network_id, addr);
                if self.kv.get(&addr_key).await?.is_some() {
                    return Err(Error::already_exists(format!("binding for {addr}")));
                }
                self.ipam.claim(addr).await?;
                addr
            }
            None => {
                let addrs = self.ipam.allocate(1, &reserved).await?;
                addrs.into_iter().next().ok_or_else(|| {
                    Error::internal("allocator returned no address".to_string())
                })?
            }
        };

        let binding = Binding {
            id: Uuid::new_v4().to_string(),
            pool_id: self.pool.id.clone(),
            address: addr.to_string(),
            allocate_time: now_nanos(),
            bind_time: 0,
            release_time: 0,
            annotations,
        };

        let tracked = TrackedBinding {
            binding,
            version: 0,
        };
        if let Err(e) = self.write_binding(&tracked, WriteMode::Keep).await {
            self.rollback_address(addr).await;
            return Err(e);
        }

        debug!(pool = %self.pool.id, %addr, binding = %tracked.binding.id, "allocated");
        Ok(tracked.binding)
    }

    /// Atomically turn a specific address into a BOUND binding.
    ///
    /// An existing non-BOUND binding for the address in this pool is
    /// re-bound in place; otherwise DYNAMIC pools claim the address fresh,
    /// while FIXED pools refuse to allocate implicitly.
    pub async fn bind(&self, annotations: Annotations, addr: IpAddr) -> Result<Binding> {
        if !self.ipam.cidr().contains(&addr) {
            return Err(Error::invalid_argument(
                "address",
                format!("{addr} is outside network {}", self.ipam.cidr()),
            ));
        }

        for attempt in 0..self.config.retry_max {
            match self.tracked_for_addr(addr).await? {
                Some(tracked) => {
                    if tracked.binding.pool_id != self.pool.id || tracked.binding.is_bound() {
                        return Err(Error::already_exists(format!(
                            "active binding for {addr}"
                        )));
                    }
                    match self.rebind(tracked, annotations.clone()).await {
                        Ok(binding) => return Ok(binding),
                        Err(e) if e.is_retryable() => {
                            conflict_backoff(attempt).await;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    if self.pool.pool_type == PoolType::Fixed {
                        return Err(Error::NoFree {
                            pool: self.pool.id.to_string(),
                        });
                    }
                    let reserved = reserved_nets(&self.kv, &self.pool.id.network_id).await?;
                    if reserved.iter().any(|net| net.contains(&addr)) {
                        return Err(Error::invalid_argument(
                            "address",
                            format!("{addr} is reserved"),
                        ));
                    }
                    self.check_capacity().await?;
                    self.ipam.claim(addr).await?;

                    let now = now_nanos();
                    let tracked = TrackedBinding {
                        binding: Binding {
                            id: Uuid::new_v4().to_string(),
                            pool_id: self.pool.id.clone(),
                            address: addr.to_string(),
                            allocate_time: now,
                            bind_time: now,
                            release_time: 0,
                            annotations,
                        },
                        version: 0,
                    };
                    if let Err(e) = self.write_binding(&tracked, WriteMode::Keep).await {
                        self.rollback_address(addr).await;
                        return Err(e);
                    }
                    debug!(pool = %self.pool.id, %addr, "bound");
                    return Ok(tracked.binding);
                }
            }
        }

        Err(Error::Conflict {
            operation: format!("bind {addr} in pool {}", self.pool.id),
        })
    }

    /// Bind whatever address is available: first by re-binding an existing
    /// non-BOUND binding, then (DYNAMIC pools only) by allocating fresh.
    pub async fn bind_any(&self, annotations: Annotations) -> Result<Binding> {
        for attempt in 0..self.config.retry_max {
            let candidates = self.tracked_bindings().await?;
            for tracked in candidates {
                if tracked.binding.is_bound() {
                    continue;
                }
                match self.rebind(tracked, annotations.clone()).await {
                    Ok(binding) => return Ok(binding),
                    // Another caller won this candidate; try the next one.
                    Err(e) if e.is_retryable() => continue,
                    Err(e) => return Err(e),
                }
            }

            if self.pool.pool_type == PoolType::Fixed {
                return Err(Error::NoFree {
                    pool: self.pool.id.to_string(),
                });
            }

            self.check_capacity().await?;
            let reserved = reserved_nets(&self.kv, &self.pool.id.network_id).await?;
            let addrs = self.ipam.allocate(1, &reserved).await?;
            let addr = addrs
                .into_iter()
                .next()
                .ok_or_else(|| Error::internal("allocator returned no address".to_string()))?;

            let now = now_nanos();
            let tracked = TrackedBinding {
                binding: Binding {
                    id: Uuid::new_v4().to_string(),
                    pool_id: self.pool.id.clone(),
                    address: addr.to_string(),
                    allocate_time: now,
                    bind_time: now,
                    release_time: 0,
                    annotations: annotations.clone(),
                },
                version: 0,
            };
            match self.write_binding(&tracked, WriteMode::Keep).await {
                Ok(()) => {
                    debug!(pool = %self.pool.id, %addr, "bound fresh address");
                    return Ok(tracked.binding);
                }
                Err(e) if e.is_retryable() => {
                    self.rollback_address(addr).await;
                    conflict_backoff(attempt).await;
                    continue;
                }
                Err(e) => {
                    self.rollback_address(addr).await;
                    return Err(e);
                }
            }
        }

        Err(Error::Conflict {
            operation: format!("bind any in pool {}", self.pool.id),
        })
    }

    /// Transition a BOUND binding to RELEASED.
    ///
    /// Hard releases delete both keys at once; the janitor observes the
    /// per-address deletion and returns the address to the allocator. Soft
    /// releases keep the record: under a TTL lease for dynamic pools, so
    /// expiry triggers the same reclamation, and forever for fixed pools,
    /// where the address stays allocated and re-bindable.
    pub async fn release(&self, binding: &Binding, hard: bool) -> Result<Binding> {
        for attempt in 0..self.config.retry_max {
            let mut tracked = self
                .tracked(&binding.id)
                .await?
                .ok_or_else(|| Error::not_found(format!("binding {}", binding.id)))?;

            if !tracked.binding.is_bound() {
                return Err(Error::invalid_argument(
                    "binding",
                    format!(
                        "binding {} is {}, not BOUND",
                        tracked.binding.id,
                        tracked.binding.state()
                    ),
                ));
            }

            tracked.binding.release_time = now_nanos();
            let mode = if hard {
                WriteMode::HardDelete
            } else if self.pool.pool_type == PoolType::Dynamic {
                WriteMode::Lease(self.config.released_binding_ttl_secs)
            } else {
                WriteMode::Keep
            };

            match self.write_binding(&tracked, mode).await {
                Ok(()) => {
                    debug!(
                        pool = %self.pool.id,
                        binding = %tracked.binding.id,
                        hard,
                        "released"
                    );
                    return Ok(tracked.binding);
                }
                Err(e) if e.is_retryable() => {
                    conflict_backoff(attempt).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict {
            operation: format!("release binding {}", binding.id),
        })
    }

    /// Fetch one binding by id.
    pub async fn binding(&self, id: &str) -> Result<Binding> {
        self.tracked(id)
            .await?
            .map(|t| t.binding)
            .ok_or_else(|| Error::not_found(format!("binding {id}")))
    }

    /// All bindings in the pool passing the filters.
    pub async fn bindings(&self, filters: &HashMap<String, String>) -> Result<Vec<Binding>> {
        let set = FilterSet::compile(filters)?;
        let all = self.tracked_bindings().await?;
        Ok(all
            .into_iter()
            .map(|t| t.binding)
            .filter(|b| {
                set.matches(|field| match field {
                    "_id" => Some(b.id.clone()),
                    "_pool" => Some(b.pool_id.id.clone()),
                    "_network" => Some(b.pool_id.network_id.clone()),
                    "_address" => Some(b.address.clone()),
                    _ => b.annotations.get(field).cloned(),
                })
            })
            .collect())
    }

    async fn check_capacity(&self) -> Result<()> {
        if self.pool.maximum == 0 {
            return Ok(());
        }
        let size = self.current_size().await?;
        if size >= self.pool.maximum {
            return Err(Error::Capacity {
                pool: self.pool.id.to_string(),
                maximum: self.pool.maximum,
            });
        }
        Ok(())
    }

    /// Re-bind an existing binding in place: fresh annotations, new bind
    /// time. The caller's version guard decides the race when several
    /// clients chase the same candidate.
    async fn rebind(&self, mut tracked: TrackedBinding, annotations: Annotations) -> Result<Binding> {
        let now = now_nanos();
        tracked.binding.annotations = annotations;
        tracked.binding.bind_time = now;
        if tracked.binding.allocate_time == 0 {
            tracked.binding.allocate_time = now;
        }
        self.write_binding(&tracked, WriteMode::Keep).await?;
        debug!(pool = %self.pool.id, binding = %tracked.binding.id, "rebound");
        Ok(tracked.binding)
    }

    /// The one write path every binding mutation funnels through: a single
    /// transaction guarded on the per-id key's version (0 for creations,
    /// where the per-address index must also be absent).
    async fn write_binding(&self, tracked: &TrackedBinding, mode: WriteMode) -> Result<()> {
        let id_key = binding_id_key(
            &self.pool.id.network_id,
            &self.pool.id.id,
            &tracked.binding.id,
        );
        let addr = parse_ip(&tracked.binding.address)?;
        let addr_key = binding_addr_key(&self.pool.id.network_id, addr);

        let mut compares = vec![Compare::VersionEq(id_key.clone(), tracked.version)];
        let ops = match mode {
            WriteMode::HardDelete => vec![
                TxnOp::Delete {
                    key: addr_key.clone(),
                },
                TxnOp::Delete { key: id_key },
            ],
            WriteMode::Keep | WriteMode::Lease(_) => {
                let lease = match mode {
                    WriteMode::Lease(secs) => Some(
                        self.kv
                            .lease_grant(Duration::from_secs(secs.max(0) as u64))
                            .await?,
                    ),
                    _ => None,
                };
                if tracked.version == 0 {
                    compares.push(Compare::VersionEq(addr_key.clone(), 0));
                }
                let data = serde_json::to_vec(&tracked.binding)
                    .map_err(|e| Error::serialization("encode binding", e))?;
                vec![
                    TxnOp::Put {
                        key: addr_key,
                        value: id_key.clone().into_bytes(),
                        lease,
                    },
                    TxnOp::Put {
                        key: id_key,
                        value: data,
                        lease,
                    },
                ]
            }
        };

        let committed = self.kv.txn(compares, ops).await?;
        if !committed {
            return Err(Error::Conflict {
                operation: format!("write binding {}", tracked.binding.id),
            });
        }
        Ok(())
    }

    async fn tracked(&self, id: &str) -> Result<Option<TrackedBinding>> {
        let key = binding_id_key(&self.pool.id.network_id, &self.pool.id.id, id);
        let Some(kv) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let binding: Binding = serde_json::from_slice(&kv.value)
            .map_err(|e| Error::serialization("decode binding", e))?;
        Ok(Some(TrackedBinding {
            binding,
            version: kv.version,
        }))
    }

    /// Resolve a binding through the network's per-address index. Works for
    /// bindings of any pool in the network.
    async fn tracked_for_addr(&self, addr: IpAddr) -> Result<Option<TrackedBinding>> {
        let addr_key = binding_addr_key(&self.pool.id.network_id, addr);
        let Some(index) = self.kv.get(&addr_key).await? else {
            return Ok(None);
        };
        let id_key = String::from_utf8(index.value)
            .map_err(|e| Error::serialization("decode binding index", e))?;
        let Some(kv) = self.kv.get(&id_key).await? else {
            // Orphaned index entry; treat the address as unbound.
            warn!(%addr, "per-address index points at missing binding");
            return Ok(None);
        };
        let binding: Binding = serde_json::from_slice(&kv.value)
            .map_err(|e| Error::serialization("decode binding", e))?;
        Ok(Some(TrackedBinding {
            binding,
            version: kv.version,
        }))
    }

    async fn tracked_bindings(&self) -> Result<Vec<TrackedBinding>> {
        let prefix = pool_bindings_prefix(&self.pool.id.network_id, &self.pool.id.id);
        let kvs = self.kv.get_prefix(&prefix).await?;
        let mut out = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let binding: Binding = serde_json::from_slice(&kv.value)
                .map_err(|e| Error::serialization("decode binding", e))?;
            out.push(TrackedBinding {
                binding,
                version: kv.version,
            });
        }
        Ok(out)
    }

    /// Best-effort return of an address after a failed binding write.
    async fn rollback_address(&self, addr: IpAddr) {
        if let Err(e) = self.ipam.release(addr).await {
            warn!(%addr, "failed to roll back address after write failure: {e}");
        }
    }
}

/// Short randomized pause between guard-failure retries so concurrent
/// writers fan out instead of thundering.
async fn conflict_backoff(attempt: u32) {
    let base = 10u64 << attempt.min(5);
    let jitter = rand::thread_rng().gen_range(0..=base);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}
