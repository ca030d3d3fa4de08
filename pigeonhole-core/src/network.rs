//! Network manager: pools, reservations, and cross-pool lookups for one
//! network.
//!
//! The manager is a stateless view materialized from the network's stored
//! record; it holds ids and a store handle, never references to other
//! managers. Pools relate to the network, the allocator owns the
//! addresses.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::addr::parse_cidr;
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::filter::FilterSet;
use crate::ipam::Ipam;
use crate::keys::{
    binding_addr_key, network_pools_prefix, network_reservations_prefix, pool_meta_key,
    reservation_key,
};
use crate::kv::{Compare, KvStore, TxnOp};
use crate::pool::PoolManager;
use crate::types::{merge_annotations, Annotations, Binding, Network, Pool, PoolId, PoolType, Reservation};

/// All reservation CIDRs of a network, parsed. Shared with the pool layer,
/// which must exclude them from every allocation path.
pub(crate) async fn reserved_nets(kv: &Arc<dyn KvStore>, network_id: &str) -> Result<Vec<IpNet>> {
    let kvs = kv
        .get_prefix(&network_reservations_prefix(network_id))
        .await?;
    let mut nets = Vec::with_capacity(kvs.len());
    for kv in kvs {
        let reservation: Reservation = serde_json::from_slice(&kv.value)
            .map_err(|e| Error::serialization("decode reservation", e))?;
        nets.push(parse_cidr(&reservation.cidr)?);
    }
    Ok(nets)
}

/// Manager for one network's pools and reservations.
pub struct NetworkManager {
    kv: Arc<dyn KvStore>,
    network: Network,
    ipam: Arc<Ipam>,
    config: AllocatorConfig,
}

impl NetworkManager {
    pub(crate) fn new(
        kv: Arc<dyn KvStore>,
        network: Network,
        ipam: Arc<Ipam>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            kv,
            network,
            ipam,
            config,
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub(crate) fn ipam(&self) -> &Arc<Ipam> {
        &self.ipam
    }

    /// Create a pool. Its annotations are the network's merged with the
    /// provided ones, provided values winning.
    pub async fn new_pool(
        &self,
        annotations: Annotations,
        maximum: u64,
        pool_type: PoolType,
    ) -> Result<PoolManager> {
        let pool = Pool {
            id: PoolId {
                network_id: self.network.id.clone(),
                id: Uuid::new_v4().to_string(),
            },
            pool_type,
            maximum,
            annotations: merge_annotations(&self.network.annotations, &annotations),
        };

        let data =
            serde_json::to_vec(&pool).map_err(|e| Error::serialization("encode pool", e))?;
        self.kv
            .put(&pool_meta_key(&pool.id.network_id, &pool.id.id), data)
            .await?;

        info!(pool = %pool.id, r#type = %pool.pool_type, maximum, "created pool");
        Ok(PoolManager::new(
            Arc::clone(&self.kv),
            pool,
            Arc::clone(&self.ipam),
            self.config.clone(),
        ))
    }

    /// Fetch one pool as a manager.
    pub async fn pool(&self, pool_id: &str) -> Result<PoolManager> {
        let key = pool_meta_key(&self.network.id, pool_id);
        let kv = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found(format!("pool {pool_id}")))?;
        let pool: Pool = serde_json::from_slice(&kv.value)
            .map_err(|e| Error::serialization("decode pool", e))?;
        Ok(PoolManager::new(
            Arc::clone(&self.kv),
            pool,
            Arc::clone(&self.ipam),
            self.config.clone(),
        ))
    }

    /// All pools of the network passing the filters.
    pub async fn pools(&self, filters: &HashMap<String, String>) -> Result<Vec<Pool>> {
        let set = FilterSet::compile(filters)?;
        let kvs = self
            .kv
            .get_prefix(&network_pools_prefix(&self.network.id))
            .await?;
        let mut pools = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let pool: Pool = serde_json::from_slice(&kv.value)
                .map_err(|e| Error::serialization("decode pool", e))?;
            let passes = set.matches(|field| match field {
                "_id" => Some(pool.id.id.clone()),
                "_network" => Some(pool.id.network_id.clone()),
                "_type" => Some(pool.pool_type.to_string()),
                _ => pool.annotations.get(field).cloned(),
            });
            if passes {
                pools.push(pool);
            }
        }
        Ok(pools)
    }

    /// Look up the binding holding an address, whichever pool it is in.
    pub async fn binding(&self, addr: IpAddr) -> Result<Binding> {
        let addr_key = binding_addr_key(&self.network.id, addr);
        let index = self
            .kv
            .get(&addr_key)
            .await?
            .ok_or_else(|| Error::not_found(format!("binding for {addr}")))?;
        let id_key = String::from_utf8(index.value)
            .map_err(|e| Error::serialization("decode binding index", e))?;
        let kv = self
            .kv
            .get(&id_key)
            .await?
            .ok_or_else(|| Error::not_found(format!("binding for {addr}")))?;
        serde_json::from_slice(&kv.value).map_err(|e| Error::serialization("decode binding", e))
    }

    /// Bindings across every pool of the network, filters applied.
    pub async fn bindings(&self, filters: &HashMap<String, String>) -> Result<Vec<Binding>> {
        // Surface an invalid filter before touching any pool.
        FilterSet::compile(filters)?;
        let pools = self.pools(&HashMap::new()).await?;
        let mut out = Vec::new();
        for pool in pools {
            let manager = PoolManager::new(
                Arc::clone(&self.kv),
                pool,
                Arc::clone(&self.ipam),
                self.config.clone(),
            );
            out.extend(manager.bindings(filters).await?);
        }
        Ok(out)
    }

    /// Reservations of the network passing the filters.
    pub async fn reservations(
        &self,
        filters: &HashMap<String, String>,
    ) -> Result<Vec<Reservation>> {
        let set = FilterSet::compile(filters)?;
        let kvs = self
            .kv
            .get_prefix(&network_reservations_prefix(&self.network.id))
            .await?;
        let mut out = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let reservation: Reservation = serde_json::from_slice(&kv.value)
                .map_err(|e| Error::serialization("decode reservation", e))?;
            let passes = set.matches(|field| match field {
                "_cidr" => Some(reservation.cidr.clone()),
                "_network" => Some(reservation.network_id.clone()),
                _ => reservation.annotations.get(field).cloned(),
            });
            if passes {
                out.push(reservation);
            }
        }
        Ok(out)
    }

    /// Add a reservation: a CIDR the allocator must never hand out.
    /// Duplicates are rejected.
    pub async fn add_reservation(
        &self,
        cidr: &str,
        annotations: Annotations,
    ) -> Result<Reservation> {
        parse_cidr(cidr)?;
        let reservation = Reservation {
            network_id: self.network.id.clone(),
            cidr: cidr.to_string(),
            annotations,
        };
        let data = serde_json::to_vec(&reservation)
            .map_err(|e| Error::serialization("encode reservation", e))?;

        let key = reservation_key(&self.network.id, cidr);
        let committed = self
            .kv
            .txn(
                vec![Compare::VersionEq(key.clone(), 0)],
                vec![TxnOp::Put {
                    key,
                    value: data,
                    lease: None,
                }],
            )
            .await?;
        if !committed {
            return Err(Error::already_exists(format!("reservation {cidr}")));
        }

        info!(network = %self.network.id, cidr, "added reservation");
        Ok(reservation)
    }

    /// Remove a reservation by CIDR.
    pub async fn remove_reservation(&self, cidr: &str) -> Result<()> {
        let key = reservation_key(&self.network.id, cidr);
        let committed = self
            .kv
            .txn(
                vec![Compare::VersionGt(key.clone(), 0)],
                vec![TxnOp::Delete { key }],
            )
            .await?;
        if !committed {
            return Err(Error::not_found(format!("reservation {cidr}")));
        }
        info!(network = %self.network.id, cidr, "removed reservation");
        Ok(())
    }

    /// Whether an address falls inside any current reservation.
    pub async fn is_reserved(&self, addr: IpAddr) -> Result<bool> {
        let nets = reserved_nets(&self.kv, &self.network.id).await?;
        Ok(nets.iter().any(|net| net.contains(&addr)))
    }

    /// Drop an orphaned per-address index entry and return the address to
    /// the allocator. Used when a hard release finds the per-id record
    /// already gone.
    pub async fn scrub_address(&self, addr: IpAddr) -> Result<()> {
        debug!(network = %self.network.id, %addr, "scrubbing address");
        self.kv
            .delete(&binding_addr_key(&self.network.id, addr))
            .await?;
        self.ipam.release(addr).await
    }
}
