//! Operation translation between the message surface and the core
//! managers. One method per operation; each parses and validates its
//! literals, materializes the collaborators it needs from the store handle,
//! and translates the result.

use std::sync::Arc;

use tracing::info;

use super::schemas::*;
use crate::addr::{parse_cidr, parse_ip, CidrWalk};
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::kv::KvStore;
use crate::network::NetworkManager;
use crate::pool::PoolManager;
use crate::registry::Registry;
use crate::types::Binding;

/// The service holds the store handle granted at startup — the only
/// process-wide state — and builds everything else per request.
pub struct IpamService {
    kv: Arc<dyn KvStore>,
    config: AllocatorConfig,
}

impl IpamService {
    pub fn new(kv: Arc<dyn KvStore>, config: AllocatorConfig) -> Self {
        Self { kv, config }
    }

    fn registry(&self) -> Registry {
        Registry::with_config(Arc::clone(&self.kv), self.config.clone())
    }

    async fn network(&self, network_id: &str) -> Result<NetworkManager> {
        if network_id.is_empty() {
            return Err(Error::invalid_argument("network_id", "must not be empty"));
        }
        self.registry().network(network_id).await
    }

    async fn pool(&self, pool_ref: &PoolRef) -> Result<(NetworkManager, PoolManager)> {
        let manager = self.network(&pool_ref.network_id).await?;
        if pool_ref.id.is_empty() {
            return Err(Error::invalid_argument("pool_id", "must not be empty"));
        }
        let pool = manager.pool(&pool_ref.id).await?;
        Ok((manager, pool))
    }

    pub async fn network_add(&self, req: NetworkAddRequest) -> Result<NetworkAddResponse> {
        info!(cidr = %req.cidr, "rpc: NetworkAdd");
        let manager = self.registry().new_network(req.annotations, &req.cidr).await?;
        Ok(NetworkAddResponse {
            network: manager.network().clone(),
        })
    }

    /// One network when `id` is set, otherwise the filtered range.
    pub async fn network_range(&self, req: NetworkRangeRequest) -> Result<NetworkRangeResponse> {
        info!(id = %req.id, "rpc: NetworkRange");
        let networks = if req.id.is_empty() {
            self.registry().networks(&req.filters).await?
        } else {
            vec![self.network(&req.id).await?.network().clone()]
        };
        Ok(NetworkRangeResponse {
            size: networks.len(),
            networks,
        })
    }

    pub async fn pool_add(&self, req: PoolAddRequest) -> Result<PoolAddResponse> {
        info!(network = %req.network_id, r#type = %req.pool_type, "rpc: PoolAdd");
        let manager = self.network(&req.network_id).await?;
        let pool = manager
            .new_pool(req.annotations, req.maximum, req.pool_type)
            .await?;
        Ok(PoolAddResponse {
            pool: pool.pool().clone(),
        })
    }

    pub async fn pool_range(&self, req: PoolRangeRequest) -> Result<PoolRangeResponse> {
        info!("rpc: PoolRange");
        let pools = match &req.id {
            None => self.registry().pools(&req.filters).await?,
            Some(pool_ref) if pool_ref.network_id.is_empty() => {
                self.registry().pools(&req.filters).await?
            }
            Some(pool_ref) if pool_ref.id.is_empty() => {
                self.network(&pool_ref.network_id)
                    .await?
                    .pools(&req.filters)
                    .await?
            }
            Some(pool_ref) => {
                let (_, pool) = self.pool(pool_ref).await?;
                vec![pool.pool().clone()]
            }
        };
        Ok(PoolRangeResponse {
            size: pools.len(),
            pools,
        })
    }

    pub async fn pool_set_max(&self, req: PoolSetMaxRequest) -> Result<PoolSetMaxResponse> {
        info!(pool = %req.pool_id.id, maximum = req.maximum, "rpc: PoolSetMax");
        let (_, mut pool) = self.pool(&req.pool_id).await?;
        pool.set_max_size(req.maximum).await?;
        Ok(PoolSetMaxResponse {})
    }

    pub async fn binding_range(&self, req: BindingRangeRequest) -> Result<BindingRangeResponse> {
        info!(network = %req.network_id, "rpc: BindingRange");
        let manager = self.network(&req.network_id).await?;
        let bindings = manager.bindings(&req.filters).await?;
        Ok(BindingRangeResponse {
            size: bindings.len(),
            bindings,
        })
    }

    pub async fn allocate_address(
        &self,
        req: AllocateAddressRequest,
    ) -> Result<AllocateAddressResponse> {
        info!(pool = %req.pool_id.id, address = %req.address, "rpc: AllocateAddress");
        let (_, pool) = self.pool(&req.pool_id).await?;
        let addr = if req.address.is_empty() {
            None
        } else {
            Some(parse_ip(&req.address)?)
        };
        let binding = pool.allocate(req.annotations, addr).await?;
        Ok(AllocateAddressResponse { binding })
    }

    /// Walk the CIDR and allocate every address individually, collecting
    /// per-address failures instead of aborting.
    pub async fn bulk_allocate_address(
        &self,
        req: BulkAllocateAddressRequest,
    ) -> Result<BulkAllocateAddressResponse> {
        info!(pool = %req.pool_id.id, cidr = %req.cidr, "rpc: BulkAllocateAddress");
        let net = parse_cidr(&req.cidr)?;
        let (_, pool) = self.pool(&req.pool_id).await?;

        let mut bindings: Vec<Binding> = Vec::new();
        let mut errors = std::collections::HashMap::new();
        for addr in CidrWalk::new(&net) {
            match pool.allocate(req.annotations.clone(), Some(addr)).await {
                Ok(binding) => bindings.push(binding),
                Err(e) => {
                    errors.insert(addr.to_string(), e.to_string());
                }
            }
        }

        Ok(BulkAllocateAddressResponse { bindings, errors })
    }

    pub async fn bind_address(&self, req: BindAddressRequest) -> Result<BindAddressResponse> {
        info!(pool = %req.pool_id.id, address = %req.address, "rpc: BindAddress");
        let (_, pool) = self.pool(&req.pool_id).await?;
        let binding = if req.address.is_empty() {
            pool.bind_any(req.annotations).await?
        } else {
            let addr = parse_ip(&req.address)?;
            if addr.is_unspecified() {
                pool.bind_any(req.annotations).await?
            } else {
                pool.bind(req.annotations, addr).await?
            }
        };
        Ok(BindAddressResponse { binding })
    }

    /// Release by address (cross-pool lookup) or by pool + binding id. A
    /// hard release whose per-id record is already gone scrubs the orphaned
    /// index entry instead of failing silently.
    pub async fn release_address(
        &self,
        req: ReleaseAddressRequest,
    ) -> Result<ReleaseAddressResponse> {
        info!(
            pool = %req.pool_id.id,
            address = %req.address,
            binding = %req.binding_id,
            hard = req.hard,
            "rpc: ReleaseAddress"
        );
        let manager = self.network(&req.pool_id.network_id).await?;

        let (pool, binding) = if !req.address.is_empty() {
            let addr = parse_ip(&req.address)?;
            let binding = match manager.binding(addr).await {
                Ok(binding) => binding,
                Err(e) => {
                    if req.hard {
                        manager.scrub_address(addr).await?;
                    }
                    return Err(e);
                }
            };
            let pool = manager.pool(&binding.pool_id.id).await?;
            (pool, binding)
        } else {
            if req.binding_id.is_empty() {
                return Err(Error::invalid_argument(
                    "binding_id",
                    "either address or binding_id is required",
                ));
            }
            let pool = manager.pool(&req.pool_id.id).await?;
            let binding = pool.binding(&req.binding_id).await?;
            (pool, binding)
        };

        pool.release(&binding, req.hard).await?;
        Ok(ReleaseAddressResponse {})
    }
}
