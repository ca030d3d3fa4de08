//! Registry: the root directory of networks.
//!
//! The registry is the only entry point callers need; it owns nothing but a
//! store handle and materializes network managers on demand from their
//! stored records.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::addr::parse_cidr;
use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::filter::FilterSet;
use crate::ipam::Ipam;
use crate::keys::{network_meta_key, networks_prefix};
use crate::kv::KvStore;
use crate::network::NetworkManager;
use crate::types::{Annotations, Network, Pool};

/// Directory of all networks in the store.
pub struct Registry {
    kv: Arc<dyn KvStore>,
    config: AllocatorConfig,
}

impl Registry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_config(kv, AllocatorConfig::default())
    }

    pub fn with_config(kv: Arc<dyn KvStore>, config: AllocatorConfig) -> Self {
        Self { kv, config }
    }

    /// Create a network for `cidr`, its allocator included. If persisting
    /// the network record fails after the allocator was created, the error
    /// is surfaced and the allocator keys are left behind.
    pub async fn new_network(
        &self,
        annotations: Annotations,
        cidr: &str,
    ) -> Result<NetworkManager> {
        let net = parse_cidr(cidr)?;
        let ipam = Ipam::create(Arc::clone(&self.kv), cidr, self.config.clone()).await?;

        let network = Network {
            id: Uuid::new_v4().to_string(),
            ipam: ipam.id().to_string(),
            cidr: net.to_string(),
            annotations,
        };
        let data = serde_json::to_vec(&network)
            .map_err(|e| Error::serialization("encode network", e))?;
        self.kv.put(&network_meta_key(&network.id), data).await?;

        info!(network = %network.id, cidr = %net, "created network");
        Ok(NetworkManager::new(
            Arc::clone(&self.kv),
            network,
            Arc::new(ipam),
            self.config.clone(),
        ))
    }

    /// Materialize the manager for one network.
    pub async fn network(&self, id: &str) -> Result<NetworkManager> {
        let kv = self
            .kv
            .get(&network_meta_key(id))
            .await?
            .ok_or_else(|| Error::not_found(format!("network {id}")))?;
        let network: Network = serde_json::from_slice(&kv.value)
            .map_err(|e| Error::serialization("decode network", e))?;
        let ipam = Ipam::fetch(Arc::clone(&self.kv), &network.ipam, self.config.clone()).await?;
        Ok(NetworkManager::new(
            Arc::clone(&self.kv),
            network,
            Arc::new(ipam),
            self.config.clone(),
        ))
    }

    /// All networks passing the filters.
    pub async fn networks(&self, filters: &HashMap<String, String>) -> Result<Vec<Network>> {
        let set = FilterSet::compile(filters)?;
        let kvs = self.kv.get_prefix(&networks_prefix()).await?;
        let mut out = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let network: Network = serde_json::from_slice(&kv.value)
                .map_err(|e| Error::serialization("decode network", e))?;
            let passes = set.matches(|field| match field {
                "_id" => Some(network.id.clone()),
                "_cidr" => Some(network.cidr.clone()),
                _ => network.annotations.get(field).cloned(),
            });
            if passes {
                out.push(network);
            }
        }
        Ok(out)
    }

    /// Pools across every network, filters applied per pool.
    pub async fn pools(&self, filters: &HashMap<String, String>) -> Result<Vec<Pool>> {
        // Surface an invalid filter once, before the fan-out.
        FilterSet::compile(filters)?;
        let networks = self.networks(&HashMap::new()).await?;
        let mut out = Vec::new();
        for network in networks {
            let manager = self.network(&network.id).await?;
            out.extend(manager.pools(filters).await?);
        }
        Ok(out)
    }
}
