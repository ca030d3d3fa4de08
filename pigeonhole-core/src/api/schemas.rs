//! Request/response messages of the service surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Annotations, Binding, Network, Pool, PoolType};

/// Pool reference in requests; `id` may be empty where an operation ranges
/// over a whole network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRef {
    pub network_id: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAddRequest {
    pub cidr: String,
    #[serde(default)]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAddResponse {
    pub network: Network,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRangeRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRangeResponse {
    pub networks: Vec<Network>,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAddRequest {
    pub network_id: String,
    #[serde(rename = "type")]
    pub pool_type: PoolType,
    #[serde(default)]
    pub maximum: u64,
    #[serde(default)]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAddResponse {
    pub pool: Pool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolRangeRequest {
    #[serde(default)]
    pub id: Option<PoolRef>,
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRangeResponse {
    pub pools: Vec<Pool>,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSetMaxRequest {
    pub pool_id: PoolRef,
    pub maximum: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSetMaxResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingRangeRequest {
    pub network_id: String,
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingRangeResponse {
    pub bindings: Vec<Binding>,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateAddressRequest {
    pub pool_id: PoolRef,
    /// Specific address to reserve; empty lets the allocator pick.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateAddressResponse {
    pub binding: Binding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAllocateAddressRequest {
    pub pool_id: PoolRef,
    /// Every address of this CIDR is allocated individually.
    pub cidr: String,
    #[serde(default)]
    pub annotations: Annotations,
}

/// Bulk allocation never fails wholesale while partial progress is
/// possible; per-address failures ride along in `errors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAllocateAddressResponse {
    pub bindings: Vec<Binding>,
    pub errors: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindAddressRequest {
    pub pool_id: PoolRef,
    /// Specific address to bind; empty binds any available one.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindAddressResponse {
    pub binding: Binding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAddressRequest {
    pub pool_id: PoolRef,
    /// Release by address…
    #[serde(default)]
    pub address: String,
    /// …or by binding id within the pool.
    #[serde(default)]
    pub binding_id: String,
    #[serde(default)]
    pub hard: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAddressResponse {}

/// Error payload returned by the REST layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
