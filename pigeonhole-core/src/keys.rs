//! Key paths for everything persisted in the KV store.
//!
//! Two prefixes: allocator state lives under the IPAM prefix, everything the
//! registry owns (networks, pools, bindings, reservations) under the
//! registry prefix. Addresses inside keys always use the canonical form from
//! [`crate::addr`].

use std::net::IpAddr;

use crate::addr::canonical_addr;

/// Prefix for all allocator keys.
pub const IPAM_PREFIX: &str = "/postal/ipam/v1";
/// Prefix for all registry keys.
pub const REGISTRY_PREFIX: &str = "/postal/registry/v1";

pub fn ipam_cidr_key(ipam_id: &str) -> String {
    format!("{IPAM_PREFIX}/{ipam_id}/cidr")
}

pub fn ipam_next_key(ipam_id: &str) -> String {
    format!("{IPAM_PREFIX}/{ipam_id}/nextKey")
}

pub fn ipam_blocks_prefix(ipam_id: &str) -> String {
    format!("{IPAM_PREFIX}/{ipam_id}/allocations")
}

pub fn ipam_block_key(ipam_id: &str, block_addr: IpAddr) -> String {
    format!(
        "{}/{}",
        ipam_blocks_prefix(ipam_id),
        canonical_addr(block_addr)
    )
}

pub fn networks_prefix() -> String {
    format!("{REGISTRY_PREFIX}/networks")
}

pub fn network_meta_key(network_id: &str) -> String {
    format!("{}/{network_id}", networks_prefix())
}

/// Prefix covering a network's pools, bindings, and reservations; this is
/// what the janitor watches.
pub fn network_subtree_prefix() -> String {
    format!("{REGISTRY_PREFIX}/network")
}

pub fn network_pools_prefix(network_id: &str) -> String {
    format!("{REGISTRY_PREFIX}/network/{network_id}/pools")
}

pub fn pool_meta_key(network_id: &str, pool_id: &str) -> String {
    format!("{}/{pool_id}", network_pools_prefix(network_id))
}

/// Prefix of a pool's authoritative per-id binding records.
pub fn pool_bindings_prefix(network_id: &str, pool_id: &str) -> String {
    format!("{REGISTRY_PREFIX}/network/{network_id}/pool/{pool_id}/bindings")
}

pub fn binding_id_key(network_id: &str, pool_id: &str, binding_id: &str) -> String {
    format!("{}/{binding_id}", pool_bindings_prefix(network_id, pool_id))
}

/// Prefix of a network's per-address binding index.
pub fn network_bindings_prefix(network_id: &str) -> String {
    format!("{REGISTRY_PREFIX}/network/{network_id}/bindings")
}

/// Per-address index key; its value is the per-id key path of the binding
/// that owns the address.
pub fn binding_addr_key(network_id: &str, addr: IpAddr) -> String {
    format!(
        "{}/{}",
        network_bindings_prefix(network_id),
        canonical_addr(addr)
    )
}

pub fn network_reservations_prefix(network_id: &str) -> String {
    format!("{REGISTRY_PREFIX}/network/{network_id}/reservations")
}

pub fn reservation_key(network_id: &str, cidr: &str) -> String {
    format!("{}/{cidr}", network_reservations_prefix(network_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn binding_keys_are_distinguishable() {
        let addr = IpAddr::from_str("10.0.0.7").unwrap();
        let by_addr = binding_addr_key("net-1", addr);
        let by_id = binding_id_key("net-1", "pool-1", "bind-1");
        assert_eq!(by_addr, "/postal/registry/v1/network/net-1/bindings/010/000/000/007");
        assert_eq!(
            by_id,
            "/postal/registry/v1/network/net-1/pool/pool-1/bindings/bind-1"
        );
        // The per-id key must never match the per-address pattern the
        // janitor acts on.
        assert!(by_addr.starts_with(&network_bindings_prefix("net-1")));
        assert!(!by_id.starts_with(&network_bindings_prefix("net-1")));
    }
}
