//! Binding lifecycle over dynamic and fixed pools.

mod common;

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;

use pigeonhole_core::error::Error;
use pigeonhole_core::types::{BindingState, PoolType};

use common::{init_tracing, memory_store, registry};

fn ip(s: &str) -> IpAddr {
    IpAddr::from_str(s).unwrap()
}

#[tokio::test]
async fn dynamic_pool_lifecycle() {
    init_tracing();
    let kv = memory_store();
    let network = registry(&kv)
        .new_network(HashMap::new(), "10.0.0.0/16")
        .await
        .unwrap();
    let pool = network
        .new_pool(HashMap::new(), 3, PoolType::Dynamic)
        .await
        .unwrap();

    // Reserve an address without binding it.
    let allocated = pool.allocate(HashMap::new(), None).await.unwrap();
    assert_eq!(allocated.state(), BindingState::Allocated);
    let addr = ip(&allocated.address);
    assert!(ipnet::IpNet::from_str("10.0.0.0/16").unwrap().contains(&addr));

    // Binding with no address reuses the allocated binding.
    let bound = pool.bind_any(HashMap::new()).await.unwrap();
    assert_eq!(bound.id, allocated.id);
    assert_eq!(bound.address, allocated.address);
    assert_eq!(bound.state(), BindingState::Bound);

    // Two more fit under the maximum of three.
    let second = pool.bind_any(HashMap::new()).await.unwrap();
    let third = pool.bind_any(HashMap::new()).await.unwrap();
    assert_ne!(second.address, bound.address);
    assert_ne!(third.address, second.address);

    // The fourth hits the capacity limit.
    let err = pool.bind_any(HashMap::new()).await.unwrap_err();
    assert!(matches!(err, Error::Capacity { maximum: 3, .. }), "{err}");
}

#[tokio::test]
async fn fixed_pool_requires_explicit_allocation() {
    init_tracing();
    let kv = memory_store();
    let network = registry(&kv)
        .new_network(HashMap::new(), "10.0.0.0/16")
        .await
        .unwrap();
    let pool = network
        .new_pool(HashMap::new(), 3, PoolType::Fixed)
        .await
        .unwrap();

    // Nothing allocated yet: a fixed pool cannot bind.
    let err = pool.bind_any(HashMap::new()).await.unwrap_err();
    assert!(matches!(err, Error::NoFree { .. }), "{err}");

    // After an explicit allocation the bind succeeds against it.
    let allocated = pool.allocate(HashMap::new(), None).await.unwrap();
    let bound = pool.bind_any(HashMap::new()).await.unwrap();
    assert_eq!(bound.id, allocated.id);
    assert_eq!(bound.state(), BindingState::Bound);

    // Bind with a specific, never-allocated address also refuses.
    let err = pool
        .bind(HashMap::new(), ip("10.0.0.200"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoFree { .. }), "{err}");
}

#[tokio::test]
async fn same_address_cannot_be_allocated_twice() {
    init_tracing();
    let kv = memory_store();
    let network = registry(&kv)
        .new_network(HashMap::new(), "10.0.0.0/16")
        .await
        .unwrap();
    let pool = network
        .new_pool(HashMap::new(), 5, PoolType::Fixed)
        .await
        .unwrap();

    let binding = pool
        .allocate(HashMap::new(), Some(ip("10.0.0.1")))
        .await
        .unwrap();
    assert_eq!(binding.address, "10.0.0.1");
    assert_eq!(binding.pool_id, pool.pool().id);

    let err = pool
        .allocate(HashMap::new(), Some(ip("10.0.0.1")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }), "{err}");

    // Uniqueness holds across pools of the same network.
    let other = network
        .new_pool(HashMap::new(), 5, PoolType::Fixed)
        .await
        .unwrap();
    let err = other
        .allocate(HashMap::new(), Some(ip("10.0.0.1")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }), "{err}");
}

#[tokio::test]
async fn rebinding_a_specific_allocated_address() {
    init_tracing();
    let kv = memory_store();
    let network = registry(&kv)
        .new_network(HashMap::new(), "10.1.0.0/24")
        .await
        .unwrap();
    let pool = network
        .new_pool(HashMap::new(), 0, PoolType::Fixed)
        .await
        .unwrap();

    let allocated = pool
        .allocate(HashMap::new(), Some(ip("10.1.0.9")))
        .await
        .unwrap();

    let mut notes = HashMap::new();
    notes.insert("owner".to_string(), "svc-a".to_string());
    let bound = pool.bind(notes.clone(), ip("10.1.0.9")).await.unwrap();
    assert_eq!(bound.id, allocated.id);
    assert_eq!(bound.annotations, notes);
    assert!(bound.bind_time > 0);

    // Binding an address that is already actively bound fails.
    let err = pool.bind(HashMap::new(), ip("10.1.0.9")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { .. }), "{err}");
}

#[tokio::test]
async fn release_transitions_and_rejects_double_release() {
    init_tracing();
    let kv = memory_store();
    let network = registry(&kv)
        .new_network(HashMap::new(), "10.2.0.0/24")
        .await
        .unwrap();
    let pool = network
        .new_pool(HashMap::new(), 0, PoolType::Fixed)
        .await
        .unwrap();

    pool.allocate(HashMap::new(), Some(ip("10.2.0.5")))
        .await
        .unwrap();
    let bound = pool.bind(HashMap::new(), ip("10.2.0.5")).await.unwrap();

    let released = pool.release(&bound, false).await.unwrap();
    assert_eq!(released.state(), BindingState::Released);
    assert!(released.release_time > released.bind_time);

    // Releasing a binding that is no longer bound is an error.
    let err = pool.release(&bound, false).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }), "{err}");

    // A fixed pool keeps the released binding around for re-binding.
    let again = pool.bind(HashMap::new(), ip("10.2.0.5")).await.unwrap();
    assert_eq!(again.id, bound.id);
    assert_eq!(again.state(), BindingState::Bound);
}

#[tokio::test]
async fn set_max_size_respects_current_size() {
    init_tracing();
    let kv = memory_store();
    let network = registry(&kv)
        .new_network(HashMap::new(), "10.3.0.0/24")
        .await
        .unwrap();
    let mut pool = network
        .new_pool(HashMap::new(), 5, PoolType::Fixed)
        .await
        .unwrap();

    for i in 1..=5 {
        pool.allocate(HashMap::new(), Some(ip(&format!("10.3.0.{i}"))))
            .await
            .unwrap();
    }

    let err = pool.set_max_size(2).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }), "{err}");

    pool.set_max_size(6).await.unwrap();

    pool.allocate(HashMap::new(), Some(ip("10.3.0.100")))
        .await
        .unwrap();
    let err = pool
        .allocate(HashMap::new(), Some(ip("10.3.0.101")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Capacity { .. }), "{err}");
}

#[tokio::test]
async fn binding_filters_apply_and_semantics() {
    init_tracing();
    let kv = memory_store();
    let network = registry(&kv)
        .new_network(HashMap::new(), "10.4.0.0/24")
        .await
        .unwrap();
    let pool = network
        .new_pool(HashMap::new(), 0, PoolType::Dynamic)
        .await
        .unwrap();

    let mut blue = HashMap::new();
    blue.insert("team".to_string(), "blue".to_string());
    let mut red = HashMap::new();
    red.insert("team".to_string(), "red".to_string());

    pool.bind(blue.clone(), ip("10.4.0.10")).await.unwrap();
    pool.bind(red, ip("10.4.0.11")).await.unwrap();

    let mut filters = HashMap::new();
    filters.insert("team".to_string(), "^blue$".to_string());
    let bindings = pool.bindings(&filters).await.unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].address, "10.4.0.10");

    filters.insert("_address".to_string(), "10\\.4\\.0\\.99".to_string());
    let bindings = pool.bindings(&filters).await.unwrap();
    assert!(bindings.is_empty());

    let mut bad = HashMap::new();
    bad.insert("team".to_string(), "(open".to_string());
    let err = pool.bindings(&bad).await.unwrap_err();
    assert!(matches!(err, Error::InvalidFilter { .. }), "{err}");
}
