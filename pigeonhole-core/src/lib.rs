//! pigeonhole-core: distributed IP address management over a transactional
//! key-value store.
//!
//! A network carves a CIDR into lazily-materialized bitmap blocks; pools
//! layer allocation policy and the binding lifecycle on top; the registry
//! ties it together; the janitor reclaims addresses when released bindings
//! expire. All coordination happens through conditional transactions on the
//! store — the managers themselves are stateless views.

pub mod addr;
pub mod api;
pub mod block;
pub mod config;
pub mod error;
pub mod filter;
pub mod ipam;
pub mod janitor;
pub mod keys;
pub mod kv;
pub mod network;
pub mod pool;
pub mod registry;
pub mod types;

pub use error::{Error, Result};
