//! Shared fixtures for integration tests.

use std::sync::Arc;

use pigeonhole_core::config::AllocatorConfig;
use pigeonhole_core::kv::{KvStore, MemoryStore};
use pigeonhole_core::registry::Registry;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pigeonhole_core=debug")
        .try_init();
}

pub fn memory_store() -> Arc<dyn KvStore> {
    Arc::new(MemoryStore::new())
}

pub fn registry(kv: &Arc<dyn KvStore>) -> Registry {
    Registry::with_config(Arc::clone(kv), AllocatorConfig::default())
}
