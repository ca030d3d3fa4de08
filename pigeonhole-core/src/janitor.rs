//! Janitor: background reclamation of released addresses.
//!
//! Soft-released bindings in dynamic pools sit under a TTL lease; when the
//! lease expires the store deletes both binding keys. Hard releases delete
//! them synchronously. Either way the per-address index deletion flows
//! through the watch, and the janitor turns it back into an allocator
//! release. The whole path is idempotent — releasing a free address is a
//! no-op — so running several janitors is safe.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::addr::parse_canonical;
use crate::config::AllocatorConfig;
use crate::error::Result;
use crate::keys::network_subtree_prefix;
use crate::kv::{EventKind, KvStore};
use crate::registry::Registry;

/// Matches per-address binding index keys; the per-id keys carry an extra
/// `/pool/<id>/` segment and never match.
static BINDING_ADDR_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/postal/registry/v1/network/([0-9a-zA-Z-]+)/bindings/(.+)$")
        .expect("binding key pattern")
});

/// Handle for stopping a running janitor.
pub struct JanitorHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Ask the janitor to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Watch consumer converting binding-key deletions into allocator releases.
pub struct Janitor {
    kv: Arc<dyn KvStore>,
    config: AllocatorConfig,
}

impl Janitor {
    pub fn new(kv: Arc<dyn KvStore>, config: AllocatorConfig) -> Self {
        Self { kv, config }
    }

    /// Start watching; returns once the watch is registered so no deletion
    /// between spawn and first poll is missed.
    pub async fn spawn(self) -> Result<JanitorHandle> {
        let mut watch = self.kv.watch_prefix(&network_subtree_prefix()).await?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let task = tokio::spawn(async move {
            info!("janitor started");
            loop {
                tokio::select! {
                    event = watch.recv() => {
                        match event {
                            Some(event) if event.kind == EventKind::Delete => {
                                self.handle_delete(&event.key).await;
                            }
                            Some(_) => {}
                            None => {
                                info!("janitor watch closed");
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        watch.cancel();
                        info!("janitor shutting down");
                        break;
                    }
                }
            }
        });

        Ok(JanitorHandle { shutdown_tx, task })
    }

    async fn handle_delete(&self, key: &str) {
        let Some(captures) = BINDING_ADDR_KEY.captures(key) else {
            return;
        };
        let (Some(network_id), Some(canonical)) = (captures.get(1), captures.get(2)) else {
            return;
        };

        let addr = match parse_canonical(canonical.as_str()) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(key, "janitor: undecodable address in binding key: {e}");
                return;
            }
        };

        let registry = Registry::with_config(Arc::clone(&self.kv), self.config.clone());
        let manager = match registry.network(network_id.as_str()).await {
            Ok(manager) => manager,
            Err(e) => {
                warn!(network = network_id.as_str(), "janitor: network lookup failed: {e}");
                return;
            }
        };

        match manager.ipam().release(addr).await {
            Ok(()) => debug!(network = network_id.as_str(), %addr, "janitor reclaimed address"),
            Err(e) => warn!(network = network_id.as_str(), %addr, "janitor release failed: {e}"),
        }
    }
}
