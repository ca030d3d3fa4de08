//! Abstract transactional key-value store.
//!
//! The allocator and registry only ever talk to this trait. The contract is
//! deliberately narrow: revisioned gets, prefix scans, conditional
//! multi-key transactions, TTL leases, and ordered prefix watches. Anything
//! providing these semantics can back the service; the crate ships an
//! in-memory store for tests and development and a redb-backed store for
//! single-node deployments.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub mod memory;
pub mod redb;

pub use self::memory::MemoryStore;
pub use self::redb::RedbStore;

/// Handle to a TTL lease. Keys put with a lease disappear when it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

/// A key with its value and concurrency metadata.
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Number of modifications since the key was created; 0 means the key
    /// does not exist. Reset when the key is deleted. This is the
    /// optimistic-concurrency token every guard in the crate compares.
    pub version: i64,
    /// Store-wide revision at which the key was last modified.
    pub mod_revision: i64,
    pub lease: Option<LeaseId>,
}

/// Guard predicate of a transaction.
#[derive(Debug, Clone)]
pub enum Compare {
    /// The key's version equals the given value (0 ⇔ key absent).
    VersionEq(String, i64),
    /// The key's version is strictly greater (VersionGt(k, 0) ⇔ key exists).
    VersionGt(String, i64),
    /// The key exists and its value equals the given bytes.
    ValueEq(String, Vec<u8>),
}

/// Effect of a transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change observed through a watch.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
}

/// Stream of watch events for one prefix. Events for a given key arrive in
/// commit order. Dropping the stream (or calling [`WatchStream::cancel`])
/// detaches the watcher.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event; `None` once the stream is cancelled or the
    /// store shuts down. Cancel-safe.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Stop receiving events. Remaining buffered events are discarded.
    pub fn cancel(&mut self) {
        self.rx.close();
    }
}

/// The store contract. All operations are linearizable per key; `txn` is
/// atomic across its ops.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Commit `ops` iff every compare holds; returns whether it committed.
    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool>;

    /// Grant a lease; keys put with it vanish when the TTL elapses, and the
    /// deletions are delivered to watchers like any other delete.
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId>;

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}
