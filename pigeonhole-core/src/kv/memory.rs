//! In-memory implementation of the store contract.
//!
//! A single mutex over a `BTreeMap` gives linearizable single-key operations
//! and atomic transactions. Lease expiry runs on spawned timers; watchers
//! are notified synchronously under the state lock, which preserves commit
//! order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{Compare, EventKind, KeyValue, KvStore, LeaseId, TxnOp, WatchEvent, WatchStream};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    version: i64,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    revision: i64,
    next_lease: u64,
    leases: HashMap<LeaseId, HashSet<String>>,
    watchers: Vec<Watcher>,
}

impl State {
    fn notify(&mut self, kind: EventKind, key: &str) {
        self.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return true;
            }
            w.tx.send(WatchEvent {
                kind,
                key: key.to_string(),
            })
            .is_ok()
        });
    }

    fn apply_put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) {
        self.revision += 1;
        let version = self.entries.get(key).map(|e| e.version).unwrap_or(0) + 1;
        if let Some(old) = self.entries.get(key) {
            if let Some(old_lease) = old.lease {
                if Some(old_lease) != lease {
                    if let Some(keys) = self.leases.get_mut(&old_lease) {
                        keys.remove(key);
                    }
                }
            }
        }
        if let Some(lease) = lease {
            self.leases.entry(lease).or_default().insert(key.to_string());
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                version,
                mod_revision: self.revision,
                lease,
            },
        );
        self.notify(EventKind::Put, key);
    }

    fn apply_delete(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.revision += 1;
            if let Some(lease) = entry.lease {
                if let Some(keys) = self.leases.get_mut(&lease) {
                    keys.remove(key);
                }
            }
            self.notify(EventKind::Delete, key);
        }
    }

    fn check(&self, compare: &Compare) -> bool {
        match compare {
            Compare::VersionEq(key, version) => {
                self.entries.get(key).map(|e| e.version).unwrap_or(0) == *version
            }
            Compare::VersionGt(key, version) => {
                self.entries.get(key).map(|e| e.version).unwrap_or(0) > *version
            }
            Compare::ValueEq(key, value) => self
                .entries
                .get(key)
                .map(|e| e.value == *value)
                .unwrap_or(false),
        }
    }

    fn key_value(&self, key: &str) -> Option<KeyValue> {
        self.entries.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            version: e.version,
            mod_revision: e.mod_revision,
            lease: e.lease,
        })
    }
}

/// Store backed by process memory. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let state = self.state.lock().await;
        Ok(state.key_value(key))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                version: e.version,
                mod_revision: e.mod_revision,
                lease: e.lease,
            })
            .collect())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.apply_put(key, value, None);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.apply_delete(key);
        Ok(())
    }

    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !compares.iter().all(|c| state.check(c)) {
            return Ok(false);
        }
        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => state.apply_put(&key, value, lease),
                TxnOp::Delete { key } => state.apply_delete(&key),
            }
        }
        Ok(true)
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        let lease = {
            let mut state = self.state.lock().await;
            state.next_lease += 1;
            let lease = LeaseId(state.next_lease);
            state.leases.insert(lease, HashSet::new());
            lease
        };

        let shared = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut state = shared.lock().await;
            if let Some(keys) = state.leases.remove(&lease) {
                debug!(lease = lease.0, keys = keys.len(), "lease expired");
                for key in keys {
                    state.apply_delete(&key);
                }
            }
        });

        Ok(lease)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_bumps_version_and_delete_resets_it() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.put("k", b"v1".to_vec()).await.unwrap();
        let kv = store.get("k").await.unwrap().unwrap();
        assert_eq!(kv.version, 1);

        store.put("k", b"v2".to_vec()).await.unwrap();
        let kv = store.get("k").await.unwrap().unwrap();
        assert_eq!(kv.version, 2);
        assert_eq!(kv.value, b"v2");

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());

        store.put("k", b"v3".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn txn_guards_hold_or_nothing_applies() {
        let store = MemoryStore::new();
        store.put("a", b"1".to_vec()).await.unwrap();

        // Version mismatch: nothing applies.
        let committed = store
            .txn(
                vec![Compare::VersionEq("a".into(), 5)],
                vec![
                    TxnOp::Put {
                        key: "a".into(),
                        value: b"2".to_vec(),
                        lease: None,
                    },
                    TxnOp::Put {
                        key: "b".into(),
                        value: b"x".to_vec(),
                        lease: None,
                    },
                ],
            )
            .await
            .unwrap();
        assert!(!committed);
        assert!(store.get("b").await.unwrap().is_none());
        assert_eq!(store.get("a").await.unwrap().unwrap().value, b"1");

        // Matching guards commit atomically.
        let committed = store
            .txn(
                vec![
                    Compare::VersionEq("a".into(), 1),
                    Compare::ValueEq("a".into(), b"1".to_vec()),
                    Compare::VersionEq("b".into(), 0),
                ],
                vec![
                    TxnOp::Put {
                        key: "a".into(),
                        value: b"2".to_vec(),
                        lease: None,
                    },
                    TxnOp::Delete { key: "a2".into() },
                    TxnOp::Put {
                        key: "b".into(),
                        value: b"x".to_vec(),
                        lease: None,
                    },
                ],
            )
            .await
            .unwrap();
        assert!(committed);
        assert_eq!(store.get("a").await.unwrap().unwrap().value, b"2");
        assert_eq!(store.get("b").await.unwrap().unwrap().value, b"x");
    }

    #[tokio::test]
    async fn prefix_scan_is_bounded() {
        let store = MemoryStore::new();
        store.put("/x/a", b"1".to_vec()).await.unwrap();
        store.put("/x/b", b"2".to_vec()).await.unwrap();
        store.put("/y/a", b"3".to_vec()).await.unwrap();

        let kvs = store.get_prefix("/x/").await.unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(kvs[0].key, "/x/a");
        assert_eq!(kvs[1].key, "/x/b");
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expiry_deletes_keys_and_notifies_watchers() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("/leased/").await.unwrap();

        let lease = store.lease_grant(Duration::from_secs(5)).await.unwrap();
        store
            .txn(
                vec![],
                vec![TxnOp::Put {
                    key: "/leased/k".into(),
                    value: b"v".to_vec(),
                    lease: Some(lease),
                }],
            )
            .await
            .unwrap();

        let ev = watch.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Put);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let ev = watch.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Delete);
        assert_eq!(ev.key, "/leased/k");
        assert!(store.get("/leased/k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_sees_events_in_commit_order() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("/w/").await.unwrap();

        store.put("/w/k", b"1".to_vec()).await.unwrap();
        store.delete("/w/k").await.unwrap();
        store.put("/w/k", b"2".to_vec()).await.unwrap();

        assert_eq!(watch.recv().await.unwrap().kind, EventKind::Put);
        assert_eq!(watch.recv().await.unwrap().kind, EventKind::Delete);
        assert_eq!(watch.recv().await.unwrap().kind, EventKind::Put);
    }
}
