//! redb-backed implementation of the store contract.
//!
//! One embedded database file holds three tables: entry records (value plus
//! version/revision/lease metadata, bincode-encoded), a meta table with the
//! store-wide revision counter, and lease records. redb has a single writer,
//! so mutations are serialized through one async mutex that is held across
//! commit *and* watcher notification — that is what keeps watch delivery in
//! commit order. Blocking database work runs on the blocking pool.
//!
//! Watches and lease timers are in-process: this store backs a single-node
//! deployment, where the only watcher is the janitor in the same process.
//! Leases are persisted, so a restart re-arms outstanding TTLs.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{Compare, EventKind, KeyValue, KvStore, LeaseId, TxnOp, WatchEvent, WatchStream};
use crate::error::{Error, Result};

const ENTRY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv_entries");
const META_TABLE: TableDefinition<&str, i64> = TableDefinition::new("kv_meta");
const LEASE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("kv_leases");

const REVISION_KEY: &str = "revision";
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: Vec<u8>,
    version: i64,
    mod_revision: i64,
    lease: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredLease {
    expires_at_ms: i64,
    keys: Vec<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

struct Shared {
    /// Serializes every mutation together with its watcher notification.
    write_lock: Mutex<()>,
    watchers: Mutex<Vec<Watcher>>,
    next_lease: AtomicU64,
}

/// Store backed by an embedded redb database.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    shared: Arc<Shared>,
}

impl RedbStore {
    /// Open (or create) the database at `path` and start the lease sweeper.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).map_err(|e| Error::store("open database", e))?;
        let db = Arc::new(db);

        // Make sure all tables exist and find the highest granted lease id.
        let mut max_lease = 0u64;
        {
            let txn = db
                .begin_write()
                .map_err(|e| Error::store("open database", e))?;
            {
                txn.open_table(ENTRY_TABLE)
                    .map_err(|e| Error::store("open entry table", e))?;
                txn.open_table(META_TABLE)
                    .map_err(|e| Error::store("open meta table", e))?;
                let leases = txn
                    .open_table(LEASE_TABLE)
                    .map_err(|e| Error::store("open lease table", e))?;
                let last_entry = leases
                    .last()
                    .map_err(|e| Error::store("scan lease table", e))?;
                if let Some(entry) = last_entry {
                    max_lease = entry.0.value();
                }
            }
            txn.commit().map_err(|e| Error::store("open database", e))?;
        }

        let store = Self {
            db,
            shared: Arc::new(Shared {
                write_lock: Mutex::new(()),
                watchers: Mutex::new(Vec::new()),
                next_lease: AtomicU64::new(max_lease),
            }),
        };
        store.spawn_lease_sweeper();
        Ok(store)
    }

    fn spawn_lease_sweeper(&self) {
        let db: Weak<Database> = Arc::downgrade(&self.db);
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_SWEEP_INTERVAL).await;
                let (Some(db), Some(shared)) = (db.upgrade(), shared.upgrade()) else {
                    break;
                };
                if let Err(e) = sweep_expired_leases(&db, &shared).await {
                    warn!("lease sweep failed: {e}");
                }
            }
        });
    }

    async fn notify(&self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let mut watchers = self.shared.watchers.lock().await;
        for event in events {
            watchers.retain(|w| {
                if !event.key.starts_with(&w.prefix) {
                    return true;
                }
                w.tx.send(event.clone()).is_ok()
            });
        }
    }

    /// Run a mutation on the blocking pool while holding the write lock,
    /// then deliver the events it produced.
    async fn mutate<F, R>(&self, operation: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&Database) -> Result<(R, Vec<WatchEvent>)> + Send + 'static,
        R: Send + 'static,
    {
        let _guard = self.shared.write_lock.lock().await;
        let db = Arc::clone(&self.db);
        let (result, events) = tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::store(operation, e))??;
        self.notify(events).await;
        Ok(result)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn decode_entry(bytes: &[u8]) -> Result<StoredEntry> {
    bincode::deserialize(bytes).map_err(|e| Error::serialization("decode store entry", e))
}

fn encode_entry(entry: &StoredEntry) -> Result<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| Error::serialization("encode store entry", e))
}

fn decode_lease(bytes: &[u8]) -> Result<StoredLease> {
    bincode::deserialize(bytes).map_err(|e| Error::serialization("decode lease", e))
}

fn encode_lease(lease: &StoredLease) -> Result<Vec<u8>> {
    bincode::serialize(lease).map_err(|e| Error::serialization("encode lease", e))
}

/// All mutation paths funnel through this context so version counting,
/// lease attachment, and event recording stay in one place.
struct MutationCtx<'txn> {
    entries: redb::Table<'txn, &'static str, &'static [u8]>,
    leases: redb::Table<'txn, u64, &'static [u8]>,
    meta: redb::Table<'txn, &'static str, i64>,
    revision: i64,
    events: Vec<WatchEvent>,
}

impl<'txn> MutationCtx<'txn> {
    fn new(txn: &'txn redb::WriteTransaction) -> Result<Self> {
        let entries = txn
            .open_table(ENTRY_TABLE)
            .map_err(|e| Error::store("open entry table", e))?;
        let leases = txn
            .open_table(LEASE_TABLE)
            .map_err(|e| Error::store("open lease table", e))?;
        let meta = txn
            .open_table(META_TABLE)
            .map_err(|e| Error::store("open meta table", e))?;
        let revision = meta
            .get(REVISION_KEY)
            .map_err(|e| Error::store("read revision", e))?
            .map(|v| v.value())
            .unwrap_or(0);
        Ok(Self {
            entries,
            leases,
            meta,
            revision,
            events: Vec::new(),
        })
    }

    fn current(&self, key: &str) -> Result<Option<StoredEntry>> {
        match self
            .entries
            .get(key)
            .map_err(|e| Error::store("read entry", e))?
        {
            Some(guard) => Ok(Some(decode_entry(guard.value())?)),
            None => Ok(None),
        }
    }

    fn check(&self, compare: &Compare) -> Result<bool> {
        Ok(match compare {
            Compare::VersionEq(key, version) => {
                self.current(key)?.map(|e| e.version).unwrap_or(0) == *version
            }
            Compare::VersionGt(key, version) => {
                self.current(key)?.map(|e| e.version).unwrap_or(0) > *version
            }
            Compare::ValueEq(key, value) => self
                .current(key)?
                .map(|e| e.value == *value)
                .unwrap_or(false),
        })
    }

    fn detach_lease(&mut self, lease: u64, key: &str) -> Result<()> {
        let record = match self
            .leases
            .get(lease)
            .map_err(|e| Error::store("read lease", e))?
        {
            Some(guard) => Some(decode_lease(guard.value())?),
            None => None,
        };
        if let Some(mut record) = record {
            record.keys.retain(|k| k != key);
            let bytes = encode_lease(&record)?;
            self.leases
                .insert(lease, bytes.as_slice())
                .map_err(|e| Error::store("write lease", e))?;
        }
        Ok(())
    }

    fn attach_lease(&mut self, lease: u64, key: &str) -> Result<()> {
        let record = match self
            .leases
            .get(lease)
            .map_err(|e| Error::store("read lease", e))?
        {
            Some(guard) => Some(decode_lease(guard.value())?),
            None => None,
        };
        let mut record = record.ok_or_else(|| {
            Error::invalid_argument("lease", format!("lease {lease} does not exist"))
        })?;
        if !record.keys.iter().any(|k| k == key) {
            record.keys.push(key.to_string());
        }
        let bytes = encode_lease(&record)?;
        self.leases
            .insert(lease, bytes.as_slice())
            .map_err(|e| Error::store("write lease", e))?;
        Ok(())
    }

    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()> {
        let previous = self.current(key)?;
        let version = previous.as_ref().map(|e| e.version).unwrap_or(0) + 1;
        if let Some(old_lease) = previous.as_ref().and_then(|e| e.lease) {
            if Some(old_lease) != lease.map(|l| l.0) {
                self.detach_lease(old_lease, key)?;
            }
        }
        if let Some(lease) = lease {
            self.attach_lease(lease.0, key)?;
        }
        self.revision += 1;
        let entry = StoredEntry {
            value,
            version,
            mod_revision: self.revision,
            lease: lease.map(|l| l.0),
        };
        let bytes = encode_entry(&entry)?;
        self.entries
            .insert(key, bytes.as_slice())
            .map_err(|e| Error::store("write entry", e))?;
        self.events.push(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
        });
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let decoded = {
            let previous = self
                .entries
                .remove(key)
                .map_err(|e| Error::store("delete entry", e))?;
            match previous {
                Some(guard) => Some(decode_entry(guard.value())?),
                None => None,
            }
        };
        if let Some(entry) = decoded {
            if let Some(lease) = entry.lease {
                self.detach_lease(lease, key)?;
            }
            self.revision += 1;
            self.events.push(WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<WatchEvent>> {
        self.meta
            .insert(REVISION_KEY, self.revision)
            .map_err(|e| Error::store("write revision", e))?;
        Ok(self.events)
    }
}

async fn sweep_expired_leases(db: &Arc<Database>, shared: &Arc<Shared>) -> Result<()> {
    let _guard = shared.write_lock.lock().await;
    let db_clone = Arc::clone(db);
    let events = tokio::task::spawn_blocking(move || -> Result<Vec<WatchEvent>> {
        let txn = db_clone
            .begin_write()
            .map_err(|e| Error::store("lease sweep", e))?;
        let events;
        {
            let mut ctx = MutationCtx::new(&txn)?;
            let now = now_ms();
            let mut expired: Vec<(u64, Vec<String>)> = Vec::new();
            {
                let iter = ctx
                    .leases
                    .iter()
                    .map_err(|e| Error::store("scan leases", e))?;
                for item in iter {
                    let (id, value) = item.map_err(|e| Error::store("scan leases", e))?;
                    let record = decode_lease(value.value())?;
                    if record.expires_at_ms <= now {
                        expired.push((id.value(), record.keys));
                    }
                }
            }
            for (id, keys) in expired {
                debug!(lease = id, keys = keys.len(), "lease expired");
                for key in keys {
                    ctx.delete(&key)?;
                }
                ctx.leases
                    .remove(id)
                    .map_err(|e| Error::store("remove lease", e))?;
            }
            events = ctx.finish()?;
        }
        txn.commit().map_err(|e| Error::store("lease sweep", e))?;
        Ok(events)
    })
    .await
    .map_err(|e| Error::store("lease sweep", e))??;

    if !events.is_empty() {
        let mut watchers = shared.watchers.lock().await;
        for event in events {
            watchers.retain(|w| {
                if !event.key.starts_with(&w.prefix) {
                    return true;
                }
                w.tx.send(event.clone()).is_ok()
            });
        }
    }
    Ok(())
}

#[async_trait]
impl KvStore for RedbStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<KeyValue>> {
            let txn = db.begin_read().map_err(|e| Error::store("read", e))?;
            let table = txn
                .open_table(ENTRY_TABLE)
                .map_err(|e| Error::store("open entry table", e))?;
            match table.get(key.as_str()).map_err(|e| Error::store("read", e))? {
                Some(guard) => {
                    let entry = decode_entry(guard.value())?;
                    Ok(Some(KeyValue {
                        key,
                        value: entry.value,
                        version: entry.version,
                        mod_revision: entry.mod_revision,
                        lease: entry.lease.map(LeaseId),
                    }))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| Error::store("read", e))?
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let db = Arc::clone(&self.db);
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<KeyValue>> {
            let txn = db.begin_read().map_err(|e| Error::store("read range", e))?;
            let table = txn
                .open_table(ENTRY_TABLE)
                .map_err(|e| Error::store("open entry table", e))?;
            let mut out = Vec::new();
            let iter = table
                .range(prefix.as_str()..)
                .map_err(|e| Error::store("read range", e))?;
            for item in iter {
                let (key, value) = item.map_err(|e| Error::store("read range", e))?;
                if !key.value().starts_with(prefix.as_str()) {
                    break;
                }
                let entry = decode_entry(value.value())?;
                out.push(KeyValue {
                    key: key.value().to_string(),
                    value: entry.value,
                    version: entry.version,
                    mod_revision: entry.mod_revision,
                    lease: entry.lease.map(LeaseId),
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::store("read range", e))?
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let key = key.to_string();
        self.mutate("put", move |db| {
            let txn = db.begin_write().map_err(|e| Error::store("put", e))?;
            let events;
            {
                let mut ctx = MutationCtx::new(&txn)?;
                ctx.put(&key, value, None)?;
                events = ctx.finish()?;
            }
            txn.commit().map_err(|e| Error::store("put", e))?;
            Ok(((), events))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.mutate("delete", move |db| {
            let txn = db.begin_write().map_err(|e| Error::store("delete", e))?;
            let events;
            {
                let mut ctx = MutationCtx::new(&txn)?;
                ctx.delete(&key)?;
                events = ctx.finish()?;
            }
            txn.commit().map_err(|e| Error::store("delete", e))?;
            Ok(((), events))
        })
        .await
    }

    async fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool> {
        self.mutate("txn", move |db| {
            let txn = db.begin_write().map_err(|e| Error::store("txn", e))?;
            let events;
            let committed;
            {
                let mut ctx = MutationCtx::new(&txn)?;
                let mut holds = true;
                for compare in &compares {
                    if !ctx.check(compare)? {
                        holds = false;
                        break;
                    }
                }
                committed = holds;
                if holds {
                    for op in ops {
                        match op {
                            TxnOp::Put { key, value, lease } => ctx.put(&key, value, lease)?,
                            TxnOp::Delete { key } => ctx.delete(&key)?,
                        }
                    }
                }
                events = ctx.finish()?;
            }
            txn.commit().map_err(|e| Error::store("txn", e))?;
            Ok((committed, events))
        })
        .await
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        let id = self.shared.next_lease.fetch_add(1, Ordering::SeqCst) + 1;
        let expires_at_ms = now_ms() + ttl.as_millis() as i64;
        self.mutate("lease grant", move |db| {
            let txn = db
                .begin_write()
                .map_err(|e| Error::store("lease grant", e))?;
            {
                let mut leases = txn
                    .open_table(LEASE_TABLE)
                    .map_err(|e| Error::store("open lease table", e))?;
                let record = StoredLease {
                    expires_at_ms,
                    keys: Vec::new(),
                };
                let bytes = encode_lease(&record)?;
                leases
                    .insert(id, bytes.as_slice())
                    .map_err(|e| Error::store("write lease", e))?;
            }
            txn.commit().map_err(|e| Error::store("lease grant", e))?;
            Ok((LeaseId(id), Vec::new()))
        })
        .await
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watchers = self.shared.watchers.lock().await;
        watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("kv.redb")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.put("/k", b"persisted".to_vec()).await.unwrap();
            store.put("/k", b"persisted2".to_vec()).await.unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        let kv = store.get("/k").await.unwrap().unwrap();
        assert_eq!(kv.value, b"persisted2");
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn txn_version_guard() {
        let (_dir, store) = temp_store();
        store.put("/a", b"1".to_vec()).await.unwrap();

        let committed = store
            .txn(
                vec![Compare::VersionEq("/a".into(), 0)],
                vec![TxnOp::Put {
                    key: "/a".into(),
                    value: b"2".to_vec(),
                    lease: None,
                }],
            )
            .await
            .unwrap();
        assert!(!committed);

        let committed = store
            .txn(
                vec![Compare::VersionEq("/a".into(), 1)],
                vec![TxnOp::Put {
                    key: "/a".into(),
                    value: b"2".to_vec(),
                    lease: None,
                }],
            )
            .await
            .unwrap();
        assert!(committed);
        assert_eq!(store.get("/a").await.unwrap().unwrap().value, b"2");
    }

    #[tokio::test]
    async fn lease_expiry_sweeps_keys() {
        let (_dir, store) = temp_store();
        let mut watch = store.watch_prefix("/leased/").await.unwrap();

        let lease = store.lease_grant(Duration::from_millis(100)).await.unwrap();
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
        assert_eq!(watch.recv().await.unwrap().kind, EventKind::Put);

        // The sweeper ticks every second; give it two.
        let deleted = tokio::time::timeout(Duration::from_secs(3), watch.recv())
            .await
            .expect("expiry event in time")
            .expect("stream open");
        assert_eq!(deleted.kind, EventKind::Delete);
        assert!(store.get("/leased/k").await.unwrap().is_none());
    }
}
