//! Transactional key-value substrate.
//!
//! The control plane coordinates exclusively through this store: every
//! mutation is one transaction, conflicting writers are resolved by
//! optimistic validation at commit, and idle clients block on a per-key
//! watch instead of polling.
//!
//! The authoritative state is an in-memory ordered map (control-plane
//! metadata is small); durability is a pluggable [`StorePersistence`] seam
//! with an in-memory no-op and a fjall-backed implementation. Conflict
//! detection tracks a per-key modification version: a transaction whose read
//! set (point reads and prefix scans) was overwritten after it began fails
//! with [`StoreError::Conflict`] and is re-run by the caller's retry wrapper.
//!
//! Commits hold the store lock across the durability write. That stalls
//! concurrent readers for the duration of a disk batch, but it is what keeps
//! validate-persist-publish atomic: releasing the lock between persisting
//! and updating the map would let another transaction validate against state
//! the backend has not accepted yet. Control-plane records are small and
//! written rarely, so the commit is short.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions};
use tokio::sync::watch;

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The transaction's read set was overwritten by a concurrent commit.
    #[error("transaction conflicted with a concurrent commit")]
    Conflict,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durability hook applied under the commit lock, before the in-memory state
/// is updated. A failing apply leaves the store unchanged.
pub trait StorePersistence: Send + Sync + 'static {
    fn load(&self) -> anyhow::Result<Vec<(Key, Value)>>;
    fn apply(&self, writes: &[(Key, Option<Value>)]) -> anyhow::Result<()>;
}

struct NoopPersistence;

impl StorePersistence for NoopPersistence {
    fn load(&self) -> anyhow::Result<Vec<(Key, Value)>> {
        Ok(Vec::new())
    }

    fn apply(&self, _writes: &[(Key, Option<Value>)]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fjall-backed persistence: one partition mirroring the in-memory map,
/// updated with an atomic batch per commit.
pub struct FjallPersistence {
    keyspace: Arc<Keyspace>,
    partition: fjall::PartitionHandle,
}

impl FjallPersistence {
    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let partition = keyspace
            .open_partition("control_plane", PartitionCreateOptions::default())
            .context("open control_plane partition")?;
        Ok(Self {
            keyspace,
            partition,
        })
    }
}

impl StorePersistence for FjallPersistence {
    fn load(&self) -> anyhow::Result<Vec<(Key, Value)>> {
        let mut out = Vec::new();
        for item in self.partition.range(Vec::new()..) {
            let (key, value) = item.context("scan control_plane partition")?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn apply(&self, writes: &[(Key, Option<Value>)]) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for (key, value) in writes {
            match value {
                Some(value) => batch.insert(&self.partition, key.clone(), value.clone()),
                None => batch.remove(&self.partition, key.clone()),
            }
        }
        batch.commit().context("commit control_plane batch")?;
        Ok(())
    }
}

struct Record {
    /// `None` is a tombstone: the key is absent but its modification version
    /// still participates in conflict validation.
    value: Option<Value>,
    modified: u64,
}

struct StoreInner {
    records: BTreeMap<Key, Record>,
    version: u64,
    watchers: HashMap<Key, watch::Sender<u64>>,
}

pub struct TxnStore {
    inner: Mutex<StoreInner>,
    persist: Box<dyn StorePersistence>,
}

impl TxnStore {
    /// Purely in-memory store, for tests and single-process embedding.
    pub fn memory() -> Arc<Self> {
        Self::with_persistence(Box::new(NoopPersistence))
            .unwrap_or_else(|_| unreachable!("in-memory load cannot fail"))
    }

    /// Durable store backed by a fjall keyspace.
    pub fn open_fjall(keyspace: Arc<Keyspace>) -> anyhow::Result<Arc<Self>> {
        Self::with_persistence(Box::new(FjallPersistence::open(keyspace)?))
    }

    pub fn with_persistence(persist: Box<dyn StorePersistence>) -> anyhow::Result<Arc<Self>> {
        let mut records = BTreeMap::new();
        for (key, value) in persist.load()? {
            records.insert(
                key,
                Record {
                    value: Some(value),
                    modified: 0,
                },
            );
        }
        Ok(Arc::new(Self {
            inner: Mutex::new(StoreInner {
                records,
                version: 0,
                watchers: HashMap::new(),
            }),
            persist,
        }))
    }

    /// Version of the most recent commit. A watch established against this
    /// version fires for any later mutation of the watched key, which gives
    /// fetch-then-watch the same consistency as doing both in one
    /// transaction: wakeups may be spurious, but can never be missed.
    pub fn current_version(&self) -> u64 {
        self.lock().version
    }

    pub fn begin(&self) -> Txn<'_> {
        let begin = self.lock().version;
        Txn {
            store: self,
            begin,
            reads: Vec::new(),
            read_prefixes: Vec::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Run `body` in one transaction. Conflicts surface as
    /// [`StoreError::Conflict`]; callers go through the retry wrapper.
    pub fn run<T, F>(&self, mut body: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut Txn<'_>) -> anyhow::Result<T>,
    {
        let mut txn = self.begin();
        let out = body(&mut txn).map_err(StoreError::Backend)?;
        txn.commit()?;
        Ok(out)
    }

    /// Watch `key` for any modification after `after`. Resolves immediately
    /// if the key was already modified past that version.
    pub fn watch(&self, key: &[u8], after: u64) -> KeyWatch {
        let mut inner = self.lock();
        let current = inner
            .records
            .get(key)
            .map(|record| record.modified)
            .unwrap_or(0);
        let sender = inner
            .watchers
            .entry(key.to_vec())
            .or_insert_with(|| watch::channel(current).0);
        KeyWatch {
            rx: sender.subscribe(),
            after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // Mutex poisoning only happens if a commit panicked; propagating the
        // panic is the only sane continuation.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Future that resolves once the watched key changes. Cancel by dropping, or
/// race it against a `CancellationToken` in a `select!`.
pub struct KeyWatch {
    rx: watch::Receiver<u64>,
    after: u64,
}

impl KeyWatch {
    pub async fn wait(mut self) {
        // The sender lives inside the store; an error means the store itself
        // was dropped, which only happens at process teardown.
        let _ = self.rx.wait_for(|version| *version > self.after).await;
    }
}

pub struct Txn<'s> {
    store: &'s TxnStore,
    begin: u64,
    reads: Vec<Key>,
    read_prefixes: Vec<Key>,
    writes: BTreeMap<Key, Option<Value>>,
}

impl Txn<'_> {
    pub fn get(&mut self, key: &[u8]) -> Option<Value> {
        if let Some(pending) = self.writes.get(key) {
            return pending.clone();
        }
        self.reads.push(key.to_vec());
        let inner = self.store.lock();
        inner.records.get(key).and_then(|record| record.value.clone())
    }

    /// Ordered scan of all live keys under `prefix`, merged with this
    /// transaction's pending writes.
    pub fn scan_prefix(&mut self, prefix: &[u8]) -> Vec<(Key, Value)> {
        self.read_prefixes.push(prefix.to_vec());
        let mut merged: BTreeMap<Key, Value> = {
            let inner = self.store.lock();
            inner
                .records
                .range(prefix.to_vec()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .filter_map(|(key, record)| {
                    record.value.as_ref().map(|value| (key.clone(), value.clone()))
                })
                .collect()
        };
        for (key, pending) in self.writes.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    pub fn set(&mut self, key: Key, value: Value) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Key) {
        self.writes.insert(key, None);
    }

    pub fn commit(self) -> Result<(), StoreError> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut inner = self.store.lock();

        for key in &self.reads {
            if let Some(record) = inner.records.get(key) {
                if record.modified > self.begin {
                    return Err(StoreError::Conflict);
                }
            }
        }
        for prefix in &self.read_prefixes {
            let dirty = inner
                .records
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(prefix.as_slice()))
                .any(|(_, record)| record.modified > self.begin);
            if dirty {
                return Err(StoreError::Conflict);
            }
        }

        let writes: Vec<(Key, Option<Value>)> = self.writes.into_iter().collect();
        self.store.persist.apply(&writes)?;

        inner.version += 1;
        let version = inner.version;
        for (key, value) in writes {
            if let Some(sender) = inner.watchers.get(&key) {
                let _ = sender.send_replace(version);
            }
            inner.records.insert(
                key,
                Record {
                    value,
                    modified: version,
                },
            );
        }
        Ok(())
    }
}
