//! Shard regions and the client surface a worker process uses.
//!
//! A region is a named ring of shards. Region metadata is immutable after
//! creation and stored twice, keyed by name for open-by-name and by id for
//! enumeration by the scheduler daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::allocation::{fetch_allocations, Allocation, AllocationSnapshot};
use crate::keys;
use crate::metrics::{NoopMetrics, ShardMetrics};
use crate::reconcile::{run_allocator, ShardFactory};
use crate::registry::{get_shard_region_nodes, NodeLease};
use crate::retry::run_txn;
use crate::ring::shard_of;
use crate::store::{Txn, TxnStore};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRegion {
    pub id: u64,
    pub name: String,
    pub ring_size: u32,
}

/// Open a region by name, creating it on first use. The ring size is fixed
/// at creation; a later open requesting a different size gets the stored
/// region back with a warning, never a resize.
pub async fn get_or_create_shard_region(
    store: &Arc<TxnStore>,
    name: &str,
    ring_size: u32,
) -> anyhow::Result<ShardRegion> {
    anyhow::ensure!(!name.is_empty(), "region name must not be empty");
    anyhow::ensure!(ring_size >= 1, "ring size must be at least 1");

    run_txn(store, "get_or_create_shard_region", |txn| {
        let by_name = keys::region_by_name_key(name);
        if let Some(raw) = txn.get(&by_name) {
            let stored = match serde_json::from_slice::<ShardRegion>(&raw) {
                Ok(region) => region,
                Err(err) => {
                    return Ok(Err(
                        anyhow::Error::new(err).context(format!("decode shard region {name:?}"))
                    ))
                }
            };
            if stored.ring_size != ring_size {
                tracing::warn!(
                    name,
                    requested = ring_size,
                    stored = stored.ring_size,
                    "ring size differs from stored region, keeping stored value"
                );
            }
            return Ok(Ok(stored));
        }

        let counter_key = keys::region_id_counter_key();
        let id = txn
            .get(&counter_key)
            .and_then(|value| value.try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0)
            + 1;
        txn.set(counter_key, id.to_be_bytes().to_vec());
        let region = ShardRegion {
            id,
            name: name.to_string(),
            ring_size,
        };
        let encoded = match serde_json::to_vec(&region) {
            Ok(encoded) => encoded,
            Err(err) => return Ok(Err(anyhow::Error::new(err))),
        };
        txn.set(by_name, encoded.clone());
        txn.set(keys::region_by_id_key(id), encoded);
        tracing::info!(name, id, ring_size, "created shard region");
        Ok(Ok(region))
    })
    .await
}

/// Enumerate every region in id order. Undecodable records are skipped.
pub fn list_regions_in_txn(txn: &mut Txn<'_>) -> Vec<ShardRegion> {
    txn.scan_prefix(&keys::region_by_id_prefix())
        .into_iter()
        .filter_map(|(_, value)| serde_json::from_slice(&value).ok())
        .collect()
}

/// Point-in-time view of a region: its lease table and allocation table,
/// read in one transaction.
#[derive(Clone, Debug)]
pub struct ShardingInfo {
    pub region: ShardRegion,
    pub nodes: Vec<NodeLease>,
    pub allocations: AllocationSnapshot,
}

#[derive(Clone, Debug)]
pub struct RegionClientConfig {
    /// Ring size used when this client is the one creating the region.
    pub default_ring_size: u32,
    /// How long a lease stays valid without a heartbeat.
    pub lease_ttl: Duration,
    /// Heartbeat cadence; jittered by up to a quarter either way.
    pub heartbeat_interval: Duration,
    /// How long a draining node waits for its shards to migrate away before
    /// closing them anyway.
    pub drain_timeout: Duration,
}

impl Default for RegionClientConfig {
    fn default() -> Self {
        Self {
            default_ring_size: 32,
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(4),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to one region. Routing (`shard_of_key`, `get_allocation`) works on
/// any client; a client additionally becomes a serving node by installing a
/// [`ShardFactory`] with [`RegionClient::start_shard`].
pub struct RegionClient {
    store: Arc<TxnStore>,
    region: ShardRegion,
    cfg: RegionClientConfig,
    metrics: Arc<dyn ShardMetrics>,
    snapshot_tx: watch::Sender<Option<Arc<AllocationSnapshot>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    serving: AtomicBool,
}

impl RegionClient {
    pub async fn open(
        store: Arc<TxnStore>,
        name: &str,
        cfg: RegionClientConfig,
    ) -> anyhow::Result<Self> {
        Self::open_with_metrics(store, name, cfg, Arc::new(NoopMetrics)).await
    }

    pub async fn open_with_metrics(
        store: Arc<TxnStore>,
        name: &str,
        cfg: RegionClientConfig,
        metrics: Arc<dyn ShardMetrics>,
    ) -> anyhow::Result<Self> {
        let region = get_or_create_shard_region(&store, name, cfg.default_ring_size).await?;
        let (snapshot_tx, _) = watch::channel(None);
        let cancel = CancellationToken::new();
        let client = Self {
            store,
            region,
            cfg,
            metrics,
            snapshot_tx,
            cancel,
            tasks: Mutex::new(Vec::new()),
            serving: AtomicBool::new(false),
        };
        let refresh = tokio::spawn(run_refresh(
            client.store.clone(),
            client.region.clone(),
            client.snapshot_tx.clone(),
            client.cancel.clone(),
        ));
        client.lock_tasks().push(refresh);
        Ok(client)
    }

    pub fn region(&self) -> &ShardRegion {
        &self.region
    }

    /// Map a routing key onto the ring. Pure and stable across processes.
    pub fn shard_of_key(&self, key: &[u8]) -> u32 {
        shard_of(key, self.region.ring_size)
    }

    /// Current holders of the shard a routing key maps to.
    pub async fn get_allocation(&self, key: &[u8]) -> anyhow::Result<Vec<Allocation>> {
        self.shard_allocations(self.shard_of_key(key)).await
    }

    /// Current allocations of one shard. Waits for the first table snapshot,
    /// then answers from the cached view.
    pub async fn shard_allocations(&self, shard: u32) -> anyhow::Result<Vec<Allocation>> {
        anyhow::ensure!(
            shard < self.region.ring_size,
            "shard {shard} out of range for ring of {}",
            self.region.ring_size
        );
        let mut rx = self.snapshot_tx.subscribe();
        // Biased: an already-published snapshot answers even after shutdown;
        // cancellation only interrupts the wait for a first snapshot that
        // will never arrive.
        let snapshot = tokio::select! {
            biased;
            published = rx.wait_for(|snapshot| snapshot.is_some()) => {
                published.ok().and_then(|snapshot| snapshot.clone())
            }
            _ = self.cancel.cancelled() => None,
        };
        let Some(snapshot) = snapshot else {
            anyhow::bail!("region client is shut down");
        };
        Ok(snapshot.shard(shard).to_vec())
    }

    /// Full region view for operators and tests.
    pub async fn sharding_info(&self) -> ShardingInfo {
        let region = self.region.clone();
        run_txn(&self.store, "sharding_info", move |txn| {
            Ok(ShardingInfo {
                region: region.clone(),
                nodes: get_shard_region_nodes(txn, region.id),
                allocations: crate::allocation::read_allocations_in_txn(txn, &region),
            })
        })
        .await
    }

    /// Join the region as a serving node. Spawns the allocator loop, which
    /// registers a fresh node identity, heartbeats it, and reconciles shard
    /// assignments through `factory`. May be called at most once per client.
    pub fn start_shard(&self, factory: Arc<dyn ShardFactory>) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.serving.swap(true, Ordering::SeqCst),
            "start_shard was already called on this client"
        );
        let task = tokio::spawn(run_allocator(
            self.store.clone(),
            self.region.clone(),
            self.cfg.clone(),
            factory,
            self.metrics.clone(),
            self.snapshot_tx.subscribe(),
            self.cancel.clone(),
        ));
        self.lock_tasks().push(task);
        Ok(())
    }

    /// Drain this node (if serving) and stop all background tasks.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "region client task failed");
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fetch-then-watch refresh of the cached allocation table. The store
/// version is captured before the read, so a change-signal bump racing the
/// read triggers one extra (harmless) refresh instead of being missed.
async fn run_refresh(
    store: Arc<TxnStore>,
    region: ShardRegion,
    tx: watch::Sender<Option<Arc<AllocationSnapshot>>>,
    cancel: CancellationToken,
) {
    let signal_key = keys::change_signal_key(region.id);
    loop {
        let version = store.current_version();
        let snapshot = fetch_allocations(&store, &region).await;
        tx.send_replace(Some(Arc::new(snapshot)));
        let changed = store.watch(&signal_key, version);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = changed.wait() => {}
        }
    }
}
