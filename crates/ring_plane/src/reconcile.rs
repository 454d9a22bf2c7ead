//! Convergence between the allocation table and the shards a node actually
//! runs.
//!
//! The [`ReconciliationManager`] owns a single worker task fed through a
//! latest-wins inbox: snapshot updates overwrite each other, so a burst of
//! table changes collapses into one reconciliation pass over the newest
//! state. The worker opens shards the table assigns to this node,
//! acknowledges readiness, closes shards the table took away, and
//! acknowledges removal. Factory and handle failures are retried with
//! backoff, forever; the table is authoritative and the node has no other
//! option than to converge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::allocation::{
    fetch_allocations, on_allocation_ready, on_allocation_removed, AllocationSnapshot,
    AllocationStatus,
};
use crate::metrics::ShardMetrics;
use crate::region::{RegionClientConfig, ShardRegion};
use crate::registry::{
    register_node, register_node_leaving, register_node_left, unix_millis, NodeId, NodeState,
};
use crate::retry::backoff_delay;
use crate::store::TxnStore;

/// Opens the application's shard instances. Called by the reconciler worker
/// whenever the allocation table assigns a shard to the local node.
#[async_trait]
pub trait ShardFactory: Send + Sync + 'static {
    async fn open_shard(&self, shard: u32) -> anyhow::Result<Box<dyn ShardHandle>>;
}

/// A running shard instance. `close` must release the shard's resources; it
/// is retried until it succeeds.
#[async_trait]
pub trait ShardHandle: Send + 'static {
    async fn close(&mut self) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct Inbox {
    seq: u64,
    snapshot: Option<Arc<AllocationSnapshot>>,
    stopped: bool,
}

pub struct ReconciliationManager {
    tx: watch::Sender<Inbox>,
    active: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationManager {
    pub fn spawn(
        store: Arc<TxnStore>,
        region: ShardRegion,
        node: NodeId,
        factory: Arc<dyn ShardFactory>,
        metrics: Arc<dyn ShardMetrics>,
    ) -> Self {
        let (tx, rx) = watch::channel(Inbox {
            seq: 0,
            snapshot: None,
            stopped: false,
        });
        let active = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            rx,
            store,
            region,
            node,
            factory,
            metrics,
            active: active.clone(),
            held: HashMap::new(),
        };
        Self {
            tx,
            active,
            worker: Mutex::new(Some(tokio::spawn(worker.run()))),
        }
    }

    /// Hand the worker the newest allocation table. Overwrites any snapshot
    /// the worker has not picked up yet.
    pub fn update(&self, snapshot: Arc<AllocationSnapshot>) {
        self.tx.send_modify(|inbox| {
            inbox.seq += 1;
            inbox.snapshot = Some(snapshot);
        });
    }

    /// Number of shards currently open on this node.
    pub fn active_shards(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the worker and close every shard it still holds. Idempotent.
    pub async fn stop(&self) {
        self.tx.send_modify(|inbox| inbox.stopped = true);
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(err) = worker.await {
                tracing::warn!(error = ?err, "reconciler worker failed");
            }
        }
    }
}

struct Worker {
    rx: watch::Receiver<Inbox>,
    store: Arc<TxnStore>,
    region: ShardRegion,
    node: NodeId,
    factory: Arc<dyn ShardFactory>,
    metrics: Arc<dyn ShardMetrics>,
    active: Arc<AtomicUsize>,
    held: HashMap<u32, Box<dyn ShardHandle>>,
}

impl Worker {
    async fn run(mut self) {
        let mut seen = 0u64;
        loop {
            let inbox = {
                let inbox = self
                    .rx
                    .wait_for(|inbox| inbox.stopped || inbox.seq > seen)
                    .await;
                match inbox {
                    Ok(inbox) => inbox.clone(),
                    // Manager dropped without stop(); shut down anyway.
                    Err(_) => break,
                }
            };
            if inbox.stopped {
                break;
            }
            seen = inbox.seq;
            if let Some(snapshot) = inbox.snapshot {
                self.reconcile(&snapshot).await;
            }
        }

        // Final pass: close everything still held, without touching the
        // table. On graceful drain the table already released these shards;
        // on lease loss the daemon cleans the records up.
        let shards: Vec<u32> = self.held.keys().copied().collect();
        for shard in shards {
            self.close_shard(shard).await;
        }
    }

    /// One pass over the ring: open what the table assigns to this node,
    /// close what it no longer does, acknowledging each transition.
    async fn reconcile(&mut self, snapshot: &AllocationSnapshot) {
        for shard in 0..snapshot.ring_size {
            let desired = snapshot.status_for(self.node, shard);
            match (desired, self.held.contains_key(&shard)) {
                (Some(AllocationStatus::Allocating) | Some(AllocationStatus::Active), false) => {
                    if !self.open_shard(shard).await {
                        return; // stop requested mid-retry
                    }
                    if desired == Some(AllocationStatus::Allocating) {
                        on_allocation_ready(&self.store, &self.region, self.node, shard).await;
                    }
                }
                (None | Some(AllocationStatus::Removing), true) => {
                    self.close_shard(shard).await;
                    if desired == Some(AllocationStatus::Removing) {
                        on_allocation_removed(&self.store, &self.region, self.node, shard).await;
                    }
                }
                _ => {}
            }
        }
    }

    /// Open one shard through the factory, retrying until it succeeds or a
    /// stop is requested. Returns false when stopping.
    async fn open_shard(&mut self, shard: u32) -> bool {
        let mut attempt = 0u32;
        let handle = loop {
            match self.factory.open_shard(shard).await {
                Ok(handle) => break handle,
                Err(err) => {
                    attempt += 1;
                    tracing::warn!(
                        shard,
                        node = %self.node,
                        attempt,
                        error = ?err,
                        "shard open failed, retrying"
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    if self.rx.borrow().stopped {
                        return false;
                    }
                }
            }
        };
        self.held.insert(shard, handle);
        self.publish_active();
        self.metrics.shard_opened(shard);
        tracing::info!(shard, node = %self.node, region = self.region.id, "opened shard");
        true
    }

    async fn close_shard(&mut self, shard: u32) {
        let Some(mut handle) = self.held.remove(&shard) else {
            return;
        };
        let mut attempt = 0u32;
        while let Err(err) = handle.close().await {
            attempt += 1;
            tracing::warn!(
                shard,
                node = %self.node,
                attempt,
                error = ?err,
                "shard close failed, retrying"
            );
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
        self.publish_active();
        self.metrics.shard_closed(shard);
        tracing::info!(shard, node = %self.node, region = self.region.id, "closed shard");
    }

    fn publish_active(&self) {
        let count = self.held.len();
        self.active.store(count, Ordering::SeqCst);
        self.metrics.active_shards(count);
    }
}

/// A node's full lifecycle in a region: register under a fresh identity,
/// heartbeat the lease while reconciling shard assignments, and on
/// cancellation drain gracefully. A lost lease discards the identity and
/// rejoins under a new one.
pub(crate) async fn run_allocator(
    store: Arc<TxnStore>,
    region: ShardRegion,
    cfg: RegionClientConfig,
    factory: Arc<dyn ShardFactory>,
    metrics: Arc<dyn ShardMetrics>,
    mut snapshot_rx: watch::Receiver<Option<Arc<AllocationSnapshot>>>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let node = NodeId::random();
        let lease = unix_millis() + cfg.lease_ttl.as_millis() as u64;
        if register_node(&store, &region, node, lease).await != NodeState::Joined {
            // The fresh identity is somehow already retired; take another.
            continue;
        }
        tracing::info!(node = %node, region = region.id, "joined shard region");

        let manager = ReconciliationManager::spawn(
            store.clone(),
            region.clone(),
            node,
            factory.clone(),
            metrics.clone(),
        );
        if let Some(snapshot) = snapshot_rx.borrow_and_update().clone() {
            manager.update(snapshot);
        }

        let mut beat = Instant::now() + jittered(&cfg);
        let lease_lost = loop {
            tokio::select! {
                _ = cancel.cancelled() => break false,
                _ = tokio::time::sleep_until(beat) => {
                    let lease = unix_millis() + cfg.lease_ttl.as_millis() as u64;
                    if register_node(&store, &region, node, lease).await != NodeState::Joined {
                        break true;
                    }
                    beat = Instant::now() + jittered(&cfg);
                }
                changed = snapshot_rx.changed() => {
                    if changed.is_err() {
                        // Client dropped the refresh loop; treat as shutdown.
                        break false;
                    }
                    if let Some(snapshot) = snapshot_rx.borrow_and_update().clone() {
                        manager.update(snapshot);
                    }
                }
            }
        };

        if !lease_lost {
            drain(&store, &region, node, &cfg, &manager, &mut snapshot_rx).await;
        }
        manager.stop().await;
        let lease = unix_millis() + cfg.lease_ttl.as_millis() as u64;
        register_node_left(&store, &region, node, lease).await;

        if lease_lost && !cancel.is_cancelled() {
            tracing::warn!(
                node = %node,
                region = region.id,
                "shard lease lost, rejoining under a new identity"
            );
            continue;
        }
        tracing::info!(node = %node, region = region.id, "left shard region");
        return;
    }
}

/// Announce `Leaving` and wait for the table to migrate our shards away:
/// held actives keep serving until their replacements go active elsewhere.
/// Gives up after `drain_timeout` so the last node of a region can still
/// shut down.
async fn drain(
    store: &Arc<TxnStore>,
    region: &ShardRegion,
    node: NodeId,
    cfg: &RegionClientConfig,
    manager: &ReconciliationManager,
    snapshot_rx: &mut watch::Receiver<Option<Arc<AllocationSnapshot>>>,
) {
    let deadline = Instant::now() + cfg.drain_timeout;
    loop {
        let lease = unix_millis() + cfg.lease_ttl.as_millis() as u64;
        let state = register_node_leaving(store, region, node, lease).await;
        if state == NodeState::Left || manager.active_shards() == 0 {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    node = %node,
                    region = region.id,
                    open_shards = manager.active_shards(),
                    "drain timed out with shards still open"
                );
                return;
            }
            _ = tokio::time::sleep(cfg.heartbeat_interval) => {}
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    // Refresh loop is gone (client shutting down); keep
                    // draining on the heartbeat cadence below.
                    tokio::time::sleep(cfg.heartbeat_interval).await;
                }
            }
        }
        // The client's refresh loop may already be cancelled during
        // shutdown, so fetch the table ourselves each round.
        let snapshot = fetch_allocations(store, region).await;
        manager.update(Arc::new(snapshot));
    }
}

fn jittered(cfg: &RegionClientConfig) -> tokio::time::Duration {
    // Spread heartbeats so a fleet restarted together does not renew in
    // lockstep.
    cfg.heartbeat_interval
        .mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}
