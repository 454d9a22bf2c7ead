//! Periodic maintenance: lease expiry and catch-up scheduling.
//!
//! Registration and acknowledgements re-run the scheduler inline, so the
//! daemon is a safety net rather than the main driver: it deletes expired
//! leases and sweeps every region so crashed nodes and missed wakeups still
//! converge. One daemon per deployment is expected, but a second one is
//! harmless; concurrent passes serialize through transaction conflicts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::allocation::schedule_in_txn;
use crate::region::list_regions_in_txn;
use crate::registry::{handle_timeouts_in_txn, unix_millis};
use crate::retry::run_txn;
use crate::store::TxnStore;

#[derive(Clone, Debug)]
pub struct SchedulerDaemonConfig {
    pub interval: Duration,
}

impl Default for SchedulerDaemonConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

pub struct SchedulerDaemon {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerDaemon {
    pub fn spawn(store: Arc<TxnStore>, cfg: SchedulerDaemonConfig) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_daemon(store, cfg, cancel.clone()));
        Self {
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop after the in-flight pass, if any. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "scheduler daemon task failed");
            }
        }
    }
}

async fn run_daemon(store: Arc<TxnStore>, cfg: SchedulerDaemonConfig, cancel: CancellationToken) {
    tracing::info!(interval_ms = cfg.interval.as_millis() as u64, "scheduler daemon started");
    loop {
        tick(&store).await;
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("scheduler daemon stopped");
                return;
            }
            _ = tokio::time::sleep(cfg.interval) => {}
        }
    }
}

/// One maintenance pass in one transaction: expire dead leases, then run the
/// scheduler over every region so their shards are reassigned in the same
/// commit.
async fn tick(store: &Arc<TxnStore>) {
    let now_ms = unix_millis();
    let (expired, actions) = run_txn(store, "scheduler_tick", |txn| {
        let expired = handle_timeouts_in_txn(txn, now_ms);
        let mut actions = 0;
        for region in list_regions_in_txn(txn) {
            actions += schedule_in_txn(txn, &region);
        }
        Ok((expired.len(), actions))
    })
    .await;
    if expired > 0 || actions > 0 {
        tracing::info!(
            expired_leases = expired,
            actions,
            "scheduler pass applied changes"
        );
    }
}
