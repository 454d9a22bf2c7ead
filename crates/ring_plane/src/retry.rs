//! Backoff-retry for store transactions.
//!
//! Every store call in the control plane goes through [`run_txn`]: unbounded
//! retries with capped exponential backoff and jitter. Transient failures
//! (optimistic conflicts, backend errors) are an operational condition
//! surfaced through logs, never to the caller.

use std::time::Duration;

use rand::Rng;

use crate::store::{StoreError, Txn, TxnStore};

const BACKOFF_BASE: Duration = Duration::from_millis(25);
const BACKOFF_MAX: Duration = Duration::from_secs(5);
const BACKOFF_MAX_SHIFT: u32 = 8;

/// Delay before retry `attempt` (1-based): capped exponential with jitter in
/// `[cap/2, cap]` so concurrent retriers spread out.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(BACKOFF_MAX_SHIFT);
    let cap = BACKOFF_BASE
        .saturating_mul(1u32 << shift)
        .min(BACKOFF_MAX)
        .as_millis() as u64;
    let jittered = rand::thread_rng().gen_range(cap / 2..=cap.max(1));
    Duration::from_millis(jittered)
}

/// Run `body` as one transaction, retrying until it commits.
pub async fn run_txn<T, F>(store: &TxnStore, op: &'static str, mut body: F) -> T
where
    F: FnMut(&mut Txn<'_>) -> anyhow::Result<T>,
{
    let mut attempt = 0u32;
    loop {
        match store.run(&mut body) {
            Ok(out) => return out,
            Err(StoreError::Conflict) => {
                attempt += 1;
                tracing::debug!(op, attempt, "transaction conflicted, retrying");
            }
            Err(StoreError::Backend(err)) => {
                attempt += 1;
                tracing::warn!(op, attempt, error = ?err, "transaction failed, retrying");
            }
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
    }
}
