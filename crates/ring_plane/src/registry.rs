//! Node lease table.
//!
//! Each worker process registers an ephemeral node per region: a state code
//! plus an expiry timestamp, refreshed by heartbeats. State only moves
//! forward (`Joined -> Leaving -> Left`); a renewal carrying an older or
//! equal lease is ignored, so out-of-order heartbeats are harmless. A lease
//! that expires without renewal is deleted outright by the scheduler daemon,
//! which is indistinguishable from an explicit departure.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::allocation::schedule_in_txn;
use crate::keys;
use crate::region::ShardRegion;
use crate::retry::run_txn;
use crate::store::{Txn, TxnStore};

/// Random per-incarnation node identity. A process that leaves and rejoins
/// does so under a fresh id; ids are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0.simple())
    }
}

/// Lease state. Forward-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Joined,
    Leaving,
    Left,
}

impl NodeState {
    pub(crate) fn code(self) -> u8 {
        match self {
            NodeState::Joined => 1,
            NodeState::Leaving => 2,
            NodeState::Left => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(NodeState::Joined),
            2 => Some(NodeState::Leaving),
            3 => Some(NodeState::Left),
            _ => None,
        }
    }
}

/// One lease record as enumerated for the scheduler or operators.
#[derive(Clone, Copy, Debug)]
pub struct NodeLease {
    pub node: NodeId,
    pub state: NodeState,
    pub timeout_at_ms: u64,
}

/// Register or renew a node lease. Creates `Joined` when absent; renews the
/// timeout only when it strictly extends the stored one; never regresses
/// state. Returns the state the registry holds after the call — anything but
/// `Joined` tells the caller its identity is no longer usable.
pub fn register_node_in_txn(
    txn: &mut Txn<'_>,
    region: u64,
    node: NodeId,
    timeout_at_ms: u64,
) -> NodeState {
    match read_state(txn, region, node) {
        None => {
            write_state(txn, region, node, NodeState::Joined);
            write_timeout(txn, region, node, timeout_at_ms);
            NodeState::Joined
        }
        Some(NodeState::Joined) => {
            extend_timeout(txn, region, node, timeout_at_ms);
            NodeState::Joined
        }
        Some(other) => other,
    }
}

/// Move a node to `Leaving`. Absent records count as already departed.
pub fn register_node_leaving_in_txn(
    txn: &mut Txn<'_>,
    region: u64,
    node: NodeId,
    timeout_at_ms: u64,
) -> NodeState {
    match read_state(txn, region, node) {
        None | Some(NodeState::Left) => NodeState::Left,
        Some(NodeState::Joined) => {
            write_state(txn, region, node, NodeState::Leaving);
            extend_timeout(txn, region, node, timeout_at_ms);
            NodeState::Leaving
        }
        Some(NodeState::Leaving) => {
            extend_timeout(txn, region, node, timeout_at_ms);
            NodeState::Leaving
        }
    }
}

/// Force a node to `Left`. The record keeps its lease (extended if the new
/// timeout is strictly newer) and stays until expiry, when the daemon
/// deletes it.
pub fn register_node_left_in_txn(
    txn: &mut Txn<'_>,
    region: u64,
    node: NodeId,
    timeout_at_ms: u64,
) -> NodeState {
    match read_state(txn, region, node) {
        None | Some(NodeState::Left) => NodeState::Left,
        Some(_) => {
            write_state(txn, region, node, NodeState::Left);
            extend_timeout(txn, region, node, timeout_at_ms);
            NodeState::Left
        }
    }
}

/// Delete every lease whose timeout passed. Returns the affected regions so
/// the caller can re-schedule them.
pub fn handle_timeouts_in_txn(txn: &mut Txn<'_>, now_ms: u64) -> Vec<u64> {
    let mut expired_regions = Vec::new();
    for (key, value) in txn.scan_prefix(&keys::node_timeout_all_prefix()) {
        let Some((region, node)) = keys::decode_node_key(keys::NS_NODE_TIMEOUT, &key) else {
            continue;
        };
        let Some(timeout_at_ms) = decode_u64(&value) else {
            continue;
        };
        if timeout_at_ms < now_ms {
            txn.delete(keys::node_state_key(region, node));
            txn.delete(keys::node_timeout_key(region, node));
            tracing::info!(region, %node, timeout_at_ms, "expired node lease");
            if !expired_regions.contains(&region) {
                expired_regions.push(region);
            }
        }
    }
    expired_regions
}

/// Enumerate one region's leases in key order. The scheduler depends on this
/// order being stable within a transaction.
pub fn get_shard_region_nodes(txn: &mut Txn<'_>, region: u64) -> Vec<NodeLease> {
    let mut leases = Vec::new();
    for (key, value) in txn.scan_prefix(&keys::node_state_prefix(region)) {
        let Some((_, node)) = keys::decode_node_key(keys::NS_NODE_STATE, &key) else {
            continue;
        };
        let Some(state) = value.first().copied().and_then(NodeState::from_code) else {
            continue;
        };
        let timeout_at_ms = txn
            .get(&keys::node_timeout_key(region, node))
            .as_deref()
            .and_then(decode_u64)
            .unwrap_or(0);
        leases.push(NodeLease {
            node,
            state,
            timeout_at_ms,
        });
    }
    leases
}

/// Enumerate every region's leases.
pub fn get_region_nodes(txn: &mut Txn<'_>) -> BTreeMap<u64, Vec<NodeLease>> {
    let mut regions: BTreeMap<u64, Vec<NodeLease>> = BTreeMap::new();
    for (key, _) in txn.scan_prefix(&keys::node_state_all_prefix()) {
        if let Some((region, _)) = keys::decode_node_key(keys::NS_NODE_STATE, &key) {
            regions.entry(region).or_default();
        }
    }
    for (region, leases) in regions.iter_mut() {
        *leases = get_shard_region_nodes(txn, *region);
    }
    regions
}

/// Register/renew and re-run the scheduler for the region in one transaction.
pub async fn register_node(
    store: &Arc<TxnStore>,
    region: &ShardRegion,
    node: NodeId,
    timeout_at_ms: u64,
) -> NodeState {
    run_txn(store, "register_node", |txn| {
        let state = register_node_in_txn(txn, region.id, node, timeout_at_ms);
        schedule_in_txn(txn, region);
        Ok(state)
    })
    .await
}

pub async fn register_node_leaving(
    store: &Arc<TxnStore>,
    region: &ShardRegion,
    node: NodeId,
    timeout_at_ms: u64,
) -> NodeState {
    run_txn(store, "register_node_leaving", |txn| {
        let state = register_node_leaving_in_txn(txn, region.id, node, timeout_at_ms);
        schedule_in_txn(txn, region);
        Ok(state)
    })
    .await
}

pub async fn register_node_left(
    store: &Arc<TxnStore>,
    region: &ShardRegion,
    node: NodeId,
    timeout_at_ms: u64,
) -> NodeState {
    run_txn(store, "register_node_left", |txn| {
        let state = register_node_left_in_txn(txn, region.id, node, timeout_at_ms);
        schedule_in_txn(txn, region);
        Ok(state)
    })
    .await
}

/// Wall-clock milliseconds, the unit lease timeouts are stored in.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn read_state(txn: &mut Txn<'_>, region: u64, node: NodeId) -> Option<NodeState> {
    txn.get(&keys::node_state_key(region, node))
        .and_then(|value| value.first().copied())
        .and_then(NodeState::from_code)
}

fn write_state(txn: &mut Txn<'_>, region: u64, node: NodeId, state: NodeState) {
    txn.set(keys::node_state_key(region, node), vec![state.code()]);
}

fn write_timeout(txn: &mut Txn<'_>, region: u64, node: NodeId, timeout_at_ms: u64) {
    txn.set(
        keys::node_timeout_key(region, node),
        timeout_at_ms.to_be_bytes().to_vec(),
    );
}

/// Renew the lease only when the new timeout strictly extends the stored one,
/// so stale heartbeats carrying an old clock are no-ops.
fn extend_timeout(txn: &mut Txn<'_>, region: u64, node: NodeId, timeout_at_ms: u64) {
    let stored = txn
        .get(&keys::node_timeout_key(region, node))
        .as_deref()
        .and_then(decode_u64)
        .unwrap_or(0);
    if timeout_at_ms > stored {
        write_timeout(txn, region, node, timeout_at_ms);
    }
}

fn decode_u64(value: &[u8]) -> Option<u64> {
    value.try_into().ok().map(u64::from_be_bytes)
}
