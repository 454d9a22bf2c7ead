//! Allocation table and the rebalancing scheduler.
//!
//! Every shard in a region's ring is bound to nodes through allocation
//! records `(region, shard, node) -> status`. During a handover a shard may
//! carry several records (old owner removing, new owner allocating); at a
//! fixed point every shard has exactly one `Active` or `Allocating` record.
//!
//! The scheduler is a pure function over one snapshot, in four passes:
//! 1. delete allocations on dead (left or unknown) nodes,
//! 2. delete not-yet-active work on draining nodes,
//! 3. resolve duplicate actives down to a single survivor,
//! 4. assign every uncovered shard to the least-loaded allocable node.
//!
//! Both call sites — node registration and the periodic daemon — run the
//! same function inside one store transaction; concurrent invocations either
//! commit sequentially or one conflicts and retries.

use std::collections::HashMap;
use std::sync::Arc;

use crate::keys;
use crate::region::ShardRegion;
use crate::registry::{get_shard_region_nodes, NodeId, NodeLease, NodeState};
use crate::retry::run_txn;
use crate::store::{Txn, TxnStore};

/// Allocation status. `Removed` is never stored; removal deletes the record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStatus {
    Allocating,
    Active,
    Removing,
}

impl AllocationStatus {
    fn code(self) -> u8 {
        match self {
            AllocationStatus::Allocating => 1,
            AllocationStatus::Active => 2,
            AllocationStatus::Removing => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AllocationStatus::Allocating),
            2 => Some(AllocationStatus::Active),
            3 => Some(AllocationStatus::Removing),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub node: NodeId,
    pub status: AllocationStatus,
}

/// One region's allocation table, indexed by shard.
#[derive(Clone, Debug)]
pub struct AllocationSnapshot {
    pub ring_size: u32,
    pub shards: Vec<Vec<Allocation>>,
}

impl AllocationSnapshot {
    pub fn empty(ring_size: u32) -> Self {
        Self {
            ring_size,
            shards: vec![Vec::new(); ring_size as usize],
        }
    }

    pub fn shard(&self, shard: u32) -> &[Allocation] {
        self.shards
            .get(shard as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn status_for(&self, node: NodeId, shard: u32) -> Option<AllocationStatus> {
        self.shard(shard)
            .iter()
            .find(|alloc| alloc.node == node)
            .map(|alloc| alloc.status)
    }
}

/// Read the full allocation table for a region. Records with unknown status
/// codes or out-of-ring shard indices are skipped, not errors: tolerance for
/// forward-compatible status additions.
pub fn read_allocations_in_txn(txn: &mut Txn<'_>, region: &ShardRegion) -> AllocationSnapshot {
    let mut snapshot = AllocationSnapshot::empty(region.ring_size);
    for (key, value) in txn.scan_prefix(&keys::allocation_prefix(region.id)) {
        let Some((_, shard, node)) = keys::decode_allocation_key(&key) else {
            continue;
        };
        let Some(status) = value.first().copied().and_then(AllocationStatus::from_code) else {
            continue;
        };
        if let Some(row) = snapshot.shards.get_mut(shard as usize) {
            row.push(Allocation { node, status });
        }
    }
    snapshot
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShardAction {
    /// Delete the record outright.
    Remove { shard: u32, node: NodeId },
    /// Demote to `Removing`; the owner acknowledges with removal.
    MarkRemoving { shard: u32, node: NodeId },
    /// Create an `Allocating` record; the owner acknowledges with readiness.
    Allocate { shard: u32, node: NodeId },
}

/// The rebalancing planner. Pure: operates on one snapshot of the allocation
/// table plus the lease table (in enumeration order, which also decides
/// ties), and returns the actions to apply.
pub(crate) fn plan_shards(allocations: &[Vec<Allocation>], nodes: &[NodeLease]) -> Vec<ShardAction> {
    let states: HashMap<NodeId, NodeState> = nodes
        .iter()
        .map(|lease| (lease.node, lease.state))
        .collect();
    let mut working: Vec<Vec<Allocation>> = allocations.to_vec();
    let mut actions = Vec::new();

    // Passes 1 and 2: evict dead nodes, and unstarted work on draining nodes.
    for (shard, row) in working.iter_mut().enumerate() {
        let shard = shard as u32;
        row.retain(|alloc| match states.get(&alloc.node) {
            None | Some(NodeState::Left) => {
                actions.push(ShardAction::Remove {
                    shard,
                    node: alloc.node,
                });
                false
            }
            Some(NodeState::Leaving)
                if alloc.status != AllocationStatus::Active
                    && alloc.status != AllocationStatus::Removing =>
            {
                actions.push(ShardAction::Remove {
                    shard,
                    node: alloc.node,
                });
                false
            }
            _ => true,
        });
    }

    // Pass 3: a shard with more than one active keeps exactly one. Actives on
    // non-allocable nodes are demoted first; any further surplus is demoted
    // in enumeration order. The tie-break is positional, not freshness-based.
    for (shard, row) in working.iter_mut().enumerate() {
        let shard = shard as u32;
        let mut survivors = row
            .iter()
            .filter(|alloc| alloc.status == AllocationStatus::Active)
            .count();
        if survivors <= 1 {
            continue;
        }
        for allocable_pass in [false, true] {
            for alloc in row.iter_mut() {
                if survivors == 1 {
                    break;
                }
                if alloc.status != AllocationStatus::Active {
                    continue;
                }
                let allocable = states.get(&alloc.node) == Some(&NodeState::Joined);
                if allocable != allocable_pass {
                    continue;
                }
                alloc.status = AllocationStatus::Removing;
                actions.push(ShardAction::MarkRemoving {
                    shard,
                    node: alloc.node,
                });
                survivors -= 1;
            }
        }
    }

    // Pass 4: cover every shard that has no live allocation on an allocable
    // node, spreading picks by tracking load as assignments are made.
    let allocable: Vec<NodeId> = nodes
        .iter()
        .filter(|lease| lease.state == NodeState::Joined)
        .map(|lease| lease.node)
        .collect();
    if allocable.is_empty() {
        return actions;
    }
    let mut loads: HashMap<NodeId, usize> = HashMap::new();
    for row in &working {
        for alloc in row {
            *loads.entry(alloc.node).or_default() += 1;
        }
    }
    for (shard, row) in working.iter_mut().enumerate() {
        let shard = shard as u32;
        let covered = row.iter().any(|alloc| {
            matches!(
                alloc.status,
                AllocationStatus::Active | AllocationStatus::Allocating
            ) && states.get(&alloc.node) == Some(&NodeState::Joined)
        });
        if covered {
            continue;
        }
        let mut best = allocable[0];
        let mut best_load = loads.get(&best).copied().unwrap_or(0);
        for node in &allocable[1..] {
            let load = loads.get(node).copied().unwrap_or(0);
            if load < best_load {
                best = *node;
                best_load = load;
            }
        }
        actions.push(ShardAction::Allocate { shard, node: best });
        *loads.entry(best).or_default() += 1;
        row.push(Allocation {
            node: best,
            status: AllocationStatus::Allocating,
        });
    }
    actions
}

/// Run the scheduler for a region inside the current transaction. Bumps the
/// region's change signal when anything was rewritten. Returns the number of
/// applied actions.
pub fn schedule_in_txn(txn: &mut Txn<'_>, region: &ShardRegion) -> usize {
    let nodes = get_shard_region_nodes(txn, region.id);
    let snapshot = read_allocations_in_txn(txn, region);
    let actions = plan_shards(&snapshot.shards, &nodes);
    for action in &actions {
        match *action {
            ShardAction::Remove { shard, node } => {
                txn.delete(keys::allocation_key(region.id, shard, node));
            }
            ShardAction::MarkRemoving { shard, node } => {
                txn.set(
                    keys::allocation_key(region.id, shard, node),
                    vec![AllocationStatus::Removing.code()],
                );
            }
            ShardAction::Allocate { shard, node } => {
                txn.set(
                    keys::allocation_key(region.id, shard, node),
                    vec![AllocationStatus::Allocating.code()],
                );
            }
        }
    }
    if !actions.is_empty() {
        bump_change_signal(txn, region.id);
        tracing::debug!(
            region = region.id,
            actions = actions.len(),
            "scheduler rewrote allocations"
        );
    }
    actions.len()
}

/// Promote an allocation the owner reports ready. Only an `Allocating`
/// record is promoted; a stale ack (the shard was reassigned meanwhile) is a
/// no-op. Promotion re-runs the scheduler in the same transaction so a
/// now-duplicate active is resolved immediately.
pub fn ack_ready_in_txn(txn: &mut Txn<'_>, region: &ShardRegion, node: NodeId, shard: u32) -> bool {
    let key = keys::allocation_key(region.id, shard, node);
    let status = txn
        .get(&key)
        .and_then(|value| value.first().copied())
        .and_then(AllocationStatus::from_code);
    if status != Some(AllocationStatus::Allocating) {
        return false;
    }
    txn.set(key, vec![AllocationStatus::Active.code()]);
    bump_change_signal(txn, region.id);
    schedule_in_txn(txn, region);
    true
}

/// Delete an allocation the owner reports closed. Only a `Removing` record
/// is deleted; stale acks are no-ops.
pub fn ack_removed_in_txn(
    txn: &mut Txn<'_>,
    region: &ShardRegion,
    node: NodeId,
    shard: u32,
) -> bool {
    let key = keys::allocation_key(region.id, shard, node);
    let status = txn
        .get(&key)
        .and_then(|value| value.first().copied())
        .and_then(AllocationStatus::from_code);
    if status != Some(AllocationStatus::Removing) {
        return false;
    }
    txn.delete(key);
    bump_change_signal(txn, region.id);
    schedule_in_txn(txn, region);
    true
}

pub async fn schedule_region(store: &Arc<TxnStore>, region: &ShardRegion) -> usize {
    run_txn(store, "schedule_region", |txn| Ok(schedule_in_txn(txn, region))).await
}

pub async fn on_allocation_ready(
    store: &Arc<TxnStore>,
    region: &ShardRegion,
    node: NodeId,
    shard: u32,
) -> bool {
    run_txn(store, "on_allocation_ready", |txn| {
        Ok(ack_ready_in_txn(txn, region, node, shard))
    })
    .await
}

pub async fn on_allocation_removed(
    store: &Arc<TxnStore>,
    region: &ShardRegion,
    node: NodeId,
    shard: u32,
) -> bool {
    run_txn(store, "on_allocation_removed", |txn| {
        Ok(ack_removed_in_txn(txn, region, node, shard))
    })
    .await
}

pub async fn fetch_allocations(store: &Arc<TxnStore>, region: &ShardRegion) -> AllocationSnapshot {
    run_txn(store, "fetch_allocations", |txn| {
        Ok(read_allocations_in_txn(txn, region))
    })
    .await
}

/// Overwrite the region's version token. Watchers only care that the value
/// changed; the counter is for debuggability.
fn bump_change_signal(txn: &mut Txn<'_>, region: u64) {
    let key = keys::change_signal_key(region);
    let current = txn
        .get(&key)
        .and_then(|value| value.try_into().ok().map(u64::from_be_bytes))
        .unwrap_or(0);
    txn.set(key, (current + 1).to_be_bytes().to_vec());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(node: NodeId, state: NodeState) -> NodeLease {
        NodeLease {
            node,
            state,
            timeout_at_ms: u64::MAX,
        }
    }

    fn counts_by_node(actions: &[ShardAction]) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for action in actions {
            if let ShardAction::Allocate { node, .. } = action {
                *counts.entry(*node).or_default() += 1;
            }
        }
        counts
    }

    #[test]
    fn initial_scheduling_balances_shards_across_nodes() {
        // Three joined nodes, nine empty shards: each node gets exactly three.
        let nodes: Vec<NodeLease> = (0..3)
            .map(|_| lease(NodeId::random(), NodeState::Joined))
            .collect();
        let allocations = vec![Vec::new(); 9];
        let actions = plan_shards(&allocations, &nodes);
        assert_eq!(actions.len(), 9);
        let counts = counts_by_node(&actions);
        for node in &nodes {
            assert_eq!(counts.get(&node.node), Some(&3));
        }
    }

    #[test]
    fn unstarted_work_on_draining_node_is_evicted_and_reassigned() {
        let draining = lease(NodeId::random(), NodeState::Leaving);
        let a = lease(NodeId::random(), NodeState::Joined);
        let b = lease(NodeId::random(), NodeState::Joined);
        let nodes = vec![draining, a, b];
        let mut allocations = vec![Vec::new(); 4];
        allocations[0].push(Allocation {
            node: draining.node,
            status: AllocationStatus::Allocating,
        });
        allocations[1].push(Allocation {
            node: draining.node,
            status: AllocationStatus::Active,
        });

        let actions = plan_shards(&allocations, &nodes);
        assert!(actions.contains(&ShardAction::Remove {
            shard: 0,
            node: draining.node
        }));
        // The active shard keeps running on the draining node until a
        // replacement becomes active, but shard 0 and the uncovered shards
        // are reassigned now. Shard 1 also gets a replacement allocation.
        let counts = counts_by_node(&actions);
        let total: usize = counts.values().sum();
        assert_eq!(total, 4);
        assert!(!counts.contains_key(&draining.node));
    }

    #[test]
    fn allocations_on_dead_nodes_are_deleted_regardless_of_status() {
        let ghost = NodeId::random();
        let nodes = vec![lease(NodeId::random(), NodeState::Joined)];
        let mut allocations = vec![Vec::new(); 2];
        allocations[0].push(Allocation {
            node: ghost,
            status: AllocationStatus::Active,
        });
        allocations[1].push(Allocation {
            node: ghost,
            status: AllocationStatus::Removing,
        });
        let actions = plan_shards(&allocations, &nodes);
        assert!(actions.contains(&ShardAction::Remove {
            shard: 0,
            node: ghost
        }));
        assert!(actions.contains(&ShardAction::Remove {
            shard: 1,
            node: ghost
        }));
    }

    #[test]
    fn duplicate_actives_resolve_to_one_survivor() {
        let a = lease(NodeId::random(), NodeState::Joined);
        let b = lease(NodeId::random(), NodeState::Joined);
        let nodes = vec![a, b];
        let mut allocations = vec![Vec::new(); 1];
        allocations[0].push(Allocation {
            node: a.node,
            status: AllocationStatus::Active,
        });
        allocations[0].push(Allocation {
            node: b.node,
            status: AllocationStatus::Active,
        });
        let actions = plan_shards(&allocations, &nodes);
        let removals: Vec<_> = actions
            .iter()
            .filter(|action| matches!(action, ShardAction::MarkRemoving { .. }))
            .collect();
        assert_eq!(removals.len(), 1);
        assert!(!actions
            .iter()
            .any(|action| matches!(action, ShardAction::Allocate { .. })));
    }

    #[test]
    fn duplicate_active_on_draining_node_is_demoted_first() {
        let draining = lease(NodeId::random(), NodeState::Leaving);
        let joined = lease(NodeId::random(), NodeState::Joined);
        let nodes = vec![draining, joined];
        let allocations = vec![vec![
            Allocation {
                node: joined.node,
                status: AllocationStatus::Active,
            },
            Allocation {
                node: draining.node,
                status: AllocationStatus::Active,
            },
        ]];
        let actions = plan_shards(&allocations, &nodes);
        assert_eq!(
            actions,
            vec![ShardAction::MarkRemoving {
                shard: 0,
                node: draining.node
            }]
        );
    }

    #[test]
    fn no_allocable_node_leaves_shards_unassigned() {
        let draining = lease(NodeId::random(), NodeState::Leaving);
        let allocations = vec![Vec::new(); 3];
        assert!(plan_shards(&allocations, &[draining]).is_empty());
        assert!(plan_shards(&allocations, &[]).is_empty());
    }

    #[test]
    fn covered_shards_are_left_alone() {
        let a = lease(NodeId::random(), NodeState::Joined);
        let allocations = vec![vec![Allocation {
            node: a.node,
            status: AllocationStatus::Allocating,
        }]];
        assert!(plan_shards(&allocations, &[a]).is_empty());
    }

    #[test]
    fn removing_records_still_count_toward_load() {
        // Node a is busy closing three shards; fresh work goes to b.
        let a = lease(NodeId::random(), NodeState::Joined);
        let b = lease(NodeId::random(), NodeState::Joined);
        let mut allocations = vec![Vec::new(); 4];
        for shard in 0..3 {
            allocations[shard].push(Allocation {
                node: a.node,
                status: AllocationStatus::Removing,
            });
        }
        let actions = plan_shards(&allocations, &[a, b]);
        // Shards 0..3 have no schedulable coverage, shard 3 neither: all four
        // get allocations, and b, the less loaded node, takes them all first
        // until loads even out.
        let counts = counts_by_node(&actions);
        assert_eq!(counts.values().sum::<usize>(), 4);
        assert!(counts.get(&b.node).copied().unwrap_or(0) >= 3);
    }
}
