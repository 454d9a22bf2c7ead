//! Allocation-table scenarios driven through the public API.

use ring_plane::allocation::{
    fetch_allocations, on_allocation_ready, on_allocation_removed, schedule_in_txn,
    schedule_region, AllocationSnapshot, AllocationStatus,
};
use ring_plane::keys;
use ring_plane::region::get_or_create_shard_region;
use ring_plane::registry::{
    get_shard_region_nodes, register_node, register_node_in_txn, register_node_leaving, NodeId,
    NodeState,
};
use ring_plane::TxnStore;

fn shards_on(snapshot: &AllocationSnapshot, node: NodeId) -> usize {
    (0..snapshot.ring_size)
        .filter(|&shard| snapshot.status_for(node, shard).is_some())
        .count()
}

#[tokio::test]
async fn shards_spread_evenly_across_nodes_joining_together() {
    let store = TxnStore::memory();
    let region = get_or_create_shard_region(&store, "users", 9)
        .await
        .expect("region");
    let nodes: Vec<NodeId> = (0..3).map(|_| NodeId::random()).collect();

    // All three register in one transaction, then one scheduler pass
    // assigns the whole ring.
    store
        .run(|txn| {
            for &node in &nodes {
                assert_eq!(
                    register_node_in_txn(txn, region.id, node, u64::MAX),
                    NodeState::Joined
                );
            }
            assert_eq!(schedule_in_txn(txn, &region), 9);
            Ok(())
        })
        .expect("join");

    let snapshot = fetch_allocations(&store, &region).await;
    for shard in 0..9 {
        let row = snapshot.shard(shard);
        assert_eq!(row.len(), 1, "shard {shard} has exactly one allocation");
        assert_eq!(row[0].status, AllocationStatus::Allocating);
    }
    for &node in &nodes {
        assert_eq!(shards_on(&snapshot, node), 3);
    }

    // Fixed point: another pass changes nothing.
    assert_eq!(schedule_region(&store, &region).await, 0);
}

#[tokio::test]
async fn first_joiner_keeps_the_ring_until_shards_are_released() {
    let store = TxnStore::memory();
    let region = get_or_create_shard_region(&store, "sticky", 4)
        .await
        .expect("region");
    let first = NodeId::random();
    let second = NodeId::random();

    register_node(&store, &region, first, u64::MAX).await;
    let snapshot = fetch_allocations(&store, &region).await;
    assert_eq!(shards_on(&snapshot, first), 4);

    // A later joiner triggers no rebalancing; covered shards stay put.
    register_node(&store, &region, second, u64::MAX).await;
    let snapshot = fetch_allocations(&store, &region).await;
    assert_eq!(shards_on(&snapshot, first), 4);
    assert_eq!(shards_on(&snapshot, second), 0);
}

#[tokio::test]
async fn draining_moves_pending_shards_immediately() {
    let store = TxnStore::memory();
    let region = get_or_create_shard_region(&store, "drain", 4)
        .await
        .expect("region");
    let leaving = NodeId::random();
    let staying = NodeId::random();

    register_node(&store, &region, leaving, u64::MAX).await;
    register_node(&store, &region, staying, u64::MAX).await;

    // The not-yet-active allocations are deleted and reassigned in the same
    // scheduler pass the drain announcement triggers.
    assert_eq!(
        register_node_leaving(&store, &region, leaving, u64::MAX).await,
        NodeState::Leaving
    );
    let snapshot = fetch_allocations(&store, &region).await;
    assert_eq!(shards_on(&snapshot, leaving), 0);
    for shard in 0..4 {
        assert_eq!(
            snapshot.status_for(staying, shard),
            Some(AllocationStatus::Allocating)
        );
    }
}

#[tokio::test]
async fn active_shards_hand_over_gracefully_on_drain() {
    let store = TxnStore::memory();
    let region = get_or_create_shard_region(&store, "handover", 2)
        .await
        .expect("region");
    let old = NodeId::random();
    let new = NodeId::random();

    register_node(&store, &region, old, u64::MAX).await;
    for shard in 0..2 {
        assert!(on_allocation_ready(&store, &region, old, shard).await);
    }
    register_node(&store, &region, new, u64::MAX).await;
    register_node_leaving(&store, &region, old, u64::MAX).await;

    // The active shards keep serving on the draining node while their
    // replacements spin up elsewhere.
    let snapshot = fetch_allocations(&store, &region).await;
    for shard in 0..2 {
        assert_eq!(
            snapshot.status_for(old, shard),
            Some(AllocationStatus::Active)
        );
        assert_eq!(
            snapshot.status_for(new, shard),
            Some(AllocationStatus::Allocating)
        );
    }

    // The replacement going active demotes the old owner in the same
    // transaction.
    assert!(on_allocation_ready(&store, &region, new, 0).await);
    let snapshot = fetch_allocations(&store, &region).await;
    assert_eq!(
        snapshot.status_for(old, 0),
        Some(AllocationStatus::Removing)
    );
    assert_eq!(snapshot.status_for(new, 0), Some(AllocationStatus::Active));
    // Shard 1's handover has not happened yet.
    assert_eq!(snapshot.status_for(old, 1), Some(AllocationStatus::Active));

    // The old owner acknowledges the close; its record disappears.
    assert!(on_allocation_removed(&store, &region, old, 0).await);
    let snapshot = fetch_allocations(&store, &region).await;
    assert_eq!(snapshot.status_for(old, 0), None);
    assert_eq!(snapshot.shard(0).len(), 1);
}

#[tokio::test]
async fn unknown_status_codes_read_as_absent() {
    let store = TxnStore::memory();
    let region = get_or_create_shard_region(&store, "tolerant", 2)
        .await
        .expect("region");
    let node = NodeId::random();
    let ghost = NodeId::random();

    store
        .run(|txn| {
            register_node_in_txn(txn, region.id, node, u64::MAX);
            // A lease with a state code from the future, and an allocation
            // with an unknown status byte.
            txn.set(keys::node_state_key(region.id, ghost), vec![99]);
            txn.set(
                keys::node_timeout_key(region.id, ghost),
                u64::MAX.to_be_bytes().to_vec(),
            );
            txn.set(keys::allocation_key(region.id, 0, node), vec![9]);
            Ok(())
        })
        .expect("seed");

    // Undecodable records are skipped, not errors.
    let snapshot = fetch_allocations(&store, &region).await;
    assert!(snapshot.shard(0).is_empty());
    let nodes = store
        .run(|txn| Ok(get_shard_region_nodes(txn, region.id)))
        .expect("nodes");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].node, node);

    // The scheduler sees shard 0 as uncovered and re-covers it, replacing
    // the bogus record with a real allocation.
    assert_eq!(schedule_region(&store, &region).await, 2);
    let snapshot = fetch_allocations(&store, &region).await;
    assert_eq!(
        snapshot.status_for(node, 0),
        Some(AllocationStatus::Allocating)
    );
    assert_eq!(
        snapshot.status_for(node, 1),
        Some(AllocationStatus::Allocating)
    );
    assert_eq!(snapshot.status_for(ghost, 0), None);
}

#[tokio::test]
async fn stale_acknowledgements_are_ignored() {
    let store = TxnStore::memory();
    let region = get_or_create_shard_region(&store, "acks", 1)
        .await
        .expect("region");
    let node = NodeId::random();
    register_node(&store, &region, node, u64::MAX).await;

    // Unknown node, wrong transition, repeated ack: all no-ops.
    assert!(!on_allocation_ready(&store, &region, NodeId::random(), 0).await);
    assert!(!on_allocation_removed(&store, &region, node, 0).await);
    assert!(on_allocation_ready(&store, &region, node, 0).await);
    assert!(!on_allocation_ready(&store, &region, node, 0).await);

    let snapshot = fetch_allocations(&store, &region).await;
    assert_eq!(snapshot.status_for(node, 0), Some(AllocationStatus::Active));
    assert_eq!(snapshot.shard(0).len(), 1);
}
