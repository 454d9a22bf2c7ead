//! Shard-allocation control plane over a transactional key-value store.
//!
//! A fixed-size ring of shards per region is continuously assigned to live
//! worker processes. The store is the single source of truth: node liveness
//! is a lease table, assignments live in an allocation table, and a per-region
//! change signal wakes clients through the store's key-watch primitive. No
//! separate consensus service participates; atomicity comes entirely from the
//! store's optimistic transactions.
//!
//! Entry points:
//! - [`region::RegionClient`] opens a region, routes keys with
//!   `shard_of_key`, answers `get_allocation`, and drives workload
//!   convergence once a [`reconcile::ShardFactory`] is attached via
//!   `start_shard`.
//! - [`daemon::SchedulerDaemon`] runs the periodic sweep that expires stale
//!   leases and re-schedules every region.

pub mod allocation;
pub mod daemon;
pub mod keys;
pub mod metrics;
pub mod reconcile;
pub mod region;
pub mod registry;
pub mod retry;
pub mod ring;
pub mod store;

pub use allocation::{Allocation, AllocationSnapshot, AllocationStatus};
pub use daemon::{SchedulerDaemon, SchedulerDaemonConfig};
pub use metrics::{NoopMetrics, ShardMetrics};
pub use reconcile::{ReconciliationManager, ShardFactory, ShardHandle};
pub use region::{
    get_or_create_shard_region, RegionClient, RegionClientConfig, ShardRegion, ShardingInfo,
};
pub use registry::{NodeId, NodeState};
pub use ring::shard_of;
pub use store::{StoreError, TxnStore};
