//! Hook points for shard lifecycle counters.

/// Callbacks fired by the reconciler as shards are opened and closed on the
/// local node. Implementations must be cheap; they run on the reconciler's
/// worker task.
pub trait ShardMetrics: Send + Sync + 'static {
    fn shard_opened(&self, _shard: u32) {}
    fn shard_closed(&self, _shard: u32) {}
    fn active_shards(&self, _count: usize) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl ShardMetrics for NoopMetrics {}
