//! Persisted key layout.
//!
//! All control-plane state lives in one store namespace, addressed by
//! ordered-tuple keys: a one-byte namespace tag followed by big-endian fixed
//! fields (region id, shard index, 16-byte node id) or length-prefixed
//! strings. Ordering groups allocations by region then shard then node, so a
//! prefix scan over a region enumerates shards in ring order.
//!
//! Layout:
//! - `registry[0, name] -> ShardRegion` (JSON)
//! - `registry[1, id]   -> ShardRegion` (JSON)
//! - `registry[2]       -> next region id` (u64 BE)
//! - `nodes.state[region, node]   -> state code` (u8)
//! - `nodes.timeout[region, node] -> epoch millis` (u64 BE)
//! - `shards[region, shard, node] -> status code` (u8)
//! - `shardVersions[region]       -> opaque counter` (u64 BE, watched)

use crate::registry::NodeId;

pub const NS_REGISTRY: u8 = 0x01;
pub const NS_NODE_STATE: u8 = 0x02;
pub const NS_NODE_TIMEOUT: u8 = 0x03;
pub const NS_ALLOCATION: u8 = 0x04;
pub const NS_CHANGE_SIGNAL: u8 = 0x05;

const REGISTRY_BY_NAME: u8 = 0x00;
const REGISTRY_BY_ID: u8 = 0x01;
const REGISTRY_NEXT_ID: u8 = 0x02;

pub fn region_by_name_key(name: &str) -> Vec<u8> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(2 + 4 + bytes.len());
    out.push(NS_REGISTRY);
    out.push(REGISTRY_BY_NAME);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

pub fn region_by_id_key(region: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 8);
    out.push(NS_REGISTRY);
    out.push(REGISTRY_BY_ID);
    out.extend_from_slice(&region.to_be_bytes());
    out
}

pub fn region_by_id_prefix() -> Vec<u8> {
    vec![NS_REGISTRY, REGISTRY_BY_ID]
}

pub fn region_id_counter_key() -> Vec<u8> {
    vec![NS_REGISTRY, REGISTRY_NEXT_ID]
}

pub fn node_state_key(region: u64, node: NodeId) -> Vec<u8> {
    node_key(NS_NODE_STATE, region, node)
}

pub fn node_state_prefix(region: u64) -> Vec<u8> {
    region_prefix(NS_NODE_STATE, region)
}

pub fn node_state_all_prefix() -> Vec<u8> {
    vec![NS_NODE_STATE]
}

pub fn node_timeout_key(region: u64, node: NodeId) -> Vec<u8> {
    node_key(NS_NODE_TIMEOUT, region, node)
}

pub fn node_timeout_all_prefix() -> Vec<u8> {
    vec![NS_NODE_TIMEOUT]
}

pub fn allocation_key(region: u64, shard: u32, node: NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 4 + 16);
    out.push(NS_ALLOCATION);
    out.extend_from_slice(&region.to_be_bytes());
    out.extend_from_slice(&shard.to_be_bytes());
    out.extend_from_slice(node.as_bytes());
    out
}

pub fn allocation_prefix(region: u64) -> Vec<u8> {
    region_prefix(NS_ALLOCATION, region)
}

pub fn change_signal_key(region: u64) -> Vec<u8> {
    region_prefix(NS_CHANGE_SIGNAL, region)
}

/// Parse a `nodes.state` or `nodes.timeout` key back into (region, node).
pub fn decode_node_key(ns: u8, key: &[u8]) -> Option<(u64, NodeId)> {
    if key.len() != 1 + 8 + 16 || key[0] != ns {
        return None;
    }
    let region = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let node = NodeId::from_slice(&key[9..25])?;
    Some((region, node))
}

/// Parse a `shards` key back into (region, shard, node).
pub fn decode_allocation_key(key: &[u8]) -> Option<(u64, u32, NodeId)> {
    if key.len() != 1 + 8 + 4 + 16 || key[0] != NS_ALLOCATION {
        return None;
    }
    let region = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let shard = u32::from_be_bytes(key[9..13].try_into().ok()?);
    let node = NodeId::from_slice(&key[13..29])?;
    Some((region, shard, node))
}

fn region_prefix(ns: u8, region: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8);
    out.push(ns);
    out.extend_from_slice(&region.to_be_bytes());
    out
}

fn node_key(ns: u8, region: u64, node: NodeId) -> Vec<u8> {
    let mut out = region_prefix(ns, region);
    out.extend_from_slice(node.as_bytes());
    out
}
