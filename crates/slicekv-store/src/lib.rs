//! SliceKV Store - Sharded ordered key-value store
//!
//! A store is a fixed set of data shards plus one reserved metadata
//! shard, each an actor on its own OS thread over an ordered slice
//! engine. Keys route to shards by hash; range scans fan out to every
//! data shard and k-way merge back into key order. Operation ordering
//! is enforced per shard by causal tokens.
//!
//! - [`KeyValueStore`]: lifecycle (create/open/shutdown) and dispatch
//! - [`ShardStore`] / [`ShardHandle`]: one actor per shard
//! - [`MergeIterator`]: lazy ordered merge over shard range streams
//! - [`StoreMetrics`]: operation counters, persisted across restarts

mod meta;
pub mod merge;
pub mod partition;
pub mod shard;
pub mod stats;
pub mod store;

pub use merge::MergeIterator;
pub use partition::{METADATA_SHARD_RESOURCE_QUOTIENT, partition_cache_config, resource_shares};
pub use shard::{ChangeListener, RangeStream, ShardHandle, ShardStore};
pub use stats::{LatencySampler, LatencySnapshot, StoreMetrics, StoreMetricsSnapshot};
pub use store::KeyValueStore;
