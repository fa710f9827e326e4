//! Per-shard ordered engine
//!
//! A [`SliceBtree`] is the single-threaded heart of one shard: an
//! ordered map of live entries plus the shard's replication metadata,
//! persisted as one snapshot blob through the slice's proxy serializer.
//! It keeps no locks of its own; the owning shard actor is the only
//! caller.
//!
//! Writes accumulate in memory and snapshot to disk once enough dirty
//! bytes or pending deletions pile up. Replication metadata writes are
//! rare and go straight through.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::{debug, info, warn};

use slicekv_common::{
    CacheConfig, CastTime, Error, GetResult, MAX_VALUE_SIZE, Mutation, MutationResult, OrderSink,
    OrderToken, ReplTimestamp, ReplicationMetadata, Result, SetPolicy, StoreKey, ValueEntry,
};

use crate::serializer::ProxySerializer;

/// On-disk form of one slice: replication state plus all live entries
/// in key order.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SliceSnapshot {
    replication: ReplicationMetadata,
    entries: Vec<(StoreKey, ValueEntry)>,
}

#[derive(Debug)]
pub struct SliceBtree {
    tree: BTreeMap<StoreKey, ValueEntry>,
    replication: ReplicationMetadata,
    proxy: ProxySerializer,
    cache_config: CacheConfig,
    sink: OrderSink,
    dirty_bytes: u64,
    pending_deletes: u64,
}

impl SliceBtree {
    /// Writes an empty snapshot into the proxy's slot. Part of the
    /// store format path; the slice is not opened.
    pub fn create_empty(proxy: &ProxySerializer) -> Result<()> {
        let blob = bincode::serialize(&SliceSnapshot::default())
            .map_err(|e| Error::serialization(format!("slice snapshot encode: {e}")))?;
        proxy.save(blob)
    }

    /// Loads the slice previously formatted into `proxy`'s slot.
    pub fn load(proxy: ProxySerializer, cache_config: CacheConfig) -> Result<Self> {
        let blob = proxy.load().ok_or_else(|| {
            Error::corruption(format!("proxy {} has no slice snapshot", proxy.proxy_id()))
        })?;
        let snapshot: SliceSnapshot = bincode::deserialize(&blob)
            .map_err(|e| Error::corruption(format!("slice snapshot decode: {e}")))?;
        let tree: BTreeMap<StoreKey, ValueEntry> = snapshot.entries.into_iter().collect();
        debug!(
            proxy = proxy.proxy_id(),
            entries = tree.len(),
            "slice loaded"
        );
        Ok(Self {
            tree,
            replication: snapshot.replication,
            proxy,
            cache_config,
            sink: OrderSink::new(),
            dirty_bytes: 0,
            pending_deletes: 0,
        })
    }

    pub fn get(&mut self, key: &StoreKey, token: OrderToken) -> Option<GetResult> {
        self.sink.check_out(token);
        self.tree.get(key).map(|entry| GetResult {
            value: entry.data.clone(),
            cas: entry.cas,
            timestamp: entry.timestamp,
        })
    }

    /// Visits live entries within the bounds in key order, stopping
    /// early when `visit` returns false. Inverted bounds visit nothing.
    pub fn scan_range(
        &mut self,
        left: &Bound<StoreKey>,
        right: &Bound<StoreKey>,
        token: OrderToken,
        mut visit: impl FnMut(&StoreKey, &ValueEntry) -> bool,
    ) {
        self.sink.check_out(token);
        if bounds_empty(left, right) {
            return;
        }
        for (key, entry) in self.tree.range((left.clone(), right.clone())) {
            if !visit(key, entry) {
                return;
            }
        }
    }

    /// Applies one mutation under the given cast time. Domain outcomes
    /// come back as [`MutationResult`]; only infrastructure failures
    /// are errors.
    pub fn apply(
        &mut self,
        mutation: &Mutation,
        cast_time: CastTime,
        token: OrderToken,
    ) -> Result<MutationResult> {
        self.sink.check_out(token);
        let result = match mutation {
            Mutation::Set { key, value, policy } => {
                if value.len() > MAX_VALUE_SIZE {
                    MutationResult::TooLarge
                } else {
                    let exists = self.tree.contains_key(key);
                    match policy {
                        SetPolicy::Add if exists => MutationResult::NotStored,
                        SetPolicy::Replace if !exists => MutationResult::NotStored,
                        _ => {
                            self.dirty_bytes += (key.len() + value.len()) as u64;
                            self.tree.insert(
                                key.clone(),
                                ValueEntry {
                                    data: value.clone(),
                                    cas: cast_time.proposed_cas,
                                    timestamp: cast_time.timestamp,
                                },
                            );
                            MutationResult::Stored
                        }
                    }
                }
            }
            Mutation::Delete { key } => {
                if self.tree.remove(key).is_some() {
                    self.dirty_bytes += key.len() as u64;
                    self.pending_deletes += 1;
                    MutationResult::Deleted
                } else {
                    MutationResult::NotFound
                }
            }
        };
        if result.is_success() {
            self.maybe_flush()?;
        }
        Ok(result)
    }

    /// Drops every entry and persists the empty slice immediately.
    pub fn delete_all_keys(&mut self) -> Result<()> {
        let purged = self.tree.len();
        self.tree.clear();
        self.flush()?;
        info!(proxy = self.proxy.proxy_id(), purged, "slice purged");
        Ok(())
    }

    /// Snapshots the slice to its backing file unconditionally.
    pub fn flush(&mut self) -> Result<()> {
        let snapshot = SliceSnapshot {
            replication: self.replication,
            entries: self
                .tree
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let blob = bincode::serialize(&snapshot)
            .map_err(|e| Error::serialization(format!("slice snapshot encode: {e}")))?;
        self.proxy.save(blob)?;
        self.dirty_bytes = 0;
        self.pending_deletes = 0;
        debug!(
            proxy = self.proxy.proxy_id(),
            entries = self.tree.len(),
            "slice flushed"
        );
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.dirty_bytes > self.cache_config.max_dirty_size {
            warn!(
                proxy = self.proxy.proxy_id(),
                dirty_bytes = self.dirty_bytes,
                max_dirty_size = self.cache_config.max_dirty_size,
                "dirty data exceeds the slice budget"
            );
        }
        if self.dirty_bytes >= self.cache_config.flush_dirty_size
            || self.pending_deletes >= self.cache_config.delete_queue_limit
        {
            self.flush()?;
        }
        Ok(())
    }

    pub fn replication_metadata(&self) -> ReplicationMetadata {
        self.replication
    }

    pub fn set_replication_clock(&mut self, clock: ReplTimestamp) -> Result<()> {
        self.replication.replication_clock = clock;
        self.flush()
    }

    pub fn set_last_sync(&mut self, last_sync: ReplTimestamp) -> Result<()> {
        self.replication.last_sync = last_sync;
        self.flush()
    }

    pub fn set_master_id(&mut self, master_id: u32) -> Result<()> {
        self.replication.master_id = master_id;
        self.flush()
    }

    pub fn set_slave_id(&mut self, slave_id: u32) -> Result<()> {
        self.replication.slave_id = slave_id;
        self.flush()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// True when the bounds describe a range no key can satisfy. Guards
/// `BTreeMap::range`, which panics on inverted input.
fn bounds_empty(left: &Bound<StoreKey>, right: &Bound<StoreKey>) -> bool {
    match (left, right) {
        (Bound::Included(l), Bound::Included(r)) => l > r,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(r))
        | (Bound::Excluded(l), Bound::Included(r)) => l >= r,
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
    }
}
