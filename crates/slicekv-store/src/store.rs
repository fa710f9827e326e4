//! Top-level store lifecycle and dispatch
//!
//! A [`KeyValueStore`] is `n_shards` data shard actors plus one
//! reserved metadata shard actor, all backed by slices striped across
//! the configured files. Point operations route by key hash to exactly
//! one data shard; range scans fan out to every data shard and merge.
//! The metadata shard is reachable only through the metadata facade and
//! the stat persistence loop, never through key routing.

use parking_lot::Mutex;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use slicekv_common::{
    CastTime, Error, GetResult, MAX_SHARDS, Mutation, MutationResult, OrderToken, Result,
    StoreConfig, StoreKey, shard_for_key,
};
use slicekv_engine::{FileSerializer, SerializerMultiplexer, SliceBtree};

use crate::merge::MergeIterator;
use crate::partition::{partition_cache_config, resource_shares};
use crate::shard::{ChangeListener, ShardStore};
use crate::stats::{self, StatPersistLoop, StoreMetrics, StoreMetricsSnapshot};

pub struct KeyValueStore {
    pub(crate) shards: Vec<ShardStore>,
    pub(crate) metadata_shard: ShardStore,
    pub(crate) multiplexer: Option<SerializerMultiplexer>,
    pub(crate) n_shards: u32,
    pub(crate) metrics: Arc<StoreMetrics>,
    pub(crate) stat_loop: Option<StatPersistLoop>,
}

impl KeyValueStore {
    /// Formats a fresh store: wipes the configured files, writes fresh
    /// serializer headers, and initializes `n_shards` data slices plus
    /// the metadata slice, all empty. The store is not left open.
    pub fn create(config: &StoreConfig, n_shards: u32) -> Result<()> {
        config.validate();
        assert!(n_shards >= 1, "store requires at least one data shard");
        assert!(
            n_shards <= MAX_SHARDS,
            "store supports at most {MAX_SHARDS} data shards, got {n_shards}"
        );

        let n_files = config.files.len() as u32;
        let n_proxies = n_shards + 1;
        let creation_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        info!(files = n_files, shards = n_shards, "formatting store");

        let indexed_paths: Vec<(u32, PathBuf)> = config
            .files
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, path)| (i as u32, path))
            .collect();
        let files = parallel_map(indexed_paths, |(file_index, path)| {
            FileSerializer::create(&path, creation_timestamp, file_index, n_files, n_proxies)
                .map(Arc::new)
        })
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        let multiplexer = SerializerMultiplexer::new(files)?;
        assert!(
            multiplexer.n_proxies() == n_proxies,
            "multiplexer produced {} proxies, expected {}",
            multiplexer.n_proxies(),
            n_proxies,
        );

        parallel_map(multiplexer.proxies(), |proxy| {
            SliceBtree::create_empty(&proxy)
        })
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        close_files(multiplexer.into_files());
        info!(shards = n_shards, "store formatted");
        Ok(())
    }

    /// Opens a formatted store. The shard count comes from the files
    /// themselves: however many slices were formatted, minus the
    /// metadata slice.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate();
        info!(files = config.files.len(), "opening store");

        let files = parallel_map(config.files.clone(), |path| {
            FileSerializer::open(&path).map(Arc::new)
        })
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
        let multiplexer = SerializerMultiplexer::new(files)?;

        let n_proxies = multiplexer.n_proxies();
        assert!(
            n_proxies >= 2,
            "formatted store must contain a data shard and the metadata shard"
        );
        let n_shards = n_proxies - 1;
        assert!(
            n_shards <= MAX_SHARDS,
            "store recorded {n_shards} data shards, limit is {MAX_SHARDS}"
        );

        let (data_share, meta_share) = resource_shares(n_shards);
        let data_cache = partition_cache_config(&config.cache, data_share);
        let meta_cache = partition_cache_config(&config.cache, meta_share);
        debug!(
            shard_max_size = data_cache.max_size,
            meta_max_size = meta_cache.max_size,
            "partitioned cache budget"
        );

        // every shard loads its slice on its own thread; readiness is
        // collected afterwards so the loads overlap
        let mut proxies = multiplexer.proxies();
        let meta_proxy = proxies.pop().ok_or_else(|| {
            Error::corruption("store has no metadata slice")
        })?;
        let mut pending = Vec::with_capacity(proxies.len());
        for (index, proxy) in proxies.into_iter().enumerate() {
            pending.push(ShardStore::spawn(index as u32, proxy, data_cache)?);
        }
        let (metadata_shard, meta_ready) = ShardStore::spawn(n_shards, meta_proxy, meta_cache)?;

        let mut shards = Vec::with_capacity(pending.len());
        for (shard, ready) in pending {
            ready.recv().map_err(|_| Error::ShardStopped)??;
            shards.push(shard);
        }
        meta_ready.recv().map_err(|_| Error::ShardStopped)??;

        // seed every data shard's timestamper from shard 0's clock so
        // no shard stamps below what replication has already seen
        let clock = shards[0].handle().replication_metadata()?.replication_clock;
        for shard in &shards {
            shard.handle().set_timestamp(clock)?;
        }

        let metrics = Arc::new(StoreMetrics::default());
        stats::unpersist_all(metadata_shard.handle(), &metrics)?;
        let stat_loop = StatPersistLoop::start(
            metadata_shard.handle().clone(),
            metrics.clone(),
            config.stat_persist_interval(),
        )?;

        info!(shards = n_shards, "store opened");
        Ok(Self {
            shards,
            metadata_shard,
            multiplexer: Some(multiplexer),
            n_shards,
            metrics,
            stat_loop: Some(stat_loop),
        })
    }

    /// Probes whether `files` hold a store this build can open, without
    /// opening it. The callback fires exactly once, from a probe
    /// thread, with the verdict over all files.
    pub fn check_existing<F>(files: &[PathBuf], callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if files.is_empty() {
            callback(false);
            return;
        }

        struct CheckState {
            remaining: usize,
            all_ok: bool,
            callback: Option<Box<dyn FnOnce(bool) + Send>>,
        }

        let state = Arc::new(Mutex::new(CheckState {
            remaining: files.len(),
            all_ok: true,
            callback: Some(Box::new(callback)),
        }));
        for path in files {
            let path = path.clone();
            let state = state.clone();
            thread::spawn(move || {
                let ok = FileSerializer::check(&path);
                let mut guard = state.lock();
                guard.all_ok &= ok;
                guard.remaining -= 1;
                if guard.remaining == 0 {
                    let verdict = guard.all_ok;
                    if let Some(callback) = guard.callback.take() {
                        drop(guard);
                        callback(verdict);
                    }
                }
            });
        }
    }

    pub fn n_shards(&self) -> u32 {
        self.n_shards
    }

    /// Point read, routed by key hash.
    pub fn get(&self, key: &StoreKey, token: OrderToken) -> Result<Option<GetResult>> {
        self.metrics.record_get();
        let shard = shard_for_key(key.as_bytes(), self.n_shards);
        self.shards[shard as usize].handle().get(key.clone(), token)
    }

    /// Applies a locally-originated mutation; the owning shard stamps
    /// it.
    pub fn change(&self, mutation: Mutation, token: OrderToken) -> Result<MutationResult> {
        let start = Instant::now();
        let shard = shard_for_key(mutation.key().as_bytes(), self.n_shards);
        let result = self.shards[shard as usize].handle().change(mutation, token);
        self.metrics.record_change(start.elapsed());
        result
    }

    /// Applies a relayed mutation under the cast time it arrived with,
    /// bypassing the owning shard's timestamper.
    pub fn change_with_cast_time(
        &self,
        mutation: Mutation,
        cast_time: CastTime,
        token: OrderToken,
    ) -> Result<MutationResult> {
        let start = Instant::now();
        let shard = shard_for_key(mutation.key().as_bytes(), self.n_shards);
        let result = self.shards[shard as usize]
            .handle()
            .change_with_cast_time(mutation, cast_time, token);
        self.metrics.record_relayed_change(start.elapsed());
        result
    }

    /// Ordered range scan across all data shards. Entries stream out
    /// lazily in global key order; the iterator is single-use.
    pub fn rget(
        &self,
        left: Bound<StoreKey>,
        right: Bound<StoreKey>,
        token: OrderToken,
    ) -> Result<MergeIterator> {
        self.metrics.record_rget();
        let mut streams = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            streams.push(shard.handle().rget(left.clone(), right.clone(), token)?);
        }
        Ok(MergeIterator::new(streams))
    }

    /// Purges every data shard, one shard at a time. Metadata and
    /// replication state survive; the store stays open for the reseed
    /// that follows.
    pub fn delete_all_keys_for_backfill(&self) -> Result<()> {
        info!(shards = self.n_shards, "purging all data shards");
        for shard in &self.shards {
            shard.handle().delete_all_keys()?;
        }
        Ok(())
    }

    /// Subscribes `listener` to every data shard's change feed.
    /// Callbacks run on shard threads, after the mutation has landed.
    pub fn register_change_listener(&self, listener: Arc<dyn ChangeListener>) -> Result<()> {
        for shard in &self.shards {
            shard.handle().add_listener(listener.clone())?;
        }
        Ok(())
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stops the store: stat loop first, then all shards in parallel
    /// (each flushes on its way out), then the backing files.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(mut stat_loop) = self.stat_loop.take() {
            stat_loop.stop();
        }
        for shard in &self.shards {
            shard.request_stop();
        }
        self.metadata_shard.request_stop();
        for shard in &mut self.shards {
            shard.join();
        }
        self.metadata_shard.join();
        if let Some(multiplexer) = self.multiplexer.take() {
            close_files(multiplexer.into_files());
            info!("store closed");
        }
    }
}

impl Drop for KeyValueStore {
    fn drop(&mut self) {
        if self.multiplexer.is_some() {
            self.shutdown_inner();
        }
    }
}

/// Runs `f` over every item on its own scoped thread and returns the
/// results in input order. A panicking task panics the caller.
fn parallel_map<T, R>(items: Vec<T>, f: impl Fn(T) -> R + Sync) -> Vec<R>
where
    T: Send,
    R: Send,
{
    let f = &f;
    thread::scope(|scope| {
        let tasks: Vec<_> = items
            .into_iter()
            .map(|item| scope.spawn(move || f(item)))
            .collect();
        tasks
            .into_iter()
            .map(|task| task.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}

fn close_files(files: Vec<Arc<FileSerializer>>) {
    let results = parallel_map(files, |file| {
        file.close().map_err(|e| (file.path().to_path_buf(), e))
    });
    for result in results {
        if let Err((path, e)) = result {
            warn!(path = %path.display(), error = %e, "serializer close failed");
        }
    }
}
