//! Operation metrics and stat persistence
//!
//! Counters live in plain atomics and cost one `fetch_add` per
//! operation. A background loop writes them into the metadata shard
//! under well-known keys so they survive restarts; the open path reads
//! them back before the loop starts.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use slicekv_common::{
    Mutation, MutationResult, OrderToken, Result, SetPolicy, ShutdownSignal, StoreKey,
};

use crate::shard::ShardHandle;

// Metadata keys the counters persist under, as decimal strings.
pub(crate) const STAT_GETS: &str = "stat_gets_total";
pub(crate) const STAT_RGETS: &str = "stat_rgets_total";
pub(crate) const STAT_CHANGES: &str = "stat_changes_total";
pub(crate) const STAT_RELAYED_CHANGES: &str = "stat_relayed_changes_total";

#[derive(Debug, Default)]
pub struct LatencySampler {
    count: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencySampler {
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_micros.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            mean_micros: if count == 0 { 0 } else { total / count },
            max_micros: self.max_micros.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_micros: u64,
    pub max_micros: u64,
}

/// Store-wide operation counters. Locally-stamped and relayed changes
/// sample separately, since relayed traffic skips the timestamper and
/// has a different latency profile.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    gets: AtomicU64,
    rgets: AtomicU64,
    changes: LatencySampler,
    relayed_changes: LatencySampler,
}

impl StoreMetrics {
    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rget(&self) {
        self.rgets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_change(&self, elapsed: Duration) {
        self.changes.record(elapsed);
    }

    pub fn record_relayed_change(&self, elapsed: Duration) {
        self.relayed_changes.record(elapsed);
    }

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            rgets: self.rgets.load(Ordering::Relaxed),
            changes: self.changes.snapshot(),
            relayed_changes: self.relayed_changes.snapshot(),
        }
    }

    /// Seeds counters from their persisted values. Latency samples do
    /// not persist; only the counts carry over.
    fn seed(&self, gets: u64, rgets: u64, changes: u64, relayed_changes: u64) {
        self.gets.store(gets, Ordering::Relaxed);
        self.rgets.store(rgets, Ordering::Relaxed);
        self.changes.count.store(changes, Ordering::Relaxed);
        self.relayed_changes
            .count
            .store(relayed_changes, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct StoreMetricsSnapshot {
    pub gets: u64,
    pub rgets: u64,
    pub changes: LatencySnapshot,
    pub relayed_changes: LatencySnapshot,
}

/// Writes every counter into the metadata shard.
pub(crate) fn persist_all(meta: &ShardHandle, metrics: &StoreMetrics) -> Result<()> {
    let snapshot = metrics.snapshot();
    persist_counter(meta, STAT_GETS, snapshot.gets)?;
    persist_counter(meta, STAT_RGETS, snapshot.rgets)?;
    persist_counter(meta, STAT_CHANGES, snapshot.changes.count)?;
    persist_counter(meta, STAT_RELAYED_CHANGES, snapshot.relayed_changes.count)?;
    Ok(())
}

fn persist_counter(meta: &ShardHandle, name: &str, value: u64) -> Result<()> {
    let mutation = Mutation::Set {
        key: StoreKey::new(name.as_bytes())?,
        value: value.to_string().into_bytes(),
        policy: SetPolicy::Upsert,
    };
    let result = meta.change(mutation, OrderToken::ignore())?;
    assert!(
        result == MutationResult::Stored,
        "stat counter upsert rejected: {result:?}"
    );
    Ok(())
}

/// Restores counters persisted by an earlier run. Missing or unreadable
/// counters reset to zero.
pub(crate) fn unpersist_all(meta: &ShardHandle, metrics: &StoreMetrics) -> Result<()> {
    let gets = read_counter(meta, STAT_GETS)?;
    let rgets = read_counter(meta, STAT_RGETS)?;
    let changes = read_counter(meta, STAT_CHANGES)?;
    let relayed_changes = read_counter(meta, STAT_RELAYED_CHANGES)?;
    metrics.seed(gets, rgets, changes, relayed_changes);
    debug!(gets, rgets, changes, relayed_changes, "restored persisted stats");
    Ok(())
}

fn read_counter(meta: &ShardHandle, name: &str) -> Result<u64> {
    let key = StoreKey::new(name.as_bytes())?;
    let Some(got) = meta.get(key, OrderToken::ignore())? else {
        return Ok(0);
    };
    match std::str::from_utf8(&got.value).ok().and_then(|s| s.parse().ok()) {
        Some(value) => Ok(value),
        None => {
            warn!(counter = name, "persisted stat counter unreadable, resetting");
            Ok(0)
        }
    }
}

/// Background loop persisting counters once per interval until stopped.
///
/// The wait is interruptible, and a stop request that races a due tick
/// wins: the loop re-checks the signal on every wakeup before touching
/// the store, so no persist starts after `stop` begins.
pub(crate) struct StatPersistLoop {
    shutdown: Arc<ShutdownSignal>,
    thread: Option<thread::JoinHandle<()>>,
}

impl StatPersistLoop {
    pub(crate) fn start(
        meta: ShardHandle,
        metrics: Arc<StoreMetrics>,
        interval: Duration,
    ) -> Result<Self> {
        let shutdown = Arc::new(ShutdownSignal::new());
        let waiter = shutdown.clone();
        let thread = thread::Builder::new()
            .name("slicekv-stats".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "stat loop running");
                loop {
                    waiter.wait_timeout(interval);
                    if waiter.is_signalled() {
                        break;
                    }
                    if let Err(e) = persist_all(&meta, &metrics) {
                        warn!(error = %e, "stat persistence failed");
                    }
                }
                debug!("stat loop stopped");
            })?;
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(&mut self) {
        self.shutdown.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StatPersistLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::KeyValueStore;
    use slicekv_common::StoreConfig;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::tempdir;

    fn quiet_config(dir: &Path) -> StoreConfig {
        let mut config = StoreConfig::with_files(vec![dir.join("data_0")]);
        // keep the store's own loop out of these tests
        config.stat_persist_interval_ms = 3_600_000;
        config
    }

    #[test]
    fn test_latency_sampler_math() {
        let sampler = LatencySampler::default();
        assert_eq!(sampler.snapshot().count, 0);
        assert_eq!(sampler.snapshot().mean_micros, 0);

        sampler.record(Duration::from_micros(10));
        sampler.record(Duration::from_micros(30));
        let snapshot = sampler.snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.mean_micros, 20);
        assert_eq!(snapshot.max_micros, 30);
    }

    #[test]
    fn test_counters_persist_and_restore() {
        let dir = tempdir().unwrap();
        let config = quiet_config(dir.path());
        KeyValueStore::create(&config, 2).unwrap();
        let store = KeyValueStore::open(&config).unwrap();

        let metrics = StoreMetrics::default();
        metrics.record_get();
        metrics.record_get();
        metrics.record_rget();
        metrics.record_change(Duration::from_micros(5));
        metrics.record_relayed_change(Duration::from_micros(5));
        metrics.record_relayed_change(Duration::from_micros(5));
        metrics.record_relayed_change(Duration::from_micros(5));
        persist_all(store.metadata_shard.handle(), &metrics).unwrap();

        let restored = StoreMetrics::default();
        unpersist_all(store.metadata_shard.handle(), &restored).unwrap();
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.gets, 2);
        assert_eq!(snapshot.rgets, 1);
        assert_eq!(snapshot.changes.count, 1);
        assert_eq!(snapshot.relayed_changes.count, 3);
        // latencies do not survive, only counts
        assert_eq!(snapshot.changes.mean_micros, 0);

        store.shutdown();
    }

    #[test]
    fn test_unpersist_from_fresh_store_is_zero() {
        let dir = tempdir().unwrap();
        let config = quiet_config(dir.path());
        KeyValueStore::create(&config, 1).unwrap();
        let store = KeyValueStore::open(&config).unwrap();

        let metrics = StoreMetrics::default();
        unpersist_all(store.metadata_shard.handle(), &metrics).unwrap();
        assert_eq!(metrics.snapshot().gets, 0);
        assert_eq!(metrics.snapshot().changes.count, 0);

        store.shutdown();
    }

    #[test]
    fn test_loop_ticks_then_stops_persisting_once_signalled() {
        let dir = tempdir().unwrap();
        let config = quiet_config(dir.path());
        KeyValueStore::create(&config, 1).unwrap();
        let store = KeyValueStore::open(&config).unwrap();

        let metrics = Arc::new(StoreMetrics::default());
        metrics.record_get();
        metrics.record_get();
        metrics.record_get();

        let mut stat_loop = StatPersistLoop::start(
            store.metadata_shard.handle().clone(),
            metrics.clone(),
            Duration::from_millis(50),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(400));

        let persisted = store.get_meta(STAT_GETS).unwrap().unwrap();
        assert_eq!(persisted, b"3");

        stat_loop.stop();
        metrics.record_get();
        thread::sleep(Duration::from_millis(300));
        let persisted = store.get_meta(STAT_GETS).unwrap().unwrap();
        assert_eq!(persisted, b"3", "loop persisted after stop");

        store.shutdown();
    }

    #[test]
    fn test_stop_interrupts_a_long_wait() {
        let dir = tempdir().unwrap();
        let config = quiet_config(dir.path());
        KeyValueStore::create(&config, 1).unwrap();
        let store = KeyValueStore::open(&config).unwrap();

        let mut stat_loop = StatPersistLoop::start(
            store.metadata_shard.handle().clone(),
            Arc::new(StoreMetrics::default()),
            Duration::from_secs(3600),
        )
        .unwrap();
        let start = Instant::now();
        stat_loop.stop();
        assert!(start.elapsed() < Duration::from_secs(5));

        store.shutdown();
    }
}
