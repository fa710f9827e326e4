//! Shard store actors
//!
//! Every shard, data and metadata alike, is one OS thread that owns its
//! [`SliceBtree`] outright. Callers reach it through a cloneable
//! [`ShardHandle`] whose commands carry their own reply channels; the
//! mailbox is the only synchronization point, so nothing in the engine
//! ever takes a lock.
//!
//! The actor checks every incoming token out of its order sink before
//! touching the engine, then mints a fresh substore token for the
//! engine call. Locally-originated mutations get their cast time from
//! the shard's timestamper; relayed ones arrive with it attached.

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded, unbounded};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

use slicekv_common::{
    CacheConfig, CastTime, Error, GetResult, Mutation, MutationResult, OrderSink, OrderSource,
    OrderToken, ReplTimestamp, ReplicationMetadata, Result, StoreKey,
};
use slicekv_engine::{ProxySerializer, SliceBtree};

/// Entries buffered per shard during a range scan before the scanning
/// actor blocks on the consumer.
const RANGE_STREAM_BUFFER: usize = 16;

/// How long a blocked scan send waits before rechecking the stop flag.
const RANGE_STREAM_POLL: Duration = Duration::from_millis(25);

/// Observer invoked on the shard's thread after a mutation lands.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, shard: u32, mutation: &Mutation, cast_time: CastTime);
}

enum ShardCommand {
    Get {
        key: StoreKey,
        token: OrderToken,
        reply: Sender<Result<Option<GetResult>>>,
    },
    Rget {
        left: Bound<StoreKey>,
        right: Bound<StoreKey>,
        token: OrderToken,
        stream: Sender<(StoreKey, Vec<u8>)>,
        reply: Sender<Result<()>>,
    },
    Change {
        mutation: Mutation,
        cast_time: Option<CastTime>,
        token: OrderToken,
        reply: Sender<Result<MutationResult>>,
    },
    ReplicationMetadata {
        reply: Sender<ReplicationMetadata>,
    },
    SetReplicationClock {
        clock: ReplTimestamp,
        reply: Sender<Result<()>>,
    },
    SetLastSync {
        last_sync: ReplTimestamp,
        reply: Sender<Result<()>>,
    },
    SetMasterId {
        master_id: u32,
        reply: Sender<Result<()>>,
    },
    SetSlaveId {
        slave_id: u32,
        reply: Sender<Result<()>>,
    },
    SetTimestamp {
        timestamp: ReplTimestamp,
        reply: Sender<()>,
    },
    DeleteAllKeys {
        reply: Sender<Result<()>>,
    },
    AddListener {
        listener: Arc<dyn ChangeListener>,
        reply: Sender<()>,
    },
    Shutdown,
}

/// Stamps locally-originated mutations. Within one wall-clock second
/// the CAS proposal carries a serial in its low bits; `set_timestamp`
/// raises the floor so stamps never fall below the replication clock
/// the shard was handed at open.
struct Timestamper {
    current: ReplTimestamp,
    seq: u32,
}

impl Timestamper {
    fn new() -> Self {
        Self {
            current: ReplTimestamp::ZERO,
            seq: 0,
        }
    }

    fn assign(&mut self) -> CastTime {
        let now = ReplTimestamp::now();
        if now > self.current {
            self.current = now;
            self.seq = 0;
        } else {
            self.seq += 1;
        }
        CastTime {
            timestamp: self.current,
            proposed_cas: (u64::from(self.current.0) << 32) | u64::from(self.seq),
        }
    }

    fn set_timestamp(&mut self, floor: ReplTimestamp) {
        if floor > self.current {
            self.current = floor;
            self.seq = 0;
        }
    }
}

#[derive(Default)]
struct Dispatcher {
    listeners: Vec<Arc<dyn ChangeListener>>,
}

impl Dispatcher {
    fn add(&mut self, listener: Arc<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    fn dispatch(&self, shard: u32, mutation: &Mutation, cast_time: CastTime) {
        for listener in &self.listeners {
            listener.on_change(shard, mutation, cast_time);
        }
    }
}

struct ShardActor {
    index: u32,
    engine: SliceBtree,
    sink: OrderSink,
    substore_source: OrderSource,
    timestamper: Timestamper,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
}

impl ShardActor {
    fn run(mut self, mailbox: &Receiver<ShardCommand>) {
        debug!(shard = self.index, "shard actor running");
        while let Ok(command) = mailbox.recv() {
            match command {
                ShardCommand::Get { key, token, reply } => {
                    let _ = reply.send(self.get(&key, token));
                }
                ShardCommand::Rget {
                    left,
                    right,
                    token,
                    stream,
                    reply,
                } => {
                    self.sink.check_out(token);
                    let scan_token = self.substore_source.check_in().with_read_mode();
                    // admission is acknowledged before the scan so the
                    // caller can start merging while entries stream out
                    let _ = reply.send(Ok(()));
                    let stop = &self.stop;
                    self.engine.scan_range(&left, &right, scan_token, |key, entry| {
                        let mut item = (key.clone(), entry.data.clone());
                        // block for the consumer, but never across a
                        // stop request
                        loop {
                            match stream.send_timeout(item, RANGE_STREAM_POLL) {
                                Ok(()) => break true,
                                Err(SendTimeoutError::Disconnected(_)) => break false,
                                Err(SendTimeoutError::Timeout(back)) => {
                                    if stop.load(Ordering::Relaxed) {
                                        break false;
                                    }
                                    item = back;
                                }
                            }
                        }
                    });
                }
                ShardCommand::Change {
                    mutation,
                    cast_time,
                    token,
                    reply,
                } => {
                    let _ = reply.send(self.change(mutation, cast_time, token));
                }
                ShardCommand::ReplicationMetadata { reply } => {
                    let _ = reply.send(self.engine.replication_metadata());
                }
                ShardCommand::SetReplicationClock { clock, reply } => {
                    let _ = reply.send(self.engine.set_replication_clock(clock));
                }
                ShardCommand::SetLastSync { last_sync, reply } => {
                    let _ = reply.send(self.engine.set_last_sync(last_sync));
                }
                ShardCommand::SetMasterId { master_id, reply } => {
                    let _ = reply.send(self.engine.set_master_id(master_id));
                }
                ShardCommand::SetSlaveId { slave_id, reply } => {
                    let _ = reply.send(self.engine.set_slave_id(slave_id));
                }
                ShardCommand::SetTimestamp { timestamp, reply } => {
                    self.timestamper.set_timestamp(timestamp);
                    let _ = reply.send(());
                }
                ShardCommand::DeleteAllKeys { reply } => {
                    let _ = reply.send(self.engine.delete_all_keys());
                }
                ShardCommand::AddListener { listener, reply } => {
                    self.dispatcher.add(listener);
                    let _ = reply.send(());
                }
                ShardCommand::Shutdown => break,
            }
        }
        if let Err(e) = self.engine.flush() {
            error!(shard = self.index, error = %e, "final flush failed");
        }
        debug!(shard = self.index, "shard actor stopped");
    }

    fn get(&mut self, key: &StoreKey, token: OrderToken) -> Result<Option<GetResult>> {
        self.sink.check_out(token);
        let read_token = self.substore_source.check_in().with_read_mode();
        Ok(self.engine.get(key, read_token))
    }

    fn change(
        &mut self,
        mutation: Mutation,
        cast_time: Option<CastTime>,
        token: OrderToken,
    ) -> Result<MutationResult> {
        self.sink.check_out(token);
        let write_token = self.substore_source.check_in();
        // relayed mutations keep the cast time they arrived with
        let cast_time = cast_time.unwrap_or_else(|| self.timestamper.assign());
        let result = self.engine.apply(&mutation, cast_time, write_token)?;
        if result.is_success() {
            self.dispatcher.dispatch(self.index, &mutation, cast_time);
        }
        Ok(result)
    }
}

/// One shard's half of a range scan. Entries arrive in key order; the
/// stream ends when the shard has covered its range. Dropping it mid
/// range tells the shard to stop scanning.
pub struct RangeStream {
    receiver: Receiver<(StoreKey, Vec<u8>)>,
}

impl RangeStream {
    pub(crate) fn new(receiver: Receiver<(StoreKey, Vec<u8>)>) -> Self {
        Self { receiver }
    }
}

impl Iterator for RangeStream {
    type Item = (StoreKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

/// Cheap cloneable reference to a shard actor.
#[derive(Clone)]
pub struct ShardHandle {
    index: u32,
    sender: Sender<ShardCommand>,
}

impl ShardHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    fn call<T>(&self, build: impl FnOnce(Sender<T>) -> ShardCommand) -> Result<T> {
        let (reply_tx, reply_rx) = bounded(1);
        self.sender
            .send(build(reply_tx))
            .map_err(|_| Error::ShardStopped)?;
        reply_rx.recv().map_err(|_| Error::ShardStopped)
    }

    pub fn get(&self, key: StoreKey, token: OrderToken) -> Result<Option<GetResult>> {
        self.call(|reply| ShardCommand::Get { key, token, reply })?
    }

    /// Starts a range scan. Returns once the shard has admitted the
    /// scan; entries follow on the stream.
    pub fn rget(
        &self,
        left: Bound<StoreKey>,
        right: Bound<StoreKey>,
        token: OrderToken,
    ) -> Result<RangeStream> {
        let (stream_tx, stream_rx) = bounded(RANGE_STREAM_BUFFER);
        self.call(|reply| ShardCommand::Rget {
            left,
            right,
            token,
            stream: stream_tx,
            reply,
        })??;
        Ok(RangeStream::new(stream_rx))
    }

    /// Applies a mutation, stamping it with this shard's timestamper.
    pub fn change(&self, mutation: Mutation, token: OrderToken) -> Result<MutationResult> {
        self.call(|reply| ShardCommand::Change {
            mutation,
            cast_time: None,
            token,
            reply,
        })?
    }

    /// Applies a relayed mutation under its original cast time.
    pub fn change_with_cast_time(
        &self,
        mutation: Mutation,
        cast_time: CastTime,
        token: OrderToken,
    ) -> Result<MutationResult> {
        self.call(|reply| ShardCommand::Change {
            mutation,
            cast_time: Some(cast_time),
            token,
            reply,
        })?
    }

    pub fn replication_metadata(&self) -> Result<ReplicationMetadata> {
        self.call(|reply| ShardCommand::ReplicationMetadata { reply })
    }

    pub fn set_replication_clock(&self, clock: ReplTimestamp) -> Result<()> {
        self.call(|reply| ShardCommand::SetReplicationClock { clock, reply })?
    }

    pub fn set_last_sync(&self, last_sync: ReplTimestamp) -> Result<()> {
        self.call(|reply| ShardCommand::SetLastSync { last_sync, reply })?
    }

    pub fn set_master_id(&self, master_id: u32) -> Result<()> {
        self.call(|reply| ShardCommand::SetMasterId { master_id, reply })?
    }

    pub fn set_slave_id(&self, slave_id: u32) -> Result<()> {
        self.call(|reply| ShardCommand::SetSlaveId { slave_id, reply })?
    }

    /// Raises the shard's timestamper floor.
    pub fn set_timestamp(&self, timestamp: ReplTimestamp) -> Result<()> {
        self.call(|reply| ShardCommand::SetTimestamp { timestamp, reply })
    }

    pub fn delete_all_keys(&self) -> Result<()> {
        self.call(|reply| ShardCommand::DeleteAllKeys { reply })?
    }

    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> Result<()> {
        self.call(|reply| ShardCommand::AddListener { listener, reply })
    }
}

/// Owns one shard actor thread. Dropping it stops the actor and waits
/// for its final flush.
pub struct ShardStore {
    handle: ShardHandle,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ShardStore {
    /// Spawns the shard's home thread. The engine loads there, not on
    /// the caller; the returned channel reports when the shard is
    /// serving, or why it could not.
    pub fn spawn(
        index: u32,
        proxy: ProxySerializer,
        cache_config: CacheConfig,
    ) -> Result<(Self, Receiver<Result<()>>)> {
        let (command_tx, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let actor_stop = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("slicekv-shard-{index}"))
            .spawn(move || {
                let engine = match SliceBtree::load(proxy, cache_config) {
                    Ok(engine) => engine,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let actor = ShardActor {
                    index,
                    engine,
                    sink: OrderSink::new(),
                    substore_source: OrderSource::new(index),
                    timestamper: Timestamper::new(),
                    dispatcher: Dispatcher::default(),
                    stop: actor_stop,
                };
                actor.run(&command_rx);
            })?;
        let handle = ShardHandle {
            index,
            sender: command_tx,
        };
        Ok((
            Self {
                handle,
                stop,
                thread: Some(thread),
            },
            ready_rx,
        ))
    }

    pub fn handle(&self) -> &ShardHandle {
        &self.handle
    }

    /// Asks the actor to flush and exit without waiting for it. A scan
    /// blocked on its stream is cut short rather than waited out.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.handle.sender.send(ShardCommand::Shutdown);
    }

    /// Waits for the actor thread to finish.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(shard = self.handle.index, "shard thread panicked");
            }
        }
    }
}

impl Drop for ShardStore {
    fn drop(&mut self) {
        self.request_stop();
        self.join();
    }
}
