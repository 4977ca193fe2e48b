//! Host-local view of a streaming source
//!
//! Host `i` of `N` owns the records at stream positions `k` with
//! `k mod N == i`. With `W` prefetch workers, worker `w` owns the host
//! positions whose host-local ordinal `k div N` satisfies
//! `(k div N) mod W == w`. Reading the workers round-robin therefore yields
//! the host shard in upstream order.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::distributed::HostAssignment;
use crate::error::{Error, Result};
use crate::source::{Record, RecordSource, ShuffledStream};

#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub num_threads: usize,
    pub prefetch_buffer_size: usize,
    pub drop_remainder: bool,
    /// `(seed, buffer_size)` for a seeded shuffle ahead of the partition
    pub shuffle: Option<(u64, usize)>,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            num_threads: 1,
            prefetch_buffer_size: 128,
            drop_remainder: false,
            shuffle: None,
        }
    }
}

/// Sub-shard keyed by `(host_index, host_count, worker_index, worker_count)`.
#[derive(Debug, Clone, Copy)]
pub struct WorkerShard {
    pub host: HostAssignment,
    pub worker_index: usize,
    pub worker_count: usize,
}

impl WorkerShard {
    pub fn owns(&self, position: usize) -> bool {
        self.host.owns(position)
            && (position / self.host.host_count) % self.worker_count == self.worker_index
    }
}

pub type Transform<T> = Arc<dyn Fn(Record) -> Result<T> + Send + Sync>;

pub struct ShardedSource {
    source: Arc<dyn RecordSource>,
    host: HostAssignment,
    options: ShardOptions,
}

impl ShardedSource {
    pub fn new(source: Arc<dyn RecordSource>, host: HostAssignment, options: ShardOptions) -> Self {
        if options.drop_remainder && source.len_hint().is_none() {
            warn!(
                "Host {}: source length unknown, drop_remainder disabled",
                host.host_index
            );
        }
        Self {
            source,
            host,
            options,
        }
    }

    pub fn host(&self) -> HostAssignment {
        self.host
    }

    /// Record count of the underlying stream, `None` when unbounded or
    /// unknown. Only informational: streams cannot be indexed.
    pub fn length(&self) -> Option<usize> {
        self.source.len_hint()
    }

    /// Number of stream positions handed out to hosts at all.
    fn assigned_limit(&self) -> Option<usize> {
        if !self.options.drop_remainder {
            return None;
        }
        let len = self.length()?;
        Some(len / self.host.host_count * self.host.host_count)
    }

    /// Records this host receives per epoch, if known.
    pub fn host_length(&self) -> Option<usize> {
        let len = self.assigned_limit().or(self.length())?;
        let HostAssignment {
            host_index,
            host_count,
        } = self.host;
        Some(len / host_count + usize::from(host_index < len % host_count))
    }

    /// Start prefetch workers for `epoch` and return the host-local stream
    /// with `transform` applied to each record.
    ///
    /// Every worker opens and decodes the full source stream (and shuffles
    /// it, when enabled) and skips positions outside its sub-shard, so read
    /// and parse cost grows with `num_threads`. Only `transform` runs in
    /// parallel.
    pub fn iterate<T: Send + 'static>(&self, epoch: u64, transform: Transform<T>) -> ShardIter<T> {
        let worker_count = self.options.num_threads.max(1);
        let capacity = (self.options.prefetch_buffer_size / worker_count).max(1);
        let limit = self.assigned_limit();
        let stop = Arc::new(AtomicBool::new(false));
        let shuffle = self
            .options
            .shuffle
            .map(|(seed, size)| (seed.wrapping_add(epoch), size));

        let mut receivers = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let (tx, rx) = bounded(capacity);
            let worker = Worker {
                source: Arc::clone(&self.source),
                shard: WorkerShard {
                    host: self.host,
                    worker_index,
                    worker_count,
                },
                limit,
                shuffle,
                transform: Arc::clone(&transform),
                stop: Arc::clone(&stop),
                tx,
            };
            let spawned = thread::Builder::new()
                .name(format!(
                    "hermes-prefetch-{}-{}",
                    self.host.host_index, worker_index
                ))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => {
                    receivers.push(rx);
                    handles.push(handle);
                }
                Err(e) => {
                    let mut iter = ShardIter::new(receivers, handles, stop);
                    iter.failed = Some(Error::Io(e));
                    return iter;
                }
            }
        }

        ShardIter::new(receivers, handles, stop)
    }
}

struct Worker<T> {
    source: Arc<dyn RecordSource>,
    shard: WorkerShard,
    limit: Option<usize>,
    shuffle: Option<(u64, usize)>,
    transform: Transform<T>,
    stop: Arc<AtomicBool>,
    tx: Sender<Result<T>>,
}

impl<T> Worker<T> {
    fn run(self) {
        let WorkerShard {
            host, worker_index, ..
        } = self.shard;
        let mut stream = match self.source.open() {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.tx.send(Err(e));
                return;
            }
        };
        if let Some((seed, size)) = self.shuffle {
            stream = Box::new(ShuffledStream::new(stream, size, seed));
        }

        let mut scanned = 0usize;
        let mut routed = 0usize;
        for (position, record) in stream.enumerate() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if self.limit.is_some_and(|limit| position >= limit) {
                break;
            }
            scanned += 1;
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    let _ = self.tx.send(Err(e));
                    return;
                }
            };
            if !self.shard.owns(position) {
                continue;
            }
            let item = (self.transform)(record);
            let failed = item.is_err();
            if self.tx.send(item).is_err() || failed {
                // Receiver gone, or the error has been handed over
                return;
            }
            routed += 1;
        }
        debug!(
            "Host {} worker {}: scanned {} records, routed {}",
            host.host_index, worker_index, scanned, routed
        );
    }
}

/// Host-local record stream fed by prefetch workers.
///
/// Dropping it stops the workers and waits for them.
pub struct ShardIter<T> {
    receivers: Vec<Receiver<Result<T>>>,
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    next_worker: usize,
    failed: Option<Error>,
    done: bool,
    received: Arc<AtomicUsize>,
}

impl<T> ShardIter<T> {
    fn new(
        receivers: Vec<Receiver<Result<T>>>,
        handles: Vec<JoinHandle<()>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            receivers,
            handles,
            stop,
            next_worker: 0,
            failed: None,
            done: false,
            received: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of records delivered so far; stays readable after the
    /// iterator moves into later stages.
    pub fn received_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.received)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        self.receivers.clear();
        let mut panicked = None;
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("prefetch").to_string();
            if handle.join().is_err() {
                panicked = Some(name);
            }
        }
        match panicked {
            Some(name) => Err(Error::WorkerPanicked(name)),
            None => Ok(()),
        }
    }
}

impl<T> Iterator for ShardIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(e) = self.failed.take() {
            self.done = true;
            let _ = self.shutdown();
            return Some(Err(e));
        }

        match self.receivers[self.next_worker].recv() {
            Ok(Ok(item)) => {
                self.next_worker = (self.next_worker + 1) % self.receivers.len();
                self.received.fetch_add(1, Ordering::Relaxed);
                Some(Ok(item))
            }
            Ok(Err(e)) => {
                self.done = true;
                let _ = self.shutdown();
                Some(Err(e))
            }
            Err(_) => {
                // A finished worker means every later host position is gone too
                self.done = true;
                self.shutdown().err().map(Err)
            }
        }
    }
}

impl<T> Drop for ShardIter<T> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
