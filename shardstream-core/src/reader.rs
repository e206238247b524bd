// shardstream-core/src/reader.rs

//! Streaming sample reader.
//!
//! A `SampleStream` walks one rank's assigned ids in order, pulling shard
//! bytes from the shared cache and decoding samples lazily. An optional
//! background thread fetches upcoming shards ahead of the consumer.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, TryRecvError};
use tracing::{debug, warn};

use crate::cache::{ShardCache, ShardHandle};
use crate::error::{Result, StreamError};
use crate::format::Sample;

/// Shareable flag that stops a stream between samples.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lazy iterator over the samples of one rank's id sequence.
///
/// Yields `Err` for a sample that cannot be read and carries on with the
/// next id. After cancellation it yields a single `Cancelled` error and
/// ends. Dropping the stream stops the prefetch thread from starting new
/// fetches; a fetch already in flight completes and stays in the cache.
pub struct SampleStream {
    cache: Arc<ShardCache>,
    ids: Vec<u64>,
    position: usize,
    current: Option<ShardHandle>,
    /// Handles delivered by the prefetch thread, oldest first.
    ahead: VecDeque<ShardHandle>,
    prefetched: Option<Receiver<ShardHandle>>,
    depth: usize,
    cancel: CancelToken,
    stop: Arc<AtomicBool>,
    finished: bool,
}

impl SampleStream {
    /// Creates a stream over `ids`, prefetching up to `prefetch_depth`
    /// shards ahead. A depth of zero disables prefetching.
    pub fn new(cache: Arc<ShardCache>, ids: Vec<u64>, prefetch_depth: usize) -> Self {
        Self::with_cancel(cache, ids, prefetch_depth, CancelToken::new())
    }

    /// Like `new`, observing an externally owned cancellation token.
    pub fn with_cancel(
        cache: Arc<ShardCache>,
        ids: Vec<u64>,
        prefetch_depth: usize,
        cancel: CancelToken,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let order = shard_order(&cache, &ids);
        debug!(
            samples = ids.len(),
            shards = order.len(),
            prefetch_depth,
            "Starting sample stream"
        );

        let prefetched = if prefetch_depth > 0 && !order.is_empty() {
            spawn_prefetch(cache.clone(), order, prefetch_depth, cancel.clone(), stop.clone())
        } else {
            None
        };

        Self {
            cache,
            ids,
            position: 0,
            current: None,
            ahead: VecDeque::new(),
            prefetched,
            depth: prefetch_depth,
            cancel,
            stop,
            finished: false,
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Number of ids already consumed.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Ids remaining in this stream.
    pub fn remaining(&self) -> usize {
        if self.finished {
            0
        } else {
            self.ids.len() - self.position
        }
    }

    fn read(&mut self, id: u64) -> Result<Sample> {
        let (shard, local) = self.cache.manifest().locate(id)?;
        let handle = self.shard(shard)?;
        let bytes = handle.sample(local)?;
        self.cache.manifest().schema().decode(bytes)
    }

    fn shard(&mut self, shard: usize) -> Result<ShardHandle> {
        if let Some(current) = &self.current {
            if current.shard() == shard {
                return Ok(current.clone());
            }
        }

        self.drain_prefetched();
        let handle = match self.ahead.iter().position(|h| h.shard() == shard) {
            Some(i) => self.ahead.remove(i),
            None => None,
        };
        let handle = match handle {
            Some(handle) => handle,
            None => self.cache.acquire(shard)?,
        };
        self.current = Some(handle.clone());
        Ok(handle)
    }

    fn drain_prefetched(&mut self) {
        let Some(rx) = &self.prefetched else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(handle) => {
                    self.ahead.push_back(handle);
                    if self.ahead.len() > self.depth {
                        self.ahead.pop_front();
                    }
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.prefetched = None;
                    return;
                }
            }
        }
    }
}

impl Iterator for SampleStream {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.position >= self.ids.len() {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finished = true;
            self.stop.store(true, Ordering::Relaxed);
            return Some(Err(StreamError::Cancelled));
        }

        let id = self.ids[self.position];
        self.position += 1;
        Some(self.read(id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (0, Some(remaining + usize::from(remaining > 0)))
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Distinct shards of `ids` in order of first use.
fn shard_order(cache: &ShardCache, ids: &[u64]) -> Vec<usize> {
    let manifest = cache.manifest();
    let mut seen = HashSet::new();
    ids.iter()
        .filter_map(|id| manifest.locate(*id).ok().map(|(shard, _)| shard))
        .filter(|shard| seen.insert(*shard))
        .collect()
}

fn spawn_prefetch(
    cache: Arc<ShardCache>,
    order: Vec<usize>,
    depth: usize,
    cancel: CancelToken,
    stop: Arc<AtomicBool>,
) -> Option<Receiver<ShardHandle>> {
    let (tx, rx) = channel::bounded(depth);

    let spawned = thread::Builder::new()
        .name("shardstream-prefetch".to_string())
        .spawn(move || {
            for shard in order {
                if stop.load(Ordering::Relaxed) || cancel.is_cancelled() {
                    break;
                }
                match cache.acquire(shard) {
                    Ok(handle) => {
                        // blocks while `depth` shards are waiting to be consumed
                        if tx.send(handle).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(shard, error = %e, "Prefetch failed"),
                }
            }
        });

    match spawned {
        Ok(_) => Some(rx),
        Err(e) => {
            warn!(error = %e, "Failed to start prefetch thread, reading without prefetch");
            None
        }
    }
}
