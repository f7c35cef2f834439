//! Read-through byte cache over a busy-locked connection.
//!
//! Consumers read whatever is cached synchronously and queue the gaps with
//! [`ByteCache::request_data_later`]. A rate-limited background pass drains the queued
//! ranges, reads them in bounded chunks under the busy lock and announces the arrivals
//! through [`ByteCache::subscribe`].

mod dispatch;
mod fragmented;
mod ranges;

use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::busy::{BusyLock, BusyRequest, BusyToken};
use crate::config::CacheConfig;
use crate::connection::Connection;
use crate::error::Result;
use dispatch::{Pass, RateLimitedDispatch};

pub use fragmented::FragmentedBuffer;
pub use ranges::RangeSet;

const EVENT_CAPACITY: usize = 256;

/// Bytes that became available in the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataReceived {
    pub offset: u64,
    pub count: u64,
}

#[derive(Default)]
struct CacheData {
    buffer: FragmentedBuffer,
    /// Read from the console
    available: RangeSet,
    /// `available` plus local write-backs
    valid: RangeSet,
}

struct Inner {
    lock: BusyLock,
    config: CacheConfig,
    requested: Mutex<RangeSet>,
    data: Mutex<CacheData>,
    events: broadcast::Sender<DataReceived>,
}

/// Sparse cache of console memory.
///
/// The cache's own locks are independent of the busy lock, so reading cached bytes
/// never waits on connection I/O.
pub struct ByteCache {
    inner: Arc<Inner>,
    refill: RateLimitedDispatch,
}

impl ByteCache {
    /// Cache reads from whatever connection `lock` guards.
    ///
    /// Must be called within a tokio runtime; the refill task lives as long as the cache.
    pub fn new(lock: BusyLock, config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            lock,
            config,
            requested: Mutex::new(RangeSet::new()),
            data: Mutex::new(CacheData::default()),
            events,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let refill = RateLimitedDispatch::spawn(inner.config.refill_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.refill_pass().await,
                    None => Pass::Stop,
                }
            }
        });

        Self { inner, refill }
    }

    pub fn lock(&self) -> &BusyLock {
        &self.inner.lock
    }

    /// Offsets the cache serves; the final byte of the 32-bit space is excluded to match
    /// the hardware backend's addressable range
    pub fn applicable_range(&self) -> Range<u64> {
        applicable_range()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataReceived> {
        self.inner.events.subscribe()
    }

    /// Copy cached bytes starting at `offset`, stopping at the first uncached byte.
    /// Never touches the connection.
    pub fn read_available(&self, offset: u64, buffer: &mut [u8]) -> usize {
        self.inner.read_available(offset, buffer)
    }

    /// Like [`read_available`](Self::read_available), but fetches the missing tail
    /// directly from the connection.
    ///
    /// `held` passes through a token the caller already owns. If the lock cannot be
    /// taken (cancelled) or there is no live connection, the cached part is returned.
    pub async fn read_available_async(
        &self,
        offset: u64,
        buffer: &mut [u8],
        held: Option<&BusyToken>,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        let read = self.read_available(offset, buffer);
        if read == buffer.len() {
            return Ok(read);
        }

        let tail_start = offset + read as u64;
        let tail_len = clamp_to_applicable(tail_start, (buffer.len() - read) as u64);
        if tail_len == 0 {
            return Ok(read);
        }

        let mut request = BusyRequest::new();
        if let Some(cancel) = cancel {
            request = request.cancel(cancel.clone());
        }
        let Some(token) = self.inner.lock.acquire_or_borrow(held, request).await else {
            return Ok(read);
        };
        let Some(connection) = live_connection(&token) else {
            return Ok(read);
        };

        let tail = &mut buffer[read..read + tail_len as usize];
        connection.read_bytes(tail_start as u32, tail).await?;
        self.inner.store(tail_start, tail, Origin::Console);
        Ok(read + tail.len())
    }

    /// Queue `[offset, offset + count)` for the next background pass
    pub fn request_data_later(&self, offset: u64, count: u64) {
        let count = clamp_to_applicable(offset, count);
        if count == 0 {
            return;
        }
        self.inner.requested().insert(offset, count);
        self.refill.invoke();
    }

    /// Forget a range entirely: pending requests, cached bytes and range tracking
    pub fn invalidate_cache(&self, offset: u64, count: u64) {
        let mut requested = self.inner.requested();
        let mut data = self.inner.data();
        requested.remove(offset, count);
        data.buffer.clear(offset, count);
        data.available.remove(offset, count);
        data.valid.remove(offset, count);
    }

    /// Record bytes the caller has just written to the console
    pub fn write_bytes_to_cache(&self, address: u32, bytes: &[u8]) {
        self.inner.store(address as u64, bytes, Origin::WriteBack);
    }

    /// Record bytes the caller read from the console itself
    pub fn store_refreshed(&self, address: u32, bytes: &[u8]) {
        self.inner.store(address as u64, bytes, Origin::Console);
    }

    pub fn available_ranges(&self) -> RangeSet {
        self.inner.data().available.clone()
    }

    pub fn valid_ranges(&self) -> RangeSet {
        self.inner.data().valid.clone()
    }

    pub fn requested_ranges(&self) -> RangeSet {
        self.inner.requested().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Console,
    WriteBack,
}

fn applicable_range() -> Range<u64> {
    0..u32::MAX as u64
}

/// Shorten `count` so the span stays inside the applicable range
fn clamp_to_applicable(offset: u64, count: u64) -> u64 {
    let range = applicable_range();
    if !range.contains(&offset) {
        return 0;
    }
    count.min(range.end - offset)
}

fn live_connection(token: &BusyToken) -> Option<Arc<dyn Connection>> {
    token.connection().filter(|c| c.is_connected())
}

impl Inner {
    fn requested(&self) -> MutexGuard<'_, RangeSet> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn data(&self) -> MutexGuard<'_, CacheData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_available(&self, offset: u64, buffer: &mut [u8]) -> usize {
        let data = self.data();
        let run = data.valid.contiguous_from(offset).min(buffer.len() as u64) as usize;
        data.buffer.read(offset, &mut buffer[..run])
    }

    /// Merge `bytes` at `offset`, clear matching requests and notify
    fn store(&self, offset: u64, bytes: &[u8], origin: Origin) {
        let count = clamp_to_applicable(offset, bytes.len() as u64);
        if count == 0 {
            return;
        }
        let bytes = &bytes[..count as usize];
        {
            let mut requested = self.requested();
            let mut data = self.data();
            requested.remove(offset, count);
            data.buffer.write(offset, bytes);
            data.valid.insert(offset, count);
            if origin == Origin::Console {
                data.available.insert(offset, count);
            }
        }
        self.emit(offset, count);
    }

    fn emit(&self, offset: u64, count: u64) {
        // no subscribers is fine
        let _ = self.events.send(DataReceived { offset, count });
    }

    async fn refill_pass(&self) -> Pass {
        if self.requested().is_empty() {
            return Pass::Done;
        }
        if self.lock.is_busy() {
            debug!("Connection busy, deferring cache refill");
            return Pass::Retry;
        }
        let Some(token) = self
            .lock
            .begin_busy_operation(self.config.refill_lock_timeout)
            .await
        else {
            debug!("Timed out waiting for the busy lock, deferring cache refill");
            return Pass::Retry;
        };
        let Some(connection) = live_connection(&token) else {
            debug!("No live connection for cache refill");
            return Pass::Done;
        };

        let requests = self.requested().take();
        let mut received = Vec::new();
        let mut deferred = RangeSet::new();

        for range in requests.iter() {
            if !deferred.is_empty() || token.is_release_requested() {
                deferred.insert(range.start, range.end - range.start);
                continue;
            }
            let (filled, rest) = self.fetch_range(&*connection, &token, range.clone()).await;
            if filled {
                received.push(range.clone());
            }
            if let Some(rest) = rest {
                deferred.insert(rest.start, rest.end - rest.start);
            }
        }

        for range in &received {
            self.emit(range.start, range.end - range.start);
        }

        if deferred.is_empty() {
            return Pass::Done;
        }
        debug!("Yielding busy lock with {} bytes still queued", deferred.covered());
        self.requested().extend(deferred.iter());
        Pass::Retry
    }

    /// Read one requested range in chunks. Failed chunks are skipped.
    ///
    /// Returns whether any chunk arrived, and the unread remainder if the holder was
    /// asked to release the lock part-way.
    async fn fetch_range(
        &self,
        connection: &dyn Connection,
        token: &BusyToken,
        range: Range<u64>,
    ) -> (bool, Option<Range<u64>>) {
        let total = (range.end - range.start).min(u32::MAX as u64) as u32;
        let chunk = connection
            .recommended_read_chunk_size(total)
            .min(self.config.max_chunk_size)
            .max(1) as u64;

        let mut filled = false;
        let mut cursor = range.start;
        let mut buffer = Vec::new();
        while cursor < range.end {
            if cursor != range.start && token.is_release_requested() {
                return (filled, Some(cursor..range.end));
            }

            let len = chunk.min(range.end - cursor) as usize;
            buffer.resize(len, 0);
            match connection.read_bytes(cursor as u32, &mut buffer).await {
                Ok(()) => {
                    self.store_chunk(cursor, &buffer);
                    filled = true;
                }
                Err(e) => debug!("Cache refill skipped {:#010X}+{:#X}: {}", cursor, len, e),
            }
            cursor += len as u64;
        }
        (filled, None)
    }

    fn store_chunk(&self, offset: u64, bytes: &[u8]) {
        let count = bytes.len() as u64;
        let mut data = self.data();
        data.buffer.write(offset, bytes);
        data.available.insert(offset, count);
        data.valid.insert(offset, count);
    }
}
