//! Connection capability interface.
//!
//! Every backend (hardware debug protocol, surrogate bridge, local file image) implements
//! [`Connection`]. Higher layers only ever talk to `dyn Connection` and ask for optional
//! capabilities through [`try_get_feature`].

mod ext;
mod features;
mod file;
#[cfg(test)]
pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::{Error, Result};

pub use ext::{ConnectionExt, Primitive};
pub use features::{FeatureSet, ProcessControl, ProcessInfo, try_get_feature};
pub use file::FileConnection;

#[cfg(test)]
pub use mock::{MockConnection, MockConnectionBuilder};

/// Largest chunk size `recommended_read_chunk_size` suggests by default
pub const DEFAULT_MAX_READ_CHUNK: u32 = 0x2000;

/// Smallest chunk size worth a round trip
pub const MIN_READ_CHUNK: u32 = 128;

/// A span of 32-bit console address space.
///
/// `base + length` never exceeds `u32::MAX`, so the full space is represented as
/// `0..u32::MAX` and the very last byte is never addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub base: u32,
    pub length: u32,
}

impl AddressRange {
    pub fn new(base: u32, length: u32) -> Result<Self> {
        if base.checked_add(length).is_none() {
            return Err(Error::AddressOverflow {
                address: base,
                count: length as usize,
            });
        }
        Ok(Self { base, length })
    }

    /// `0..u32::MAX`
    pub const fn full() -> Self {
        Self {
            base: 0,
            length: u32::MAX,
        }
    }

    /// Exclusive end address
    pub fn end(&self) -> u32 {
        self.base + self.length
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.end()
    }

    /// Whether `[address, address + count)` lies entirely inside this range
    pub fn contains_span(&self, address: u32, count: usize) -> bool {
        address >= self.base && address as u64 + count as u64 <= self.end() as u64
    }

    /// Shorten `count` so that a span starting at `address` stays inside the range.
    /// Returns 0 when `address` itself is outside.
    pub fn clamp_length(&self, address: u32, count: usize) -> usize {
        if !self.contains(address) {
            return 0;
        }
        count.min((self.end() - address) as usize)
    }
}

/// The minimal contract every memory backend satisfies.
///
/// Implementations do not arbitrate between callers. Exclusive access is the job of
/// [`crate::BusyLock`]; an [`OperationGuard`] only turns accidental overlap into an error.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Short human-readable backend name
    fn connection_type(&self) -> &'static str;

    fn is_connected(&self) -> bool;

    fn is_little_endian(&self) -> bool;

    fn addressable_range(&self) -> AddressRange;

    /// Preferred size of a single read when `total` bytes are wanted
    fn recommended_read_chunk_size(&self, total: u32) -> u32 {
        total.clamp(MIN_READ_CHUNK, DEFAULT_MAX_READ_CHUNK)
    }

    /// Fill `buffer` from console memory starting at `address`
    async fn read_bytes(&self, address: u32, buffer: &mut [u8]) -> Result<()>;

    async fn write_bytes(&self, address: u32, data: &[u8]) -> Result<()>;

    /// `None` when the backend cannot tell
    async fn is_memory_invalid_or_protected(&self, _address: u32, _count: u32) -> Result<Option<bool>> {
        Ok(None)
    }

    async fn close(&self) -> Result<()>;

    fn features(&self) -> &FeatureSet;
}

/// Rejects overlapping operations on a single connection.
#[derive(Debug, Default)]
pub struct OperationGuard {
    busy: AtomicBool,
}

impl OperationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the connection busy until the returned scope is dropped
    pub fn begin(&self) -> Result<OperationScope<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::ConcurrentOperation)?;
        Ok(OperationScope { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

#[must_use]
pub struct OperationScope<'a> {
    guard: &'a OperationGuard,
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

pub(crate) fn check_span(address: u32, count: usize) -> Result<()> {
    if address as u64 + count as u64 > u32::MAX as u64 + 1 {
        return Err(Error::AddressOverflow { address, count });
    }
    Ok(())
}
