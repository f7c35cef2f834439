//! In-memory connection for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{AddressRange, Connection, FeatureSet};
use crate::error::{Error, Result};

/// Mapped regions of fake console memory; anything outside them fails to read.
pub struct MockConnection {
    regions: Mutex<Vec<(u32, Vec<u8>)>>,
    failing: Vec<(u32, u32)>,
    little_endian: bool,
    read_delay: Option<Duration>,
    range: AddressRange,
    connected: AtomicBool,
    reads: Mutex<Vec<(u32, usize)>>,
    read_count: AtomicUsize,
    features: FeatureSet,
}

impl MockConnection {
    /// Number of `read_bytes` calls so far, including failed ones
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    /// `(address, length)` of every read so far
    pub fn read_log(&self) -> Vec<(u32, usize)> {
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_reads(&self) {
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.read_count.store(0, Ordering::SeqCst);
    }

    /// Overwrite bytes directly, bypassing the read log
    pub fn poke(&self, address: u32, data: &[u8]) {
        let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slice) = find_span_mut(&mut regions, address, data.len()) {
            slice.copy_from_slice(data);
        }
    }

    fn is_failing(&self, address: u32, count: usize) -> bool {
        let end = address as u64 + count as u64;
        self.failing
            .iter()
            .any(|&(base, len)| (address as u64) < base as u64 + len as u64 && end > base as u64)
    }
}

fn find_span_mut(regions: &mut [(u32, Vec<u8>)], address: u32, count: usize) -> Option<&mut [u8]> {
    regions.iter_mut().find_map(|(base, data)| {
        let start = address.checked_sub(*base)? as usize;
        let end = start.checked_add(count)?;
        data.get_mut(start..end)
    })
}

#[async_trait]
impl Connection for MockConnection {
    fn connection_type(&self) -> &'static str {
        "Mock"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    fn addressable_range(&self) -> AddressRange {
        self.range
    }

    async fn read_bytes(&self, address: u32, buffer: &mut [u8]) -> Result<()> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((address, buffer.len()));

        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }

        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        if self.is_failing(address, buffer.len()) {
            return Err(Error::MemoryReadFailed {
                address,
                count: buffer.len(),
                message: "injected failure".to_string(),
            });
        }

        let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        match find_span_mut(&mut regions, address, buffer.len()) {
            Some(slice) => {
                buffer.copy_from_slice(slice);
                Ok(())
            }
            None => Err(Error::MemoryReadFailed {
                address,
                count: buffer.len(),
                message: "unmapped".to_string(),
            }),
        }
    }

    async fn write_bytes(&self, address: u32, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        match find_span_mut(&mut regions, address, data.len()) {
            Some(slice) => {
                slice.copy_from_slice(data);
                Ok(())
            }
            None => Err(Error::MemoryWriteFailed {
                address,
                count: data.len(),
                message: "unmapped".to_string(),
            }),
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn features(&self) -> &FeatureSet {
        &self.features
    }
}

/// Builder for MockConnection
#[derive(Default)]
pub struct MockConnectionBuilder {
    regions: Vec<(u32, Vec<u8>)>,
    words: Vec<(u32, u32)>,
    failing: Vec<(u32, u32)>,
    big_endian: bool,
    read_delay: Option<Duration>,
    range: Option<AddressRange>,
}

impl MockConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    /// Map `data` at `address`
    pub fn with_bytes(mut self, address: u32, data: &[u8]) -> Self {
        self.regions.push((address, data.to_vec()));
        self
    }

    pub fn with_zeroes(mut self, address: u32, count: usize) -> Self {
        self.regions.push((address, vec![0u8; count]));
        self
    }

    /// Map a 4-byte pointer value, encoded with the final endianness
    pub fn with_u32(mut self, address: u32, value: u32) -> Self {
        self.words.push((address, value));
        self
    }

    /// Reads overlapping `[address, address + count)` fail
    pub fn fail_at(mut self, address: u32, count: u32) -> Self {
        self.failing.push((address, count));
        self
    }

    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn addressable(mut self, range: AddressRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn build(self) -> MockConnection {
        let little_endian = !self.big_endian;
        let mut regions = self.regions;
        for (address, value) in self.words {
            let raw = if little_endian {
                value.to_le_bytes()
            } else {
                value.to_be_bytes()
            };
            regions.push((address, raw.to_vec()));
        }

        MockConnection {
            regions: Mutex::new(regions),
            failing: self.failing,
            little_endian,
            read_delay: self.read_delay,
            range: self.range.unwrap_or(AddressRange::full()),
            connected: AtomicBool::new(true),
            reads: Mutex::new(Vec::new()),
            read_count: AtomicUsize::new(0),
            features: FeatureSet::new(),
        }
    }
}
