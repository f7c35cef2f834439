//! Memory addresses that resolve against a live connection.
//!
//! A [`MemoryAddress`] is either a fixed value, a pointer chain walked from a base
//! address, or a byte pattern whose match feeds the same chain walk. Chains may declare a
//! "static" prefix whose intermediate result is cached until explicitly invalidated, so
//! hot-path polling only re-walks the offsets that actually move.
//!
//! ## Example
//!
//! ```ignore
//! let address: MemoryAddress = "82600000->20->5C".parse()?;
//! if let Some(resolved) = address.resolve(&*connection, false).await {
//!     let health = connection.read_u32(resolved).await?;
//! }
//! ```

mod parse;
mod pattern;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::connection::{Connection, ConnectionExt};
use crate::error::{Error, Result};

pub use pattern::{find_in_slice, find_pattern, format_pattern, parse_pattern};

/// How to compute a final console address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryAddress {
    Static(u32),
    Dynamic(DynamicAddress),
    Pattern(PatternAddress),
}

impl MemoryAddress {
    pub fn fixed(address: u32) -> Self {
        MemoryAddress::Static(address)
    }

    pub fn dynamic(base: u32, offsets: Vec<i32>, static_offset_count: u32) -> Result<Self> {
        let chain = OffsetChain::new(offsets, static_offset_count, false)?;
        Ok(MemoryAddress::Dynamic(DynamicAddress { base, chain }))
    }

    pub fn pattern(
        pattern: Vec<Option<u8>>,
        offsets: Vec<i32>,
        cache_result: bool,
        static_offset_count: u32,
    ) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::InvalidAddress("Byte pattern is empty".to_string()));
        }
        let chain = OffsetChain::new(offsets, static_offset_count, true)?;
        Ok(MemoryAddress::Pattern(PatternAddress {
            pattern,
            cache_result,
            chain,
            found: CachedValue::default(),
        }))
    }

    /// Compute the final address.
    ///
    /// Returns `None` when a pointer along the way cannot be read or is null. I/O errors
    /// are not propagated; the caller decides how to show an unresolved address.
    pub async fn resolve<C: Connection + ?Sized>(
        &self,
        connection: &C,
        invalidate_cache: bool,
    ) -> Option<u32> {
        match self {
            MemoryAddress::Static(address) => Some(*address),
            MemoryAddress::Dynamic(dynamic) => {
                dynamic
                    .chain
                    .resolve_from(connection, dynamic.base, invalidate_cache)
                    .await
            }
            MemoryAddress::Pattern(pattern) => pattern.resolve(connection, invalidate_cache).await,
        }
    }

    /// Drop any cached intermediate results
    pub fn invalidate(&self) {
        match self {
            MemoryAddress::Static(_) => {}
            MemoryAddress::Dynamic(dynamic) => dynamic.chain.static_base.clear(),
            MemoryAddress::Pattern(pattern) => {
                pattern.found.clear();
                pattern.chain.static_base.clear();
            }
        }
    }

    pub fn is_static(&self) -> bool {
        matches!(self, MemoryAddress::Static(_))
    }
}

impl From<u32> for MemoryAddress {
    fn from(address: u32) -> Self {
        MemoryAddress::Static(address)
    }
}

/// A pointer chain walked from a fixed base address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynamicAddress {
    base: u32,
    chain: OffsetChain,
}

impl DynamicAddress {
    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn offsets(&self) -> &[i32] {
        &self.chain.offsets
    }

    pub fn static_offset_count(&self) -> u32 {
        self.chain.static_count
    }

    /// The cached static-prefix address, if one has been resolved
    pub fn resolved_static_base(&self) -> Option<u32> {
        self.chain.static_base.get()
    }
}

/// A pointer chain walked from the first match of a byte pattern
#[derive(Debug, Clone)]
pub struct PatternAddress {
    pattern: Vec<Option<u8>>,
    cache_result: bool,
    chain: OffsetChain,
    found: CachedValue,
}

impl PatternAddress {
    pub fn pattern(&self) -> &[Option<u8>] {
        &self.pattern
    }

    pub fn offsets(&self) -> &[i32] {
        &self.chain.offsets
    }

    pub fn cache_result(&self) -> bool {
        self.cache_result
    }

    pub fn static_offset_count(&self) -> u32 {
        self.chain.static_count
    }

    async fn resolve<C: Connection + ?Sized>(&self, connection: &C, invalidate: bool) -> Option<u32> {
        if invalidate {
            self.found.clear();
        }

        let found = match self.found.get() {
            Some(found) => found,
            None => {
                let range = connection.addressable_range();
                let chunk = connection.recommended_read_chunk_size(range.length) as usize;
                let found = match find_pattern(connection, range, &self.pattern, chunk).await {
                    Ok(found) => found?,
                    Err(e) => {
                        debug!("Pattern scan failed: {}", e);
                        return None;
                    }
                };
                if self.cache_result {
                    self.found.set(found);
                }
                found
            }
        };

        if self.chain.offsets.is_empty() {
            return Some(found);
        }
        self.chain.resolve_from(connection, found, invalidate).await
    }
}

/// Compares the location only; `cache_result` is resolution policy
impl PartialEq for PatternAddress {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.chain == other.chain
    }
}

impl Eq for PatternAddress {}

impl Hash for PatternAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
        self.chain.hash(state);
    }
}

/// Offsets plus the cached result of walking the static prefix
#[derive(Debug, Clone)]
struct OffsetChain {
    offsets: Vec<i32>,
    static_count: u32,
    static_base: CachedValue,
}

impl OffsetChain {
    fn new(offsets: Vec<i32>, static_count: u32, allow_empty: bool) -> Result<Self> {
        if offsets.is_empty() && !allow_empty {
            return Err(Error::InvalidAddress(
                "Pointer chain needs at least one offset".to_string(),
            ));
        }
        if static_count as usize > offsets.len() {
            return Err(Error::InvalidAddress(format!(
                "Static offset count {} exceeds {} offsets",
                static_count,
                offsets.len()
            )));
        }
        Ok(Self {
            offsets,
            static_count,
            static_base: CachedValue::default(),
        })
    }

    async fn resolve_from<C: Connection + ?Sized>(
        &self,
        connection: &C,
        base: u32,
        invalidate: bool,
    ) -> Option<u32> {
        if invalidate {
            self.static_base.clear();
        }

        let split = self.static_count as usize;
        if split == 0 {
            return walk_chain(connection, base, &self.offsets).await;
        }

        let prefix = match self.static_base.get() {
            Some(prefix) => prefix,
            None => {
                let prefix = walk_chain(connection, base, &self.offsets[..split]).await?;
                self.static_base.set(prefix);
                prefix
            }
        };

        let rest = &self.offsets[split..];
        if rest.is_empty() {
            return Some(prefix);
        }
        let next = read_pointer(connection, prefix).await?;
        walk_chain(connection, next, rest).await
    }
}

impl PartialEq for OffsetChain {
    fn eq(&self, other: &Self) -> bool {
        self.offsets == other.offsets && self.static_count == other.static_count
    }
}

impl Eq for OffsetChain {}

impl Hash for OffsetChain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.offsets.hash(state);
        self.static_count.hash(state);
    }
}

/// Read a pointer at each `address + offset` except the last, then add the last offset
async fn walk_chain<C: Connection + ?Sized>(
    connection: &C,
    start: u32,
    offsets: &[i32],
) -> Option<u32> {
    let (last, walk) = offsets.split_last()?;
    let mut address = start;
    for offset in walk {
        address = read_pointer(connection, address.wrapping_add_signed(*offset)).await?;
    }
    Some(address.wrapping_add_signed(*last))
}

async fn read_pointer<C: Connection + ?Sized>(connection: &C, address: u32) -> Option<u32> {
    match connection.read_u32(address).await {
        Ok(0) => {
            debug!("Null pointer at {:#010X}", address);
            None
        }
        Ok(pointer) => Some(pointer),
        Err(e) => {
            debug!("Pointer read at {:#010X} failed: {}", address, e);
            None
        }
    }
}

#[derive(Default)]
struct CachedValue(Mutex<Option<u32>>);

impl CachedValue {
    fn get(&self) -> Option<u32> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, value: u32) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    fn clear(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Clone for CachedValue {
    fn clone(&self) -> Self {
        Self(Mutex::new(self.get()))
    }
}

impl fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => write!(f, "Some({:#010X})", value),
            None => f.write_str("None"),
        }
    }
}
