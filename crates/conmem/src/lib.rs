//! # conmem
//!
//! Remote memory access for game consoles.
//!
//! This crate provides:
//! - Memory addresses (static, pointer chains, byte patterns) with static-prefix caching
//! - The `Connection` capability interface and a file-backed implementation
//! - `BusyLock`, the exclusivity arbiter every consumer queues through
//! - A binary RPC transport to a surrogate process hosting the native console library
//! - A read-through byte cache with rate-limited background refills

pub mod address;
pub mod busy;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod rpc;

pub use address::{MemoryAddress, find_pattern, format_pattern, parse_pattern};
pub use busy::{BusyLock, BusyRequest, BusyToken, HeldToken};
pub use cache::{ByteCache, DataReceived, RangeSet};
pub use config::{CacheConfig, CacheConfigBuilder, TransportConfig, TransportConfigBuilder};
pub use connection::{
    AddressRange, Connection, ConnectionExt, FeatureSet, FileConnection, OperationGuard,
    ProcessControl, ProcessInfo, try_get_feature,
};
pub use error::{Error, Result};
pub use rpc::{
    Command, ProcessLauncher, SurrogateConnection, SurrogateLauncher, SurrogateProcess,
    SurrogateSession,
};
