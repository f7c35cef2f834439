//! Tunables for the surrogate transport and the byte cache.
//!
//! Both structs deserialize with `#[serde(default)]`, so a config file only needs to
//! name the values it overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default loopback port the surrogate listens on
pub const DEFAULT_SURROGATE_PORT: u16 = 45678;

/// Configuration for bringing up and talking to the surrogate process
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Surrogate executable; the port is appended as the final argument
    pub program: PathBuf,
    /// Arguments placed before the port
    pub args: Vec<String>,
    /// Loopback port the surrogate listens on
    pub port: u16,
    /// Bound on the initial TCP connect
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Deadline for a single "read fully" on the socket
    #[serde(with = "millis")]
    pub read_deadline: Duration,
    /// Sleep between polls while waiting for response bytes
    #[serde(with = "millis")]
    pub read_poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ccapi-surrogate"),
            args: Vec::new(),
            port: DEFAULT_SURROGATE_PORT,
            connect_timeout: Duration::from_secs(10),
            read_deadline: Duration::from_secs(10),
            read_poll_interval: Duration::from_millis(1),
        }
    }
}

impl TransportConfig {
    /// Create a new configuration builder
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }
}

/// Builder for TransportConfig
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
    port: Option<u16>,
    connect_timeout: Option<Duration>,
    read_deadline: Option<Duration>,
    read_poll_interval: Option<Duration>,
}

impl TransportConfigBuilder {
    /// Set the surrogate executable
    pub fn program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Set arguments passed before the port
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Set the loopback port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_deadline(mut self, deadline: Duration) -> Self {
        self.read_deadline = Some(deadline);
        self
    }

    pub fn read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = Some(interval);
        self
    }

    /// Build the configuration
    pub fn build(self) -> TransportConfig {
        let default = TransportConfig::default();
        TransportConfig {
            program: self.program.unwrap_or(default.program),
            args: self.args.unwrap_or(default.args),
            port: self.port.unwrap_or(default.port),
            connect_timeout: self.connect_timeout.unwrap_or(default.connect_timeout),
            read_deadline: self.read_deadline.unwrap_or(default.read_deadline),
            read_poll_interval: self
                .read_poll_interval
                .unwrap_or(default.read_poll_interval),
        }
    }
}

/// Configuration for the byte cache's background refill
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Minimum spacing between two refill passes
    #[serde(with = "millis")]
    pub refill_interval: Duration,
    /// How long a refill pass waits for the busy lock before rescheduling
    #[serde(with = "millis")]
    pub refill_lock_timeout: Duration,
    /// Upper bound on a single chunk read during refill
    pub max_chunk_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refill_interval: Duration::from_millis(200),
            refill_lock_timeout: Duration::from_millis(500),
            max_chunk_size: 0x2000,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

/// Builder for CacheConfig
#[derive(Debug, Clone, Default)]
pub struct CacheConfigBuilder {
    refill_interval: Option<Duration>,
    refill_lock_timeout: Option<Duration>,
    max_chunk_size: Option<u32>,
}

impl CacheConfigBuilder {
    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = Some(interval);
        self
    }

    pub fn refill_lock_timeout(mut self, timeout: Duration) -> Self {
        self.refill_lock_timeout = Some(timeout);
        self
    }

    /// Set the chunk cap; zero is treated as one byte
    pub fn max_chunk_size(mut self, size: u32) -> Self {
        self.max_chunk_size = Some(size.max(1));
        self
    }

    /// Build the configuration
    pub fn build(self) -> CacheConfig {
        let default = CacheConfig::default();
        CacheConfig {
            refill_interval: self.refill_interval.unwrap_or(default.refill_interval),
            refill_lock_timeout: self
                .refill_lock_timeout
                .unwrap_or(default.refill_lock_timeout),
            max_chunk_size: self.max_chunk_size.unwrap_or(default.max_chunk_size),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
