//! `conmem.toml` handling.
//!
//! ```toml
//! console = "192.168.1.20"
//!
//! [transport]
//! program = "ccapi-surrogate.exe"
//! port = 45678
//! connect_timeout = 10000
//!
//! [cache]
//! refill_interval = 200
//! max_chunk_size = 8192
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use conmem::{CacheConfig, TransportConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Console IP used when `--console` is not given
    pub console: Option<String>,
    pub transport: TransportConfig,
    pub cache: CacheConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "console = \"10.0.0.5\"\n[transport]\nport = 50000").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.console.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.transport.port, 50000);
        assert_eq!(config.transport.read_deadline, Duration::from_secs(10));
        assert_eq!(config.cache.max_chunk_size, 0x2000);
    }

    #[test]
    fn test_durations_are_milliseconds() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[cache]\nrefill_interval = 50").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.cache.refill_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/conmem.toml").is_err());
    }
}
