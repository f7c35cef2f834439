//! Choosing and opening the memory backend.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use conmem::{Connection, FileConnection, SurrogateConnection, SurrogateSession};
use tracing::info;

use crate::commands::hex_utils::parse_hex_u32;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Use a memory image file as console memory
    #[arg(long, global = true)]
    pub file: Option<PathBuf>,

    /// Console address of the image's first byte (hex)
    #[arg(long, global = true, value_parser = parse_hex_u32, default_value = "0")]
    pub base: u32,

    /// Treat the image as big-endian
    #[arg(long, global = true)]
    pub big_endian: bool,

    /// Connect through the surrogate process from the config file
    #[arg(long, global = true)]
    pub surrogate: bool,

    /// Console IP for --surrogate
    #[arg(long, global = true, env = "CONMEM_CONSOLE")]
    pub console: Option<String>,
}

impl TargetArgs {
    pub async fn open(&self, config: &Config) -> Result<Arc<dyn Connection>> {
        match (&self.file, self.surrogate) {
            (Some(_), true) => bail!("--file and --surrogate are mutually exclusive"),
            (Some(path), false) => {
                let connection = FileConnection::open(path, self.base, !self.big_endian)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                info!("Using image {} at {:#010X}", path.display(), self.base);
                Ok(Arc::new(connection))
            }
            (None, true) => {
                let Some(console) = self.console.as_ref().or(config.console.as_ref()) else {
                    bail!("No console IP: pass --console or set `console` in the config");
                };
                let session = SurrogateSession::start(&config.transport, None)
                    .await
                    .context("Failed to start the surrogate")?;
                let connection = SurrogateConnection::connect(session, console)
                    .await
                    .with_context(|| format!("Failed to connect to {}", console))?;
                Ok(Arc::new(connection))
            }
            (None, false) => bail!("No target: pass --file <image> or --surrogate"),
        }
    }
}
