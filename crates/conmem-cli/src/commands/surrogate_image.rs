//! Surrogate-image command implementation.
//!
//! Stands in for the native surrogate: a memory image is served over the same wire
//! protocol, so `--surrogate` sessions can be exercised without a console.

use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;

use anyhow::{Context, Result};
use conmem::rpc::server::{self, ImageBackend};
use tracing::info;

/// Run the surrogate-image command; returns once the host disconnects or sends exit
pub async fn run(file: &Path, port: u16, base: u32) -> Result<()> {
    let image = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .with_context(|| format!("Failed to listen on port {}", port))?;

    info!(
        "Serving {} ({} bytes at {:#010X}) on port {}",
        file.display(),
        image.len(),
        base,
        port
    );

    let mut backend = ImageBackend::new(base, image);
    tokio::task::spawn_blocking(move || server::serve(&listener, &mut backend)).await??;
    info!("Host disconnected");
    Ok(())
}
