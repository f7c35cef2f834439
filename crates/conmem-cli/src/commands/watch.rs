//! Watch command implementation.
//!
//! Polls a set of addresses under the busy lock and prints a line whenever a value
//! changes. Chains are re-resolved every tick; an unresolved chain drops its cached
//! static prefix so the next tick walks it from the base again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::ValueEnum;
use conmem::{BusyLock, Connection, ConnectionExt, MemoryAddress};
use owo_colors::OwoColorize;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// How to interpret the bytes at a watched address
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ValueKind {
    U8,
    U16,
    U32,
    F32,
    F64,
}

impl ValueKind {
    pub async fn read(self, connection: &dyn Connection, address: u32) -> conmem::Result<String> {
        Ok(match self {
            ValueKind::U8 => connection.read_u8(address).await?.to_string(),
            ValueKind::U16 => connection.read_u16(address).await?.to_string(),
            ValueKind::U32 => connection.read_u32(address).await?.to_string(),
            ValueKind::F32 => format!("{:.3}", connection.read_f32(address).await?),
            ValueKind::F64 => format!("{:.3}", connection.read_f64(address).await?),
        })
    }
}

struct Watched {
    address: MemoryAddress,
    last: Option<String>,
}

/// Run the watch command until Ctrl-C
pub async fn run(
    connection: Arc<dyn Connection>,
    expressions: &[String],
    interval_ms: u64,
    kind: ValueKind,
) -> Result<()> {
    let mut watched = expressions
        .iter()
        .map(|text| {
            let address = text
                .parse()
                .with_context(|| format!("Invalid address expression '{}'", text))?;
            Ok(Watched { address, last: None })
        })
        .collect::<Result<Vec<_>>>()?;

    let interval = Duration::from_millis(interval_ms.max(1));
    let lock = BusyLock::with_connection(connection);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("Watching {} address(es), Ctrl-C to stop", watched.len());
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {}
        }

        let Some(token) = lock.begin_busy_operation(interval).await else {
            debug!("Connection busy, skipping tick");
            continue;
        };
        let Some(connection) = token.connection() else {
            break;
        };
        if !connection.is_connected() {
            println!("{}", "Connection lost".red());
            break;
        }

        for item in &mut watched {
            let value = poll(connection.as_ref(), &item.address, kind).await;
            if item.last.as_deref() == Some(value.as_str()) {
                continue;
            }
            let timestamp = Local::now().format("%H:%M:%S%.3f").to_string();
            let previous = item.last.as_deref().unwrap_or("-");
            println!(
                "{} {} {} -> {}",
                timestamp.dimmed(),
                item.address.cyan(),
                previous.red(),
                value.green()
            );
            item.last = Some(value);
        }
    }
    Ok(())
}

async fn poll(connection: &dyn Connection, address: &MemoryAddress, kind: ValueKind) -> String {
    let Some(resolved) = address.resolve(connection, false).await else {
        address.invalidate();
        return "<unresolved>".to_string();
    };
    match kind.read(connection, resolved).await {
        Ok(value) => value,
        Err(e) => format!("<{}>", e),
    }
}
