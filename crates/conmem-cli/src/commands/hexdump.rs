//! Hexdump command implementation.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use conmem::{BusyLock, BusyRequest, ByteCache, Connection, MemoryAddress};

use super::hex_utils::format_row;
use crate::config::Config;

/// Run the hexdump command
pub async fn run(
    connection: &Arc<dyn Connection>,
    config: &Config,
    expression: &str,
    size: usize,
    ascii: bool,
) -> Result<()> {
    let lock = BusyLock::with_connection(Arc::clone(connection));
    let cache = ByteCache::new(lock.clone(), config.cache.clone());

    for line in dump(&cache, expression, size, ascii).await? {
        println!("{}", line);
    }
    Ok(())
}

async fn dump(cache: &ByteCache, expression: &str, size: usize, ascii: bool) -> Result<Vec<String>> {
    let address: MemoryAddress = expression
        .parse()
        .with_context(|| format!("Invalid address expression '{}'", expression))?;

    let Some(token) = cache.lock().begin_busy_operation(BusyRequest::new()).await else {
        bail!("Could not take the connection");
    };
    let Some(connection) = token.connection() else {
        bail!("No connection");
    };
    let Some(start) = address.resolve(connection.as_ref(), false).await else {
        bail!("{} does not resolve", address);
    };

    let mut buffer = vec![0u8; size];
    let read = cache
        .read_available_async(start as u64, &mut buffer, Some(&token), None)
        .await
        .with_context(|| format!("Failed to read {} bytes at {:#010X}", size, start))?;
    buffer.truncate(read);

    let mut lines = vec![format!("{} -> {:08X}, {} bytes", address, start, read)];
    for (i, chunk) in buffer.chunks(16).enumerate() {
        lines.push(format_row(start.wrapping_add(i as u32 * 16), chunk, ascii));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conmem::{CacheConfig, FileConnection};
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn cache_over(bytes: &[u8], base: u32) -> (NamedTempFile, ByteCache) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        let conn = FileConnection::open(file.path(), base, true).await.unwrap();
        let lock = BusyLock::with_connection(Arc::new(conn));
        (file, ByteCache::new(lock, CacheConfig::default()))
    }

    #[tokio::test]
    async fn test_dump_rows() {
        let mut image = vec![0u8; 0x40];
        image[0x10..0x1B].copy_from_slice(b"Hello World");
        let (_file, cache) = cache_over(&image, 0x8260_0000).await;

        let lines = dump(&cache, "82600010", 20, true).await.unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "82600010 -> 82600010, 20 bytes");
        assert!(lines[1].ends_with("|Hello World.....|"));
        assert!(lines[2].starts_with("82600020: 00 00 00 00 "));
    }

    #[tokio::test]
    async fn test_dump_fills_the_cache() {
        let (_file, cache) = cache_over(&[0xAB; 0x20], 0x1000).await;

        dump(&cache, "1000", 0x20, false).await.unwrap();
        let mut buf = [0u8; 0x20];
        assert_eq!(cache.read_available(0x1000, &mut buf), 0x20);
        assert_eq!(buf, [0xAB; 0x20]);
    }

    #[tokio::test]
    async fn test_unresolved_address_fails() {
        let (_file, cache) = cache_over(&[0; 0x10], 0x1000).await;
        assert!(dump(&cache, "1000->4->0", 16, true).await.is_err());
    }
}
