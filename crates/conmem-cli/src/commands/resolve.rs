//! Resolve command implementation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use conmem::{BusyLock, BusyRequest, Connection, ConnectionExt, MemoryAddress};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the resolve command
pub async fn run(connection: &Arc<dyn Connection>, expression: &str) -> Result<()> {
    let lock = BusyLock::with_connection(Arc::clone(connection));
    for line in describe(&lock, expression).await? {
        println!("{}", line);
    }
    Ok(())
}

async fn describe(lock: &BusyLock, expression: &str) -> Result<Vec<String>> {
    let address: MemoryAddress = expression
        .parse()
        .with_context(|| format!("Invalid address expression '{}'", expression))?;

    let request = BusyRequest::new().timeout(LOCK_TIMEOUT);
    let Some(token) = lock.begin_busy_operation(request).await else {
        bail!("Could not take the connection");
    };
    let Some(connection) = token.connection() else {
        bail!("No connection");
    };
    let connection = connection.as_ref();

    let Some(resolved) = address.resolve(connection, false).await else {
        return Ok(vec![format!("{} -> unresolved", address)]);
    };

    let mut lines = vec![format!("{} -> {:08X}", address, resolved)];
    if let MemoryAddress::Dynamic(dynamic) = &address {
        if let Some(base) = dynamic.resolved_static_base() {
            lines.push(format!("  static base: {:08X}", base));
        }
    }
    match connection.read_u32(resolved).await {
        Ok(value) => {
            lines.push(format!("  u32: {:#010X} ({})", value, value));
            lines.push(format!("  f32: {}", f32::from_bits(value)));
        }
        Err(e) => lines.push(format!("  value unreadable: {}", e)),
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conmem::FileConnection;
    use std::io::Write;
    use tempfile::NamedTempFile;

    async fn big_endian_image() -> (NamedTempFile, BusyLock) {
        let mut image = vec![0u8; 0x100];
        image[0x20..0x24].copy_from_slice(&0x8260_0040u32.to_be_bytes());
        image[0x48..0x4C].copy_from_slice(&0xCAFE_BABEu32.to_be_bytes());

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        let conn = FileConnection::open(file.path(), 0x8260_0000, false)
            .await
            .unwrap();
        (file, BusyLock::with_connection(Arc::new(conn)))
    }

    #[tokio::test]
    async fn test_describe_walks_chain() {
        let (_file, lock) = big_endian_image().await;
        let lines = describe(&lock, "82600000->20->8").await.unwrap();
        assert_eq!(lines[0], "82600000->20->8 -> 82600048");
        assert!(lines.iter().any(|l| l.contains("0xCAFEBABE")));
    }

    #[tokio::test]
    async fn test_null_pointer_is_unresolved() {
        let (_file, lock) = big_endian_image().await;
        let lines = describe(&lock, "82600000->30->8").await.unwrap();
        assert_eq!(lines, vec!["82600000->30->8 -> unresolved".to_string()]);
    }

    #[tokio::test]
    async fn test_bad_expression() {
        let (_file, lock) = big_endian_image().await;
        assert!(describe(&lock, "82600000->zz").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_connection_is_not_touched() {
        let (_file, lock) = big_endian_image().await;
        let _held = lock.try_begin_busy_operation().unwrap();

        let err = describe(&lock, "82600000->20->8").await.unwrap_err();
        assert!(err.to_string().contains("Could not take the connection"));
    }
}
