//! Byte patterns with `??` wildcards and chunked scanning over a connection.

use memchr::memchr_iter;
use tracing::debug;

use crate::connection::{AddressRange, Connection};
use crate::error::{Error, Result};

pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        let value = u8::from_str_radix(token, 16).map_err(|e| {
            Error::InvalidAddress(format!("Invalid pattern token '{}': {}", token, e))
        })?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err(Error::InvalidAddress("Byte pattern is empty".to_string()));
    }

    Ok(bytes)
}

pub fn format_pattern(bytes: &[Option<u8>]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            Some(value) => format!("{:02X}", value),
            None => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Index of the first match of `pattern` in `haystack`
pub fn find_in_slice(haystack: &[u8], pattern: &[Option<u8>]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > haystack.len() {
        return None;
    }

    let Some((anchor, anchor_byte)) = pattern
        .iter()
        .enumerate()
        .find_map(|(i, b)| b.map(|b| (i, b)))
    else {
        return Some(0);
    };

    // positions in the shifted slice are candidate start offsets
    memchr_iter(anchor_byte, &haystack[anchor..])
        .filter(|&start| start + pattern.len() <= haystack.len())
        .find(|&start| matches_at(&haystack[start..], pattern))
}

fn matches_at(window: &[u8], pattern: &[Option<u8>]) -> bool {
    pattern
        .iter()
        .zip(window)
        .all(|(expected, actual)| expected.is_none_or(|b| b == *actual))
}

/// Scan `range` of console memory for `pattern`, reading `chunk_size` bytes at a time.
///
/// Consecutive reads overlap by `pattern.len() - 1` bytes so that matches straddling a
/// chunk boundary are found. Chunks that fail to read are skipped.
pub async fn find_pattern<C: Connection + ?Sized>(
    connection: &C,
    range: AddressRange,
    pattern: &[Option<u8>],
    chunk_size: usize,
) -> Result<Option<u32>> {
    if pattern.is_empty() {
        return Err(Error::InvalidAddress("Byte pattern is empty".to_string()));
    }

    let chunk_size = chunk_size.max(1);
    let overlap = pattern.len() - 1;
    let end = range.end() as u64;
    let mut position = range.base as u64;
    let mut buffer = vec![0u8; chunk_size + overlap];

    while position < end {
        let step = (chunk_size as u64).min(end - position) as usize;
        let read_len = ((step + overlap) as u64).min(end - position) as usize;
        let window = &mut buffer[..read_len];

        match connection.read_bytes(position as u32, window).await {
            Ok(()) => {
                if let Some(index) = find_in_slice(window, pattern) {
                    return Ok(Some(position as u32 + index as u32));
                }
            }
            Err(e) => {
                if !connection.is_connected() {
                    return Err(e);
                }
                debug!("Skipping unreadable chunk at {:#010X}: {}", position, e);
            }
        }

        position += step as u64;
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnectionBuilder;

    #[test]
    fn test_parse_pattern_with_wildcards() {
        let bytes = parse_pattern("48 8D 0D ?? ?? ?? ??").unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], Some(0x48));
        assert_eq!(bytes[1], Some(0x8D));
        assert_eq!(bytes[2], Some(0x0D));
        assert_eq!(bytes[3], None);
    }

    #[test]
    fn test_parse_pattern_rejects_garbage() {
        assert!(parse_pattern("").is_err());
        assert!(parse_pattern("4G").is_err());
    }

    #[test]
    fn test_format_pattern_roundtrip() {
        let pattern = vec![Some(0x48), Some(0x8D), Some(0x0D), None, Some(0xFF)];
        let formatted = format_pattern(&pattern);
        assert_eq!(formatted, "48 8D 0D ?? FF");
        let parsed = parse_pattern(&formatted).unwrap();
        assert_eq!(parsed, pattern);
    }

    #[test]
    fn test_find_in_slice_with_leading_wildcard() {
        let haystack = [0x00, 0x11, 0x22, 0x33, 0x11, 0x22, 0x44];
        let pattern = [None, Some(0x22), Some(0x44)];
        assert_eq!(find_in_slice(&haystack, &pattern), Some(4));
        assert_eq!(find_in_slice(&haystack, &[Some(0x99)]), None);
        assert_eq!(find_in_slice(&haystack, &[None, None]), Some(0));
    }

    #[tokio::test]
    async fn test_find_pattern_across_chunk_boundary() {
        let mut image = vec![0u8; 64];
        image[30..34].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let conn = MockConnectionBuilder::new()
            .with_bytes(0x4000, &image)
            .build();
        let range = AddressRange::new(0x4000, 64).unwrap();

        let found = find_pattern(&conn, range, &parse_pattern("DE AD ?? EF").unwrap(), 32)
            .await
            .unwrap();
        assert_eq!(found, Some(0x401E));
    }

    #[tokio::test]
    async fn test_find_pattern_skips_failed_chunks() {
        let mut image = vec![0u8; 64];
        image[40] = 0x7F;
        image[10] = 0x7F;
        let conn = MockConnectionBuilder::new()
            .with_bytes(0x0, &image)
            .fail_at(0x0, 16)
            .build();
        let range = AddressRange::new(0, 64).unwrap();

        let found = find_pattern(&conn, range, &[Some(0x7F)], 16).await.unwrap();
        assert_eq!(found, Some(40));
    }
}
