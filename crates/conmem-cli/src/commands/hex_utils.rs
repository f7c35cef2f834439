//! Hex parsing and formatting helpers shared by the commands.

use anyhow::Result;

/// Parse a 32-bit hex value (with or without 0x prefix).
pub fn parse_hex_u32(s: &str) -> Result<u32> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).map_err(|e| anyhow::anyhow!("Invalid hex value: {}", e))
}

/// Write one 16-byte row in hexdump layout:
///
/// ```text
/// 82600000: 48 65 6C 6C 6F 20 57 6F  72 6C 64 00 00 00 00 00  |Hello World.....|
/// ```
pub fn format_row(address: u32, chunk: &[u8], ascii: bool) -> String {
    let mut line = format!("{:08X}: ", address);

    for (j, byte) in chunk.iter().enumerate() {
        if j == 8 {
            line.push(' ');
        }
        line.push_str(&format!("{:02X} ", byte));
    }
    for j in chunk.len()..16 {
        if j == 8 {
            line.push(' ');
        }
        line.push_str("   ");
    }

    if ascii {
        line.push_str(" |");
        for &byte in chunk {
            line.push(if (0x20..0x7F).contains(&byte) {
                byte as char
            } else {
                '.'
            });
        }
        for _ in chunk.len()..16 {
            line.push(' ');
        }
        line.push('|');
    }
    line
}
