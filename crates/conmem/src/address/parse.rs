//! Text form of [`MemoryAddress`].
//!
//! ```text
//! 82600000                 static
//! 82600000->20->-1C        pointer chain, offsets in signed hex
//! 82600000->20->5C[1]      first offset is a cached static prefix
//! {48 8D ?? ??}->20        pattern, cache flag is implied
//! ```

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use super::{MemoryAddress, format_pattern, parse_pattern};
use crate::error::{Error, Result};

fn write_offsets(f: &mut fmt::Formatter<'_>, offsets: &[i32], static_count: u32) -> fmt::Result {
    for &offset in offsets {
        if offset < 0 {
            write!(f, "->-{:X}", (offset as i64).unsigned_abs())?;
        } else {
            write!(f, "->{:X}", offset)?;
        }
    }
    if static_count > 0 {
        write!(f, "[{}]", static_count)?;
    }
    Ok(())
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAddress::Static(address) => write!(f, "{:08X}", address),
            MemoryAddress::Dynamic(dynamic) => {
                write!(f, "{:08X}", dynamic.base())?;
                write_offsets(f, dynamic.offsets(), dynamic.static_offset_count())
            }
            MemoryAddress::Pattern(pattern) => {
                write!(f, "{{{}}}", format_pattern(pattern.pattern()))?;
                write_offsets(f, pattern.offsets(), pattern.static_offset_count())
            }
        }
    }
}

fn invalid(text: &str, reason: &str) -> Error {
    Error::InvalidAddress(format!("'{}': {}", text, reason))
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn parse_base(text: &str, token: &str) -> Result<u32> {
    let digits = strip_hex_prefix(token.trim());
    u32::from_str_radix(digits, 16).map_err(|e| invalid(text, &format!("bad base: {}", e)))
}

/// Signed hex offset with optional `0x`, `-0x` and surrounding brackets
fn parse_offset(text: &str, token: &str) -> Result<i32> {
    let token = token.trim();
    let token = token
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(token)
        .trim();

    let (negative, magnitude) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    let magnitude = u32::from_str_radix(strip_hex_prefix(magnitude), 16)
        .map_err(|e| invalid(text, &format!("bad offset '{}': {}", token, e)))?;

    if negative {
        i32::try_from(-(magnitude as i64))
            .map_err(|_| invalid(text, &format!("offset '{}' out of range", token)))
    } else {
        // values above i32::MAX are two's complement spellings of negative offsets
        Ok(magnitude as i32)
    }
}

/// Split off a trailing `[N]` that is not itself a bracketed offset
fn split_static_count<'a>(text: &str, s: &'a str) -> Result<(&'a str, u32)> {
    if !s.ends_with(']') {
        return Ok((s, 0));
    }
    let Some(open) = s.rfind('[') else {
        return Err(invalid(text, "unbalanced ']'"));
    };
    if s[..open].ends_with("->") {
        return Ok((s, 0));
    }
    let count = s[open + 1..s.len() - 1]
        .trim()
        .parse::<u32>()
        .map_err(|e| invalid(text, &format!("bad static offset count: {}", e)))?;
    Ok((&s[..open], count))
}

impl FromStr for MemoryAddress {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(invalid(text, "empty address"));
        }

        let (head, tail) = if let Some(rest) = trimmed.strip_prefix('{') {
            let close = rest
                .find('}')
                .ok_or_else(|| invalid(text, "unterminated pattern"))?;
            (Some(&rest[..close]), &rest[close + 1..])
        } else {
            (None, trimmed)
        };

        let (chain, static_count) = split_static_count(text, tail)?;
        let mut parts = chain.split("->");

        match head {
            Some(pattern) => {
                if parts.next().is_some_and(|p| !p.trim().is_empty()) {
                    return Err(invalid(text, "unexpected text after pattern"));
                }
                let offsets = parts
                    .map(|token| parse_offset(text, token))
                    .collect::<Result<Vec<_>>>()?;
                MemoryAddress::pattern(parse_pattern(pattern)?, offsets, true, static_count)
            }
            None => {
                let base = parse_base(text, parts.next().unwrap_or_default())?;
                let offsets = parts
                    .map(|token| parse_offset(text, token))
                    .collect::<Result<Vec<_>>>()?;
                if offsets.is_empty() {
                    if static_count > 0 {
                        return Err(invalid(text, "static offset count without offsets"));
                    }
                    return Ok(MemoryAddress::Static(base));
                }
                MemoryAddress::dynamic(base, offsets, static_count)
            }
        }
    }
}

impl Serialize for MemoryAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemoryAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(address: &MemoryAddress) -> MemoryAddress {
        address.to_string().parse().unwrap()
    }

    #[test]
    fn test_static_format() {
        assert_eq!(MemoryAddress::fixed(0x1F).to_string(), "0000001F");
        assert_eq!("0x8260ABCD".parse::<MemoryAddress>().unwrap(), MemoryAddress::fixed(0x8260_ABCD));
    }

    #[test]
    fn test_dynamic_format_with_negative_offset_and_static_count() {
        let address = MemoryAddress::dynamic(0x8260_0000, vec![0x20, -0x1C, 0x5C], 1).unwrap();
        assert_eq!(address.to_string(), "82600000->20->-1C->5C[1]");
        assert_eq!(roundtrip(&address), address);
    }

    #[test]
    fn test_roundtrip_extremes() {
        let addresses = [
            MemoryAddress::fixed(0),
            MemoryAddress::fixed(u32::MAX),
            MemoryAddress::dynamic(0, vec![i32::MIN, i32::MAX, 0], 3).unwrap(),
            MemoryAddress::dynamic(0xFFFF_FFFF, vec![-1], 0).unwrap(),
        ];
        for address in &addresses {
            assert_eq!(&roundtrip(address), address, "{}", address);
        }
    }

    #[test]
    fn test_non_caching_pattern_roundtrips() {
        let address =
            MemoryAddress::pattern(vec![Some(0x48), None, Some(0x05)], vec![0x10, -4], false, 1)
                .unwrap();
        let parsed = roundtrip(&address);
        assert_eq!(parsed, address);
        assert_eq!(parsed.to_string(), address.to_string());

        let MemoryAddress::Pattern(parsed) = parsed else {
            panic!("expected a pattern address");
        };
        assert!(parsed.cache_result());
    }

    #[test]
    fn test_parse_accepts_prefixes_and_brackets() {
        let parsed: MemoryAddress = "0x82600000->0x20->-0x1C->[5C]".parse().unwrap();
        let expected = MemoryAddress::dynamic(0x8260_0000, vec![0x20, -0x1C, 0x5C], 0).unwrap();
        assert_eq!(parsed, expected);

        let parsed: MemoryAddress = " 82600000 -> 20 -> [5C] [2] ".parse().unwrap();
        let expected = MemoryAddress::dynamic(0x8260_0000, vec![0x20, 0x5C], 2).unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<MemoryAddress>().is_err());
        assert!("XYZ".parse::<MemoryAddress>().is_err());
        assert!("1000->".parse::<MemoryAddress>().is_err());
        assert!("1000[1]".parse::<MemoryAddress>().is_err());
        assert!("1000->4[2]".parse::<MemoryAddress>().is_err());
        assert!("1000->-80000001".parse::<MemoryAddress>().is_err());
        assert!("{48 8D".parse::<MemoryAddress>().is_err());
    }

    #[test]
    fn test_pattern_format() {
        let address = MemoryAddress::pattern(
            parse_pattern("48 8D ?? ??").unwrap(),
            vec![0x20],
            true,
            0,
        )
        .unwrap();
        assert_eq!(address.to_string(), "{48 8D ?? ??}->20");
        assert_eq!(roundtrip(&address), address);
    }

    #[test]
    fn test_deserialize_from_text() {
        use serde::de::IntoDeserializer;
        use serde::de::value::{Error as ValueError, StrDeserializer};

        let deserializer: StrDeserializer<'_, ValueError> = "82600000->20->5C".into_deserializer();
        let address = MemoryAddress::deserialize(deserializer).unwrap();
        assert_eq!(
            address,
            MemoryAddress::dynamic(0x8260_0000, vec![0x20, 0x5C], 0).unwrap()
        );

        let deserializer: StrDeserializer<'_, ValueError> = "not an address".into_deserializer();
        assert!(MemoryAddress::deserialize(deserializer).is_err());
    }
}
