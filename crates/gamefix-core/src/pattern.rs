//! Byte patterns with wildcard positions.
//!
//! Text form is a list of space separated two-digit hex tokens, with `??`
//! (or `?`) standing for a byte that matches anything:
//!
//! ```
//! use gamefix_core::Pattern;
//!
//! let pattern: Pattern = "D9 05 ?? ?? ?? ?? D8 0D".parse().unwrap();
//! assert_eq!(pattern.len(), 8);
//! assert_eq!(pattern.wildcard_count(), 4);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    bytes: Vec<Option<u8>>,
}

impl Pattern {
    /// Parse the text form. Fails on empty input or malformed tokens.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            bytes: parse_pattern(text)?,
        })
    }

    /// A pattern with no wildcard positions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidPattern("Pattern is empty".to_string()));
        }
        Ok(Self {
            bytes: bytes.iter().copied().map(Some).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Positions in order; `None` marks a wildcard.
    pub fn tokens(&self) -> &[Option<u8>] {
        &self.bytes
    }

    pub fn wildcard_count(&self) -> usize {
        self.bytes.iter().filter(|b| b.is_none()).count()
    }

    /// Whether `data` starts with a run of bytes matching this pattern.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() >= self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(data)
                .all(|(expected, actual)| expected.is_none_or(|value| value == *actual))
    }

    /// First fixed position and its byte, used to seed candidate offsets.
    pub(crate) fn anchor(&self) -> Option<(usize, u8)> {
        self.bytes
            .iter()
            .enumerate()
            .find_map(|(index, byte)| byte.map(|value| (index, value)))
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_pattern(&self.bytes))
    }
}

pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>> {
    let mut bytes = Vec::new();
    for token in pattern.split_whitespace() {
        if token == "??" || token == "?" {
            bytes.push(None);
            continue;
        }

        if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidPattern(format!(
                "Invalid pattern token '{}'",
                token
            )));
        }
        let value = u8::from_str_radix(token, 16)
            .map_err(|e| Error::InvalidPattern(format!("Invalid pattern token '{}': {}", token, e)))?;
        bytes.push(Some(value));
    }

    if bytes.is_empty() {
        return Err(Error::InvalidPattern("Pattern is empty".to_string()));
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

#[cfg(test)]
mod tests {
    use super::*;

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
    fn test_single_question_mark_is_wildcard() {
        let bytes = parse_pattern("90 ? 90").unwrap();
        assert_eq!(bytes, vec![Some(0x90), None, Some(0x90)]);
    }

    #[test]
    fn test_lowercase_hex_accepted() {
        let pattern = Pattern::parse("d9 05 ff").unwrap();
        assert_eq!(pattern.tokens(), &[Some(0xD9), Some(0x05), Some(0xFF)]);
    }

    #[test]
    fn test_rejects_malformed_tokens() {
        assert!(parse_pattern("").is_err());
        assert!(parse_pattern("   ").is_err());
        assert!(parse_pattern("9").is_err());
        assert!(parse_pattern("123").is_err());
        assert!(parse_pattern("GG").is_err());
        assert!(parse_pattern("+F").is_err());
        assert!(matches!(
            parse_pattern("90 ZZ"),
            Err(Error::InvalidPattern(_))
        ));
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
    fn test_matches_with_wildcard() {
        let pattern = Pattern::parse("90 90 ?? 90").unwrap();
        assert!(pattern.matches(&[0x90, 0x90, 0x7F, 0x90]));
        assert!(!pattern.matches(&[0x90, 0x91, 0x7F, 0x90]));
        assert!(!pattern.matches(&[0x90, 0x90, 0x7F]));
    }

    #[test]
    fn test_wildcard_accepts_every_byte_value() {
        let pattern = Pattern::parse("D9 05 ?? D8").unwrap();
        for value in 0..=255u8 {
            assert!(pattern.matches(&[0xD9, 0x05, value, 0xD8]));
            assert!(!pattern.matches(&[0xD9, 0x06, value, 0xD8]));
        }
    }

    #[test]
    fn test_anchor_skips_leading_wildcards() {
        let pattern = Pattern::parse("?? ?? 0F 11").unwrap();
        assert_eq!(pattern.anchor(), Some((2, 0x0F)));
        assert_eq!(Pattern::parse("?? ??").unwrap().anchor(), None);
    }

    #[test]
    fn test_from_bytes() {
        let pattern = Pattern::from_bytes(&[0xC3]).unwrap();
        assert_eq!(pattern.to_string(), "C3");
        assert_eq!(pattern.wildcard_count(), 0);
        assert!(Pattern::from_bytes(&[]).is_err());
    }
}
