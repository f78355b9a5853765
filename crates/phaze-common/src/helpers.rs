//! Common helper functions for PhazeTunnel.

use crate::{Error, Result};

/// Performs a constant-time comparison of two strings.
/// Used when comparing admin tokens.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();

    if a_bytes.len() != b_bytes.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a_bytes.iter().zip(b_bytes.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Parse a 32-byte key from 64 hex characters.
pub fn parse_hex_key(input: &str) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(input.trim(), &mut key)
        .map_err(|e| Error::config(format!("invalid 32-byte hex key: {e}")))?;
    Ok(key)
}

/// Short printable form of a tag or key for logs.
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(4)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_identical() {
        assert!(constant_time_eq("token123", "token123"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_constant_time_eq_different() {
        assert!(!constant_time_eq("token123", "token124"));
        assert!(!constant_time_eq("", "a"));
    }

    #[test]
    fn test_constant_time_eq_different_lengths() {
        assert!(!constant_time_eq("short", "much_longer_string"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn test_parse_hex_key() {
        let hex = "0f".repeat(32);
        assert_eq!(parse_hex_key(&hex).unwrap(), [0x0f; 32]);
        assert_eq!(parse_hex_key(&format!(" {hex}\n")).unwrap(), [0x0f; 32]);
        assert!(parse_hex_key("0f").is_err());
        assert!(parse_hex_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_short_hex() {
        assert_eq!(short_hex(&[0xde, 0xad, 0xbe, 0xef, 0x01]), "deadbeef");
        assert_eq!(short_hex(&[0xab]), "ab");
    }
}
