//! Reversible escaping of participant ids into path components and keys.
//!
//! Reserved characters, `%` itself and control characters are written as
//! `%XX` per UTF-8 byte. Because `%` is always escaped, two distinct ids
//! never map to the same output.

use std::fmt::Write;

/// Escapes every character `reserved` flags, plus `%` and control characters.
pub fn escape_with(raw: &str, reserved: impl Fn(char) -> bool) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch == '%' || ch.is_control() || reserved(ch) {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                let _ = write!(escaped, "%{byte:02X}");
            }
        } else {
            escaped.push(ch);
        }
    }
    escaped
}

/// Inverse of [`escape_with`]. `None` for input it cannot have produced.
pub fn unescape(escaped: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut rest = escaped.as_bytes();
    while let Some((&first, tail)) = rest.split_first() {
        if first == b'%' {
            let hex = tail.get(..2)?;
            let hex = std::str::from_utf8(hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(first);
            rest = tail;
        }
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slash(ch: char) -> bool {
        ch == '/'
    }

    #[test]
    fn reserved_and_percent_are_escaped() {
        assert_eq!(escape_with("a/b", slash), "a%2Fb");
        assert_eq!(escape_with("a%2Fb", slash), "a%252Fb");
        assert_eq!(escape_with("tab\there", slash), "tab%09here");
        assert_eq!(escape_with("P1", slash), "P1");
    }

    #[test]
    fn escaping_round_trips() {
        for raw in ["P1", "a/b", "a_b", "100%", "ü/é", " P1 ", "%2F"] {
            assert_eq!(unescape(&escape_with(raw, slash)).as_deref(), Some(raw));
        }
        assert_eq!(unescape("%4"), None);
    }
}
