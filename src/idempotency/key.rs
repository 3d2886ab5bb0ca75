use std::borrow::Cow;

use crate::error::GuardRejection;

pub const CACHE_KEY_PREFIX: &str = "idempotency";
pub const LOCK_PREFIX: &str = "idempotency_lock";

/// Checks a client key against the minimum length.
///
/// Length is measured in bytes and a `min_len` of 0 disables the check.
pub fn validate_key(key: &[u8], min_len: usize) -> Result<(), GuardRejection> {
    if min_len > 0 && key.len() < min_len {
        return Err(GuardRejection::KeyTooShort { min: min_len });
    }
    Ok(())
}

/// Renders raw key bytes as a cache-key segment.
///
/// UTF-8 keys without `:` or `%` pass through untouched. Anything else is
/// percent-escaped byte by byte (`:`, `%` and non-ASCII), so distinct keys never
/// share a segment and the segment never contains a `:`.
pub fn key_segment(key: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(key) {
        if !text.contains(|c| c == ':' || c == '%') {
            return Cow::Borrowed(text);
        }
    }

    let mut escaped = String::with_capacity(key.len() + 8);
    for &byte in key {
        if byte == b':' || byte == b'%' || !byte.is_ascii() {
            escaped.push('%');
            escaped.push_str(&hex::encode_upper([byte]));
        } else {
            escaped.push(byte as char);
        }
    }
    Cow::Owned(escaped)
}

/// Builds the cache key for a client key, scoped to the requester when one is known.
pub fn cache_key(idempotency_key: &[u8], identity: Option<&str>) -> String {
    let segment = key_segment(idempotency_key);
    match identity {
        Some(identity) => format!("{}:{}:user_{}", CACHE_KEY_PREFIX, segment, identity),
        None => format!("{}:{}", CACHE_KEY_PREFIX, segment),
    }
}

/// Name of the distributed lock guarding a cache key.
pub fn lock_name(cache_key: &str) -> String {
    format!("{}:{}", LOCK_PREFIX, cache_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_min_length() {
        assert!(validate_key(b"12345678", 8).is_ok());
        assert_eq!(
            validate_key(b"short", 8),
            Err(GuardRejection::KeyTooShort { min: 8 })
        );
        assert!(validate_key(b"", 8).is_err());
    }

    #[test]
    fn test_validate_key_counts_bytes() {
        // four characters, eight bytes
        assert!(validate_key("éééé".as_bytes(), 8).is_ok());
        assert!(validate_key(b"key-\xff\xfe-1", 8).is_ok());
    }

    #[test]
    fn test_validate_key_disabled() {
        assert!(validate_key(b"", 0).is_ok());
        assert!(validate_key(b"a", 0).is_ok());
    }

    #[test]
    fn test_cache_key_without_identity() {
        assert_eq!(cache_key(b"abc-12345", None), "idempotency:abc-12345");
    }

    #[test]
    fn test_cache_key_scoped_to_identity() {
        let alice = cache_key(b"abc-12345", Some("42"));
        let bob = cache_key(b"abc-12345", Some("43"));
        assert_eq!(alice, "idempotency:abc-12345:user_42");
        assert_ne!(alice, bob);
        assert_ne!(alice, cache_key(b"abc-12345", None));
    }

    #[test]
    fn test_key_containing_scope_marker_does_not_collide() {
        let unscoped = cache_key(b"abc:user_42", None);
        let scoped = cache_key(b"abc", Some("42"));
        assert_eq!(unscoped, "idempotency:abc%3Auser_42");
        assert_ne!(unscoped, scoped);
    }

    #[test]
    fn test_non_utf8_keys_are_escaped_losslessly() {
        assert_eq!(key_segment(b"key-\xff\xfe-1234"), "key-%FF%FE-1234");
        assert_ne!(key_segment(b"key-\xff"), key_segment(b"key-%FF"));
        assert_eq!(key_segment(b"key-%FF"), "key-%25FF");
    }

    #[test]
    fn test_plain_keys_are_borrowed() {
        assert!(matches!(key_segment(b"550e8400-e29b"), Cow::Borrowed(_)));
        assert_eq!(key_segment("café-1234".as_bytes()), "café-1234");
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        assert_ne!(cache_key(b"Key-ABCDEF", None), cache_key(b"key-abcdef", None));
    }

    #[test]
    fn test_lock_name() {
        assert_eq!(
            lock_name("idempotency:abc-12345"),
            "idempotency_lock:idempotency:abc-12345"
        );
    }
}
