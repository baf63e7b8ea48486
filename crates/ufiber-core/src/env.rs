//! Environment variable utilities
//!
//! ```ignore
//! use ufiber_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("UFIBER_STACK_SIZE", 256 * 1024);
//! let trace = env_get_bool("UFIBER_LOG_SWITCHES", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset variables and values that fail to parse both yield `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true; any other
/// value is false. Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get a byte size such as `65536`, `64k` or `2M`
pub fn env_get_size(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_size(&v))
        .unwrap_or(default)
}

fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' | b'K' => (&s[..s.len() - 1], 10),
        b'm' | b'M' => (&s[..s.len() - 1], 20),
        _ => (s, 0),
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(1usize << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__UFIBER_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__UFIBER_TEST_NUM__", " 123 ");
        let val: usize = env_get("__UFIBER_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__UFIBER_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__UFIBER_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__UFIBER_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__UFIBER_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        assert!(env_get_bool("__UFIBER_TEST_UNSET__", true));

        std::env::set_var("__UFIBER_TEST_BOOL__", "ON");
        assert!(env_get_bool("__UFIBER_TEST_BOOL__", false));
        std::env::set_var("__UFIBER_TEST_BOOL__", "0");
        assert!(!env_get_bool("__UFIBER_TEST_BOOL__", true));
        std::env::remove_var("__UFIBER_TEST_BOOL__");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64k"), Some(64 * 1024));
        assert_eq!(parse_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("k"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("lots"), None);
    }
}
