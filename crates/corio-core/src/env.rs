//! Environment variable utilities
//!
//! ```ignore
//! use corio_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("CORIO_THREADS", 1);
//! let use_caller = env_get_bool("CORIO_USE_CALLER", true);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as `T`, or `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (any case) are true; any other set value is false.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some(T)` if the variable is set and parses, `None` otherwise
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Environment key for a dotted config name: `tcp.connect.timeout` -> `CORIO_TCP_CONNECT_TIMEOUT`
pub fn env_key_for(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 6);
    key.push_str("CORIO_");
    for c in name.chars() {
        key.push(if c == '.' { '_' } else { c.to_ascii_uppercase() });
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__CORIO_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__CORIO_TEST_UNSET__", true));
        assert_eq!(env_get_str("__CORIO_TEST_UNSET__", "x"), "x");
    }

    #[test]
    fn test_env_get_set_and_invalid() {
        std::env::set_var("__CORIO_TEST_NUM__", " 123 ");
        assert_eq!(env_get::<usize>("__CORIO_TEST_NUM__", 0), 123);
        std::env::set_var("__CORIO_TEST_NUM__", "lots");
        assert_eq!(env_get::<usize>("__CORIO_TEST_NUM__", 99), 99);
        std::env::remove_var("__CORIO_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (v, expect) in [("1", true), ("YES", true), ("on", true), ("0", false), ("nope", false)] {
            std::env::set_var("__CORIO_TEST_BOOL__", v);
            assert_eq!(env_get_bool("__CORIO_TEST_BOOL__", !expect), expect, "value {v}");
        }
        std::env::remove_var("__CORIO_TEST_BOOL__");
    }

    #[test]
    fn test_env_key_for() {
        assert_eq!(env_key_for("tcp.connect.timeout"), "CORIO_TCP_CONNECT_TIMEOUT");
    }
}
