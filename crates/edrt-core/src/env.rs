//! Environment variable helpers
//!
//! Every tunable in `RuntimeConfig` can be overridden by an `EDRT_*`
//! variable. Unset or unparsable values fall back to the compiled default.
//!
//! ```ignore
//! use edrt_core::env::{env_get, env_get_bool, env_get_with};
//!
//! let workers: usize = env_get("EDRT_NUM_WORKERS", 8);
//! let locking = env_get_bool("EDRT_ADVISORY_LOCK", true);
//! let policy = env_get_with("EDRT_POOL_POLICY", Backpressure::Reject, Backpressure::parse);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` with a custom parser, or return `default`
///
/// For values that are not `FromStr`, such as policy enums.
pub fn env_get_with<T>(key: &str, default: T, parse: fn(&str) -> Option<T>) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| parse(v.trim()))
        .unwrap_or(default)
}

/// Read `key` as a boolean.
///
/// "1", "true", "yes", "on" are true and "0", "false", "no", "off" are
/// false (case-insensitive). Anything else, including unset, is `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    env_get_with(key, default, parse_bool)
}

/// Parse `key` as `T`; `None` if unset or unparsable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Read `key` as a string, or return `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Whether `key` is set at all
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let val: usize = env_get("__EDRT_TEST_UNSET__", 200);
        assert_eq!(val, 200);
        assert!(env_get_bool("__EDRT_TEST_UNSET__", true));
        assert!(env_get_opt::<u16>("__EDRT_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__EDRT_TEST_UNSET__", "/tmp/x.sock"), "/tmp/x.sock");
        assert!(!env_is_set("__EDRT_TEST_UNSET__"));
    }

    #[test]
    fn test_parse_with_whitespace() {
        std::env::set_var("__EDRT_TEST_QUEUE__", " 64 ");
        let val: usize = env_get("__EDRT_TEST_QUEUE__", 200);
        assert_eq!(val, 64);
        std::env::remove_var("__EDRT_TEST_QUEUE__");
    }

    #[test]
    fn test_bool_falls_back_on_garbage() {
        std::env::set_var("__EDRT_TEST_LOCK__", "off");
        assert!(!env_get_bool("__EDRT_TEST_LOCK__", true));

        std::env::set_var("__EDRT_TEST_LOCK__", "YES");
        assert!(env_get_bool("__EDRT_TEST_LOCK__", false));

        std::env::set_var("__EDRT_TEST_LOCK__", "maybe");
        assert!(env_get_bool("__EDRT_TEST_LOCK__", true));
        assert!(!env_get_bool("__EDRT_TEST_LOCK__", false));
        std::env::remove_var("__EDRT_TEST_LOCK__");
    }

    #[test]
    fn test_custom_parser() {
        fn parse_mode(v: &str) -> Option<u8> {
            match v {
                "block" => Some(1),
                "reject" => Some(2),
                _ => None,
            }
        }
        std::env::set_var("__EDRT_TEST_MODE__", "block");
        assert_eq!(env_get_with("__EDRT_TEST_MODE__", 0, parse_mode), 1);
        std::env::set_var("__EDRT_TEST_MODE__", "drop");
        assert_eq!(env_get_with("__EDRT_TEST_MODE__", 0, parse_mode), 0);
        std::env::remove_var("__EDRT_TEST_MODE__");
    }
}
