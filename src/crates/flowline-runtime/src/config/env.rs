//! Environment variable helpers
//!
//! Every override is read as `{PREFIX}{FIELD}` with the field name
//! upper-cased, e.g. `FLOWLINE_MAX_WORKERS`.

use crate::{Result, RuntimeError};
use std::env;
use std::str::FromStr;

/// Build a prefixed environment variable name
///
/// ```rust
/// use flowline_runtime::config::env_key;
///
/// assert_eq!(env_key("FLOWLINE_", "max_workers"), "FLOWLINE_MAX_WORKERS");
/// ```
pub fn env_key(prefix: &str, field: &str) -> String {
    format!("{}{}", prefix, field.to_uppercase())
}

/// Read a variable; `Ok(None)` when unset
pub fn env_var(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(RuntimeError::Configuration(format!(
            "Environment variable {} contains invalid UTF-8",
            key
        ))),
    }
}

/// Read and parse a variable; a present but unparsable value is an error
pub fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_var(key)?
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                RuntimeError::Configuration(format!("Invalid value for {}: {} ({})", key, raw, e))
            })
        })
        .transpose()
}

/// Read a boolean variable (`true/1/yes/on`, `false/0/no/off`)
pub fn env_bool(key: &str) -> Result<Option<bool>> {
    env_var(key)?
        .map(|raw| match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(RuntimeError::Configuration(format!(
                "Invalid boolean value for {}: {}",
                key, raw
            ))),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_variable_is_none() {
        assert!(env_var("FLOWLINE_TEST_MISSING_12345").unwrap().is_none());
        assert!(env_parse::<u32>("FLOWLINE_TEST_MISSING_12345").unwrap().is_none());
        assert!(env_bool("FLOWLINE_TEST_MISSING_12345").unwrap().is_none());
    }

    #[test]
    fn test_env_parse() {
        env::set_var("FLOWLINE_TEST_PARSE_NUMBER", " 42 ");
        assert_eq!(env_parse::<usize>("FLOWLINE_TEST_PARSE_NUMBER").unwrap(), Some(42));
        env::remove_var("FLOWLINE_TEST_PARSE_NUMBER");
    }

    #[test]
    fn test_env_parse_invalid() {
        env::set_var("FLOWLINE_TEST_PARSE_INVALID", "many");
        assert!(env_parse::<usize>("FLOWLINE_TEST_PARSE_INVALID").is_err());
        env::remove_var("FLOWLINE_TEST_PARSE_INVALID");
    }

    #[test]
    fn test_env_bool_values() {
        for (raw, expected) in [("on", true), ("YES", true), ("0", false), ("off", false)] {
            env::set_var("FLOWLINE_TEST_BOOL", raw);
            assert_eq!(env_bool("FLOWLINE_TEST_BOOL").unwrap(), Some(expected), "value {}", raw);
        }
        env::remove_var("FLOWLINE_TEST_BOOL");
    }

    #[test]
    fn test_env_bool_invalid() {
        env::set_var("FLOWLINE_TEST_BOOL_INVALID", "sometimes");
        assert!(env_bool("FLOWLINE_TEST_BOOL_INVALID").is_err());
        env::remove_var("FLOWLINE_TEST_BOOL_INVALID");
    }
}
