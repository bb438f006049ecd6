//! Parsing of `FERRY_*` settings, shared by the server and client binaries.
//!
//! Values come from any key lookup (the process environment in the binaries,
//! a map in tests). Unset and blank keys are treated alike.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Parse `key`, or `None` when it is unset or blank.
pub fn parse_opt<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match var(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

/// Parse `key`, falling back to `default` when it is unset or blank.
pub fn parse_or<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    Ok(parse_opt(var, key)?.unwrap_or(default))
}
