//! Environment-style settings
//!
//! Both binaries read `MTAP_*` variables. Loaders take a lookup closure so
//! tests can feed values without touching the process environment.

use std::str::FromStr;

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

/// Lookup from the real process environment
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Read and parse `key`, falling back to `default` when unset or blank
pub fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Read a string, falling back to `default` when unset or blank
pub fn string_var<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Read a duration given in (fractional) seconds
pub fn seconds_var<F>(
    lookup: &F,
    key: &str,
    default: std::time::Duration,
) -> Result<std::time::Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_var(lookup, key, default.as_secs_f64())?;
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: key.to_string(),
        value: secs.to_string(),
        reason,
    };
    if !secs.is_finite() || secs <= 0.0 {
        return Err(invalid("must be a positive number of seconds".into()));
    }
    std::time::Duration::try_from_secs_f64(secs).map_err(|e| invalid(e.to_string()))
}
