//! Typed environment configuration helpers.
//!
//! Every setting is resolved exactly once, at load time, into an explicit
//! typed value. A variable is either absent (`None`) or present with a
//! value that must parse; `false`, `0`, and the empty string are ordinary
//! present values and are never replaced by a default. Only absence falls
//! back to a default, and a value that fails to parse is an error rather
//! than a silent fallback.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Errors raised while resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is required")]
    Missing { key: String },

    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Where configuration values come from.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment (after `dotenvy` has loaded any `.env` file).
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Read and parse an optional variable.
pub fn env_opt<T>(env: &dyn EnvSource, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env.var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

/// Read a required variable.
pub fn env_required<T>(env: &dyn EnvSource, key: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    env_opt(env, key)?.ok_or_else(|| ConfigError::Missing {
        key: key.to_string(),
    })
}

/// Read a variable, using `default` only when it is absent.
pub fn env_or<T>(env: &dyn EnvSource, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(env_opt(env, key)?.unwrap_or(default))
}

/// Read an optional boolean (`true/false`, `1/0`, `yes/no`, `on/off`).
pub fn env_bool(env: &dyn EnvSource, key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = env.var(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}

/// Read an optional duration given in milliseconds.
pub fn env_millis(env: &dyn EnvSource, key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_opt::<u64>(env, key)?.map(Duration::from_millis))
}

/// Read an optional comma-separated list. An empty value is an empty list.
pub fn env_list(env: &dyn EnvSource, key: &str) -> Option<Vec<String>> {
    env.var(key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}
