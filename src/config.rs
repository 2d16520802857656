use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(lookup, key, default)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be at least 1 second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub users_file: Option<PathBuf>,
}

impl ServerConfig {
    pub const DEFAULT_DATABASE_URL: &'static str = "sqlite://evalboard.db";
    pub const DEFAULT_BIND_ADDR: &'static str = "127.0.0.1:3000";

    /// Reads the process environment after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_addr = SocketAddr::from(([127, 0, 0, 1], 3000));
        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| Self::DEFAULT_DATABASE_URL.to_string()),
            bind_addr: parse_or(&lookup, "BIND_ADDR", default_addr)?,
            users_file: lookup("USERS_FILE").map(PathBuf::from),
        })
    }
}

/// Bounded exponential backoff for queued remote writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base: Duration::from_secs(5),
            max_backoff: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next try after `attempts` failures:
    /// `base * 2^(attempts - 1)`, never more than `max_backoff`.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub api_base: String,
    pub database_url: String,
    pub timeout: Duration,
    pub replay_interval: Duration,
    pub retry: RetryPolicy,
}

impl SyncConfig {
    pub const DEFAULT_API_BASE: &'static str = "http://127.0.0.1:3000/api";
    pub const DEFAULT_DATABASE_URL: &'static str = "sqlite://evalsync.db";

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RetryPolicy::default();
        let max_attempts: u32 = parse_or(&lookup, "EVALSYNC_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "EVALSYNC_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let retry = RetryPolicy {
            max_attempts,
            base: secs_or(&lookup, "EVALSYNC_BACKOFF_BASE_SECS", defaults.base.as_secs())?,
            max_backoff: secs_or(
                &lookup,
                "EVALSYNC_MAX_BACKOFF_SECS",
                defaults.max_backoff.as_secs(),
            )?,
        };

        Ok(Self {
            api_base: lookup("EVALSYNC_API_BASE")
                .unwrap_or_else(|| Self::DEFAULT_API_BASE.to_string()),
            database_url: lookup("EVALSYNC_DATABASE_URL")
                .unwrap_or_else(|| Self::DEFAULT_DATABASE_URL.to_string()),
            timeout: secs_or(&lookup, "EVALSYNC_TIMEOUT_SECS", 10)?,
            replay_interval: secs_or(&lookup, "EVALSYNC_REPLAY_INTERVAL_SECS", 60)?,
            retry,
        })
    }
}
