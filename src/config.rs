//! Configuration for the relay gateway.
//!
//! Configuration is read from environment variables:
//! - `RELAY_HOST` - Optional. Listen host. Defaults to `127.0.0.1`.
//! - `RELAY_PORT` - Optional. Listen port. Defaults to `3000`.
//! - `RELAY_CHANNELS_FILE` - Optional. JSON array of channels. Defaults to `channels.json`.
//! - `RELAY_DATABASE_PATH` - Optional. SQLite file for task bindings. Empty keeps bindings in memory.
//!   Defaults to `data/relay.db`.
//! - `RELAY_RETRY_TIMES` - Optional. Extra channel attempts after the first. Defaults to `3`.
//! - `RELAY_REQUEST_TIMEOUT_SECS` - Optional. Per-request deadline. Defaults to `300`.
//! - `RELAY_GEMINI_API_VERSION` - Optional. Gemini API version for stable models. Defaults to `v1`.
//! - `RELAY_DEFAULT_VIDEO_MODEL` - Optional. Model used when a video request names none.
//!   Defaults to `sora-2`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub channels_file: PathBuf,
    /// `None` selects the in-memory binding store.
    pub database_path: Option<PathBuf>,
    pub retry_times: u32,
    pub request_timeout: Duration,
    pub gemini_api_version: String,
    pub default_video_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            channels_file: PathBuf::from("channels.json"),
            database_path: Some(PathBuf::from("data/relay.db")),
            retry_times: 3,
            request_timeout: Duration::from_secs(300),
            gemini_api_version: "v1".to_string(),
            default_video_model: "sora-2".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key → value source. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
        };

        let database_path = match lookup("RELAY_DATABASE_PATH") {
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(PathBuf::from(v.trim())),
            None => defaults.database_path,
        };

        let timeout_secs: u64 = parse(&lookup, "RELAY_REQUEST_TIMEOUT_SECS", 300)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_REQUEST_TIMEOUT_SECS".to_string(),
                "must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            host: text("RELAY_HOST", defaults.host),
            port: parse(&lookup, "RELAY_PORT", defaults.port)?,
            channels_file: PathBuf::from(text(
                "RELAY_CHANNELS_FILE",
                defaults.channels_file.to_string_lossy().into_owned(),
            )),
            database_path,
            retry_times: parse(&lookup, "RELAY_RETRY_TIMES", defaults.retry_times)?,
            request_timeout: Duration::from_secs(timeout_secs),
            gemini_api_version: text("RELAY_GEMINI_API_VERSION", defaults.gemini_api_version),
            default_video_model: text("RELAY_DEFAULT_VIDEO_MODEL", defaults.default_video_model),
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) => v
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}
