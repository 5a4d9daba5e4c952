//! Runtime configuration read from the environment (after `.env` loading).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::dedup::DEFAULT_DEDUP_CAPACITY;
use crate::locking::DEFAULT_DUPLICATE_WINDOW_SECS;

pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub channel_access_token: String,
    pub channel_secret: String,
    pub port: u16,
    /// None means TAMBUN_DB_PATH or ~/.tambun/ledger.redb
    pub db_path: Option<String>,
    pub uploads_dir: PathBuf,
    pub dedup_capacity: usize,
    pub duplicate_window_secs: u64,
}

/// Parse an env var, keeping `default` when it is unset or malformed
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring malformed {}={}", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            channel_access_token: std::env::var("LINE_CHANNEL_ACCESS_TOKEN").unwrap_or_default(),
            channel_secret: std::env::var("LINE_CHANNEL_SECRET").unwrap_or_default(),
            port: env_or("PORT", DEFAULT_PORT),
            db_path: std::env::var("TAMBUN_DB_PATH").ok(),
            uploads_dir: std::env::var("TAMBUN_UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./uploads")),
            dedup_capacity: env_or("TAMBUN_DEDUP_CAPACITY", DEFAULT_DEDUP_CAPACITY),
            duplicate_window_secs: env_or("TAMBUN_DUPLICATE_WINDOW_SECS", DEFAULT_DUPLICATE_WINDOW_SECS),
        }
    }
}

impl BotConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    /// Missing credentials are not fatal: the CLI still works offline
    pub fn warn_if_incomplete(&self) {
        if self.channel_access_token.is_empty() {
            warn!("LINE_CHANNEL_ACCESS_TOKEN not set - replies will fail");
        }
        if self.channel_secret.is_empty() {
            warn!("LINE_CHANNEL_SECRET not set - every webhook will be rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back() {
        std::env::set_var("TAMBUN_TEST_NUMBER", "42");
        std::env::set_var("TAMBUN_TEST_GARBAGE", "forty-two");
        assert_eq!(env_or("TAMBUN_TEST_NUMBER", 7u16), 42);
        assert_eq!(env_or("TAMBUN_TEST_GARBAGE", 7u16), 7);
        assert_eq!(env_or("TAMBUN_TEST_UNSET_VAR", 7u16), 7);
    }

    #[test]
    fn test_duplicate_window() {
        let config = BotConfig {
            duplicate_window_secs: 90,
            ..BotConfig::default()
        };
        assert_eq!(config.duplicate_window(), Duration::from_secs(90));
    }
}
