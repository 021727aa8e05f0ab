//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the client can start with zero
//! configuration.

use std::path::PathBuf;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// SQLite database file.
    /// Env: `PARLEY_DB_PATH`
    /// Default: platform data directory (`None` here).
    pub database_path: Option<PathBuf>,

    /// Number of most recent messages fetched and decrypted per conversation.
    /// Env: `PARLEY_HISTORY_LIMIT`
    /// Default: `50`
    pub history_limit: u32,

    /// Store the message as plaintext when encryption is unavailable,
    /// telling the caller it happened. Off means the send fails instead.
    /// Env: `PARLEY_PLAINTEXT_FALLBACK` (true/false)
    /// Default: `false`
    pub plaintext_fallback: bool,

    /// Sends allowed per actor within one window.
    /// Env: `PARLEY_SEND_RATE_MAX`
    /// Default: `10`
    pub send_rate_max: u32,

    /// Length of the send rate window in seconds.
    /// Env: `PARLEY_SEND_RATE_WINDOW_SECS`
    /// Default: `60`
    pub send_rate_window_secs: u64,

    /// How often a watched database is checked for messages written by
    /// other processes, in milliseconds.
    /// Env: `PARLEY_FEED_POLL_MS`
    /// Default: `500`
    pub feed_poll_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            history_limit: 50,
            plaintext_fallback: false,
            send_rate_max: 10,
            send_rate_window_secs: 60,
            feed_poll_ms: 500,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("PARLEY_DB_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = lookup("PARLEY_HISTORY_LIMIT") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.history_limit = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_HISTORY_LIMIT, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_PLAINTEXT_FALLBACK") {
            config.plaintext_fallback = val == "true" || val == "1";
        }

        if let Some(val) = lookup("PARLEY_SEND_RATE_MAX") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.send_rate_max = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_SEND_RATE_MAX, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_SEND_RATE_WINDOW_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.send_rate_window_secs = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid PARLEY_SEND_RATE_WINDOW_SECS, using default"
                ),
            }
        }

        if let Some(val) = lookup("PARLEY_FEED_POLL_MS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.feed_poll_ms = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_FEED_POLL_MS, using default"),
            }
        }

        config
    }
}
