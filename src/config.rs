//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use chrono::{FixedOffset, Offset, Utc};
use std::env;
use std::str::FromStr;

const MAX_RETENTION_DAYS: i64 = 36_500;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// Days of state log history to keep (default: 90)
    pub retention_days: i64,
    /// Offset from UTC, in minutes, that defines calendar days (default: 0)
    pub utc_offset_minutes: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptrail.db".to_string(),
            retention_days: 90,
            utc_offset_minutes: 0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `UPTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `UPTRAIL_DB_PATH`: Database file path (default: "uptrail.db")
    /// - `UPTRAIL_RETENTION_DAYS`: State log retention in days (default: 90)
    /// - `UPTRAIL_UTC_OFFSET_MINUTES`: Offset for day boundaries (default: 0)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var(&lookup, "UPTRAIL_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(days) = parse_var::<i64>(&lookup, "UPTRAIL_RETENTION_DAYS") {
            if (1..=MAX_RETENTION_DAYS).contains(&days) {
                cfg.retention_days = days;
            } else {
                tracing::warn!("Ignoring out-of-range UPTRAIL_RETENTION_DAYS={}", days);
            }
        }

        if let Some(minutes) = parse_var::<i32>(&lookup, "UPTRAIL_UTC_OFFSET_MINUTES") {
            if offset_from_minutes(minutes).is_some() {
                cfg.utc_offset_minutes = minutes;
            } else {
                tracing::warn!("Ignoring out-of-range UPTRAIL_UTC_OFFSET_MINUTES={}", minutes);
            }
        }

        cfg
    }

    /// The offset in which calendar days are evaluated.
    pub fn day_offset(&self) -> FixedOffset {
        offset_from_minutes(self.utc_offset_minutes).unwrap_or_else(|| Utc.fix())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    minutes.checked_mul(60).and_then(FixedOffset::east_opt)
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={}", key, raw);
            None
        }
    }
}
