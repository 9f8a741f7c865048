//! Database model types.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Returned when a stored or submitted string is not a known enum value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Invalid protocol settings on a target.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid probe_config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Implements string conversions plus SQLite text mapping for a closed enum.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// Health state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
    /// Reachable but not doing useful work (client errors, missing or stale data).
    Idle,
}

text_enum!(Status, "status", {
    Online => "online",
    Offline => "offline",
    Idle => "idle",
});

/// Closed taxonomy of probe failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ServerError,
    ClientError,
    Timeout,
    ConnectionRefused,
    DnsFailure,
    ConnectionError,
    UnknownError,
    ModbusNoResponse,
    ModbusTimeout,
    ModbusConnectionRefused,
    ModbusError,
}

text_enum!(ErrorKind, "error kind", {
    ServerError => "server_error",
    ClientError => "client_error",
    Timeout => "timeout",
    ConnectionRefused => "connection_refused",
    DnsFailure => "dns_failure",
    ConnectionError => "connection_error",
    UnknownError => "unknown_error",
    ModbusNoResponse => "modbus_no_response",
    ModbusTimeout => "modbus_timeout",
    ModbusConnectionRefused => "modbus_connection_refused",
    ModbusError => "modbus_error",
});

/// Protocol used to probe a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Http,
    Modbus,
    /// Modbus connectivity plus a freshness check on pipeline data.
    CompositeFreshness,
}

text_enum!(ProtocolKind, "protocol", {
    Http => "http",
    Modbus => "modbus",
    CompositeFreshness => "composite-freshness",
});

/// Which Modbus register table to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Holding,
    Input,
}

/// Protocol-specific settings, stored as JSON in `targets.probe_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub port: Option<u16>,
    pub unit_id: Option<u8>,
    pub registers: Vec<u16>,
    pub quantity: Option<u16>,
    pub register_kind: RegisterKind,
    /// Data pipeline device class consulted by freshness checks.
    pub device_class: Option<String>,
}

/// A monitored target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub probe_type: ProtocolKind,
    pub probe_config: String,
    /// Seconds between scheduled probes.
    pub probe_interval: f64,
    /// Per-check timeout in seconds.
    pub timeout: f64,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            probe_type: ProtocolKind::Http,
            probe_config: "{}".to_string(),
            probe_interval: 60.0,
            timeout: 5.0,
        }
    }
}

impl Target {
    /// Parse and validate `probe_config` for this target's protocol.
    pub fn settings(&self) -> Result<ProbeSettings, ConfigError> {
        let settings: ProbeSettings = if self.probe_config.trim().is_empty() {
            ProbeSettings::default()
        } else {
            serde_json::from_str(&self.probe_config)?
        };

        if let Some(quantity) = settings.quantity {
            if quantity == 0 || quantity > 125 {
                return Err(ConfigError::Invalid(format!(
                    "register quantity must be 1..=125, got {}",
                    quantity
                )));
            }
        }

        if self.probe_type == ProtocolKind::CompositeFreshness
            && settings.device_class.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Invalid(
                "composite-freshness targets need a device_class".to_string(),
            ));
        }

        Ok(settings)
    }

    /// Reject a timeout or interval that is not a positive number of seconds up to [`MAX_PROBE_SECS`].
    pub fn check_timing(&self) -> Result<(), ConfigError> {
        for (field, value) in [("timeout", self.timeout), ("probe_interval", self.probe_interval)] {
            if !(value > 0.0 && value <= MAX_PROBE_SECS) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 0 and {} seconds, got {}",
                    field, MAX_PROBE_SECS, value
                )));
            }
        }
        Ok(())
    }

    pub fn timeout_duration(&self) -> Duration {
        seconds_or_default(self.timeout, DEFAULT_TIMEOUT_SECS)
    }

    pub fn interval_duration(&self) -> Duration {
        seconds_or_default(self.probe_interval, DEFAULT_INTERVAL_SECS)
    }
}

/// Longest accepted timeout or probe interval: one week.
pub const MAX_PROBE_SECS: f64 = 604_800.0;
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Non-positive values fall back to the default; large ones are capped.
fn seconds_or_default(value: f64, default_secs: u64) -> Duration {
    if !(value > 0.0) {
        return Duration::from_secs(default_secs);
    }
    Duration::try_from_secs_f64(value.min(MAX_PROBE_SECS)).unwrap_or(Duration::from_secs(default_secs))
}

/// A persisted health transition (or daily checkpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLogEntry {
    pub id: i64,
    pub target_name: String,
    pub address: String,
    pub status: Status,
    pub previous_status: Option<Status>,
    pub message: String,
    pub duration_ms: u64,
    pub is_timeout: bool,
    /// Timeout configured on the target at check time, in seconds.
    pub configured_timeout: f64,
    pub error_kind: Option<ErrorKind>,
    pub checked_at: DateTime<Utc>,
}
