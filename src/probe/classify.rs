//! Health classification.
//!
//! Turns raw adapter results into a [`ProbeOutcome`]. Everything here is pure so
//! the same taxonomy applies to every protocol and can be tested without a network.

use std::error::Error as StdError;
use std::io;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::ProbeOutcome;
use crate::db::{ErrorKind, ProtocolKind, Status};

/// Data older than this makes a composite target idle.
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Typed failure category, when the networking library tells us directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHint {
    Timeout,
    Refused,
    Dns,
}

/// A failure cause: an optional typed hint plus the full error-chain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureCause {
    pub hint: Option<FailureHint>,
    pub text: String,
}

impl FailureCause {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            hint: None,
            text: text.into(),
        }
    }

    pub fn timeout(text: impl Into<String>) -> Self {
        Self {
            hint: Some(FailureHint::Timeout),
            text: text.into(),
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        Self {
            hint: io_hint(err.kind()),
            text: error_chain(err),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let hint = if err.is_timeout() {
            Some(FailureHint::Timeout)
        } else {
            find_io_error(err).and_then(|io_err| io_hint(io_err.kind()))
        };

        Self {
            hint,
            text: error_chain(err),
        }
    }

    /// The hint if present, otherwise whatever the text suggests.
    fn resolve(&self) -> Option<FailureHint> {
        self.hint.or_else(|| hint_from_text(&self.text))
    }
}

/// Raw result of one HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpAttempt {
    /// The server answered with this status code.
    Response(u16),
    /// Connection-level failure (connect, timeout, request transport).
    Transport(FailureCause),
    /// Anything else, e.g. an unusable URL.
    Other(String),
}

/// Registers and exception codes gathered from Modbus replies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModbusReply {
    pub registers: Vec<u16>,
    pub exception: Option<u8>,
}

impl ModbusReply {
    pub fn merge(mut self, other: ModbusReply) -> Self {
        self.registers.extend(other.registers);
        self.exception = self.exception.or(other.exception);
        self
    }
}

/// Raw result of one Modbus-TCP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusAttempt {
    Response(ModbusReply),
    /// The connection closed before any reply frame arrived.
    NoResponse,
    Failed(FailureCause),
}

fn io_hint(kind: io::ErrorKind) -> Option<FailureHint> {
    match kind {
        io::ErrorKind::TimedOut => Some(FailureHint::Timeout),
        io::ErrorKind::ConnectionRefused => Some(FailureHint::Refused),
        _ => None,
    }
}

fn find_io_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}

/// Render an error with all of its sources, joined by `": "`.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let part = cause.to_string();
        if !text.contains(&part) {
            text.push_str(": ");
            text.push_str(&part);
        }
        source = cause.source();
    }
    text
}

fn hint_from_text(text: &str) -> Option<FailureHint> {
    static TIMEOUT: OnceLock<Regex> = OnceLock::new();
    static REFUSED: OnceLock<Regex> = OnceLock::new();
    static DNS: OnceLock<Regex> = OnceLock::new();

    let timeout = TIMEOUT.get_or_init(|| Regex::new(r"(?i)timed out|timeout|etimedout").unwrap());
    let refused = REFUSED.get_or_init(|| Regex::new(r"(?i)connection refused|econnrefused").unwrap());
    let dns = DNS.get_or_init(|| {
        Regex::new(
            r"(?i)could not resolve host|getaddrinfo|dns error|failed to lookup address|name or service not known|no such host",
        )
        .unwrap()
    });

    if timeout.is_match(text) {
        Some(FailureHint::Timeout)
    } else if refused.is_match(text) {
        Some(FailureHint::Refused)
    } else if dns.is_match(text) {
        Some(FailureHint::Dns)
    } else {
        None
    }
}

/// Milliseconds, rounded to the nearest whole value.
pub fn round_ms(elapsed: Duration) -> u64 {
    (elapsed.as_secs_f64() * 1000.0).round() as u64
}

pub fn classify_http(attempt: &HttpAttempt, elapsed: Duration) -> ProbeOutcome {
    let duration_ms = round_ms(elapsed);
    match attempt {
        HttpAttempt::Response(code) if (200..300).contains(code) => {
            ProbeOutcome::online(format!("HTTP {}", code), duration_ms)
        }
        HttpAttempt::Response(code) if *code >= 500 => ProbeOutcome::failed(
            Status::Offline,
            ErrorKind::ServerError,
            format!("HTTP {} server error", code),
            duration_ms,
        ),
        HttpAttempt::Response(code) => ProbeOutcome::failed(
            Status::Idle,
            ErrorKind::ClientError,
            format!("HTTP {} client error", code),
            duration_ms,
        ),
        HttpAttempt::Transport(cause) => {
            let (kind, label) = match cause.resolve() {
                Some(FailureHint::Timeout) => (ErrorKind::Timeout, "Request timed out"),
                Some(FailureHint::Refused) => (ErrorKind::ConnectionRefused, "Connection refused"),
                Some(FailureHint::Dns) => (ErrorKind::DnsFailure, "DNS resolution failed"),
                None => (ErrorKind::ConnectionError, "Connection error"),
            };
            ProbeOutcome::failed(
                Status::Offline,
                kind,
                format!("{}: {}", label, cause.text),
                duration_ms,
            )
        }
        HttpAttempt::Other(text) => ProbeOutcome::failed(
            Status::Offline,
            ErrorKind::UnknownError,
            format!("Unexpected error: {}", text),
            duration_ms,
        ),
    }
}

pub fn classify_modbus(attempt: &ModbusAttempt, elapsed: Duration) -> ProbeOutcome {
    let duration_ms = round_ms(elapsed);
    match attempt {
        ModbusAttempt::Response(reply) => {
            let message = match reply.exception {
                Some(code) => format!("Modbus device responded with exception code {}", code),
                None if reply.registers.is_empty() => {
                    "Modbus device responded with no register data".to_string()
                }
                None => format!("Modbus device responded ({} registers)", reply.registers.len()),
            };
            ProbeOutcome::online(message, duration_ms)
        }
        ModbusAttempt::NoResponse => ProbeOutcome::failed(
            Status::Offline,
            ErrorKind::ModbusNoResponse,
            "Modbus device closed the connection without responding".to_string(),
            duration_ms,
        ),
        ModbusAttempt::Failed(cause) => {
            let (kind, label) = match cause.resolve() {
                Some(FailureHint::Timeout) => (ErrorKind::ModbusTimeout, "Modbus request timed out"),
                Some(FailureHint::Refused) => {
                    (ErrorKind::ModbusConnectionRefused, "Modbus connection refused")
                }
                _ => (ErrorKind::ModbusError, "Modbus error"),
            };
            ProbeOutcome::failed(
                Status::Offline,
                kind,
                format!("{}: {}", label, cause.text),
                duration_ms,
            )
        }
    }
}

/// Combine a Modbus outcome with the newest pipeline record for the device class.
///
/// An offline device is passed through untouched.
pub fn classify_freshness(
    device: ProbeOutcome,
    latest: Result<Option<DateTime<Utc>>, String>,
    now: DateTime<Utc>,
    elapsed: Duration,
) -> ProbeOutcome {
    if device.status == Status::Offline {
        return device;
    }

    let duration_ms = round_ms(elapsed);
    let idle = |message: String| ProbeOutcome {
        status: Status::Idle,
        message,
        duration_ms,
        is_timeout: false,
        error_kind: None,
    };

    match latest {
        Err(e) => idle(format!("Connected but data source unavailable: {}", e)),
        Ok(None) => idle("Connected but no data yet".to_string()),
        Ok(Some(recorded_at)) => {
            let age = now.signed_duration_since(recorded_at);
            if age.num_seconds() > FRESHNESS_WINDOW_SECS {
                idle(format!(
                    "Connected but stale data: last record {} minutes ago",
                    age.num_minutes()
                ))
            } else {
                ProbeOutcome::online("Connected and data is fresh".to_string(), duration_ms)
            }
        }
    }
}

/// Outcome for a target whose protocol settings cannot be used.
pub fn misconfigured(protocol: ProtocolKind, reason: &str) -> ProbeOutcome {
    let kind = match protocol {
        ProtocolKind::Http => ErrorKind::UnknownError,
        ProtocolKind::Modbus | ProtocolKind::CompositeFreshness => ErrorKind::ModbusError,
    };
    ProbeOutcome::failed(
        Status::Offline,
        kind,
        format!("Invalid probe configuration: {}", reason),
        0,
    )
}
