//! Probe module for endpoint health checks.
//!
//! Supports HTTP, Modbus-TCP, and composite Modbus + data-freshness probes. Each
//! probe makes exactly one attempt and never returns an error: failures are
//! classified into a [`ProbeOutcome`].

pub mod classify;
mod freshness;
mod http;
mod modbus;

pub use freshness::*;
pub use http::*;
pub use modbus::*;

use serde::Serialize;

use crate::clock::Clock;
use crate::db::{DataPipeline, ErrorKind, ProtocolKind, Status, Target};

/// Classified result of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub status: Status,
    pub message: String,
    /// Wall-clock cost of the probe, rounded to milliseconds.
    pub duration_ms: u64,
    pub is_timeout: bool,
    pub error_kind: Option<ErrorKind>,
}

impl ProbeOutcome {
    pub fn online(message: String, duration_ms: u64) -> Self {
        Self {
            status: Status::Online,
            message,
            duration_ms,
            is_timeout: false,
            error_kind: None,
        }
    }

    pub fn failed(status: Status, kind: ErrorKind, message: String, duration_ms: u64) -> Self {
        Self {
            status,
            message,
            duration_ms,
            is_timeout: matches!(kind, ErrorKind::Timeout | ErrorKind::ModbusTimeout),
            error_kind: Some(kind),
        }
    }
}

/// Probe a target once using its configured protocol.
pub async fn run_probe(target: &Target, pipeline: &dyn DataPipeline, clock: &dyn Clock) -> ProbeOutcome {
    let timeout = target.timeout_duration();

    let settings = match target.settings() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Target {} has unusable probe_config: {}", target.name, e);
            return classify::misconfigured(target.probe_type, &e.to_string());
        }
    };

    match target.probe_type {
        ProtocolKind::Http => run_http_probe(&target.address, timeout).await,
        ProtocolKind::Modbus => run_modbus_probe(&target.address, &settings, timeout).await,
        ProtocolKind::CompositeFreshness => {
            run_freshness_probe(&target.address, &settings, timeout, pipeline, clock).await
        }
    }
}
