//! Event-driven persistence of probe results.
//!
//! A probe result is written only when the status changes, when the target has no
//! history, or when the calendar day rolled over since the last entry. Every other
//! probe just reports how long the current status has held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::db::{ErrorKind, LogStore, StateLogEntry, Status, Target};
use crate::probe::ProbeOutcome;

/// What a probe cycle reports back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub target: String,
    pub status: Status,
    pub previous_status: Option<Status>,
    pub status_changed: bool,
    pub message: String,
    pub duration_ms: u64,
    pub is_timeout: bool,
    /// Configured timeout of the target, in seconds.
    pub timeout_duration: f64,
    pub error_kind: Option<ErrorKind>,
    /// Seconds the current status has held; 0 when this probe was logged.
    pub uptime_seconds: i64,
    pub log_id: Option<i64>,
    pub logged: bool,
    pub checked_at: DateTime<Utc>,
}

/// The logging decision for one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous_status: Option<Status>,
    pub status_changed: bool,
    pub should_log: bool,
    pub uptime_seconds: i64,
}

/// Decide whether a probe with `status` at `now` must be logged after `last`.
///
/// Calendar days are evaluated in `day_offset`.
pub fn evaluate(
    last: Option<&StateLogEntry>,
    status: Status,
    now: DateTime<Utc>,
    day_offset: FixedOffset,
) -> Transition {
    let previous_status = last.map(|e| e.status);
    let status_changed = previous_status != Some(status);
    let is_different_day = last.map_or(false, |e| {
        e.checked_at.with_timezone(&day_offset).date_naive()
            != now.with_timezone(&day_offset).date_naive()
    });
    let should_log = status_changed || last.is_none() || is_different_day;

    let uptime_seconds = match last {
        Some(e) if !should_log => (now - e.checked_at).num_seconds().abs(),
        _ => 0,
    };

    Transition {
        previous_status,
        status_changed,
        should_log,
        uptime_seconds,
    }
}

/// Writes transitions to the log store, one target at a time.
pub struct TransitionLogger {
    store: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    day_offset: FixedOffset,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TransitionLogger {
    pub fn new(store: Arc<dyn LogStore>, clock: Arc<dyn Clock>, day_offset: FixedOffset) -> Self {
        Self {
            store,
            clock,
            day_offset,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn target_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    /// Drop the lock kept for a target that no longer exists.
    pub fn forget(&self, name: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(name);
    }

    /// Record a classified outcome for `target`.
    ///
    /// Store failures never propagate; they show up as `logged = false`.
    pub async fn record(&self, target: &Target, outcome: ProbeOutcome) -> ProbeResult {
        let lock = self.target_lock(&target.name);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let mut result = ProbeResult {
            target: target.name.clone(),
            status: outcome.status,
            previous_status: None,
            status_changed: false,
            message: outcome.message,
            duration_ms: outcome.duration_ms,
            is_timeout: outcome.is_timeout,
            timeout_duration: target.timeout,
            error_kind: outcome.error_kind,
            uptime_seconds: 0,
            log_id: None,
            logged: false,
            checked_at: now,
        };

        let last = match self.store.get_last(&target.name) {
            Ok(last) => last,
            Err(e) => {
                tracing::error!("Failed to read last state for {}: {}", target.name, e);
                return result;
            }
        };

        let transition = evaluate(last.as_ref(), outcome.status, now, self.day_offset);
        result.previous_status = transition.previous_status;
        result.status_changed = transition.status_changed;
        result.uptime_seconds = transition.uptime_seconds;

        if !transition.should_log {
            return result;
        }

        let entry = StateLogEntry {
            id: 0,
            target_name: target.name.clone(),
            address: target.address.clone(),
            status: result.status,
            previous_status: result.previous_status,
            message: result.message.clone(),
            duration_ms: result.duration_ms,
            is_timeout: result.is_timeout,
            configured_timeout: target.timeout,
            error_kind: result.error_kind,
            checked_at: now,
        };

        match self.store.append(&entry) {
            Ok(id) => {
                result.log_id = Some(id);
                result.logged = true;
                if transition.status_changed {
                    match (transition.previous_status, result.status) {
                        (Some(prev), Status::Offline) => tracing::warn!(
                            "{} went {} -> offline: {}",
                            target.name,
                            prev,
                            result.message
                        ),
                        (Some(prev), status) => tracing::info!("{} went {} -> {}", target.name, prev, status),
                        (None, status) => tracing::info!("{} first seen {}", target.name, status),
                    }
                } else {
                    tracing::debug!("{} daily checkpoint ({})", target.name, result.status);
                }
            }
            Err(e) => {
                tracing::error!("Failed to append state log for {}: {}", target.name, e);
            }
        }

        result
    }
}
