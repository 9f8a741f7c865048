//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, ProtocolKind, Target};
use crate::monitor::MonitorError;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

fn error_response(err: MonitorError) -> Response {
    match err {
        MonitorError::UnknownTarget(name) => {
            (StatusCode::NOT_FOUND, format!("Target not found: {}", name)).into_response()
        }
        MonitorError::Store(DbError::NotFound) => (StatusCode::NOT_FOUND, "Not found").into_response(),
        MonitorError::InvalidWindow { .. } => (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        MonitorError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Parse an optional RFC 3339 query parameter.
fn parse_time(value: Option<&str>, name: &str) -> Result<Option<DateTime<Utc>>, Response> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid {}: {}", name, e)).into_response()),
    }
}

// ============================================================================
// API: Targets
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    match state.monitor.targets() {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub name: String,
    pub address: String,
    pub probe_type: ProtocolKind,
    #[serde(default)]
    pub probe_config: Option<serde_json::Value>,
    #[serde(default)]
    pub probe_interval: f64,
    #[serde(default)]
    pub timeout: f64,
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<CreateTargetRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() || req.address.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "name and address are required").into_response();
    }

    let mut target = Target {
        id: 0,
        name: req.name,
        address: req.address,
        probe_type: req.probe_type,
        probe_config: req
            .probe_config
            .map(|v| v.to_string())
            .unwrap_or_else(|| "{}".to_string()),
        probe_interval: if req.probe_interval <= 0.0 { 60.0 } else { req.probe_interval },
        timeout: if req.timeout <= 0.0 { 5.0 } else { req.timeout },
    };

    if let Err(e) = target.settings().and_then(|_| target.check_timing()) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    match state.store.add_target(&mut target) {
        Ok(_) => {
            state.scheduler.add_target(target.clone()).await;
            (StatusCode::CREATED, Json(target)).into_response()
        }
        Err(DbError::Sqlite(e)) if is_constraint_violation(&e) => {
            (StatusCode::CONFLICT, "A target with that name already exists").into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    state.scheduler.remove_target(&name).await;

    match state.store.delete_target(&name) {
        Ok(_) => {
            state.monitor.forget_target(&name);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(DbError::NotFound) => (StatusCode::NOT_FOUND, "Target not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_probe_target(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.monitor.probe_named(&name).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_probe_all(State(state): State<AppState>) -> impl IntoResponse {
    match state.monitor.targets() {
        Ok(targets) => Json(state.monitor.probe_many(&targets).await).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: History and stats
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

impl WindowQuery {
    /// Resolve the window, defaulting to the 24 hours before `end` (or now).
    fn resolve(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), Response> {
        let end = parse_time(self.end.as_deref(), "end")?.unwrap_or_else(Utc::now);
        let start = parse_time(self.start.as_deref(), "start")?.unwrap_or(end - ChronoDuration::hours(24));
        Ok((start, end))
    }
}

pub async fn handle_get_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let (start, end) = match query.resolve() {
        Ok(window) => window,
        Err(resp) => return resp,
    };

    if let Err(e) = state.monitor.target(&name) {
        return error_response(e);
    }

    match state.monitor.history(&name, start, end) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub target: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: crate::monitor::ReconstructedStats,
}

pub async fn handle_get_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let (start, end) = match query.resolve() {
        Ok(window) => window,
        Err(resp) => return resp,
    };

    if let Err(e) = state.monitor.target(&name) {
        return error_response(e);
    }

    match state.monitor.reconstruct(&name, start, end) {
        Ok(stats) => Json(StatsResponse {
            target: name,
            start,
            end,
            stats,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: Retention
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    pub before: String,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub deleted: usize,
}

pub async fn handle_purge_logs(
    State(state): State<AppState>,
    Query(query): Query<PurgeQuery>,
) -> impl IntoResponse {
    let cutoff = match parse_time(Some(&query.before), "before") {
        Ok(Some(cutoff)) => cutoff,
        Ok(None) => return (StatusCode::BAD_REQUEST, "before is required").into_response(),
        Err(resp) => return resp,
    };

    match state.monitor.purge_before(cutoff) {
        Ok(deleted) => Json(PurgeResponse { deleted }).into_response(),
        Err(e) => error_response(e),
    }
}
