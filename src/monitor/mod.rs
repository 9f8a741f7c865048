//! Probe, log and report: the monitor ties probes to the transition log.

mod transition;
mod uptime;

pub use transition::*;
pub use uptime::*;

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

use crate::clock::Clock;
use crate::db::{DataPipeline, DbError, LogStore, StateLogEntry, Target, TargetRegistry};
use crate::probe::run_probe;

/// Monitor error types.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("storage error: {0}")]
    Store(#[from] DbError),
    #[error("invalid window: start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("unknown target: {0}")]
    UnknownTarget(String),
}

/// Entry point for probing targets and reporting on their history.
pub struct Monitor {
    registry: Arc<dyn TargetRegistry>,
    logs: Arc<dyn LogStore>,
    pipeline: Arc<dyn DataPipeline>,
    clock: Arc<dyn Clock>,
    logger: TransitionLogger,
}

impl Monitor {
    pub fn new(
        registry: Arc<dyn TargetRegistry>,
        logs: Arc<dyn LogStore>,
        pipeline: Arc<dyn DataPipeline>,
        clock: Arc<dyn Clock>,
        day_offset: FixedOffset,
    ) -> Self {
        let logger = TransitionLogger::new(logs.clone(), clock.clone(), day_offset);
        Self {
            registry,
            logs,
            pipeline,
            clock,
            logger,
        }
    }

    /// Probe a target once and record the result if it is a transition.
    pub async fn probe(&self, target: &Target) -> ProbeResult {
        let outcome = run_probe(target, self.pipeline.as_ref(), self.clock.as_ref()).await;
        self.logger.record(target, outcome).await
    }

    /// Probe targets one after another.
    pub async fn probe_many(&self, targets: &[Target]) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.probe(target).await);
        }
        results
    }

    /// Look a target up in the registry and probe it.
    pub async fn probe_named(&self, name: &str) -> Result<ProbeResult, MonitorError> {
        let target = self.target(name)?;
        Ok(self.probe(&target).await)
    }

    pub fn targets(&self) -> Result<Vec<Target>, MonitorError> {
        Ok(self.registry.list_targets()?)
    }

    pub fn target(&self, name: &str) -> Result<Target, MonitorError> {
        match self.registry.get_target(name) {
            Ok(target) => Ok(target),
            Err(DbError::NotFound) => Err(MonitorError::UnknownTarget(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Logged transitions for a target inside `[start, end]`.
    pub fn history(
        &self,
        target_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StateLogEntry>, MonitorError> {
        check_window(start, end)?;
        Ok(self.logs.query_range(target_name, start, end)?)
    }

    /// Online/offline/timeout totals for a target over `[start, end]`.
    pub fn reconstruct(
        &self,
        target_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReconstructedStats, MonitorError> {
        let entries = self.history(target_name, start, end)?;
        Ok(reconstruct(&entries, end, self.clock.now()))
    }

    /// Current time on the monitor's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Release per-target state after a target is deleted.
    pub fn forget_target(&self, name: &str) {
        self.logger.forget(name);
    }

    /// Drop log entries older than `cutoff`.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, MonitorError> {
        let deleted = self.logs.purge_before(cutoff)?;
        if deleted > 0 {
            tracing::info!("Purged {} state log entries before {}", deleted, cutoff);
        }
        Ok(deleted)
    }
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), MonitorError> {
    if start > end {
        return Err(MonitorError::InvalidWindow { start, end });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{ErrorKind, ProtocolKind, Status, Store};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    fn monitor(store: Arc<Store>, clock: Arc<ManualClock>) -> Monitor {
        Monitor::new(
            store.clone(),
            store.clone(),
            store,
            clock,
            FixedOffset::east_opt(0).unwrap(),
        )
    }

    /// Answer every connection with the same HTTP status.
    async fn http_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!("{}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status_line);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        addr.to_string()
    }

    fn entry(status: Status, at: DateTime<Utc>) -> StateLogEntry {
        StateLogEntry {
            id: 0,
            target_name: "boiler".to_string(),
            address: "10.0.0.9".to_string(),
            status,
            previous_status: None,
            message: String::new(),
            duration_ms: 1,
            is_timeout: false,
            configured_timeout: 5.0,
            error_kind: None,
            checked_at: at,
        }
    }

    #[tokio::test]
    async fn test_probe_logs_transitions_only() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()));
        let monitor = monitor(store.clone(), clock.clone());

        let mut target = Target {
            name: "historian-api".to_string(),
            address: http_server("HTTP/1.1 200 OK").await,
            probe_type: ProtocolKind::Http,
            timeout: 2.0,
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();

        let first = assert_ok!(monitor.probe_named("historian-api").await);
        assert_eq!(first.status, Status::Online);
        assert!(first.logged);

        clock.advance(ChronoDuration::seconds(90));
        let second = monitor.probe(&target).await;
        assert!(!second.logged);
        assert_eq!(second.uptime_seconds, 90);

        target.address = http_server("HTTP/1.1 500 Internal Server Error").await;
        clock.advance(ChronoDuration::seconds(30));
        let third = monitor.probe(&target).await;
        assert!(third.logged);
        assert!(third.status_changed);
        assert_eq!(third.previous_status, Some(Status::Online));
        assert_eq!(third.error_kind, Some(ErrorKind::ServerError));

        clock.advance(ChronoDuration::seconds(60));
        let stats = monitor
            .reconstruct("historian-api", clock.now() - ChronoDuration::hours(1), clock.now())
            .unwrap();
        assert_eq!(stats.online_duration, 120);
        assert_eq!(stats.timeout_duration, 60);
    }

    #[tokio::test]
    async fn test_probe_many_is_sequential_and_complete() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()));
        let monitor = monitor(store, clock);

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap().to_string();
        drop(closed);

        let targets = vec![
            Target {
                name: "web".to_string(),
                address: http_server("HTTP/1.1 200 OK").await,
                timeout: 2.0,
                ..Default::default()
            },
            Target {
                name: "plc".to_string(),
                address: closed_addr,
                probe_type: ProtocolKind::Modbus,
                timeout: 2.0,
                ..Default::default()
            },
            Target {
                name: "meter".to_string(),
                address: "127.0.0.1".to_string(),
                probe_type: ProtocolKind::CompositeFreshness,
                probe_config: "{}".to_string(),
                ..Default::default()
            },
        ];

        let results = monitor.probe_many(&targets).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].status, Status::Online);
        assert_eq!(results[1].error_kind, Some(ErrorKind::ModbusConnectionRefused));
        // Missing device_class: configuration error in the Modbus bucket.
        assert_eq!(results[2].error_kind, Some(ErrorKind::ModbusError));
        assert!(results.iter().all(|r| r.logged));
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let monitor = monitor(store, Arc::new(ManualClock::new(Utc::now())));

        let err = assert_err!(monitor.probe_named("ghost").await);
        assert!(matches!(err, MonitorError::UnknownTarget(_)));
    }

    #[test]
    fn test_reconstruct_rejects_inverted_window() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let monitor = monitor(store, Arc::new(ManualClock::new(now)));

        let err = monitor.reconstruct("boiler", now, now - ChronoDuration::hours(1));
        assert!(matches!(err, Err(MonitorError::InvalidWindow { .. })));
    }

    #[test]
    fn test_run_started_before_window_is_truncated() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let start = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let end = start + ChronoDuration::hours(1);
        let monitor = monitor(store.clone(), Arc::new(ManualClock::new(end + ChronoDuration::days(1))));

        // Offline since before the window, back online ten minutes in.
        store.append(&entry(Status::Offline, start - ChronoDuration::hours(1))).unwrap();
        store.append(&entry(Status::Online, start + ChronoDuration::minutes(10))).unwrap();

        let stats = monitor.reconstruct("boiler", start, end).unwrap();
        assert_eq!(stats.online_duration, 50 * 60);
        // The leading ten offline minutes fall outside the fetched evidence.
        assert_eq!(stats.offline_duration, 0);
        assert_eq!(stats.timeout_duration, 0);
        assert_eq!(stats.online_percentage, 100.0);
    }

    #[test]
    fn test_purge_before() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let monitor = monitor(store.clone(), Arc::new(ManualClock::new(now)));

        store.append(&entry(Status::Online, now - ChronoDuration::days(100))).unwrap();
        store.append(&entry(Status::Offline, now - ChronoDuration::days(1))).unwrap();

        assert_eq!(monitor.purge_before(now - ChronoDuration::days(90)).unwrap(), 1);
        assert_eq!(monitor.purge_before(now - ChronoDuration::days(90)).unwrap(), 0);
    }
}
