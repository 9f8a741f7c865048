//! Retention manager for cleaning up old state log entries.

use crate::monitor::Monitor;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Manager for deleting log entries past the retention period.
pub struct RetentionManager {
    monitor: Arc<Monitor>,
    retention: chrono::Duration,
    stop: Arc<Mutex<Option<broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(monitor: Arc<Monitor>, retention: chrono::Duration) -> Self {
        Self {
            monitor,
            retention,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub async fn start(&self) {
        let (tx, mut rx) = broadcast::channel(1);
        {
            let mut stop_guard = self.stop.lock().await;
            if stop_guard.is_some() {
                return;
            }
            *stop_guard = Some(tx);
        }

        let monitor = self.monitor.clone();
        let retention = self.retention;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&monitor, retention);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let mut stop = self.stop.lock().await;
        if let Some(tx) = stop.take() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(monitor: &Monitor, retention: chrono::Duration) -> usize {
    let cutoff = monitor.now() - retention;
    match monitor.purge_before(cutoff) {
        Ok(deleted) => deleted,
        Err(e) => {
            tracing::error!("RetentionManager: Failed to purge state logs before {}: {}", cutoff, e);
            0
        }
    }
}
