//! Scheduler module: runs one probe loop per target plus log retention.

mod retention;

pub use retention::*;

use crate::db::Target;
use crate::monitor::Monitor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    monitor: Arc<Monitor>,
    stop_chans: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
    retention_manager: RetentionManager,
}

impl Scheduler {
    /// Create a new scheduler around the given monitor.
    pub fn new(monitor: Arc<Monitor>, retention: chrono::Duration) -> Self {
        let retention_manager = RetentionManager::new(monitor.clone(), retention);
        Self {
            monitor,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
            retention_manager,
        }
    }

    /// Start the scheduler and begin monitoring all registered targets.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let targets = self.monitor.targets()?;

        tracing::info!("Starting scheduler with {} targets", targets.len());

        for target in targets {
            self.add_target(target).await;
        }

        self.retention_manager.start().await;

        Ok(())
    }

    /// Add a target to be monitored.
    pub async fn add_target(&self, target: Target) {
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&target.name) {
            return; // Already running
        }

        let (stop_tx, _) = broadcast::channel(1);
        stop_chans.insert(target.name.clone(), stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Scheduler: Adding target {}", target.name);

        let monitor = self.monitor.clone();
        let stop_chans = self.stop_chans.clone();
        let stop_rx = stop_tx.subscribe();

        tokio::spawn(async move {
            let name = target.name.clone();
            run_probe_loop(monitor, target, stop_rx).await;

            // A re-created target with the same name owns the entry by now.
            let mut chans = stop_chans.write().await;
            if chans.get(&name).is_some_and(|tx| tx.same_channel(&stop_tx)) {
                chans.remove(&name);
            }
        });
    }

    /// Remove a target from monitoring.
    pub async fn remove_target(&self, name: &str) {
        let mut stop_chans = self.stop_chans.write().await;

        if let Some(stop_tx) = stop_chans.remove(name) {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: Removed target {}", name);
        }
    }

    /// Stop every probe loop and the retention manager.
    pub async fn shutdown(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
        drop(stop_chans);

        self.retention_manager.stop().await;
        tracing::info!("Scheduler stopped");
    }

    /// Names of targets with a running probe loop.
    pub async fn running_targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stop_chans.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Run the probe loop for a single target.
///
/// Each cycle must finish within one interval; a late result is discarded.
async fn run_probe_loop(monitor: Arc<Monitor>, target: Target, mut stop_rx: broadcast::Receiver<()>) {
    let interval_duration = target.interval_duration();
    let deadline = interval_duration.max(target.timeout_duration());

    // Spread target start times so probes do not fire in lockstep.
    let jitter = rand::random::<u64>() % 1000;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            stopped = stop_rx.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = stopped {
                    tracing::warn!("Stop channel for {} closed, ending probe loop", target.name);
                }
                break;
            }
            _ = interval.tick() => {
                match tokio::time::timeout(deadline, monitor.probe(&target)).await {
                    Ok(result) => tracing::debug!(
                        "{}: {} ({} ms, logged={})",
                        target.name,
                        result.status,
                        result.duration_ms,
                        result.logged
                    ),
                    Err(_) => tracing::warn!(
                        "Probe cycle for {} exceeded {:?}, result discarded",
                        target.name,
                        deadline
                    ),
                }
            }
        }
    }
}
