//! Composite probe: Modbus connectivity plus pipeline data freshness.

use std::time::{Duration, Instant};

use super::classify::classify_freshness;
use super::{run_modbus_probe, ProbeOutcome};
use crate::clock::Clock;
use crate::db::{DataPipeline, ProbeSettings, Status};

/// Check that the device answers Modbus and that its class has recent pipeline data.
///
/// An unreachable device is reported as-is without touching the pipeline.
pub async fn run_freshness_probe(
    address: &str,
    settings: &ProbeSettings,
    timeout: Duration,
    pipeline: &dyn DataPipeline,
    clock: &dyn Clock,
) -> ProbeOutcome {
    let start = Instant::now();
    let device = run_modbus_probe(address, settings, timeout).await;
    if device.status == Status::Offline {
        return device;
    }

    let device_class = settings.device_class.as_deref().unwrap_or_default();
    let latest = pipeline
        .latest_record_timestamp(device_class)
        .map_err(|e| e.to_string());

    classify_freshness(device, latest, clock.now(), start.elapsed())
}
