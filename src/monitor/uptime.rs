//! Duration reconstruction from the sparse transition log.
//!
//! The log is a run-length encoding of each target's status: every entry starts a
//! run that lasts until the next entry with a different status. Decoding it gives
//! an explicit list of [`Run`]s, which are then bucketed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{StateLogEntry, Status};

/// Offline runs shorter than this count as timeouts (RTO) rather than outages.
pub const RTO_THRESHOLD_SECS: i64 = 300;

/// Online/offline/timeout totals for a reporting window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ReconstructedStats {
    /// Seconds.
    pub online_duration: i64,
    pub offline_duration: i64,
    pub timeout_duration: i64,
    pub online_percentage: f64,
    pub offline_percentage: f64,
    pub timeout_percentage: f64,
}

/// A maximal stretch of one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub status: Status,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Run {
    pub fn seconds(&self) -> i64 {
        (self.end - self.start).num_seconds().max(0)
    }
}

/// Decode ordered log entries into runs, merging same-status neighbours.
///
/// The final run is left open until `close_at`.
pub fn decode_runs(entries: &[StateLogEntry], close_at: DateTime<Utc>) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();

    for entry in entries {
        match runs.last_mut() {
            Some(run) if run.status == entry.status => continue,
            Some(run) => run.end = entry.checked_at,
            None => {}
        }
        runs.push(Run {
            status: entry.status,
            start: entry.checked_at,
            end: entry.checked_at,
        });
    }

    if let Some(last) = runs.last_mut() {
        last.end = close_at.max(last.start);
    }
    runs
}

/// Reconstruct totals from the entries inside a window ending at `end`.
///
/// Runs that started before the window are measured from their first in-window
/// entry. Idle runs count toward no bucket.
pub fn reconstruct(entries: &[StateLogEntry], end: DateTime<Utc>, now: DateTime<Utc>) -> ReconstructedStats {
    let mut stats = ReconstructedStats::default();
    if entries.is_empty() {
        return stats;
    }

    for run in decode_runs(entries, now.min(end)) {
        let secs = run.seconds();
        match run.status {
            Status::Online => stats.online_duration += secs,
            Status::Offline if secs >= RTO_THRESHOLD_SECS => stats.offline_duration += secs,
            Status::Offline => stats.timeout_duration += secs,
            Status::Idle => {}
        }
    }

    let total = stats.online_duration + stats.offline_duration + stats.timeout_duration;
    stats.online_percentage = percentage(stats.online_duration, total);
    stats.offline_percentage = percentage(stats.offline_duration, total);
    stats.timeout_percentage = percentage(stats.timeout_duration, total);
    stats
}

fn percentage(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 10_000.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 10, 6, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + ChronoDuration::seconds(secs)
    }

    fn log(points: &[(i64, Status)]) -> Vec<StateLogEntry> {
        let mut previous = None;
        points
            .iter()
            .enumerate()
            .map(|(i, (secs, status))| {
                let entry = StateLogEntry {
                    id: i as i64 + 1,
                    target_name: "plc".to_string(),
                    address: "10.1.1.1".to_string(),
                    status: *status,
                    previous_status: previous,
                    message: String::new(),
                    duration_ms: 5,
                    is_timeout: false,
                    configured_timeout: 5.0,
                    error_kind: None,
                    checked_at: at(*secs),
                };
                previous = Some(*status);
                entry
            })
            .collect()
    }

    #[test]
    fn test_empty_window_is_zero() {
        let stats = reconstruct(&[], at(100), at(200));
        assert_eq!(stats, ReconstructedStats::default());
    }

    #[test]
    fn test_short_outage_between_online_runs() {
        use Status::*;
        let entries = log(&[(0, Online), (100, Offline), (150, Online)]);
        let stats = reconstruct(&entries, at(150), at(1_000));

        assert_eq!(stats.timeout_duration, 50);
        assert_eq!(stats.offline_duration, 0);
        // Online from 0 until the outage at 100; the trailing run closes at the window end.
        assert_eq!(stats.online_duration, 100);
        assert!(stats.online_duration + stats.offline_duration + stats.timeout_duration <= 150);
    }

    #[test]
    fn test_threshold_boundary() {
        use Status::*;
        let just_under = log(&[(0, Offline), (299, Online)]);
        let stats = reconstruct(&just_under, at(299), at(299));
        assert_eq!(stats.timeout_duration, 299);
        assert_eq!(stats.offline_duration, 0);

        let exact = log(&[(0, Offline), (300, Online)]);
        let stats = reconstruct(&exact, at(300), at(300));
        assert_eq!(stats.offline_duration, 300);
        assert_eq!(stats.timeout_duration, 0);
    }

    #[test]
    fn test_daily_checkpoints_merge_into_one_run() {
        use Status::*;
        // Two 200s halves of one outage would each be RTO; merged they are a real outage.
        let entries = log(&[(0, Offline), (200, Offline), (400, Online)]);
        let stats = reconstruct(&entries, at(400), at(400));
        assert_eq!(stats.offline_duration, 400);
        assert_eq!(stats.timeout_duration, 0);

        let runs = decode_runs(&entries, at(400));
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].seconds(), 400);
    }

    #[test]
    fn test_open_run_closes_at_now_when_before_end() {
        use Status::*;
        let entries = log(&[(0, Online)]);
        let stats = reconstruct(&entries, at(3_600), at(600));
        assert_eq!(stats.online_duration, 600);
        assert_eq!(stats.online_percentage, 100.0);

        let stats = reconstruct(&entries, at(3_600), at(7_200));
        assert_eq!(stats.online_duration, 3_600);
    }

    #[test]
    fn test_open_offline_run_is_bucketed_by_length() {
        use Status::*;
        let entries = log(&[(0, Online), (60, Offline)]);
        let stats = reconstruct(&entries, at(1_000), at(1_000));
        assert_eq!(stats.online_duration, 60);
        assert_eq!(stats.offline_duration, 940);
    }

    #[test]
    fn test_idle_counts_toward_no_bucket() {
        use Status::*;
        let entries = log(&[(0, Online), (100, Idle), (400, Offline), (500, Online)]);
        let stats = reconstruct(&entries, at(600), at(600));
        assert_eq!(stats.online_duration, 200);
        assert_eq!(stats.timeout_duration, 100);
        assert_eq!(stats.offline_duration, 0);
        // Percentages are relative to the three buckets, not the window.
        assert_eq!(stats.online_percentage, 66.67);
        assert_eq!(stats.timeout_percentage, 33.33);
    }

    #[test]
    fn test_durations_never_exceed_window() {
        use Status::*;
        let cases: Vec<Vec<(i64, Status)>> = vec![
            vec![(0, Online)],
            vec![(10, Offline), (20, Offline), (30, Online), (4_000, Offline)],
            vec![(0, Idle), (1, Online), (2, Offline), (3, Idle), (3_599, Online)],
            vec![(3_600, Offline)],
        ];
        let (start, end) = (0, 3_600);

        for points in cases {
            let entries: Vec<_> = log(&points)
                .into_iter()
                .filter(|e| e.checked_at >= at(start) && e.checked_at <= at(end))
                .collect();
            for now in [at(1_800), at(end), at(end + 86_400)] {
                let stats = reconstruct(&entries, at(end), now);
                let sum = stats.online_duration + stats.offline_duration + stats.timeout_duration;
                assert!(sum <= end - start, "{:?} summed to {}", points, sum);
            }
        }
    }

    #[test]
    fn test_entry_after_now_is_clamped() {
        use Status::*;
        let entries = log(&[(0, Online), (500, Offline)]);
        let stats = reconstruct(&entries, at(1_000), at(400));
        assert_eq!(stats.online_duration, 500);
        assert_eq!(stats.offline_duration + stats.timeout_duration, 0);
    }
}
