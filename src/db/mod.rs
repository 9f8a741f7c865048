//! Database module for uptrail.
//!
//! Provides SQLite storage with embedded migrations, plus the storage seams the
//! monitor depends on.

mod models;
mod store;

pub use models::*;
pub use store::*;

use chrono::{DateTime, Utc};

/// Source of monitored target definitions.
pub trait TargetRegistry: Send + Sync {
    fn list_targets(&self) -> Result<Vec<Target>, DbError>;
    fn get_target(&self, name: &str) -> Result<Target, DbError>;
}

/// Append-only log of health transitions.
pub trait LogStore: Send + Sync {
    /// Append an entry and return its id.
    fn append(&self, entry: &StateLogEntry) -> Result<i64, DbError>;
    /// Most recent entry for a target.
    fn get_last(&self, target_name: &str) -> Result<Option<StateLogEntry>, DbError>;
    /// Entries with `start <= checked_at <= end`, oldest first.
    fn query_range(
        &self,
        target_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StateLogEntry>, DbError>;
    /// Delete every entry older than `cutoff`, returning the number removed.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;
}

/// Read side of the external data pipeline, used by freshness checks.
pub trait DataPipeline: Send + Sync {
    fn latest_record_timestamp(&self, device_class: &str) -> Result<Option<DateTime<Utc>>, DbError>;
}
