//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::models::*;
use super::{DataPipeline, LogStore, TargetRegistry};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const LOG_COLUMNS: &str = "id, target_name, address, status, previous_status, message, duration_ms, \
     is_timeout, configured_timeout, error_kind, checked_at";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::info!("Applied migration V{}__{}", migration.version(), migration.name());
        }
        Ok(())
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        if target.probe_interval <= 0.0 {
            target.probe_interval = 60.0;
        }
        if target.timeout <= 0.0 {
            target.timeout = 5.0;
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (name, address, probe_type, probe_config, probe_interval, timeout) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                target.name,
                target.address,
                target.probe_type,
                target.probe_config,
                target.probe_interval,
                target.timeout,
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        Ok(id)
    }

    /// Get all targets.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, address, probe_type, probe_config, probe_interval, timeout FROM targets ORDER BY name",
        )?;

        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(targets)
    }

    /// Get a target by name.
    pub fn get_target(&self, name: &str) -> Result<Target, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, address, probe_type, probe_config, probe_interval, timeout FROM targets WHERE name = ?1",
            params![name],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a target and its state log.
    pub fn delete_target(&self, name: &str) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM state_logs WHERE target_name = ?1", params![name])?;
        let deleted = conn.execute("DELETE FROM targets WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Data pipeline records (written by the pipeline itself in production) ---

    /// Record that the data pipeline wrote a row for `device_class`.
    #[cfg(test)]
    pub fn add_device_record(&self, device_class: &str, recorded_at: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO device_records (device_class, recorded_at) VALUES (?1, ?2)",
            params![device_class, format_db_time(recorded_at)],
        )?;
        Ok(())
    }
}

impl TargetRegistry for Store {
    fn list_targets(&self) -> Result<Vec<Target>, DbError> {
        self.get_targets()
    }

    fn get_target(&self, name: &str) -> Result<Target, DbError> {
        Store::get_target(self, name)
    }
}

impl LogStore for Store {
    fn append(&self, entry: &StateLogEntry) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO state_logs (target_name, address, status, previous_status, message, duration_ms, \
             is_timeout, configured_timeout, error_kind, checked_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.target_name,
                entry.address,
                entry.status,
                entry.previous_status,
                entry.message,
                i64::try_from(entry.duration_ms).unwrap_or(i64::MAX),
                entry.is_timeout,
                entry.configured_timeout,
                entry.error_kind,
                format_db_time(entry.checked_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_last(&self, target_name: &str) -> Result<Option<StateLogEntry>, DbError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM state_logs WHERE target_name = ?1 ORDER BY checked_at DESC, id DESC LIMIT 1",
                    LOG_COLUMNS
                ),
                params![target_name],
                log_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn query_range(
        &self,
        target_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StateLogEntry>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM state_logs \
             WHERE target_name = ?1 AND checked_at >= ?2 AND checked_at <= ?3 \
             ORDER BY checked_at ASC, id ASC",
            LOG_COLUMNS
        ))?;

        let entries = stmt
            .query_map(
                params![target_name, format_db_time(start), format_db_time(end)],
                log_entry_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(entries)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM state_logs WHERE checked_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

impl DataPipeline for Store {
    fn latest_record_timestamp(&self, device_class: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let conn = self.conn()?;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(recorded_at) FROM device_records WHERE device_class = ?1",
            params![device_class],
            |row| row.get(0),
        )?;

        match latest {
            None => Ok(None),
            Some(raw) => parse_db_time(&raw).map(Some).ok_or_else(|| {
                DbError::Sqlite(rusqlite::Error::FromSqlConversionFailure(
                    0,
                    Type::Text,
                    format!("unparseable recorded_at for {}: {}", device_class, raw).into(),
                ))
            }),
        }
    }
}

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        probe_type: row.get(3)?,
        probe_config: row.get(4)?,
        probe_interval: row.get(5)?,
        timeout: row.get(6)?,
    })
}

fn log_entry_from_row(row: &Row<'_>) -> SqlResult<StateLogEntry> {
    let duration_ms: i64 = row.get(6)?;
    Ok(StateLogEntry {
        id: row.get(0)?,
        target_name: row.get(1)?,
        address: row.get(2)?,
        status: row.get(3)?,
        previous_status: row.get(4)?,
        message: row.get(5)?,
        duration_ms: duration_ms.max(0) as u64,
        is_timeout: row.get(7)?,
        configured_timeout: row.get(8)?,
        error_kind: row.get(9)?,
        checked_at: time_column(row, 10)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unparseable timestamp: {}", raw).into(),
        )
    })
}

/// Format a timestamp so lexical order in SQLite matches time order.
fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
