//! `SQLite` threshold backend.

use super::connection::{from_sql_int, open_connection, sql_error, to_sql_int};
use super::graph::millis_to_datetime;
use super::metrics::record_operation_metrics;
use crate::Result;
use crate::models::ThresholdRecord;
use crate::storage::locks::acquire_lock;
use crate::storage::traits::ThresholdBackend;
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS thresholds (
    context_key TEXT PRIMARY KEY,
    value REAL NOT NULL,
    smoothed_success_rate REAL NOT NULL,
    sample_count INTEGER NOT NULL,
    in_band_streak INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);
";

/// `SQLite` implementation of [`ThresholdBackend`].
pub struct SqliteThresholdBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteThresholdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteThresholdBackend").finish_non_exhaustive()
    }
}

impl SqliteThresholdBackend {
    /// Opens or creates the thresholds table in the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(open_connection(Some(path.as_ref()))?)
    }

    /// Creates a backend over a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(open_connection(None)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(sql_error("create_thresholds_table"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ThresholdBackend for SqliteThresholdBackend {
    fn save(&self, record: &ThresholdRecord) -> Result<()> {
        let start = Instant::now();
        let result = acquire_lock(&self.conn, "sqlite_thresholds")
            .execute(
                "INSERT OR REPLACE INTO thresholds
                 (context_key, value, smoothed_success_rate, sample_count, in_band_streak, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.context_key,
                    record.value,
                    record.smoothed_success_rate,
                    to_sql_int(record.sample_count),
                    record.in_band_streak,
                    record.updated_at.timestamp_millis(),
                ],
            )
            .map(|_| ())
            .map_err(sql_error("save_threshold"));
        record_operation_metrics("sqlite_thresholds", "save", start, &result);
        result
    }

    fn load_all(&self) -> Result<Vec<ThresholdRecord>> {
        let start = Instant::now();
        let result = (|| {
            let conn = acquire_lock(&self.conn, "sqlite_thresholds");
            let mut stmt = conn
                .prepare(
                    "SELECT context_key, value, smoothed_success_rate, sample_count, in_band_streak, updated_at
                     FROM thresholds ORDER BY context_key",
                )
                .map_err(sql_error("prepare_load_thresholds"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ThresholdRecord {
                        context_key: row.get(0)?,
                        value: row.get(1)?,
                        smoothed_success_rate: row.get(2)?,
                        sample_count: from_sql_int(row.get(3)?),
                        in_band_streak: row.get(4)?,
                        updated_at: millis_to_datetime(row.get(5)?),
                    })
                })
                .map_err(sql_error("load_thresholds"))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(sql_error("read_threshold_row"))
        })();
        record_operation_metrics("sqlite_thresholds", "load_all", start, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_replaces_by_key() {
        let backend = SqliteThresholdBackend::in_memory().unwrap();
        let mut record = ThresholdRecord::new("repo", 0.92, 0.85);
        backend.save(&record).unwrap();

        record.value = 0.88;
        record.sample_count = 10;
        record.in_band_streak = 2;
        backend.save(&record).unwrap();

        let loaded = backend.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!((loaded[0].value - 0.88).abs() < f64::EPSILON);
        assert_eq!(loaded[0].sample_count, 10);
        assert_eq!(loaded[0].in_band_streak, 2);
    }

    #[test]
    fn test_file_backed_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capgraph.db");
        SqliteThresholdBackend::new(&path)
            .unwrap()
            .save(&ThresholdRecord::new("a:b", 0.7, 0.9))
            .unwrap();

        let reopened = SqliteThresholdBackend::new(&path).unwrap();
        let loaded = reopened.load_all().unwrap();
        assert_eq!(loaded[0].context_key, "a:b");
    }
}
