//! `SQLite` episodic event backend.
//!
//! Events live in `episodic_events`, indexed by context and timestamp.
//! Timestamps are stored as Unix milliseconds.

use super::connection::{open_connection, sql_error};
use super::graph::millis_to_datetime;
use super::metrics::record_operation_metrics;
use crate::models::{EpisodicEvent, NodeId, Outcome};
use crate::storage::locks::acquire_lock;
use crate::storage::traits::EpisodicBackend;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS episodic_events (
    id TEXT PRIMARY KEY,
    context_id TEXT NOT NULL,
    action_id TEXT NOT NULL,
    predicted_confidence REAL NOT NULL,
    outcome TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    aux_payload TEXT
);
CREATE INDEX IF NOT EXISTS idx_episodic_context ON episodic_events(context_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_episodic_timestamp ON episodic_events(timestamp DESC);
";

const SELECT_COLUMNS: &str =
    "SELECT id, context_id, action_id, predicted_confidence, outcome, timestamp, aux_payload
     FROM episodic_events";

/// `SQLite` implementation of [`EpisodicBackend`].
pub struct SqliteEpisodicBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteEpisodicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEpisodicBackend").finish_non_exhaustive()
    }
}

impl SqliteEpisodicBackend {
    /// Opens or creates the events table in the database at `path`.
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
            .map_err(sql_error("create_episodic_table"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<EpisodicEvent>> {
        let conn = acquire_lock(&self.conn, "sqlite_episodic");
        let mut stmt = conn.prepare(sql).map_err(sql_error("prepare_episodic_query"))?;
        let rows = stmt
            .query_map(args, |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    context_id: row.get(1)?,
                    action_id: row.get(2)?,
                    predicted_confidence: row.get(3)?,
                    outcome: row.get(4)?,
                    timestamp: row.get(5)?,
                    aux_payload: row.get(6)?,
                })
            })
            .map_err(sql_error("episodic_query"))?;

        let mut events = Vec::new();
        for row in rows {
            let row = row.map_err(sql_error("read_episodic_row"))?;
            match row.into_event() {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable episodic row");
                    metrics::counter!("episodic_data_inconsistencies_total").increment(1);
                },
            }
        }
        Ok(events)
    }
}

struct EventRow {
    id: String,
    context_id: String,
    action_id: String,
    predicted_confidence: f64,
    outcome: String,
    timestamp: i64,
    aux_payload: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Result<EpisodicEvent> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| Error::DataInconsistency(format!("event id {}: {e}", self.id)))?;
        let actual_outcome = Outcome::parse(&self.outcome).ok_or_else(|| {
            Error::DataInconsistency(format!("event {} has outcome {}", self.id, self.outcome))
        })?;
        let aux_payload = match self.aux_payload.as_deref() {
            Some(text) => serde_json::from_str(text)
                .map_err(|e| Error::DataInconsistency(format!("event {} payload: {e}", self.id)))?,
            None => serde_json::Value::Null,
        };
        #[allow(clippy::cast_possible_truncation)]
        let predicted_confidence = self.predicted_confidence as f32;
        Ok(EpisodicEvent {
            id,
            context_id: self.context_id,
            action_id: NodeId::new(self.action_id),
            predicted_confidence,
            actual_outcome,
            timestamp: millis_to_datetime(self.timestamp),
            aux_payload,
        })
    }
}

fn usize_to_sql(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl EpisodicBackend for SqliteEpisodicBackend {
    #[instrument(
        name = "capgraph.storage.episodic.append",
        skip(self, events),
        fields(component = "storage", operation = "append_events", count = events.len())
    )]
    fn append(&self, events: &[EpisodicEvent]) -> Result<usize> {
        let start = Instant::now();
        let result = (|| {
            let mut conn = acquire_lock(&self.conn, "sqlite_episodic");
            let tx = conn.transaction().map_err(sql_error("begin_append_events"))?;
            let mut inserted = 0;
            for event in events {
                let payload = if event.aux_payload.is_null() {
                    None
                } else {
                    Some(event.aux_payload.to_string())
                };
                inserted += tx
                    .execute(
                        "INSERT OR IGNORE INTO episodic_events
                         (id, context_id, action_id, predicted_confidence, outcome, timestamp, aux_payload)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            event.id.to_string(),
                            event.context_id,
                            event.action_id.as_str(),
                            f64::from(event.predicted_confidence),
                            event.actual_outcome.as_str(),
                            event.timestamp.timestamp_millis(),
                            payload,
                        ],
                    )
                    .map_err(sql_error("insert_event"))?;
            }
            tx.commit().map_err(sql_error("commit_append_events"))?;
            Ok(inserted)
        })();
        record_operation_metrics("sqlite_episodic", "append", start, &result);
        result
    }

    fn by_context(&self, context_id: &str, limit: usize) -> Result<Vec<EpisodicEvent>> {
        let start = Instant::now();
        let sql = format!(
            "{SELECT_COLUMNS} WHERE context_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2"
        );
        let result = self.query(&sql, &[&context_id, &usize_to_sql(limit)]);
        record_operation_metrics("sqlite_episodic", "by_context", start, &result);
        result
    }

    fn recent(&self, limit: usize) -> Result<Vec<EpisodicEvent>> {
        let start = Instant::now();
        let sql = format!("{SELECT_COLUMNS} ORDER BY timestamp DESC, id DESC LIMIT ?1");
        let result = self.query(&sql, &[&usize_to_sql(limit)]);
        record_operation_metrics("sqlite_episodic", "recent", start, &result);
        result
    }

    #[instrument(
        name = "capgraph.storage.episodic.prune",
        skip(self),
        fields(component = "storage", operation = "prune_events")
    )]
    fn prune(&self, cutoff: DateTime<Utc>, max_count: usize, dry_run: bool) -> Result<usize> {
        let start = Instant::now();
        let result = (|| {
            let mut conn = acquire_lock(&self.conn, "sqlite_episodic");
            let tx = conn.transaction().map_err(sql_error("begin_prune_events"))?;
            let cutoff_ms = cutoff.timestamp_millis();

            let expired: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM episodic_events WHERE timestamp < ?1",
                    params![cutoff_ms],
                    |row| row.get(0),
                )
                .map_err(sql_error("count_expired_events"))?;
            let remaining: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM episodic_events WHERE timestamp >= ?1",
                    params![cutoff_ms],
                    |row| row.get(0),
                )
                .map_err(sql_error("count_retained_events"))?;
            let overflow = (remaining - usize_to_sql(max_count)).max(0);
            let total = usize::try_from(expired + overflow).unwrap_or(0);

            if dry_run {
                return Ok(total);
            }

            tx.execute(
                "DELETE FROM episodic_events WHERE timestamp < ?1",
                params![cutoff_ms],
            )
            .map_err(sql_error("delete_expired_events"))?;
            tx.execute(
                "DELETE FROM episodic_events WHERE id NOT IN (
                     SELECT id FROM episodic_events ORDER BY timestamp DESC, id DESC LIMIT ?1
                 )",
                params![usize_to_sql(max_count)],
            )
            .map_err(sql_error("delete_overflow_events"))?;
            tx.commit().map_err(sql_error("commit_prune_events"))?;
            Ok(total)
        })();
        record_operation_metrics("sqlite_episodic", "prune", start, &result);
        result
    }

    fn count(&self) -> Result<usize> {
        let conn = acquire_lock(&self.conn, "sqlite_episodic");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM episodic_events", [], |row| row.get(0))
            .map_err(sql_error("count_events"))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
