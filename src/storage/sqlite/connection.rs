//! Connection setup for the `SQLite` backends.
//!
//! Each backend owns one `Mutex<Connection>`. WAL mode lets the backends
//! share a database file without blocking each other's readers.

use crate::{Error, Result};
use rusqlite::Connection;
use std::path::Path;

/// Applies the connection pragmas shared by every backend.
///
/// | Pragma | Value |
/// |--------|-------|
/// | `journal_mode` | `WAL` |
/// | `synchronous` | `NORMAL` |
/// | `busy_timeout` | `5000` ms |
///
/// In-memory databases report `memory` for `journal_mode`; that is not an
/// error.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if `synchronous` or `busy_timeout`
/// cannot be set.
pub fn configure_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a row, and in-memory databases refuse WAL.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| Error::OperationFailed {
            operation: "configure_sqlite".to_string(),
            cause: e.to_string(),
        })?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|e| Error::OperationFailed {
            operation: "configure_sqlite".to_string(),
            cause: e.to_string(),
        })?;
    Ok(())
}

/// Opens and configures a connection; `None` opens a private in-memory
/// database.
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the database cannot be opened or
/// its parent directory cannot be created.
pub fn open_connection(path: Option<&Path>) -> Result<Connection> {
    let conn = match path {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| Error::OperationFailed {
                    operation: "create_db_dir".to_string(),
                    cause: e.to_string(),
                })?;
            }
            Connection::open(path).map_err(|e| Error::OperationFailed {
                operation: "open_sqlite".to_string(),
                cause: e.to_string(),
            })?
        },
        None => Connection::open_in_memory().map_err(|e| Error::OperationFailed {
            operation: "open_sqlite_in_memory".to_string(),
            cause: e.to_string(),
        })?,
    };
    configure_connection(&conn)?;
    Ok(conn)
}

/// Maps a `rusqlite` error into [`Error::OperationFailed`].
pub(crate) fn sql_error(operation: &str) -> impl FnOnce(rusqlite::Error) -> Error + '_ {
    move |e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

/// Converts a `u64` counter into an `SQLite` integer, saturating.
pub(crate) fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Converts an `SQLite` integer into a `u64` counter, clamping negatives.
pub(crate) fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_sets_busy_timeout() {
        let conn = open_connection(None).unwrap();
        let timeout: i64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 5000);
    }

    #[test]
    fn test_open_file_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_connection(Some(&dir.path().join("nested").join("db.sqlite"))).unwrap();
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_int_conversions_saturate() {
        assert_eq!(to_sql_int(u64::MAX), i64::MAX);
        assert_eq!(from_sql_int(-3), 0);
        assert_eq!(from_sql_int(42), 42);
    }
}
