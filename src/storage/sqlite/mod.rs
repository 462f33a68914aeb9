//! `SQLite` backends.
//!
//! Each backend owns its own connection and can point at the same database
//! file; WAL mode keeps their readers independent.
//!
//! | Backend | Tables |
//! |---------|--------|
//! | [`SqliteGraphPersistence`] | `nodes`, `edges`, `graph_meta` |
//! | [`SqliteEpisodicBackend`] | `episodic_events` |
//! | [`SqliteThresholdBackend`] | `thresholds` |

mod connection;
mod episodic;
mod graph;
mod metrics;
mod thresholds;

pub use connection::{configure_connection, open_connection};
pub use episodic::SqliteEpisodicBackend;
pub use graph::SqliteGraphPersistence;
pub use metrics::record_operation_metrics;
pub use thresholds::SqliteThresholdBackend;
