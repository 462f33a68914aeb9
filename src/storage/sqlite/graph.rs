//! `SQLite` graph persistence.
//!
//! # Schema
//!
//! | Table | Key | Contents |
//! |-------|-----|----------|
//! | `nodes` | `id` | kind, members and structure (JSON), embedding (little-endian `f32` blob), metadata (JSON) |
//! | `edges` | `(from_id, to_id, kind)` | source, confidence, observations |
//! | `graph_meta` | `key` | `version` |
//!
//! The backend also implements [`GraphListener`], so subscribing it to a
//! [`crate::storage::graph::GraphStore`] writes every commit through.

use super::connection::{from_sql_int, open_connection, sql_error, to_sql_int};
use super::metrics::record_operation_metrics;
use crate::models::{
    CapabilitySpec, Edge, EdgeKind, EdgeSource, Node, NodeId, NodeKind, StructureEdge,
};
use crate::storage::graph::{GraphChange, GraphCommit, GraphListener, GraphSnapshot};
use crate::storage::locks::acquire_lock;
use crate::storage::traits::{GraphPersistence, PersistedGraph};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::instrument;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    members TEXT,
    structure TEXT,
    embedding BLOB,
    metadata TEXT,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS edges (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    source TEXT NOT NULL,
    confidence REAL NOT NULL,
    observations INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (from_id, to_id, kind)
);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_id);
CREATE TABLE IF NOT EXISTS graph_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// `SQLite` implementation of [`GraphPersistence`].
pub struct SqliteGraphPersistence {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteGraphPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGraphPersistence")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteGraphPersistence {
    /// Opens or creates the graph tables in the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = open_connection(Some(path))?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Creates a backend over a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(open_connection(None)?, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(sql_error("create_graph_tables"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub const fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }

    fn upsert_node(tx: &Transaction<'_>, node: &Node) -> Result<()> {
        let (members, structure) = match &node.kind {
            NodeKind::Tool => (None, None),
            NodeKind::Capability(spec) => (
                Some(to_json(&spec.members, "encode_members")?),
                Some(to_json(&spec.structure, "encode_structure")?),
            ),
        };
        let embedding = node.embedding.as_deref().map(encode_embedding);
        let metadata = to_json(&node.metadata, "encode_metadata")?;
        tx.execute(
            "INSERT OR REPLACE INTO nodes (id, kind, members, structure, embedding, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                node.id.as_str(),
                node.kind.as_str(),
                members,
                structure,
                embedding,
                metadata,
                node.updated_at.timestamp_millis(),
            ],
        )
        .map_err(sql_error("upsert_node"))?;
        Ok(())
    }

    fn upsert_edge(tx: &Transaction<'_>, edge: &Edge) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO edges (from_id, to_id, kind, source, confidence, observations, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge.from.as_str(),
                edge.to.as_str(),
                edge.kind.as_str(),
                edge.source.as_str(),
                edge.confidence,
                to_sql_int(edge.observations),
                edge.updated_at.timestamp_millis(),
            ],
        )
        .map_err(sql_error("upsert_edge"))?;
        Ok(())
    }

    fn set_version(tx: &Transaction<'_>, version: u64) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO graph_meta (key, value) VALUES ('version', ?1)",
            params![version.to_string()],
        )
        .map_err(sql_error("set_graph_version"))?;
        Ok(())
    }

    fn write_commit(&self, snapshot: &GraphSnapshot, commit: &GraphCommit) -> Result<()> {
        let mut conn = acquire_lock(&self.conn, "sqlite_graph");
        let tx = conn.transaction().map_err(sql_error("begin_commit"))?;
        for change in &commit.changes {
            match change {
                GraphChange::NodeUpserted(id) => {
                    // Absent when a later op in the same batch removed it.
                    if let Some(node) = snapshot.node(id) {
                        Self::upsert_node(&tx, node)?;
                    }
                },
                GraphChange::NodeRemoved(id) => {
                    tx.execute(
                        "DELETE FROM edges WHERE from_id = ?1 OR to_id = ?1",
                        params![id.as_str()],
                    )
                    .map_err(sql_error("delete_incident_edges"))?;
                    tx.execute("DELETE FROM nodes WHERE id = ?1", params![id.as_str()])
                        .map_err(sql_error("delete_node"))?;
                },
                GraphChange::EdgeUpserted(key) => {
                    if let Some(edge) = snapshot.edge(key) {
                        Self::upsert_edge(&tx, edge)?;
                    }
                },
                GraphChange::EdgeRemoved(key) => {
                    tx.execute(
                        "DELETE FROM edges WHERE from_id = ?1 AND to_id = ?2 AND kind = ?3",
                        params![key.from.as_str(), key.to.as_str(), key.kind.as_str()],
                    )
                    .map_err(sql_error("delete_edge"))?;
                },
            }
        }
        Self::set_version(&tx, commit.version)?;
        tx.commit().map_err(sql_error("commit_graph"))
    }

    fn read_nodes(conn: &Connection, skipped: &mut usize) -> Result<Vec<Node>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, members, structure, embedding, metadata, updated_at
                 FROM nodes ORDER BY id",
            )
            .map_err(sql_error("prepare_load_nodes"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(NodeRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    members: row.get(2)?,
                    structure: row.get(3)?,
                    embedding: row.get(4)?,
                    metadata: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })
            .map_err(sql_error("load_nodes"))?;

        let mut nodes = Vec::new();
        for row in rows {
            let row = row.map_err(sql_error("read_node_row"))?;
            let id = row.id.clone();
            match row.into_node() {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    tracing::warn!(node = %id, error = %e, "Skipping undecodable node row");
                    metrics::counter!("graph_data_inconsistencies_total", "kind" => "node_row")
                        .increment(1);
                    *skipped += 1;
                },
            }
        }
        Ok(nodes)
    }

    fn read_edges(conn: &Connection, skipped: &mut usize) -> Result<Vec<Edge>> {
        let mut stmt = conn
            .prepare(
                "SELECT from_id, to_id, kind, source, confidence, observations, updated_at
                 FROM edges ORDER BY from_id, to_id, kind",
            )
            .map_err(sql_error("prepare_load_edges"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .map_err(sql_error("load_edges"))?;

        let mut edges = Vec::new();
        for row in rows {
            let (from, to, kind, source, confidence, observations, updated_at) =
                row.map_err(sql_error("read_edge_row"))?;
            let (Some(kind), Some(source)) = (EdgeKind::parse(&kind), EdgeSource::parse(&source))
            else {
                tracing::warn!(%from, %to, %kind, "Skipping edge row with unknown kind or source");
                metrics::counter!("graph_data_inconsistencies_total", "kind" => "edge_row")
                    .increment(1);
                *skipped += 1;
                continue;
            };
            let mut edge = Edge::new(from, to, kind, source).with_confidence(confidence);
            edge.observations = from_sql_int(observations);
            edge.updated_at = millis_to_datetime(updated_at);
            edges.push(edge);
        }
        Ok(edges)
    }
}

struct NodeRow {
    id: String,
    kind: String,
    members: Option<String>,
    structure: Option<String>,
    embedding: Option<Vec<u8>>,
    metadata: Option<String>,
    updated_at: i64,
}

impl NodeRow {
    fn into_node(self) -> Result<Node> {
        let kind = match self.kind.as_str() {
            "tool" => NodeKind::Tool,
            "capability" => {
                let members: Vec<NodeId> = from_json(self.members.as_deref(), "members")?;
                let structure: Vec<StructureEdge> =
                    from_json(self.structure.as_deref(), "structure")?;
                NodeKind::Capability(CapabilitySpec { members, structure })
            },
            other => {
                return Err(Error::DataInconsistency(format!(
                    "node {} has unknown kind {other}",
                    self.id
                )));
            },
        };
        let embedding = self.embedding.as_deref().map(decode_embedding).transpose()?;
        let metadata = match self.metadata.as_deref() {
            Some(text) => serde_json::from_str(text)
                .map_err(|e| Error::DataInconsistency(format!("metadata: {e}")))?,
            None => serde_json::Value::Null,
        };
        Ok(Node {
            id: NodeId::new(self.id),
            kind,
            embedding,
            metadata,
            updated_at: millis_to_datetime(self.updated_at),
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T, operation: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    })
}

fn from_json<T: serde::de::DeserializeOwned + Default>(text: Option<&str>, field: &str) -> Result<T> {
    text.map_or_else(
        || Ok(T::default()),
        |t| {
            serde_json::from_str(t).map_err(|e| Error::DataInconsistency(format!("{field}: {e}")))
        },
    )
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::DataInconsistency(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

impl GraphPersistence for SqliteGraphPersistence {
    #[instrument(
        name = "capgraph.storage.graph.save_snapshot",
        skip(self, snapshot),
        fields(component = "storage", operation = "save_snapshot", version = snapshot.version())
    )]
    fn save_snapshot(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let start = Instant::now();
        let result = (|| {
            let mut conn = acquire_lock(&self.conn, "sqlite_graph");
            let tx = conn.transaction().map_err(sql_error("begin_save_snapshot"))?;
            tx.execute_batch("DELETE FROM edges; DELETE FROM nodes;")
                .map_err(sql_error("clear_graph"))?;
            for node in snapshot.nodes() {
                Self::upsert_node(&tx, node)?;
            }
            for edge in snapshot.edges() {
                Self::upsert_edge(&tx, edge)?;
            }
            Self::set_version(&tx, snapshot.version())?;
            tx.commit().map_err(sql_error("commit_save_snapshot"))
        })();
        record_operation_metrics("sqlite_graph", "save_snapshot", start, &result);
        result
    }

    fn apply_commit(&self, snapshot: &GraphSnapshot, commit: &GraphCommit) -> Result<()> {
        let start = Instant::now();
        let result = self.write_commit(snapshot, commit);
        record_operation_metrics("sqlite_graph", "apply_commit", start, &result);
        result
    }

    #[instrument(
        name = "capgraph.storage.graph.load",
        skip(self),
        fields(component = "storage", operation = "load_graph")
    )]
    fn load(&self) -> Result<PersistedGraph> {
        let start = Instant::now();
        let result = (|| {
            let conn = acquire_lock(&self.conn, "sqlite_graph");
            let mut skipped = 0;
            let nodes = Self::read_nodes(&conn, &mut skipped)?;
            let edges = Self::read_edges(&conn, &mut skipped)?;
            let version = conn
                .query_row(
                    "SELECT value FROM graph_meta WHERE key = 'version'",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(sql_error("load_graph_version"))?
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            Ok(PersistedGraph {
                nodes,
                edges,
                version,
                skipped,
            })
        })();
        record_operation_metrics("sqlite_graph", "load", start, &result);
        result
    }
}

impl GraphListener for SqliteGraphPersistence {
    fn on_commit(&self, snapshot: &Arc<GraphSnapshot>, commit: &GraphCommit) {
        if let Err(e) = self.apply_commit(snapshot, commit) {
            tracing::warn!(
                version = commit.version,
                error = %e,
                "Failed to persist graph commit"
            );
            metrics::counter!("graph_persistence_failures_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StructureEdgeKind;
    use crate::storage::graph::{BatchPolicy, GraphBatch, GraphConfig, GraphStore};

    fn sample_store() -> GraphStore {
        let store = GraphStore::new(GraphConfig::default().with_embedding_dimensions(2));
        let spec = CapabilitySpec::new(vec![NodeId::new("fetch"), NodeId::new("parse")])
            .with_edge(StructureEdge::new("fetch", "parse", StructureEdgeKind::Provides));
        let batch = GraphBatch::new()
            .upsert_node(Node::tool("fetch").with_embedding(vec![0.25, -1.5]))
            .upsert_node(Node::tool("parse").with_metadata(serde_json::json!({"v": 2})))
            .upsert_node(Node::capability("ingest", spec))
            .upsert_edge(Edge::new("fetch", "parse", EdgeKind::Provides, EdgeSource::Observed));
        store.apply_batch(batch, BatchPolicy::AllOrNothing).unwrap();
        store
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let store = sample_store();
        let backend = SqliteGraphPersistence::in_memory().unwrap();
        backend.save_snapshot(&store.snapshot()).unwrap();

        let loaded = backend.load().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.nodes.len(), 3);
        assert_eq!(loaded.edges.len(), 1);
        assert_eq!(loaded.skipped, 0);

        let fetch = loaded.nodes.iter().find(|n| n.id.as_str() == "fetch").unwrap();
        assert_eq!(fetch.embedding, Some(vec![0.25, -1.5]));
        let ingest = loaded.nodes.iter().find(|n| n.id.as_str() == "ingest").unwrap();
        assert_eq!(ingest.kind.capability().unwrap().members.len(), 2);
    }

    #[test]
    fn test_listener_writes_commits_through() {
        let store = sample_store();
        let backend = Arc::new(SqliteGraphPersistence::in_memory().unwrap());
        store.subscribe(Arc::clone(&backend) as Arc<dyn GraphListener>);

        store.add_node(Node::tool("store")).unwrap();
        store
            .observe_edge("parse", "store", EdgeKind::Sequence)
            .unwrap();

        let loaded = backend.load().unwrap();
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.edges.len(), 1);
        assert_eq!(loaded.edges[0].source, EdgeSource::Observed);
    }

    #[test]
    fn test_bad_rows_are_skipped() {
        let backend = SqliteGraphPersistence::in_memory().unwrap();
        {
            let conn = acquire_lock(&backend.conn, "test");
            conn.execute(
                "INSERT INTO nodes (id, kind, updated_at) VALUES ('x', 'gadget', 0)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO edges VALUES ('a', 'b', 'teleports', 'observed', 0.5, 1, 0)",
                [],
            )
            .unwrap();
        }
        let loaded = backend.load().unwrap();
        assert!(loaded.nodes.is_empty());
        assert!(loaded.edges.is_empty());
        assert_eq!(loaded.skipped, 2);
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let values = vec![1.0, -0.5, f32::MIN_POSITIVE];
        assert_eq!(decode_embedding(&encode_embedding(&values)).unwrap(), values);
        assert!(decode_embedding(&[0, 1, 2]).is_err());
    }
}
