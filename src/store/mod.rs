//! Storage layer: two embedded SQLite databases extended with sqlite-vec.
//!
//! The vector database holds documents, chunk embeddings, collections, and
//! the knowledge graph. The usage database holds conversations, messages,
//! and the retrieval/tool-call audit trail. Cosine distance is computed in
//! SQL with `vec_distance_cosine` over little-endian f32 BLOBs.
use rusqlite::{Connection, Result};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use tracing::info;

pub mod chat;
pub mod documents;
pub mod graph;
pub mod models;
pub mod vector;

const VECTOR_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL,
    content TEXT NOT NULL,
    vector BLOB NOT NULL,
    collection TEXT NOT NULL DEFAULT 'default',
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_embeddings_doc ON embeddings(doc_id);
CREATE INDEX IF NOT EXISTS idx_embeddings_collection ON embeddings(collection);

CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    dimensions INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS graph_nodes (
    id TEXT PRIMARY KEY,
    node_type TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    vector BLOB,
    properties TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS graph_edges (
    id TEXT PRIMARY KEY,
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    edge_type TEXT NOT NULL DEFAULT '',
    weight REAL NOT NULL DEFAULT 0.5,
    properties TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_edges_from ON graph_edges(from_id);
CREATE INDEX IF NOT EXISTS idx_edges_to ON graph_edges(to_id);
"#;

const USAGE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_name TEXT NOT NULL DEFAULT '',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    created_at DATETIME NOT NULL,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);

CREATE TABLE IF NOT EXISTS rag_queries (
    id TEXT PRIMARY KEY,
    conversation_id TEXT,
    query TEXT NOT NULL,
    answer TEXT NOT NULL DEFAULT '',
    top_k INTEGER NOT NULL DEFAULT 5,
    temperature REAL NOT NULL DEFAULT 0.7,
    max_tokens INTEGER NOT NULL DEFAULT 25000,
    total_ms INTEGER NOT NULL DEFAULT 0,
    retrieval_ms INTEGER NOT NULL DEFAULT 0,
    generation_ms INTEGER NOT NULL DEFAULT 0,
    chunks_found INTEGER NOT NULL DEFAULT 0,
    tool_calls INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 1,
    error TEXT,
    model TEXT NOT NULL DEFAULT '',
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    estimated_cost REAL NOT NULL DEFAULT 0,
    created_at DATETIME NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queries_conversation ON rag_queries(conversation_id);
CREATE INDEX IF NOT EXISTS idx_queries_created ON rag_queries(created_at);
CREATE INDEX IF NOT EXISTS idx_queries_success ON rag_queries(success);

CREATE TABLE IF NOT EXISTS rag_chunk_hits (
    id TEXT PRIMARY KEY,
    query_id TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    content TEXT NOT NULL,
    score REAL NOT NULL,
    rank_position INTEGER NOT NULL,
    used_in_generation INTEGER NOT NULL DEFAULT 0,
    source_file TEXT NOT NULL DEFAULT '',
    start_offset INTEGER,
    end_offset INTEGER,
    created_at DATETIME NOT NULL,
    FOREIGN KEY (query_id) REFERENCES rag_queries(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_hits_query ON rag_chunk_hits(query_id);
CREATE INDEX IF NOT EXISTS idx_hits_score ON rag_chunk_hits(score, rank_position);

CREATE TABLE IF NOT EXISTS rag_tool_calls (
    id TEXT PRIMARY KEY,
    query_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL DEFAULT '{}',
    result TEXT,
    success INTEGER NOT NULL DEFAULT 1,
    error TEXT,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME NOT NULL,
    FOREIGN KEY (query_id) REFERENCES rag_queries(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tool_calls_query ON rag_tool_calls(query_id);
CREATE INDEX IF NOT EXISTS idx_tool_calls_name ON rag_tool_calls(tool_name);
"#;

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

fn open_connection(path: Option<&Path>, schema: &str, label: &str) -> Result<Connection> {
    init_sqlite_vec();

    let conn = match path {
        Some(p) => {
            info!("Initializing {label} database: {}", p.display());
            Connection::open(p)?
        }
        None => Connection::open_in_memory()?,
    };

    // Verify sqlite-vec is loaded
    let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
    info!("sqlite-vec version: {vec_version}");

    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(schema)?;

    Ok(conn)
}

/// The vector database: documents, embeddings, collections, graph.
pub struct VectorDb {
    pub(crate) conn: Connection,
}

impl VectorDb {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_connection(Some(path.as_ref()), VECTOR_SCHEMA_SQL, "vector")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = open_connection(None, VECTOR_SCHEMA_SQL, "vector")?;
        Ok(Self { conn })
    }
}

/// The usage database: conversations, messages, query/hit/tool-call records.
pub struct UsageDb {
    pub(crate) conn: Connection,
}

impl UsageDb {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = open_connection(Some(path.as_ref()), USAGE_SCHEMA_SQL, "usage")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = open_connection(None, USAGE_SCHEMA_SQL, "usage")?;
        Ok(Self { conn })
    }
}

/// Serialize a float32 vector into little-endian bytes for BLOB storage.
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Inverse of [`serialize_vector`].
pub fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_db_init() {
        let db = VectorDb::open_in_memory().expect("Failed to open in-memory DB");

        let tables: usize = db.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('documents', 'embeddings', 'collections', 'graph_nodes', 'graph_edges');",
            [],
            |row| row.get(0),
        ).unwrap();

        assert_eq!(tables, 5);
    }

    #[test]
    fn test_usage_db_init() {
        let db = UsageDb::open_in_memory().expect("Failed to open in-memory DB");

        let tables: usize = db.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('conversations', 'messages', 'rag_queries', 'rag_chunk_hits', 'rag_tool_calls');",
            [],
            |row| row.get(0),
        ).unwrap();

        assert_eq!(tables, 5);
    }

    #[test]
    fn test_serialize_vector() {
        let vec = vec![1.0, 2.0, -3.5];
        let bytes = serialize_vector(&vec);
        assert_eq!(bytes.len(), 12);

        // 1.0f32 in hex: 0x3f800000 -> little endian: 00 00 80 3f
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(deserialize_vector(&bytes), vec);
    }

    #[test]
    fn test_vec_distance_available() {
        let db = VectorDb::open_in_memory().unwrap();
        let a = serialize_vector(&[1.0, 0.0]);
        let b = serialize_vector(&[0.0, 1.0]);
        let distance: f64 = db
            .conn
            .query_row("SELECT vec_distance_cosine(?, ?)", (&a, &b), |row| {
                row.get(0)
            })
            .unwrap();
        assert!((distance - 1.0).abs() < 1e-6, "orthogonal vectors, got {distance}");
    }
}
