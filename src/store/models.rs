//! Core data model shared across stores and pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::provider::Metadata;

/// Metadata key that scopes a chunk to a collection.
pub const COLLECTION_KEY: &str = "collection";
/// Default collection for chunks without an explicit one.
pub const DEFAULT_COLLECTION: &str = "default";
/// Internal row discriminator stamped into chunk metadata.
pub const TYPE_KEY: &str = "_type";
pub const TYPE_CHUNK: &str = "chunk";

/// An ingested document. Owns its chunks; deletion cascades to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Opaque stable identifier (UUID v4 string).
    pub id: String,
    /// Source path or URL the content came from.
    pub source: String,
    /// Full raw content (persisted to enable re-chunking).
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A contiguous slice of a document's text with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `<document_id>_<ordinal>`.
    pub id: String,
    pub document_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub vector: Vec<f32>,
    /// Retrieval score, populated by search only.
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    /// Compose a chunk id from its document and ordinal.
    pub fn compose_id(document_id: &str, ordinal: usize) -> String {
        format!("{document_id}_{ordinal}")
    }

    /// Collection this chunk belongs to, defaulting to `"default"`.
    pub fn collection(&self) -> &str {
        self.metadata
            .get(COLLECTION_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_COLLECTION)
    }
}

/// A knowledge-graph node. The id is deterministic per entity name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    /// Entity class, e.g. "person", "organization".
    pub node_type: String,
    /// Description content; embedded for vector scoring.
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub vector: Vec<f32>,
    #[serde(default)]
    pub properties: Metadata,
}

/// Deterministic node id: UUIDv5 over the normalized entity name.
///
/// Stable across ingests; case- and whitespace-insensitive.
pub fn node_id(name: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        name.trim().to_lowercase().as_bytes(),
    )
    .to_string()
}

/// A weighted, typed edge between two graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub edge_type: String,
    /// Weight in [0, 1].
    pub weight: f32,
    /// Includes provenance (source chunk id) under `"source_chunk"`.
    #[serde(default)]
    pub properties: Metadata,
}

/// One hybrid-search result.
#[derive(Debug, Clone)]
pub struct HybridResult {
    pub node: GraphNode,
    pub combined_score: f32,
    pub vector_score: f32,
    pub graph_score: f32,
}

/// A chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Message role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// An append-only chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    /// Optional embedding for semantic recall.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}
