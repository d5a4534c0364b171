//! Knowledge graph store: nodes, weighted edges, and hybrid search.
//!
//! Node ids are deterministic per entity name (see
//! [`models::node_id`]), so repeated ingests of the same entity upsert
//! in place with merge-last-wins semantics. Edges are never deduplicated
//! at write time; traversal collapses duplicates through its visited set.
//!
//! Hybrid search combines embedding similarity with BFS hop distance from
//! an optional start node: `combined = 0.7·vector + 0.3·graph`, where
//! `graph = 1/(1+d)` and `d` is capped at 3 hops.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use super::models::{GraphEdge, GraphNode, HybridResult};
use super::{VectorDb, deserialize_vector, serialize_vector};
use crate::error::{RagError, Result};

const VECTOR_WEIGHT: f32 = 0.7;
const GRAPH_WEIGHT: f32 = 0.3;
const MAX_HOPS: u32 = 3;

#[derive(Clone)]
pub struct GraphStore {
    db: Arc<TokioMutex<VectorDb>>,
}

impl GraphStore {
    pub fn new(db: Arc<TokioMutex<VectorDb>>) -> Self {
        Self { db }
    }

    /// Insert or merge a node. Description content and properties are
    /// merge-last-wins; an absent vector never clears a stored one.
    pub async fn upsert_node(&self, node: &GraphNode) -> Result<()> {
        let mut db = self.db.lock().await;
        let tx = db
            .conn
            .transaction()
            .map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT properties FROM graph_nodes WHERE id = ?",
                params![node.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;

        let mut properties: crate::provider::Metadata = existing
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default();
        for (k, v) in &node.properties {
            properties.insert(k.clone(), v.clone());
        }
        let properties_json = serde_json::to_string(&properties)?;

        let vector_blob = if node.vector.is_empty() {
            None
        } else {
            Some(serialize_vector(&node.vector))
        };

        tx.execute(
            r#"
            INSERT INTO graph_nodes (id, node_type, content, vector, properties)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                node_type = excluded.node_type,
                content = excluded.content,
                vector = COALESCE(excluded.vector, graph_nodes.vector),
                properties = excluded.properties
            "#,
            params![
                node.id,
                node.node_type,
                node.content,
                vector_blob,
                properties_json
            ],
        )
        .map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;

        tx.commit()
            .map_err(|e| RagError::GraphStoreFailed(e.to_string()))
    }

    /// Insert an edge. Edges are not deduplicated across ingests.
    pub async fn upsert_edge(&self, edge: &GraphEdge) -> Result<()> {
        let id = if edge.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            edge.id.clone()
        };
        let properties_json = serde_json::to_string(&edge.properties)?;

        let db = self.db.lock().await;
        db.conn
            .execute(
                r#"
                INSERT INTO graph_edges (id, from_id, to_id, edge_type, weight, properties)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    from_id = excluded.from_id,
                    to_id = excluded.to_id,
                    edge_type = excluded.edge_type,
                    weight = excluded.weight,
                    properties = excluded.properties
                "#,
                params![
                    id,
                    edge.from_id,
                    edge.to_id,
                    edge.edge_type,
                    edge.weight.clamp(0.0, 1.0) as f64,
                    properties_json
                ],
            )
            .map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;
        Ok(())
    }

    /// Fetch a node by id.
    pub async fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let db = self.db.lock().await;
        db.conn
            .query_row(
                "SELECT id, node_type, content, vector, properties FROM graph_nodes WHERE id = ?",
                params![id],
                map_node_row,
            )
            .optional()
            .map_err(|e| RagError::GraphStoreFailed(e.to_string()))
    }

    /// Hybrid vector + traversal search.
    ///
    /// Without a start node the graph component is zero for every node
    /// and the ranking is purely by embedding similarity.
    pub async fn hybrid_search(
        &self,
        query_vector: &[f32],
        start_node_id: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<HybridResult>> {
        let (nodes, adjacency) = {
            let db = self.db.lock().await;
            (load_nodes(&db)?, load_adjacency(&db)?)
        };

        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let hops = start_node_id
            .map(|start| bfs_hops(start, &adjacency))
            .unwrap_or_default();

        let mut results: Vec<HybridResult> = nodes
            .into_iter()
            .map(|node| {
                let vector_score = if node.vector.len() == query_vector.len()
                    && !node.vector.is_empty()
                {
                    let cos = cosine(query_vector, &node.vector);
                    ((1.0 + cos) / 2.0).clamp(0.0, 1.0)
                } else {
                    0.0
                };

                let graph_score = match hops.get(node.id.as_str()) {
                    Some(&d) => 1.0 / (1.0 + d.min(MAX_HOPS) as f32),
                    None => 0.0,
                };

                HybridResult {
                    combined_score: VECTOR_WEIGHT * vector_score + GRAPH_WEIGHT * graph_score,
                    vector_score,
                    graph_score,
                    node,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        results.truncate(top_k);
        Ok(results)
    }

    /// Remove all nodes and edges.
    pub async fn reset(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.conn
            .execute_batch("DELETE FROM graph_edges; DELETE FROM graph_nodes;")
            .map_err(|e| RagError::GraphStoreFailed(e.to_string()))
    }
}

fn map_node_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNode> {
    let vector_blob: Option<Vec<u8>> = row.get(3)?;
    let properties_json: String = row.get(4)?;
    Ok(GraphNode {
        id: row.get(0)?,
        node_type: row.get(1)?,
        content: row.get(2)?,
        vector: vector_blob.map(|b| deserialize_vector(&b)).unwrap_or_default(),
        properties: serde_json::from_str(&properties_json).unwrap_or_default(),
    })
}

fn load_nodes(db: &VectorDb) -> Result<Vec<GraphNode>> {
    let mut stmt = db
        .conn
        .prepare("SELECT id, node_type, content, vector, properties FROM graph_nodes")
        .map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;
    let rows = stmt
        .query_map([], map_node_row)
        .map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;

    let mut nodes = Vec::new();
    for row in rows {
        nodes.push(row.map_err(|e| RagError::GraphStoreFailed(e.to_string()))?);
    }
    Ok(nodes)
}

/// Undirected adjacency view of the edge table. Duplicate edges collapse
/// into the same neighbor entry.
fn load_adjacency(db: &VectorDb) -> Result<HashMap<String, HashSet<String>>> {
    let mut stmt = db
        .conn
        .prepare("SELECT from_id, to_id FROM graph_edges")
        .map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;

    let mut adjacency: HashMap<String, HashSet<String>> = HashMap::new();
    for row in rows {
        let (from, to) = row.map_err(|e| RagError::GraphStoreFailed(e.to_string()))?;
        adjacency.entry(from.clone()).or_default().insert(to.clone());
        adjacency.entry(to).or_default().insert(from);
    }
    Ok(adjacency)
}

/// Shortest-path hop counts from `start`, bounded by the hop cap.
fn bfs_hops(start: &str, adjacency: &HashMap<String, HashSet<String>>) -> HashMap<String, u32> {
    let mut hops: HashMap<String, u32> = HashMap::new();
    hops.insert(start.to_string(), 0);

    let mut frontier = VecDeque::new();
    frontier.push_back((start.to_string(), 0u32));

    while let Some((node, depth)) = frontier.pop_front() {
        if depth >= MAX_HOPS {
            continue;
        }
        if let Some(neighbors) = adjacency.get(&node) {
            for neighbor in neighbors {
                if !hops.contains_key(neighbor) {
                    hops.insert(neighbor.clone(), depth + 1);
                    frontier.push_back((neighbor.clone(), depth + 1));
                }
            }
        }
    }

    hops
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
