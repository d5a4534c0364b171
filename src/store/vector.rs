//! Durable chunk embedding store with filtered, reranked, and
//! diversity-aware search.
//!
//! Chunks are upserted by id and partitioned into collections; a
//! collection is created on first write and its dimension count is fixed
//! by the first stored vector. Every search is scoped to rows stamped
//! `_type = "chunk"` and to collections whose dimensions match the query
//! vector, so mixed-dimension deployments never fault inside
//! `vec_distance_cosine`.

use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Transaction, params};
use tokio::sync::Mutex as TokioMutex;

use super::models::{COLLECTION_KEY, Chunk, TYPE_CHUNK, TYPE_KEY};
use super::{VectorDb, deserialize_vector, serialize_vector};
use crate::error::{RagError, Result};
use crate::provider::Metadata;

/// Candidate multiplier for rerank and diversity searches.
const CANDIDATE_FACTOR: usize = 3;

/// Reranker strategies applied over a widened candidate pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankStrategy {
    /// Multiply the vector score by `1 + boost·min(1, keyword_matches/5)`.
    KeywordBoost,
}

impl RerankStrategy {
    /// Parse a wire-format strategy name.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "keyword_boost" | "keyword-boost" => Ok(Self::KeywordBoost),
            other => Err(RagError::invalid_input(format!(
                "unknown rerank strategy: {other}"
            ))),
        }
    }
}

/// Thread-safe vector store over the shared vector database.
#[derive(Clone)]
pub struct VectorStore {
    db: Arc<TokioMutex<VectorDb>>,
}

impl VectorStore {
    pub fn new(db: Arc<TokioMutex<VectorDb>>) -> Self {
        Self { db }
    }

    /// Upsert chunks by id.
    ///
    /// The chunk's collection comes from its metadata (default
    /// `"default"`); the collection row is created if absent with the
    /// dimensions of the first vector written to it.
    pub async fn store(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut db = self.db.lock().await;
        let tx = db
            .conn
            .transaction()
            .map_err(|e| RagError::VectorStoreFailed(e.to_string()))?;

        for chunk in chunks {
            let collection = chunk.collection().to_string();
            ensure_collection(&tx, &collection, chunk.vector.len())?;

            let mut metadata = chunk.metadata.clone();
            metadata.insert(
                TYPE_KEY.to_string(),
                serde_json::Value::String(TYPE_CHUNK.to_string()),
            );
            metadata.insert(
                COLLECTION_KEY.to_string(),
                serde_json::Value::String(collection.clone()),
            );
            let metadata_json = serde_json::to_string(&metadata)?;

            tx.execute(
                r#"
                INSERT INTO embeddings (id, doc_id, content, vector, collection, metadata)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    doc_id = excluded.doc_id,
                    content = excluded.content,
                    vector = excluded.vector,
                    collection = excluded.collection,
                    metadata = excluded.metadata
                "#,
                params![
                    chunk.id,
                    chunk.document_id,
                    chunk.content,
                    serialize_vector(&chunk.vector),
                    collection,
                    metadata_json,
                ],
            )
            .map_err(|e| RagError::VectorStoreFailed(e.to_string()))?;
        }

        tx.commit()
            .map_err(|e| RagError::VectorStoreFailed(e.to_string()))
    }

    /// Cosine similarity search across all collections.
    pub async fn search(&self, query_vector: &[f32], top_k: usize) -> Result<Vec<Chunk>> {
        self.search_with_filters(query_vector, top_k, &Metadata::new())
            .await
    }

    /// Cosine similarity search with exact-match metadata filters.
    pub async fn search_with_filters(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filters: &Metadata,
    ) -> Result<Vec<Chunk>> {
        let db = self.db.lock().await;
        run_search(&db, query_vector, top_k, filters)
    }

    /// Retrieve a widened candidate pool, apply a reranker strategy, and
    /// return the best `top_k`.
    pub async fn search_with_reranker(
        &self,
        query_vector: &[f32],
        query_text: &str,
        top_k: usize,
        strategy: RerankStrategy,
        boost: f32,
    ) -> Result<Vec<Chunk>> {
        let pool = top_k.saturating_mul(CANDIDATE_FACTOR).max(top_k);
        let mut candidates = {
            let db = self.db.lock().await;
            run_search(&db, query_vector, pool, &Metadata::new())?
        };

        match strategy {
            RerankStrategy::KeywordBoost => {
                let keywords: Vec<String> = query_text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| w.chars().count() > 2)
                    .map(|w| w.to_lowercase())
                    .collect();

                for chunk in &mut candidates {
                    let content = chunk.content.to_lowercase();
                    let matches = keywords.iter().filter(|k| content.contains(*k)).count();
                    let factor = 1.0 + boost * (matches as f32 / 5.0).min(1.0);
                    chunk.score *= factor;
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(top_k);
        Ok(candidates)
    }

    /// MMR-style diversity selection over a widened candidate pool.
    ///
    /// Selects `argmax_i [ λ·sim(q,i) − (1−λ)·max_{j∈S} sim(i,j) ]` until
    /// `top_k` chunks are chosen.
    pub async fn search_with_diversity(
        &self,
        query_vector: &[f32],
        top_k: usize,
        lambda: f32,
    ) -> Result<Vec<Chunk>> {
        let pool = top_k.saturating_mul(CANDIDATE_FACTOR).max(top_k);
        let candidates = {
            let db = self.db.lock().await;
            run_search(&db, query_vector, pool, &Metadata::new())?
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut remaining: Vec<Chunk> = candidates;
        let mut selected: Vec<Chunk> = Vec::with_capacity(top_k);

        while selected.len() < top_k && !remaining.is_empty() {
            let mut best_idx = 0;
            let mut best_score = f32::NEG_INFINITY;

            for (i, candidate) in remaining.iter().enumerate() {
                let relevance = cosine(query_vector, &candidate.vector);
                let redundancy = selected
                    .iter()
                    .map(|s| cosine(&candidate.vector, &s.vector))
                    .fold(0.0f32, f32::max);
                let mmr = lambda * relevance - (1.0 - lambda) * redundancy;
                if mmr > best_score {
                    best_score = mmr;
                    best_idx = i;
                }
            }

            selected.push(remaining.remove(best_idx));
        }

        Ok(selected)
    }

    /// Remove all chunks belonging to a document.
    pub async fn delete(&self, document_id: &str) -> Result<usize> {
        let db = self.db.lock().await;
        db.conn
            .execute("DELETE FROM embeddings WHERE doc_id = ?", params![document_id])
            .map_err(|e| RagError::VectorStoreFailed(e.to_string()))
    }

    /// Distinct document ids present in the store.
    pub async fn list_documents(&self) -> Result<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare("SELECT DISTINCT doc_id FROM embeddings ORDER BY doc_id")
            .map_err(|e| RagError::VectorStoreFailed(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| RagError::VectorStoreFailed(e.to_string()))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(|e| RagError::VectorStoreFailed(e.to_string()))?);
        }
        Ok(ids)
    }

    /// Remove all chunks and all collections.
    pub async fn reset(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.conn
            .execute_batch("DELETE FROM embeddings; DELETE FROM collections;")
            .map_err(|e| RagError::VectorStoreFailed(e.to_string()))
    }
}

/// Create the collection row if absent. First writer wins on dimensions.
fn ensure_collection(tx: &Transaction<'_>, name: &str, dimensions: usize) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO collections (name, dimensions) VALUES (?, ?)",
        params![name, dimensions as i64],
    )
    .map_err(|e| RagError::VectorStoreFailed(e.to_string()))?;
    Ok(())
}

fn run_search(
    db: &VectorDb,
    query_vector: &[f32],
    top_k: usize,
    filters: &Metadata,
) -> Result<Vec<Chunk>> {
    let mut query = String::from(
        r#"
        SELECT id, doc_id, content, vector, metadata,
               vec_distance_cosine(vector, ?) AS distance
        FROM embeddings
        WHERE json_extract(metadata, '$._type') = 'chunk'
          AND collection IN (SELECT name FROM collections WHERE dimensions = ?)
        "#,
    );

    let mut sql_params: Vec<Value> = vec![
        Value::Blob(serialize_vector(query_vector)),
        Value::Integer(query_vector.len() as i64),
    ];

    for (key, value) in filters {
        if key == TYPE_KEY {
            continue; // always enforced above
        }
        query.push_str(" AND json_extract(metadata, ?) = ?");
        sql_params.push(Value::Text(format!("$.{key}")));
        sql_params.push(json_to_sql(value));
    }

    query.push_str(" ORDER BY distance ASC, id ASC LIMIT ?");
    sql_params.push(Value::Integer(top_k as i64));

    let param_refs: Vec<&dyn rusqlite::ToSql> =
        sql_params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

    let mut stmt = db
        .conn
        .prepare(&query)
        .map_err(|e| RagError::VectorStoreFailed(e.to_string()))?;
    let rows = stmt
        .query_map(param_refs.as_slice(), map_chunk_row)
        .map_err(|e| RagError::VectorStoreFailed(e.to_string()))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(|e| RagError::VectorStoreFailed(e.to_string()))?);
    }
    Ok(results)
}

fn map_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let vector_blob: Vec<u8> = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let distance: f64 = row.get(5)?;

    // Cosine distance is in [0, 2]; map to a [0, 1] similarity.
    let similarity = (1.0 - distance / 2.0).clamp(0.0, 1.0) as f32;

    Ok(Chunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        content: row.get(2)?,
        vector: deserialize_vector(&vector_blob),
        score: similarity,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

fn json_to_sql(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Bool(b) => Value::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        other => Value::Text(other.to_string()),
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
