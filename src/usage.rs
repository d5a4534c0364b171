//! Usage tracking: every RAG query, chunk hit, and tool call is recorded
//! for audit and analytics.
//!
//! The hot path pays for a single synchronous row insert (the query
//! record); hits and tool calls are written by detached tasks that funnel
//! into the shared connection mutex. A query record is always written
//! before its hits, so the foreign keys hold at any instant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{RagError, Result};
use crate::store::UsageDb;

// ── Records ──────────────────────────────────────────────────────────

/// One recorded RAG query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagQueryRecord {
    pub id: String,
    pub conversation_id: Option<String>,
    pub query: String,
    pub answer: String,
    pub top_k: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    pub total_ms: u64,
    pub retrieval_ms: u64,
    pub generation_ms: u64,
    pub chunks_found: u32,
    pub tool_calls: u32,
    pub success: bool,
    pub error: Option<String>,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub estimated_cost: f64,
    pub created_at: DateTime<Utc>,
}

/// One chunk retrieved for a query, with its content snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkHit {
    pub id: String,
    pub query_id: String,
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub score: f32,
    /// 1-based, unique per query, monotonically increasing.
    pub rank_position: u32,
    pub used_in_generation: bool,
    pub source_file: String,
    pub start_offset: Option<u64>,
    pub end_offset: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// One tool invocation made while answering a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub query_id: String,
    pub tool_name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
    /// JSON-encoded result, if the call returned one.
    pub result: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

// ── Metrics ──────────────────────────────────────────────────────────

/// Score-shape metrics over a query's hits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub average_score: f32,
    pub top_score: f32,
    /// Five buckets over [0, 1): [0,0.2), [0.2,0.4), ... [0.8,1.0].
    pub score_distribution: [u32; 5],
    /// Score variance.
    pub diversity: f32,
    pub coverage: f32,
}

impl RetrievalMetrics {
    pub fn from_hits(hits: &[ChunkHit]) -> Self {
        if hits.is_empty() {
            return Self::default();
        }

        let scores: Vec<f32> = hits.iter().map(|h| h.score).collect();
        let n = scores.len() as f32;
        let average = scores.iter().sum::<f32>() / n;
        let top = scores.iter().fold(0.0f32, |a, &b| a.max(b));

        let mut distribution = [0u32; 5];
        for &score in &scores {
            let bucket = ((score * 5.0) as usize).min(4);
            distribution[bucket] += 1;
        }

        let variance = scores.iter().map(|s| (s - average).powi(2)).sum::<f32>() / n;
        let coverage = average + if top > 0.8 { 0.1 } else { 0.0 };

        Self {
            average_score: average,
            top_score: top,
            score_distribution: distribution,
            diversity: variance,
            coverage,
        }
    }
}

/// Heuristic answer-quality metrics over a query's hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub source_utilization: f32,
    pub confidence: f32,
    pub hallucination_risk: f32,
    pub factuality: f32,
}

impl QualityMetrics {
    pub fn from_hits(hits: &[ChunkHit]) -> Self {
        if hits.is_empty() {
            return Self {
                source_utilization: 0.0,
                confidence: 0.0,
                hallucination_risk: 0.9,
                factuality: 0.0,
            };
        }

        let total = hits.len() as f32;
        let used = hits.iter().filter(|h| h.used_in_generation).count() as f32;
        let utilization = used / total;

        let average = hits.iter().map(|h| h.score).sum::<f32>() / total;
        let top = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);

        let confidence = 0.8 * utilization + 0.2 * average;
        let factuality = 0.6 * utilization + if top > 0.7 { 0.3 } else { 0.0 };

        Self {
            source_utilization: utilization,
            confidence,
            hallucination_risk: 1.0 - confidence,
            factuality,
        }
    }
}

// ── Read-path shapes ─────────────────────────────────────────────────

/// Filters for query listing.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub conversation_id: Option<String>,
    /// Substring match on the query text.
    pub query_contains: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Per-query visualization bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDetail {
    pub query: RagQueryRecord,
    pub hits: Vec<ChunkHit>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub retrieval: RetrievalMetrics,
    pub quality: QualityMetrics,
}

/// Aggregate analytics over the recorded queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageAnalytics {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub success_rate: f32,
    pub average_total_ms: f64,
    pub latency_under_1s: u64,
    pub latency_1s_to_5s: u64,
    pub latency_over_5s: u64,
    pub top_queries: Vec<(String, u64)>,
    pub popular_sources: Vec<(String, u64)>,
}

// ── Token estimation ─────────────────────────────────────────────────

/// Estimate token count for a model family from character count.
///
/// Used only when the provider does not report usage.
pub fn estimate_tokens(text: &str, model: &str) -> u32 {
    let chars = text.chars().count() as f32;
    (chars * model_char_ratio(model)).ceil() as u32
}

fn model_char_ratio(model: &str) -> f32 {
    let m = model.to_lowercase();
    if m.contains("llama") || m.contains("qwen") {
        0.285
    } else {
        // GPT family and the general fallback
        0.25
    }
}

// ── Tracker ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct UsageTracker {
    db: Arc<TokioMutex<UsageDb>>,
}

impl UsageTracker {
    pub fn new(db: Arc<TokioMutex<UsageDb>>) -> Self {
        Self { db }
    }

    /// Record a query. Synchronous single-row insert on the hot path.
    pub async fn record_query(&self, record: &RagQueryRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.conn
            .execute(
                r#"
                INSERT INTO rag_queries (
                    id, conversation_id, query, answer, top_k, temperature, max_tokens,
                    total_ms, retrieval_ms, generation_ms, chunks_found, tool_calls,
                    success, error, model, input_tokens, output_tokens, total_tokens,
                    estimated_cost, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    record.id,
                    record.conversation_id,
                    record.query,
                    record.answer,
                    record.top_k,
                    record.temperature as f64,
                    record.max_tokens,
                    record.total_ms as i64,
                    record.retrieval_ms as i64,
                    record.generation_ms as i64,
                    record.chunks_found,
                    record.tool_calls,
                    record.success,
                    record.error,
                    record.model,
                    record.input_tokens,
                    record.output_tokens,
                    record.total_tokens,
                    record.estimated_cost,
                    record.created_at,
                ],
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        Ok(())
    }

    /// Record chunk hits off the hot path. The returned handle is only
    /// needed by tests; dropping it leaves the write running.
    pub fn record_hits(&self, hits: Vec<ChunkHit>) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = insert_hits(&db, &hits).await {
                warn!("failed to record chunk hits: {e}");
            }
        })
    }

    /// Record a tool call off the hot path.
    pub fn record_tool_call(&self, record: ToolCallRecord) -> JoinHandle<()> {
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = insert_tool_call(&db, &record).await {
                warn!("failed to record tool call: {e}");
            }
        })
    }

    /// Fetch one query record.
    pub async fn get_query(&self, id: &str) -> Result<RagQueryRecord> {
        let db = self.db.lock().await;
        let record = db
            .conn
            .query_row(
                &format!("SELECT {QUERY_COLUMNS} FROM rag_queries WHERE id = ?"),
                params![id],
                map_query_row,
            )
            .optional()
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        record.ok_or_else(|| RagError::not_found("query", id))
    }

    /// List queries newest-first with optional filters and pagination.
    pub async fn list_queries(&self, filter: &QueryFilter) -> Result<Vec<RagQueryRecord>> {
        let mut sql = format!("SELECT {QUERY_COLUMNS} FROM rag_queries");
        let mut clauses: Vec<&str> = Vec::new();
        let mut sql_params: Vec<Value> = Vec::new();

        if let Some(conversation_id) = &filter.conversation_id {
            clauses.push("conversation_id = ?");
            sql_params.push(Value::Text(conversation_id.clone()));
        }
        if let Some(substring) = &filter.query_contains {
            clauses.push("query LIKE ? ESCAPE '\\'");
            let escaped = substring.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
            sql_params.push(Value::Text(format!("%{escaped}%")));
        }
        if let Some(since) = &filter.since {
            clauses.push("created_at >= ?");
            sql_params.push(Value::Text(since.to_rfc3339()));
        }
        if let Some(until) = &filter.until {
            clauses.push("created_at <= ?");
            sql_params.push(Value::Text(until.to_rfc3339()));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
        sql_params.push(Value::Integer(filter.limit.unwrap_or(50) as i64));
        sql_params.push(Value::Integer(filter.offset as i64));

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            sql_params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare(&sql)
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        let rows = stmt
            .query_map(param_refs.as_slice(), map_query_row)
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| RagError::ChatStoreFailed(e.to_string()))?);
        }
        Ok(records)
    }

    /// The full visualization bundle for one query.
    pub async fn query_detail(&self, id: &str) -> Result<QueryDetail> {
        let query = self.get_query(id).await?;
        let hits = self.hits_for_query(id).await?;
        let tool_calls = self.tool_calls_for_query(id).await?;
        let retrieval = RetrievalMetrics::from_hits(&hits);
        let quality = QualityMetrics::from_hits(&hits);

        Ok(QueryDetail {
            query,
            hits,
            tool_calls,
            retrieval,
            quality,
        })
    }

    /// Hits for a query, ordered by rank.
    pub async fn hits_for_query(&self, query_id: &str) -> Result<Vec<ChunkHit>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare(
                r#"
                SELECT id, query_id, chunk_id, document_id, content, score, rank_position,
                       used_in_generation, source_file, start_offset, end_offset, created_at
                FROM rag_chunk_hits
                WHERE query_id = ?
                ORDER BY rank_position ASC
                "#,
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        let rows = stmt
            .query_map(params![query_id], map_hit_row)
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

        let mut hits = Vec::new();
        for row in rows {
            hits.push(row.map_err(|e| RagError::ChatStoreFailed(e.to_string()))?);
        }
        Ok(hits)
    }

    /// Tool calls for a query, in recording order.
    pub async fn tool_calls_for_query(&self, query_id: &str) -> Result<Vec<ToolCallRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare(
                r#"
                SELECT id, query_id, tool_name, arguments, result, success, error,
                       duration_ms, created_at
                FROM rag_tool_calls
                WHERE query_id = ?
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        let rows = stmt
            .query_map(params![query_id], map_tool_call_row)
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row.map_err(|e| RagError::ChatStoreFailed(e.to_string()))?);
        }
        Ok(calls)
    }

    /// Delete a query record; hits and tool calls cascade.
    pub async fn delete_query(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db
            .conn
            .execute("DELETE FROM rag_queries WHERE id = ?", params![id])
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        Ok(rows > 0)
    }

    /// Aggregate analytics over all recorded queries.
    pub async fn analytics(&self) -> Result<UsageAnalytics> {
        let db = self.db.lock().await;

        let (total, successful, average_ms, under_1s, s1_to_5s, over_5s): (
            u64,
            u64,
            f64,
            u64,
            u64,
            u64,
        ) = db
            .conn
            .query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(success), 0),
                       COALESCE(AVG(total_ms), 0.0),
                       COALESCE(SUM(total_ms < 1000), 0),
                       COALESCE(SUM(total_ms >= 1000 AND total_ms <= 5000), 0),
                       COALESCE(SUM(total_ms > 5000), 0)
                FROM rag_queries
                "#,
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? as u64,
                        row.get::<_, i64>(1)? as u64,
                        row.get(2)?,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, i64>(4)? as u64,
                        row.get::<_, i64>(5)? as u64,
                    ))
                },
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

        let top_queries = count_rows(
            &db,
            "SELECT query, COUNT(*) AS n FROM rag_queries GROUP BY query ORDER BY n DESC, query ASC LIMIT 10",
        )?;
        let popular_sources = count_rows(
            &db,
            r#"
            SELECT COALESCE(NULLIF(h.source_file, ''), h.document_id) AS source, COUNT(*) AS n
            FROM rag_chunk_hits h
            JOIN rag_queries q ON h.query_id = q.id
            GROUP BY source ORDER BY n DESC, source ASC LIMIT 10
            "#,
        )?;

        Ok(UsageAnalytics {
            total_queries: total,
            successful_queries: successful,
            success_rate: if total > 0 {
                successful as f32 / total as f32
            } else {
                0.0
            },
            average_total_ms: average_ms,
            latency_under_1s: under_1s,
            latency_1s_to_5s: s1_to_5s,
            latency_over_5s: over_5s,
            top_queries,
            popular_sources,
        })
    }
}

async fn insert_hits(db: &Arc<TokioMutex<UsageDb>>, hits: &[ChunkHit]) -> Result<()> {
    if hits.is_empty() {
        return Ok(());
    }
    let mut db = db.lock().await;
    let tx = db
        .conn
        .transaction()
        .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
    for hit in hits {
        tx.execute(
            r#"
            INSERT INTO rag_chunk_hits (
                id, query_id, chunk_id, document_id, content, score, rank_position,
                used_in_generation, source_file, start_offset, end_offset, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                hit.id,
                hit.query_id,
                hit.chunk_id,
                hit.document_id,
                hit.content,
                hit.score as f64,
                hit.rank_position,
                hit.used_in_generation,
                hit.source_file,
                hit.start_offset.map(|v| v as i64),
                hit.end_offset.map(|v| v as i64),
                hit.created_at,
            ],
        )
        .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| RagError::ChatStoreFailed(e.to_string()))
}

async fn insert_tool_call(db: &Arc<TokioMutex<UsageDb>>, record: &ToolCallRecord) -> Result<()> {
    let db = db.lock().await;
    db.conn
        .execute(
            r#"
            INSERT INTO rag_tool_calls (
                id, query_id, tool_name, arguments, result, success, error,
                duration_ms, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.id,
                record.query_id,
                record.tool_name,
                record.arguments,
                record.result,
                record.success,
                record.error,
                record.duration_ms as i64,
                record.created_at,
            ],
        )
        .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
    Ok(())
}

const QUERY_COLUMNS: &str = "id, conversation_id, query, answer, top_k, temperature, max_tokens, \
     total_ms, retrieval_ms, generation_ms, chunks_found, tool_calls, success, error, model, \
     input_tokens, output_tokens, total_tokens, estimated_cost, created_at";

fn map_query_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RagQueryRecord> {
    Ok(RagQueryRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        query: row.get(2)?,
        answer: row.get(3)?,
        top_k: row.get(4)?,
        temperature: row.get::<_, f64>(5)? as f32,
        max_tokens: row.get(6)?,
        total_ms: row.get::<_, i64>(7)? as u64,
        retrieval_ms: row.get::<_, i64>(8)? as u64,
        generation_ms: row.get::<_, i64>(9)? as u64,
        chunks_found: row.get(10)?,
        tool_calls: row.get(11)?,
        success: row.get(12)?,
        error: row.get(13)?,
        model: row.get(14)?,
        input_tokens: row.get(15)?,
        output_tokens: row.get(16)?,
        total_tokens: row.get(17)?,
        estimated_cost: row.get(18)?,
        created_at: row.get(19)?,
    })
}

fn map_hit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkHit> {
    Ok(ChunkHit {
        id: row.get(0)?,
        query_id: row.get(1)?,
        chunk_id: row.get(2)?,
        document_id: row.get(3)?,
        content: row.get(4)?,
        score: row.get::<_, f64>(5)? as f32,
        rank_position: row.get(6)?,
        used_in_generation: row.get(7)?,
        source_file: row.get(8)?,
        start_offset: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        end_offset: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        created_at: row.get(11)?,
    })
}

fn map_tool_call_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    Ok(ToolCallRecord {
        id: row.get(0)?,
        query_id: row.get(1)?,
        tool_name: row.get(2)?,
        arguments: row.get(3)?,
        result: row.get(4)?,
        success: row.get(5)?,
        error: row.get(6)?,
        duration_ms: row.get::<_, i64>(7)? as u64,
        created_at: row.get(8)?,
    })
}

fn count_rows(db: &UsageDb, sql: &str) -> Result<Vec<(String, u64)>> {
    let mut stmt = db
        .conn
        .prepare(sql)
        .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })
        .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row.map_err(|e| RagError::ChatStoreFailed(e.to_string()))?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tracker() -> UsageTracker {
        let db = UsageDb::open_in_memory().unwrap();
        UsageTracker::new(Arc::new(TokioMutex::new(db)))
    }

    fn query_record(id: &str, query: &str, success: bool, total_ms: u64) -> RagQueryRecord {
        RagQueryRecord {
            id: id.to_string(),
            conversation_id: None,
            query: query.to_string(),
            answer: "answer".to_string(),
            top_k: 5,
            temperature: 0.7,
            max_tokens: 25000,
            total_ms,
            retrieval_ms: total_ms / 4,
            generation_ms: total_ms / 2,
            chunks_found: 0,
            tool_calls: 0,
            success,
            error: None,
            model: "qwen2.5:7b".to_string(),
            input_tokens: 100,
            output_tokens: 20,
            total_tokens: 120,
            estimated_cost: 0.0,
            created_at: Utc::now(),
        }
    }

    fn hit(query_id: &str, rank: u32, score: f32, used: bool) -> ChunkHit {
        ChunkHit {
            id: Uuid::new_v4().to_string(),
            query_id: query_id.to_string(),
            chunk_id: format!("doc_{rank}"),
            document_id: "doc".to_string(),
            content: format!("chunk {rank}"),
            score,
            rank_position: rank,
            used_in_generation: used,
            source_file: "notes.md".to_string(),
            start_offset: None,
            end_offset: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_get_query() {
        let tracker = tracker();
        tracker
            .record_query(&query_record("q1", "what is rust", true, 800))
            .await
            .unwrap();

        let fetched = tracker.get_query("q1").await.unwrap();
        assert_eq!(fetched.query, "what is rust");
        assert!(fetched.success);
    }

    #[tokio::test]
    async fn test_get_missing_query() {
        let tracker = tracker();
        let err = tracker.get_query("nope").await.unwrap_err();
        assert!(matches!(err, RagError::NotFound { kind: "query", .. }));
    }

    #[tokio::test]
    async fn test_hits_recorded_async_and_ordered() {
        let tracker = tracker();
        tracker
            .record_query(&query_record("q1", "q", true, 100))
            .await
            .unwrap();

        // Insert out of rank order; the read path orders by rank.
        tracker
            .record_hits(vec![
                hit("q1", 2, 0.7, false),
                hit("q1", 1, 0.9, true),
            ])
            .await
            .unwrap();

        let hits = tracker.hits_for_query("q1").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rank_position, 1);
        assert_eq!(hits[1].rank_position, 2);
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let tracker = tracker();
        tracker
            .record_query(&query_record("q1", "q", true, 100))
            .await
            .unwrap();
        tracker
            .record_hits(vec![hit("q1", 1, 0.9, true)])
            .await
            .unwrap();
        tracker
            .record_tool_call(ToolCallRecord {
                id: Uuid::new_v4().to_string(),
                query_id: "q1".to_string(),
                tool_name: "search".to_string(),
                arguments: "{}".to_string(),
                result: Some("{}".to_string()),
                success: true,
                error: None,
                duration_ms: 12,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(tracker.delete_query("q1").await.unwrap());
        assert!(tracker.hits_for_query("q1").await.unwrap().is_empty());
        assert!(tracker.tool_calls_for_query("q1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_queries_filters() {
        let tracker = tracker();
        let mut in_conversation = query_record("q1", "rust borrow checker", true, 100);
        in_conversation.conversation_id = Some("c1".to_string());
        tracker.record_query(&in_conversation).await.unwrap();
        tracker
            .record_query(&query_record("q2", "gardening", true, 100))
            .await
            .unwrap();

        let by_conversation = tracker
            .list_queries(&QueryFilter {
                conversation_id: Some("c1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_conversation.len(), 1);
        assert_eq!(by_conversation[0].id, "q1");

        let by_substring = tracker
            .list_queries(&QueryFilter {
                query_contains: Some("borrow".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_substring.len(), 1);

        let paged = tracker
            .list_queries(&QueryFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[tokio::test]
    async fn test_query_detail_includes_metrics() {
        let tracker = tracker();
        let mut record = query_record("q1", "q", true, 100);
        record.chunks_found = 2;
        tracker.record_query(&record).await.unwrap();
        tracker
            .record_hits(vec![hit("q1", 1, 0.9, true), hit("q1", 2, 0.5, false)])
            .await
            .unwrap();

        let detail = tracker.query_detail("q1").await.unwrap();
        assert_eq!(detail.hits.len(), 2);
        assert!(detail.retrieval.top_score >= detail.retrieval.average_score);
        assert!((detail.quality.source_utilization - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_analytics() {
        let tracker = tracker();
        tracker
            .record_query(&query_record("q1", "popular", true, 500))
            .await
            .unwrap();
        tracker
            .record_query(&query_record("q2", "popular", true, 2000))
            .await
            .unwrap();
        tracker
            .record_query(&query_record("q3", "rare", false, 8000))
            .await
            .unwrap();
        tracker
            .record_hits(vec![hit("q1", 1, 0.9, true)])
            .await
            .unwrap();

        let analytics = tracker.analytics().await.unwrap();
        assert_eq!(analytics.total_queries, 3);
        assert_eq!(analytics.successful_queries, 2);
        assert!((analytics.success_rate - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(analytics.latency_under_1s, 1);
        assert_eq!(analytics.latency_1s_to_5s, 1);
        assert_eq!(analytics.latency_over_5s, 1);
        assert_eq!(analytics.top_queries[0], ("popular".to_string(), 2));
        assert_eq!(analytics.popular_sources[0], ("notes.md".to_string(), 1));
    }

    #[test]
    fn test_retrieval_metrics() {
        let hits = vec![hit("q", 1, 0.9, true), hit("q", 2, 0.5, false)];
        let metrics = RetrievalMetrics::from_hits(&hits);

        assert!((metrics.average_score - 0.7).abs() < 1e-6);
        assert!((metrics.top_score - 0.9).abs() < 1e-6);
        assert_eq!(metrics.score_distribution[4], 1); // 0.9
        assert_eq!(metrics.score_distribution[2], 1); // 0.5
        // top_score > 0.8 adds the coverage bonus
        assert!((metrics.coverage - 0.8).abs() < 1e-6);
        assert!(metrics.diversity > 0.0);
    }

    #[test]
    fn test_quality_metrics_no_hits() {
        let metrics = QualityMetrics::from_hits(&[]);
        assert_eq!(metrics.hallucination_risk, 0.9);
        assert_eq!(metrics.source_utilization, 0.0);
    }

    #[test]
    fn test_quality_metrics_formula() {
        let hits = vec![hit("q", 1, 0.8, true), hit("q", 2, 0.6, false)];
        let metrics = QualityMetrics::from_hits(&hits);

        let expected_confidence = 0.8 * 0.5 + 0.2 * 0.7;
        assert!((metrics.confidence - expected_confidence).abs() < 1e-6);
        assert!((metrics.hallucination_risk - (1.0 - expected_confidence)).abs() < 1e-6);
        // top_score 0.8 > 0.7 earns the factuality bonus
        assert!((metrics.factuality - (0.6 * 0.5 + 0.3)).abs() < 1e-6);
    }

    #[test]
    fn test_token_estimation_by_family() {
        let text = "a".repeat(100);
        assert_eq!(estimate_tokens(&text, "gpt-4o"), 25);
        assert_eq!(estimate_tokens(&text, "llama3.1:8b"), 29);
        assert_eq!(estimate_tokens(&text, "qwen2.5:7b"), 29);
        assert_eq!(estimate_tokens(&text, "unknown-model"), 25);
    }
}
