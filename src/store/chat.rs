//! Per-session chat message log with semantic recall.
//!
//! Messages are append-only and ordered by timestamp (with the id as a
//! monotonic tiebreak), which keeps reads linearizable without any
//! caller-side locking.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use super::models::{ChatMessage, ChatSession, Role};
use super::{UsageDb, deserialize_vector, serialize_vector};
use crate::error::{RagError, Result};
use crate::provider::Metadata;

#[derive(Clone)]
pub struct ChatStore {
    db: Arc<TokioMutex<UsageDb>>,
}

impl ChatStore {
    pub fn new(db: Arc<TokioMutex<UsageDb>>) -> Self {
        Self { db }
    }

    /// Create a new session.
    pub async fn create_session(&self, user: &str, metadata: Metadata) -> Result<ChatSession> {
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            user: user.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata,
        };
        let metadata_json = serde_json::to_string(&session.metadata)?;

        let db = self.db.lock().await;
        db.conn
            .execute(
                "INSERT INTO conversations (id, user_name, created_at, updated_at, metadata) VALUES (?, ?, ?, ?, ?)",
                params![
                    session.id,
                    session.user,
                    session.created_at,
                    session.updated_at,
                    metadata_json
                ],
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        Ok(session)
    }

    /// Fetch a session by id. Fails with `NotFound` when missing.
    pub async fn get_session(&self, id: &str) -> Result<ChatSession> {
        let db = self.db.lock().await;
        let session = db
            .conn
            .query_row(
                "SELECT id, user_name, created_at, updated_at, metadata FROM conversations WHERE id = ?",
                params![id],
                |row| {
                    let metadata_json: String = row.get(4)?;
                    Ok(ChatSession {
                        id: row.get(0)?,
                        user: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                    })
                },
            )
            .optional()
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

        session.ok_or_else(|| RagError::not_found("session", id))
    }

    /// Append a message to its session.
    pub async fn add_message(&self, message: &ChatMessage) -> Result<()> {
        let embedding_blob = message.embedding.as_deref().map(serialize_vector);

        let db = self.db.lock().await;
        db.conn
            .execute(
                "INSERT INTO messages (id, conversation_id, role, content, embedding, created_at) VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    message.id,
                    message.session_id,
                    message.role.as_str(),
                    message.content,
                    embedding_blob,
                    message.created_at
                ],
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        db.conn
            .execute(
                "UPDATE conversations SET updated_at = ? WHERE id = ?",
                params![message.created_at, message.session_id],
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        Ok(())
    }

    /// The most recent `limit` messages of a session, oldest first.
    pub async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare(
                r#"
                SELECT id, conversation_id, role, content, embedding, created_at
                FROM messages
                WHERE conversation_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
                "#,
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;
        let rows = stmt
            .query_map(params![session_id, limit as i64], map_message_row)
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(|e| RagError::ChatStoreFailed(e.to_string()))?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Semantic recall: cosine similarity over message embeddings within
    /// a session. Messages without embeddings are skipped.
    pub async fn search_history(
        &self,
        query_vector: &[f32],
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<(ChatMessage, f32)>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare(
                r#"
                SELECT id, conversation_id, role, content, embedding, created_at,
                       vec_distance_cosine(embedding, ?) AS distance
                FROM messages
                WHERE conversation_id = ?
                  AND embedding IS NOT NULL
                  AND length(embedding) = ?
                ORDER BY distance ASC, id ASC
                LIMIT ?
                "#,
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

        let query_blob = serialize_vector(query_vector);
        let rows = stmt
            .query_map(
                params![
                    query_blob,
                    session_id,
                    (query_vector.len() * 4) as i64,
                    limit as i64
                ],
                |row| {
                    let message = map_message_row(row)?;
                    let distance: f64 = row.get(6)?;
                    let similarity = (1.0 - distance / 2.0).clamp(0.0, 1.0) as f32;
                    Ok((message, similarity))
                },
            )
            .map_err(|e| RagError::ChatStoreFailed(e.to_string()))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(|e| RagError::ChatStoreFailed(e.to_string()))?);
        }
        Ok(results)
    }

    /// Export a conversation as a self-contained JSON record with all
    /// messages in order.
    pub async fn export_conversation(&self, session_id: &str) -> Result<serde_json::Value> {
        let session = self.get_session(session_id).await?;
        let messages = self.history(session_id, usize::MAX >> 1).await?;

        Ok(serde_json::json!({
            "session": session,
            "messages": messages,
        }))
    }
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role_str: String = row.get(2)?;
    let embedding_blob: Option<Vec<u8>> = row.get(4)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::parse(&role_str).unwrap_or(Role::User),
        content: row.get(3)?,
        embedding: embedding_blob.map(|b| deserialize_vector(&b)),
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> ChatStore {
        let db = UsageDb::open_in_memory().unwrap();
        ChatStore::new(Arc::new(TokioMutex::new(db)))
    }

    fn message(
        session_id: &str,
        role: Role,
        content: &str,
        offset_secs: i64,
        embedding: Option<Vec<f32>>,
    ) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            embedding,
            created_at: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let store = store();
        let session = store.create_session("erin", Metadata::new()).await.unwrap();

        let fetched = store.get_session(&session.id).await.unwrap();
        assert_eq!(fetched.user, "erin");
    }

    #[tokio::test]
    async fn test_get_missing_session() {
        let store = store();
        let err = store.get_session("nope").await.unwrap_err();
        assert!(matches!(err, RagError::NotFound { kind: "session", .. }));
    }

    #[tokio::test]
    async fn test_history_recent_oldest_first() {
        let store = store();
        let session = store.create_session("u", Metadata::new()).await.unwrap();

        for i in 0..5 {
            store
                .add_message(&message(
                    &session.id,
                    Role::User,
                    &format!("message {i}"),
                    i,
                    None,
                ))
                .await
                .unwrap();
        }

        let recent = store.history(&session.id, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "message 2");
        assert_eq!(recent[2].content, "message 4");
    }

    #[tokio::test]
    async fn test_message_requires_session() {
        let store = store();
        let err = store
            .add_message(&message("ghost-session", Role::User, "hi", 0, None))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::ChatStoreFailed(_)));
    }

    #[tokio::test]
    async fn test_search_history_semantic_recall() {
        let store = store();
        let session = store.create_session("u", Metadata::new()).await.unwrap();

        store
            .add_message(&message(
                &session.id,
                Role::User,
                "about rust",
                0,
                Some(vec![1.0, 0.0]),
            ))
            .await
            .unwrap();
        store
            .add_message(&message(
                &session.id,
                Role::User,
                "about cooking",
                1,
                Some(vec![0.0, 1.0]),
            ))
            .await
            .unwrap();
        store
            .add_message(&message(&session.id, Role::User, "no embedding", 2, None))
            .await
            .unwrap();

        let results = store
            .search_history(&[1.0, 0.0], &session.id, 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.content, "about rust");
        assert!(results[0].1 > results[1].1);
    }

    #[tokio::test]
    async fn test_export_round_trip() {
        let store = store();
        let session = store.create_session("u", Metadata::new()).await.unwrap();
        for i in 0..3 {
            store
                .add_message(&message(
                    &session.id,
                    if i % 2 == 0 { Role::User } else { Role::Assistant },
                    &format!("turn {i}"),
                    i,
                    None,
                ))
                .await
                .unwrap();
        }

        let exported = store.export_conversation(&session.id).await.unwrap();
        let text = serde_json::to_string(&exported).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&text).unwrap();

        let messages = reparsed["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], "turn 0");
        assert_eq!(messages[2]["content"], "turn 2");
    }
}
