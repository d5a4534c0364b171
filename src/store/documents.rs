//! Durable store of document records and raw content.
//!
//! Full content is persisted so documents can be re-chunked without
//! re-ingesting the source.

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use tokio::sync::Mutex as TokioMutex;

use super::VectorDb;
use super::models::Document;
use crate::error::{RagError, Result};

#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<TokioMutex<VectorDb>>,
}

impl DocumentStore {
    pub fn new(db: Arc<TokioMutex<VectorDb>>) -> Self {
        Self { db }
    }

    /// Insert or replace a document record.
    pub async fn store(&self, doc: &Document) -> Result<()> {
        let metadata_json = serde_json::to_string(&doc.metadata)?;
        let db = self.db.lock().await;
        db.conn
            .execute(
                r#"
                INSERT INTO documents (id, source, content, metadata, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    source = excluded.source,
                    content = excluded.content,
                    metadata = excluded.metadata
                "#,
                params![doc.id, doc.source, doc.content, metadata_json, doc.created_at],
            )
            .map_err(|e| RagError::DocumentStoreFailed(e.to_string()))?;
        Ok(())
    }

    /// Fetch a document by id. Fails with `NotFound` when missing.
    pub async fn get(&self, id: &str) -> Result<Document> {
        let db = self.db.lock().await;
        let doc = db
            .conn
            .query_row(
                "SELECT id, source, content, metadata, created_at FROM documents WHERE id = ?",
                params![id],
                map_document_row,
            )
            .optional()
            .map_err(|e| RagError::DocumentStoreFailed(e.to_string()))?;

        doc.ok_or_else(|| RagError::not_found("document", id))
    }

    /// All documents, oldest first.
    pub async fn list(&self) -> Result<Vec<Document>> {
        let db = self.db.lock().await;
        let mut stmt = db
            .conn
            .prepare(
                "SELECT id, source, content, metadata, created_at FROM documents ORDER BY created_at, id",
            )
            .map_err(|e| RagError::DocumentStoreFailed(e.to_string()))?;
        let rows = stmt
            .query_map([], map_document_row)
            .map_err(|e| RagError::DocumentStoreFailed(e.to_string()))?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.map_err(|e| RagError::DocumentStoreFailed(e.to_string()))?);
        }
        Ok(docs)
    }

    /// Delete a document record. Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db
            .conn
            .execute("DELETE FROM documents WHERE id = ?", params![id])
            .map_err(|e| RagError::DocumentStoreFailed(e.to_string()))?;
        Ok(rows > 0)
    }

    /// Remove all documents.
    pub async fn reset(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.conn
            .execute("DELETE FROM documents", [])
            .map_err(|e| RagError::DocumentStoreFailed(e.to_string()))?;
        Ok(())
    }
}

fn map_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let metadata_json: String = row.get(3)?;
    Ok(Document {
        id: row.get(0)?,
        source: row.get(1)?,
        content: row.get(2)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store() -> DocumentStore {
        let db = VectorDb::open_in_memory().unwrap();
        DocumentStore::new(Arc::new(TokioMutex::new(db)))
    }

    fn doc(id: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            source: format!("{id}.txt"),
            content: content.to_string(),
            metadata: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_get_roundtrip() {
        let store = store();
        let mut original = doc("d1", "full document content");
        original
            .metadata
            .insert("summary".to_string(), serde_json::json!("a doc"));
        store.store(&original).await.unwrap();

        let fetched = store.get("d1").await.unwrap();
        assert_eq!(fetched.content, "full document content");
        assert_eq!(fetched.source, "d1.txt");
        assert_eq!(fetched.metadata["summary"], serde_json::json!("a doc"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = store();
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(
            err,
            RagError::NotFound {
                kind: "document",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = store();
        store.store(&doc("d1", "one")).await.unwrap();
        store.store(&doc("d2", "two")).await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);

        assert!(store.delete("d1").await.unwrap());
        assert!(!store.delete("d1").await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reset() {
        let store = store();
        store.store(&doc("d1", "one")).await.unwrap();
        store.reset().await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_is_upsert() {
        let store = store();
        store.store(&doc("d1", "first")).await.unwrap();
        store.store(&doc("d1", "enriched")).await.unwrap();

        let fetched = store.get("d1").await.unwrap();
        assert_eq!(fetched.content, "enriched");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
