//! Ingestion pipeline: resolve content, enrich metadata, chunk, embed,
//! store, and kick off background graph extraction.
//!
//! The document row is always written before its chunk vectors; this
//! order is fixed for the life of a deployment. Graph extraction runs
//! detached from the originating request, bounded by its own semaphore
//! and per-call deadlines, and never affects the ingest response.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunker::{self, ChunkMethod, ChunkOptions};
use crate::config::Config;
use crate::error::{RagError, Result};
use crate::extract::MetadataExtractor;
use crate::provider::{EmbeddingClient, Metadata};
use crate::store::documents::DocumentStore;
use crate::store::graph::GraphStore;
use crate::store::models::{COLLECTION_KEY, Chunk, Document, GraphEdge, GraphNode, node_id};
use crate::store::vector::VectorStore;

/// Max concurrent documents in a batch ingest.
const BATCH_CONCURRENCY: usize = 5;
/// Max concurrent entity-extraction LLM calls.
const GRAPH_CONCURRENCY: usize = 3;
/// Minimum chunk length worth extracting entities from.
const GRAPH_MIN_CHUNK_CHARS: usize = 50;
/// Deadline for one chunk's entity extraction.
const EXTRACT_DEADLINE: Duration = Duration::from_secs(60);
/// Deadline for one entity embedding.
const EMBED_DEADLINE: Duration = Duration::from_secs(10);

const CREATION_DATE_KEY: &str = "creation_date";

/// An ingestion request. Exactly one of `content`, `file_path`, or `url`
/// must be present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    pub content: Option<String>,
    pub file_path: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub chunk_size: Option<usize>,
    pub overlap: Option<usize>,
}

/// The ingestion outcome.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub document_id: String,
    pub chunk_count: usize,
    pub message: String,
}

/// Explicit dependency record for the ingestion pipeline, constructed
/// once at startup.
pub struct IngestionPipeline {
    vector: VectorStore,
    documents: DocumentStore,
    graph: Option<GraphStore>,
    embedder: Arc<dyn EmbeddingClient>,
    extractor: Option<Arc<MetadataExtractor>>,
    config: Arc<Config>,
    graph_semaphore: Arc<Semaphore>,
}

impl IngestionPipeline {
    pub fn new(
        vector: VectorStore,
        documents: DocumentStore,
        graph: Option<GraphStore>,
        embedder: Arc<dyn EmbeddingClient>,
        extractor: Option<Arc<MetadataExtractor>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            vector,
            documents,
            graph,
            embedder,
            extractor,
            config,
            graph_semaphore: Arc::new(Semaphore::new(GRAPH_CONCURRENCY)),
        }
    }

    /// Ingest one document.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        cancel: &CancellationToken,
    ) -> Result<IngestResponse> {
        let (content, source, mtime) = resolve_content(&request)?;

        if content.trim().is_empty() {
            return Ok(IngestResponse {
                success: false,
                document_id: String::new(),
                chunk_count: 0,
                message: "no content found".to_string(),
            });
        }

        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        let mut metadata = request.metadata.clone();

        // LLM enrichment; explicit request values always win.
        if self.config.enable_metadata_extraction {
            if let Some(extractor) = &self.extractor {
                if let Some(extracted) = extractor.extract(&content).await {
                    merge_extracted(&mut metadata, extracted);
                } else {
                    debug!("metadata extraction yielded nothing, continuing");
                }
            }
        }

        // Precedence for creation_date: request > extractor > file mtime.
        if !metadata.contains_key(CREATION_DATE_KEY) {
            if let Some(mtime) = mtime {
                metadata.insert(
                    CREATION_DATE_KEY.to_string(),
                    serde_json::Value::String(mtime.format("%Y-%m-%d").to_string()),
                );
            }
        }
        metadata
            .entry(COLLECTION_KEY.to_string())
            .or_insert_with(|| {
                serde_json::Value::String(self.config.default_collection.clone())
            });

        let document_id = Uuid::new_v4().to_string();
        let options = ChunkOptions {
            size: request.chunk_size.unwrap_or(self.config.chunk_size),
            overlap: request.overlap.unwrap_or(self.config.chunk_overlap),
            method: ChunkMethod::Sentence,
        };
        let pieces = chunker::split(&content, &options)?;

        let mut chunks = Vec::with_capacity(pieces.len());
        for (i, piece) in pieces.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            let vector = self.embedder.embed(piece).await.map_err(|e| {
                RagError::EmbeddingFailed {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                }
            })?;
            chunks.push(Chunk {
                id: Chunk::compose_id(&document_id, i),
                document_id: document_id.clone(),
                content: piece.clone(),
                vector,
                score: 0.0,
                metadata: metadata.clone(),
            });
        }

        // Document first, then vectors. Do not swap.
        let document = Document {
            id: document_id.clone(),
            source,
            content,
            metadata,
            created_at: Utc::now(),
        };
        self.documents.store(&document).await?;
        self.vector.store(&chunks).await?;

        info!(
            "ingested document {document_id} ({} chunks from {})",
            chunks.len(),
            document.source
        );

        if self.config.enable_graph_extraction {
            if let (Some(graph), Some(extractor)) = (&self.graph, &self.extractor) {
                self.spawn_graph_extraction(graph.clone(), extractor.clone(), &chunks);
            }
        }

        Ok(IngestResponse {
            success: true,
            document_id,
            chunk_count: chunks.len(),
            message: "document ingested".to_string(),
        })
    }

    /// Ingest a batch of requests under bounded concurrency. Per-item
    /// failures are logged and dropped; only successes are returned, in
    /// request order.
    pub async fn ingest_batch(
        &self,
        requests: Vec<IngestRequest>,
        cancel: &CancellationToken,
    ) -> Vec<IngestResponse> {
        let semaphore = Arc::new(Semaphore::new(BATCH_CONCURRENCY));
        let mut set: JoinSet<(usize, Result<IngestResponse>)> = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            // The pipeline is cheap to clone piecewise; share the pieces.
            let this = self.clone_parts();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, this.ingest(request, &cancel).await)
            });
        }

        let mut responses: Vec<(usize, IngestResponse)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(response))) => responses.push((index, response)),
                Ok((index, Err(e))) => warn!("batch item {index} failed: {e}"),
                Err(e) => warn!("batch ingest task panicked: {e}"),
            }
        }

        responses.sort_by_key(|(index, _)| *index);
        responses.into_iter().map(|(_, r)| r).collect()
    }

    fn clone_parts(&self) -> IngestionPipeline {
        IngestionPipeline {
            vector: self.vector.clone(),
            documents: self.documents.clone(),
            graph: self.graph.clone(),
            embedder: self.embedder.clone(),
            extractor: self.extractor.clone(),
            config: self.config.clone(),
            graph_semaphore: self.graph_semaphore.clone(),
        }
    }

    /// Detached entity extraction into the knowledge graph.
    ///
    /// Not tied to the request's cancellation token: the task survives on
    /// its own deadlines.
    fn spawn_graph_extraction(
        &self,
        graph: GraphStore,
        extractor: Arc<MetadataExtractor>,
        chunks: &[Chunk],
    ) {
        let work: Vec<(String, String)> = chunks
            .iter()
            .filter(|c| c.content.chars().count() > GRAPH_MIN_CHUNK_CHARS)
            .map(|c| (c.id.clone(), c.content.clone()))
            .collect();
        if work.is_empty() {
            return;
        }

        let embedder = self.embedder.clone();
        let semaphore = self.graph_semaphore.clone();

        tokio::spawn(async move {
            for (chunk_id, content) in work {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };

                let entities =
                    match timeout(EXTRACT_DEADLINE, extractor.extract_entities(&content)).await
                    {
                        Ok(Some(entities)) => entities,
                        Ok(None) => continue,
                        Err(_) => {
                            warn!("entity extraction timed out for chunk {chunk_id}");
                            continue;
                        }
                    };

                for entity in entities {
                    let description = if entity.description.is_empty() {
                        entity.name.clone()
                    } else {
                        entity.description.clone()
                    };

                    let vector = match timeout(EMBED_DEADLINE, embedder.embed(&description)).await
                    {
                        Ok(Ok(v)) => v,
                        Ok(Err(e)) => {
                            warn!("entity embedding failed for '{}': {e}", entity.name);
                            Vec::new()
                        }
                        Err(_) => {
                            warn!("entity embedding timed out for '{}'", entity.name);
                            Vec::new()
                        }
                    };

                    let mut properties = Metadata::new();
                    properties.insert(
                        "name".to_string(),
                        serde_json::Value::String(entity.name.clone()),
                    );
                    let node = GraphNode {
                        id: node_id(&entity.name),
                        node_type: entity.entity_type.clone(),
                        content: description,
                        vector,
                        properties,
                    };
                    if let Err(e) = graph.upsert_node(&node).await {
                        warn!("graph node upsert failed for '{}': {e}", entity.name);
                        continue;
                    }

                    for relation in &entity.relations {
                        if relation.target.trim().is_empty() {
                            continue;
                        }
                        // Make sure the target exists before the edge.
                        let target = GraphNode {
                            id: node_id(&relation.target),
                            node_type: String::new(),
                            content: String::new(),
                            vector: Vec::new(),
                            properties: {
                                let mut p = Metadata::new();
                                p.insert(
                                    "name".to_string(),
                                    serde_json::Value::String(relation.target.clone()),
                                );
                                p
                            },
                        };
                        if let Err(e) = graph.upsert_node(&target).await {
                            warn!("graph target upsert failed: {e}");
                            continue;
                        }

                        let mut edge_properties = Metadata::new();
                        edge_properties.insert(
                            "source_chunk".to_string(),
                            serde_json::Value::String(chunk_id.clone()),
                        );
                        let edge = GraphEdge {
                            id: String::new(),
                            from_id: node.id.clone(),
                            to_id: node_id(&relation.target),
                            edge_type: relation.relation.clone(),
                            weight: relation.weight,
                            properties: edge_properties,
                        };
                        if let Err(e) = graph.upsert_edge(&edge).await {
                            warn!("graph edge upsert failed: {e}");
                        }
                    }
                }
            }
        });
    }
}

/// Resolve the raw content for a request: exactly one source allowed.
fn resolve_content(
    request: &IngestRequest,
) -> Result<(String, String, Option<DateTime<Utc>>)> {
    let sources = [
        request.content.is_some(),
        request.file_path.is_some(),
        request.url.is_some(),
    ]
    .iter()
    .filter(|&&present| present)
    .count();

    if sources != 1 {
        return Err(RagError::invalid_input(
            "exactly one of content, file_path, or url must be provided",
        ));
    }

    if let Some(content) = &request.content {
        return Ok((content.clone(), "inline".to_string(), None));
    }
    if request.url.is_some() {
        return Err(RagError::Unimplemented("url ingestion"));
    }

    let file_path = request.file_path.as_deref().expect("checked above");
    let path = Path::new(file_path);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    let content = match extension.as_str() {
        "txt" | "md" => std::fs::read_to_string(path)?,
        "pdf" => read_pdf(path)?,
        other => {
            return Err(RagError::invalid_input(format!(
                "unsupported file type: .{other}"
            )));
        }
    };

    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    Ok((content, file_path.to_string(), mtime))
}

/// Per-page plain-text extraction, pages separated by a blank line.
fn read_pdf(path: &Path) -> Result<String> {
    let doc = lopdf::Document::load(path)
        .map_err(|e| RagError::invalid_input(format!("failed to load pdf: {e}")))?;

    let mut pages = Vec::new();
    for (page_number, _) in doc.get_pages() {
        match doc.extract_text(&[page_number]) {
            Ok(text) => pages.push(text),
            Err(e) => warn!("failed to extract pdf page {page_number}: {e}"),
        }
    }
    Ok(pages.join("\n\n"))
}

/// Merge extracted metadata into the request map. Request values win.
fn merge_extracted(metadata: &mut Metadata, extracted: crate::extract::ExtractedMetadata) {
    let mut put = |key: &str, value: serde_json::Value| {
        if !value.is_null() {
            metadata.entry(key.to_string()).or_insert(value);
        }
    };

    if !extracted.summary.is_empty() {
        put("summary", serde_json::Value::String(extracted.summary));
    }
    if !extracted.keywords.is_empty() {
        put("keywords", serde_json::json!(extracted.keywords));
    }
    if !extracted.document_type.is_empty() {
        put(
            "document_type",
            serde_json::Value::String(extracted.document_type),
        );
    }
    if !extracted.creation_date.is_empty() {
        put(
            CREATION_DATE_KEY,
            serde_json::Value::String(extracted.creation_date),
        );
    }
    if !extracted.collection.is_empty() {
        put(
            COLLECTION_KEY,
            serde_json::Value::String(extracted.collection),
        );
    }
    if !extracted.entities.is_empty() {
        put("entities", serde_json::json!(extracted.entities));
    }
    if !extracted.temporal_refs.is_empty() {
        put("temporal_refs", serde_json::json!(extracted.temporal_refs));
    }
    if !extracted.events.is_empty() {
        put("events", serde_json::json!(extracted.events));
    }
    for (key, value) in extracted.custom {
        metadata.entry(key).or_insert(value);
    }
}
