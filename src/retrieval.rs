//! Retrieval pipeline: hybrid search, prompt composition, generation,
//! and usage recording.
//!
//! Branch priority for the dense search: reranker, then diversity, then
//! metadata filters, then plain similarity. Graph enrichment appends
//! synthetic chunks under the `graph_virtual_doc` pseudo-document and is
//! never fatal. Zero retrieved context short-circuits to a fixed answer
//! that is still recorded.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{RagError, Result};
use crate::extract::MetadataExtractor;
use crate::prompt::{self, PromptContext, ThinkingTagFilter};
use crate::provider::{
    ChatTurn, EmbeddingClient, GenerationClient, GenerationOptions, Metadata, ToolRegistration,
};
use crate::store::chat::ChatStore;
use crate::store::graph::GraphStore;
use crate::store::models::{ChatMessage, Chunk, node_id};
use crate::store::vector::{RerankStrategy, VectorStore};
use crate::usage::{ChunkHit, RagQueryRecord, ToolCallRecord, UsageTracker, estimate_tokens};

/// Fixed answer when retrieval finds nothing to ground a response on.
pub const NO_CONTEXT_ANSWER: &str =
    "I cannot find relevant information in the knowledge base to answer your question.";

/// Document id used for synthetic knowledge-graph chunks.
pub const GRAPH_VIRTUAL_DOC: &str = "graph_virtual_doc";

/// Queries shorter than this skip graph enrichment.
const GRAPH_MIN_QUERY_CHARS: usize = 10;
/// How many graph nodes to fold into the context.
const GRAPH_TOP_K: usize = 3;
/// How many past messages semantic recall contributes.
const RECALL_LIMIT: usize = 5;
/// Recent-window size fetched from the chat store.
const RECENT_LIMIT: usize = 10;

fn default_show_sources() -> bool {
    true
}

/// A retrieval query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: Metadata,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_show_sources")]
    pub show_sources: bool,
    #[serde(default)]
    pub show_thinking: bool,
    #[serde(default)]
    pub tools_enabled: bool,
    #[serde(default)]
    pub rerank_strategy: String,
    #[serde(default)]
    pub rerank_boost: f32,
    #[serde(default)]
    pub diversity_lambda: f32,
    pub conversation_id: Option<String>,
}

/// The retrieval answer.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Chunk>,
    pub elapsed: String,
}

/// Explicit dependency record for the retrieval pipeline, constructed
/// once at startup.
pub struct RetrievalPipeline {
    vector: VectorStore,
    graph: Option<GraphStore>,
    chat: Option<ChatStore>,
    embedder: Arc<dyn EmbeddingClient>,
    generator: Arc<dyn GenerationClient>,
    extractor: Option<Arc<MetadataExtractor>>,
    tracker: UsageTracker,
    tools: Vec<ToolRegistration>,
    config: Arc<Config>,
}

impl RetrievalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vector: VectorStore,
        graph: Option<GraphStore>,
        chat: Option<ChatStore>,
        embedder: Arc<dyn EmbeddingClient>,
        generator: Arc<dyn GenerationClient>,
        extractor: Option<Arc<MetadataExtractor>>,
        tracker: UsageTracker,
        config: Arc<Config>,
    ) -> Self {
        Self {
            vector,
            graph,
            chat,
            embedder,
            generator,
            extractor,
            tracker,
            tools: Vec::new(),
            config,
        }
    }

    /// Register tools exposed to tool-augmented generation.
    pub fn with_tools(mut self, tools: Vec<ToolRegistration>) -> Self {
        self.tools = tools;
        self
    }

    /// Answer a query with a single generation call.
    pub async fn query(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse> {
        self.run(request, None, cancel).await
    }

    /// Answer a query, streaming decoded tokens through `on_token`.
    ///
    /// Thinking spans are suppressed from the emitted tokens unless
    /// `show_thinking` is set. Emission stops within one token of
    /// cancellation.
    pub async fn query_stream(
        &self,
        request: QueryRequest,
        on_token: &mut (dyn FnMut(&str) + Send),
        cancel: &CancellationToken,
    ) -> Result<QueryResponse> {
        self.run(request, Some(on_token), cancel).await
    }

    async fn run(
        &self,
        request: QueryRequest,
        mut on_token: Option<&mut (dyn FnMut(&str) + Send)>,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse> {
        let started = Instant::now();

        if request.query.trim().is_empty() {
            return Err(RagError::invalid_input("query must not be empty"));
        }
        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        let query_id = Uuid::new_v4().to_string();
        let top_k = request.top_k.unwrap_or(self.config.top_k);

        // Embed the query.
        let query_vector = match self.embedder.embed(&request.query).await {
            Ok(v) => v,
            Err(e) => {
                let error = RagError::EmbeddingFailed {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                };
                self.record_failure(&query_id, &request, top_k, &error, started)
                    .await;
                return Err(error);
            }
        };

        // Dense retrieval, branch by priority.
        let retrieval_started = Instant::now();
        let mut chunks = self
            .dense_search(&request, &query_vector, top_k)
            .await?;

        // Graph enrichment; failures are non-fatal.
        if request.query.chars().count() > GRAPH_MIN_QUERY_CHARS {
            if let Some(graph) = &self.graph {
                match self.graph_chunks(graph, &request.query, &query_vector).await {
                    Ok(mut graph_chunks) => chunks.append(&mut graph_chunks),
                    Err(e) => warn!("graph enrichment failed: {e}"),
                }
            }
        }

        // Deduplicate by content, first occurrence wins.
        let mut seen = HashSet::new();
        chunks.retain(|c| seen.insert(c.content.clone()));
        let retrieval_ms = retrieval_started.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        // Conversation context.
        let (recent, past) = self.conversation_context(&request, &query_vector).await;

        // Nothing to ground on: fixed answer, still recorded.
        if chunks.is_empty() && recent.is_empty() && past.is_empty() {
            let answer = NO_CONTEXT_ANSWER.to_string();
            if let Some(emit) = &mut on_token {
                emit(&answer);
            }
            self.record_success(
                &query_id, &request, top_k, &answer, &[], 0, started, retrieval_ms, 0, None,
                "",
            )
            .await;
            return Ok(QueryResponse {
                answer,
                sources: Vec::new(),
                elapsed: format_elapsed(started),
            });
        }

        let prompt = prompt::compose(
            &request.query,
            &PromptContext {
                memory: None,
                chunks: &chunks,
                past: &past,
                recent: &recent,
            },
        );

        let opts = GenerationOptions {
            temperature: request
                .temperature
                .unwrap_or(self.config.generation.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.config.generation.max_tokens),
            model: self.config.generation.model.clone(),
        };

        // Generate.
        let generation_started = Instant::now();
        let (answer, usage, tool_call_count) = match self
            .generate(&request, &query_id, &prompt, &opts, on_token, cancel)
            .await
        {
            Ok(result) => result,
            Err(error) => {
                self.record_failure(&query_id, &request, top_k, &error, started)
                    .await;
                return Err(error);
            }
        };
        let generation_ms = generation_started.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            let error = RagError::Cancelled;
            self.record_failure(&query_id, &request, top_k, &error, started)
                .await;
            return Err(error);
        }

        self.record_success(
            &query_id,
            &request,
            top_k,
            &answer,
            &chunks,
            tool_call_count,
            started,
            retrieval_ms,
            generation_ms,
            usage,
            &prompt,
        )
        .await;

        let sources = if request.show_sources {
            chunks
                .into_iter()
                .map(|mut c| {
                    c.vector = Vec::new();
                    c
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(QueryResponse {
            answer,
            sources,
            elapsed: format_elapsed(started),
        })
    }

    async fn dense_search(
        &self,
        request: &QueryRequest,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<Chunk>> {
        if !request.rerank_strategy.is_empty() {
            let strategy = RerankStrategy::parse(&request.rerank_strategy)?;
            return self
                .vector
                .search_with_reranker(
                    query_vector,
                    &request.query,
                    top_k,
                    strategy,
                    request.rerank_boost,
                )
                .await;
        }
        if request.diversity_lambda > 0.0 {
            return self
                .vector
                .search_with_diversity(query_vector, top_k, request.diversity_lambda)
                .await;
        }
        if !request.filters.is_empty() {
            return self
                .vector
                .search_with_filters(query_vector, top_k, &request.filters)
                .await;
        }
        self.vector.search(query_vector, top_k).await
    }

    /// Resolve a start entity from the query and fold nearby graph nodes
    /// in as synthetic chunks.
    async fn graph_chunks(
        &self,
        graph: &GraphStore,
        query: &str,
        query_vector: &[f32],
    ) -> Result<Vec<Chunk>> {
        let start_id = match &self.extractor {
            Some(extractor) => extractor.primary_entity(query).await.map(|name| node_id(&name)),
            None => None,
        };

        let results = graph
            .hybrid_search(query_vector, start_id.as_deref(), GRAPH_TOP_K)
            .await?;

        Ok(results
            .into_iter()
            .map(|result| {
                let name = result
                    .node
                    .properties
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let mut metadata = Metadata::new();
                metadata.insert(
                    "source".to_string(),
                    serde_json::Value::String("Knowledge Graph".to_string()),
                );
                Chunk {
                    id: format!("graph_{}", result.node.id),
                    document_id: GRAPH_VIRTUAL_DOC.to_string(),
                    content: format!(
                        "[Knowledge Graph Entity]\nName: {name}\nType: {}\nDescription: {}",
                        result.node.node_type, result.node.content
                    ),
                    vector: Vec::new(),
                    score: result.combined_score,
                    metadata,
                }
            })
            .collect())
    }

    async fn conversation_context(
        &self,
        request: &QueryRequest,
        query_vector: &[f32],
    ) -> (Vec<ChatMessage>, Vec<ChatMessage>) {
        let (Some(chat), Some(conversation_id)) = (&self.chat, &request.conversation_id) else {
            return (Vec::new(), Vec::new());
        };

        let recent = match chat.history(conversation_id, RECENT_LIMIT).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("failed to load recent conversation: {e}");
                Vec::new()
            }
        };
        let past = match chat
            .search_history(query_vector, conversation_id, RECALL_LIMIT)
            .await
        {
            Ok(results) => results.into_iter().map(|(m, _)| m).collect(),
            Err(e) => {
                warn!("conversation recall failed: {e}");
                Vec::new()
            }
        };

        (recent, past)
    }

    async fn generate(
        &self,
        request: &QueryRequest,
        query_id: &str,
        prompt: &str,
        opts: &GenerationOptions,
        on_token: Option<&mut (dyn FnMut(&str) + Send)>,
        cancel: &CancellationToken,
    ) -> Result<(String, Option<crate::provider::TokenUsage>, u32)> {
        // Tool-augmented path (non-streaming).
        if request.tools_enabled && !self.tools.is_empty() {
            let definitions: Vec<_> =
                self.tools.iter().map(|t| t.definition.clone()).collect();
            let messages = [ChatTurn {
                role: "user".to_string(),
                content: prompt.to_string(),
            }];
            let response = self
                .generator
                .generate_with_tools(&messages, &definitions, opts)
                .await
                .map_err(|e| RagError::GenerationFailed {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                })?;

            let tool_call_count = response.tool_calls.len() as u32;
            for call in &response.tool_calls {
                let validation = self
                    .tools
                    .iter()
                    .find(|t| t.definition.name == call.name)
                    .map(|t| t.validate(&call.arguments))
                    .unwrap_or_else(|| Err(format!("unknown tool: {}", call.name)));

                self.tracker.record_tool_call(ToolCallRecord {
                    id: Uuid::new_v4().to_string(),
                    query_id: query_id.to_string(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                    result: None,
                    success: validation.is_ok(),
                    error: validation.err(),
                    duration_ms: 0,
                    created_at: Utc::now(),
                });
            }

            let answer = if request.show_thinking {
                response.content
            } else {
                prompt::strip_thinking(&response.content)
            };
            return Ok((answer, response.usage, tool_call_count));
        }

        match on_token {
            // Streaming path with the thinking-tag filter.
            Some(on_token) => {
                let mut filter = ThinkingTagFilter::new(request.show_thinking);
                let cancel = cancel.clone();
                let mut forward = |token: &str| {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let visible = filter.feed(token);
                    if !visible.is_empty() {
                        on_token(&visible);
                    }
                };
                let generation = self
                    .generator
                    .stream(prompt, opts, &mut forward)
                    .await
                    .map_err(|e| RagError::GenerationFailed {
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    })?;
                let tail = filter.flush();
                if !tail.is_empty() && !cancel.is_cancelled() {
                    on_token(&tail);
                }

                let answer = if request.show_thinking {
                    generation.text
                } else {
                    prompt::strip_thinking(&generation.text)
                };
                Ok((answer, generation.usage, 0))
            }
            // Plain generation.
            None => {
                let generation = self.generator.generate(prompt, opts).await.map_err(|e| {
                    RagError::GenerationFailed {
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    }
                })?;
                let answer = if request.show_thinking {
                    generation.text
                } else {
                    prompt::strip_thinking(&generation.text)
                };
                Ok((answer, generation.usage, 0))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_success(
        &self,
        query_id: &str,
        request: &QueryRequest,
        top_k: usize,
        answer: &str,
        chunks: &[Chunk],
        tool_call_count: u32,
        started: Instant,
        retrieval_ms: u64,
        generation_ms: u64,
        usage: Option<crate::provider::TokenUsage>,
        prompt: &str,
    ) {
        let model = &self.config.generation.model;
        let (input_tokens, output_tokens) = match usage {
            Some(u) => (u.input_tokens, u.output_tokens),
            None => (
                estimate_tokens(prompt, model),
                estimate_tokens(answer, model),
            ),
        };

        let record = RagQueryRecord {
            id: query_id.to_string(),
            conversation_id: request.conversation_id.clone(),
            query: request.query.clone(),
            answer: answer.to_string(),
            top_k: top_k as u32,
            temperature: request
                .temperature
                .unwrap_or(self.config.generation.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.config.generation.max_tokens),
            total_ms: started.elapsed().as_millis() as u64,
            retrieval_ms,
            generation_ms,
            chunks_found: chunks.len() as u32,
            tool_calls: tool_call_count,
            success: true,
            error: None,
            model: model.clone(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost: 0.0,
            created_at: Utc::now(),
        };

        if let Err(e) = self.tracker.record_query(&record).await {
            warn!("failed to record query: {e}");
            return;
        }

        let now = Utc::now();
        let hits: Vec<ChunkHit> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| ChunkHit {
                id: Uuid::new_v4().to_string(),
                query_id: query_id.to_string(),
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                content: chunk.content.clone(),
                score: chunk.score,
                rank_position: (i + 1) as u32,
                used_in_generation: true,
                source_file: chunk
                    .metadata
                    .get("source")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                start_offset: None,
                end_offset: None,
                created_at: now,
            })
            .collect();
        if !hits.is_empty() {
            debug!("recording {} chunk hits for query {query_id}", hits.len());
            self.tracker.record_hits(hits);
        }
    }

    async fn record_failure(
        &self,
        query_id: &str,
        request: &QueryRequest,
        top_k: usize,
        error: &RagError,
        started: Instant,
    ) {
        let record = RagQueryRecord {
            id: query_id.to_string(),
            conversation_id: request.conversation_id.clone(),
            query: request.query.clone(),
            answer: String::new(),
            top_k: top_k as u32,
            temperature: request
                .temperature
                .unwrap_or(self.config.generation.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.config.generation.max_tokens),
            total_ms: started.elapsed().as_millis() as u64,
            retrieval_ms: 0,
            generation_ms: 0,
            chunks_found: 0,
            tool_calls: 0,
            success: false,
            error: Some(error.to_string()),
            model: self.config.generation.model.clone(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            estimated_cost: 0.0,
            created_at: Utc::now(),
        };
        if let Err(e) = self.tracker.record_query(&record).await {
            warn!("failed to record failed query: {e}");
        }
    }
}

fn format_elapsed(started: Instant) -> String {
    format!("{:.3}s", started.elapsed().as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{MockEmbedding, MockGeneration};
    use crate::store::{UsageDb, VectorDb};
    use crate::usage::QueryFilter;
    use tokio::sync::Mutex as TokioMutex;

    struct Fixture {
        pipeline: RetrievalPipeline,
        generator: Arc<MockGeneration>,
        tracker: UsageTracker,
        vector: VectorStore,
        embedder: Arc<MockEmbedding>,
    }

    fn fixture() -> Fixture {
        let vector_db = Arc::new(TokioMutex::new(VectorDb::open_in_memory().unwrap()));
        let usage_db = Arc::new(TokioMutex::new(UsageDb::open_in_memory().unwrap()));

        let vector = VectorStore::new(vector_db.clone());
        let tracker = UsageTracker::new(usage_db.clone());
        let generator = Arc::new(MockGeneration::new());
        let embedder = Arc::new(MockEmbedding::default());

        let pipeline = RetrievalPipeline::new(
            vector.clone(),
            None,
            Some(ChatStore::new(usage_db)),
            embedder.clone(),
            generator.clone(),
            None,
            tracker.clone(),
            Arc::new(Config::default()),
        );

        Fixture {
            pipeline,
            generator,
            tracker,
            vector,
            embedder,
        }
    }

    async fn seed(fixture: &Fixture, id: &str, doc: &str, content: &str) {
        let vector = fixture.embedder.embed(content).await.unwrap();
        fixture
            .vector
            .store(&[Chunk {
                id: id.to_string(),
                document_id: doc.to_string(),
                content: content.to_string(),
                vector,
                score: 0.0,
                metadata: Metadata::new(),
            }])
            .await
            .unwrap();
    }

    fn request(query: &str) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            show_sources: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let fixture = fixture();
        let err = fixture
            .pipeline
            .query(request("  "), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_query_returns_answer_and_sources() {
        let fixture = fixture();
        seed(&fixture, "d_0", "d", "Paris is the capital of France.").await;

        let response = fixture
            .pipeline
            .query(
                request("What is the capital of France?"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.answer.contains("Paris"));
        assert_eq!(response.sources.len(), 1);
        assert!(response.sources[0].score >= 0.6);
        assert!(response.elapsed.ends_with('s'));
    }

    #[tokio::test]
    async fn test_no_context_short_circuit_still_recorded() {
        let fixture = fixture();

        let response = fixture
            .pipeline
            .query(request("anything at all"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.answer, NO_CONTEXT_ANSWER);
        assert!(response.sources.is_empty());

        let queries = fixture
            .tracker
            .list_queries(&QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].chunks_found, 0);
        assert!(queries[0].success);
    }

    #[tokio::test]
    async fn test_query_records_hits_with_ranks() {
        let fixture = fixture();
        seed(&fixture, "a_0", "a", "The CEO is Alice.").await;
        seed(&fixture, "b_0", "b", "The CTO is Bob.").await;

        let mut req = request("Who is Bob?");
        req.top_k = Some(2);
        fixture
            .pipeline
            .query(req, &CancellationToken::new())
            .await
            .unwrap();

        let queries = fixture
            .tracker
            .list_queries(&QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(queries.len(), 1);
        let record = &queries[0];
        assert_eq!(record.chunks_found, 2);

        // Hits are written asynchronously; poll briefly.
        let mut hits = Vec::new();
        for _ in 0..50 {
            hits = fixture.tracker.hits_for_query(&record.id).await.unwrap();
            if hits.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rank_position, 1);
        assert_eq!(hits[1].rank_position, 2);
        assert!(hits[0].content.contains("Bob"));
        assert!(hits[1].content.contains("Alice"));

        let detail = fixture.tracker.query_detail(&record.id).await.unwrap();
        assert!(detail.retrieval.top_score >= detail.retrieval.average_score);
    }

    #[tokio::test]
    async fn test_duplicate_content_deduplicated() {
        let fixture = fixture();
        let text = "An identical chunk shared by three documents.";
        seed(&fixture, "a_0", "a", text).await;
        seed(&fixture, "b_0", "b", text).await;
        seed(&fixture, "c_0", "c", text).await;

        let mut req = request("identical chunk shared by documents");
        req.top_k = Some(10);
        let response = fixture
            .pipeline
            .query(req, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.sources.len(), 1);
        let contents: HashSet<&str> =
            response.sources.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents.len(), response.sources.len());
    }

    #[tokio::test]
    async fn test_streaming_thinking_filtered() {
        let fixture = fixture();
        seed(&fixture, "d_0", "d", "Paris is the capital of France.").await;
        fixture.generator.set_stream_tokens(vec![
            "answer ", "is ", "<think>", "internal", "</think>", "42",
        ]);

        let mut collected = String::new();
        let response = fixture
            .pipeline
            .query_stream(
                request("What is the capital of France?"),
                &mut |t| collected.push_str(t),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(collected, "answer is 42");
        assert!(!collected.contains("<think>"));
        assert_eq!(response.answer, "answer is 42");
    }

    #[tokio::test]
    async fn test_streaming_show_thinking_passthrough() {
        let fixture = fixture();
        seed(&fixture, "d_0", "d", "Paris is the capital of France.").await;
        fixture
            .generator
            .set_stream_tokens(vec!["a<think>b</think>", "c"]);

        let mut req = request("What is the capital of France?");
        req.show_thinking = true;

        let mut collected = String::new();
        fixture
            .pipeline
            .query_stream(req, &mut |t| collected.push_str(t), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(collected, "a<think>b</think>c");
    }

    #[tokio::test]
    async fn test_non_streaming_strips_thinking() {
        let fixture = fixture();
        seed(&fixture, "d_0", "d", "Paris is the capital of France.").await;
        fixture
            .generator
            .push_response("Paris.<think>multi\nline\nreasoning</think> It is Paris.");

        let response = fixture
            .pipeline
            .query(
                request("What is the capital of France?"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.answer, "Paris. It is Paris.");
    }

    #[tokio::test]
    async fn test_generation_failure_recorded() {
        let fixture = fixture();
        seed(&fixture, "d_0", "d", "Paris is the capital of France.").await;
        fixture.generator.fail_next();

        let err = fixture
            .pipeline
            .query(
                request("What is the capital of France?"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::GenerationFailed { .. }));
        assert!(err.is_retryable());

        let queries = fixture
            .tracker
            .list_queries(&QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(queries.len(), 1);
        assert!(!queries[0].success);
        assert!(queries[0].error.as_deref().unwrap().contains("transient"));
    }

    #[tokio::test]
    async fn test_unknown_rerank_strategy_is_invalid_input() {
        let fixture = fixture();
        seed(&fixture, "d_0", "d", "content").await;

        let mut req = request("a long enough query");
        req.rerank_strategy = "mystery".to_string();
        let err = fixture
            .pipeline
            .query(req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fixture = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fixture
            .pipeline
            .query(request("a query"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Cancelled));
    }

    #[tokio::test]
    async fn test_show_sources_false_hides_chunks() {
        let fixture = fixture();
        seed(&fixture, "d_0", "d", "Paris is the capital of France.").await;

        let mut req = request("What is the capital of France?");
        req.show_sources = false;
        let response = fixture
            .pipeline
            .query(req, &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.sources.is_empty());
        assert!(!response.answer.is_empty());
    }

    #[tokio::test]
    async fn test_tools_path_records_calls() {
        let fixture = fixture();
        seed(&fixture, "d_0", "d", "Paris is the capital of France.").await;

        fn validate(args: &serde_json::Value) -> std::result::Result<(), String> {
            args.get("q").map(|_| ()).ok_or_else(|| "missing q".to_string())
        }

        let tools = vec![
            ToolRegistration::new(crate::provider::ToolDefinition {
                name: "lookup".to_string(),
                description: "lookup a fact".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            })
            .with_validator(validate),
        ];

        fixture.generator.set_tool_response(crate::provider::ToolAugmentedResponse {
            content: "Using lookup.".to_string(),
            tool_calls: vec![crate::provider::ToolCallRequest {
                id: "call-1".to_string(),
                name: "lookup".to_string(),
                arguments: serde_json::json!({"q": "capital of France"}),
            }],
            usage: None,
        });

        let pipeline = fixture.pipeline.with_tools(tools);
        let mut req = request("What is the capital of France?");
        req.tools_enabled = true;
        pipeline.query(req, &CancellationToken::new()).await.unwrap();

        let queries = fixture
            .tracker
            .list_queries(&QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(queries[0].tool_calls, 1);

        let mut calls = Vec::new();
        for _ in 0..50 {
            calls = fixture
                .tracker
                .tool_calls_for_query(&queries[0].id)
                .await
                .unwrap();
            if !calls.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "lookup");
        assert!(calls[0].success);
    }
}
