//! # localrag — Local-first RAG Engine Core
//!
//! Ingests documents, chunks and embeds them, stores vectors alongside a
//! lightweight knowledge graph, and answers natural-language queries by
//! hybrid retrieval (dense vector + graph traversal) followed by prompt
//! composition and generation. Every retrieval hit and tool call is
//! recorded for analytics.
//!
//! ## Architecture
//!
//! - **[`config`]** — Configuration loading, validation, defaults
//! - **[`chunker`]** — Sentence/fixed overlapping text chunking
//! - **[`provider`]** — Embedding and generation contracts (+ test mocks)
//! - **[`extract`]** — LLM metadata and entity extraction
//! - **[`store`]** — SQLite + sqlite-vec storage: chunks, documents, graph, chat
//! - **[`ingest`]** — Ingestion pipeline with background graph extraction
//! - **[`retrieval`]** — Hybrid retrieval, generation, streaming, recording
//! - **[`prompt`]** — Prompt composition and thinking-tag filtering
//! - **[`usage`]** — Query/hit/tool-call records, metrics, analytics
//!
//! The HTTP surface, CLI, and concrete provider implementations live
//! outside this crate; the engine depends only on the [`provider`]
//! contracts.

pub mod chunker;
pub mod config;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod prompt;
pub mod provider;
pub mod retrieval;
pub mod store;
pub mod usage;

pub use error::{RagError, Result};
