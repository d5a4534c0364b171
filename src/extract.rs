//! LLM-driven metadata and entity extraction.
//!
//! Calls the generation client with a locked JSON-schema prompt at low
//! temperature and parses the reply. Every failure path returns `None`
//! after a warning; extraction is always best-effort and never fails an
//! ingest or a query.

use std::collections::HashMap;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::provider::{GenerationClient, GenerationOptions};

/// How much document text the extraction prompt may carry.
const MAX_EXTRACT_CHARS: usize = 4000;

/// Structured metadata derived from raw content.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedMetadata {
    /// One-paragraph summary of the document.
    #[serde(default)]
    pub summary: String,
    /// Salient keywords, most important first.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Document genre, e.g. "report", "email", "article".
    #[serde(default)]
    pub document_type: String,
    /// ISO date the content was authored, if stated.
    #[serde(default)]
    pub creation_date: String,
    /// Suggested collection name. Advisory only: the same text may get a
    /// different collection on a later ingest, and explicit request
    /// metadata always wins.
    #[serde(default)]
    pub collection: String,
    /// Entity names grouped by entity type.
    #[serde(default)]
    pub entities: HashMap<String, Vec<String>>,
    /// Temporal phrases mapped to ISO dates.
    #[serde(default)]
    pub temporal_refs: HashMap<String, String>,
    /// Notable events mentioned in the content.
    #[serde(default)]
    pub events: Vec<String>,
    /// Any additional fields the model chose to emit.
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

/// An entity extracted for the knowledge graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedEntity {
    pub name: String,
    /// Entity class, e.g. "person", "organization", "location".
    #[serde(default)]
    pub entity_type: String,
    /// Short description used as the node embedding text.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

/// A directed relation from the owning entity to `target`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedRelation {
    pub target: String,
    /// Relation label, e.g. "works_at", "based_in".
    #[serde(default)]
    pub relation: String,
    /// Confidence weight in [0, 1].
    #[serde(default = "default_weight")]
    pub weight: f32,
}

fn default_weight() -> f32 {
    0.5
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct EntityList {
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
}

/// Metadata extractor backed by a generation client.
pub struct MetadataExtractor {
    client: Arc<dyn GenerationClient>,
    model: String,
}

impl MetadataExtractor {
    pub fn new(client: Arc<dyn GenerationClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn opts(&self, temperature: f32) -> GenerationOptions {
        GenerationOptions {
            temperature,
            model: self.model.clone(),
            ..GenerationOptions::default()
        }
    }

    /// Derive structured metadata from raw content.
    ///
    /// Returns `None` on any provider or parse failure; the caller
    /// proceeds without enrichment.
    pub async fn extract(&self, content: &str) -> Option<ExtractedMetadata> {
        let schema = serde_json::to_string(&schemars::schema_for!(ExtractedMetadata)).ok()?;
        let excerpt = truncate_chars(content, MAX_EXTRACT_CHARS);
        let prompt = format!(
            "Analyze the document below and respond with a single JSON object \
             matching this schema exactly. Do not add commentary.\n\n\
             Schema:\n{schema}\n\nDocument:\n{excerpt}\n\nJSON:"
        );

        let reply = match self.client.generate(&prompt, &self.opts(0.2)).await {
            Ok(g) => g.text,
            Err(e) => {
                warn!("metadata extraction call failed: {e}");
                return None;
            }
        };

        match serde_json::from_str::<ExtractedMetadata>(strip_code_fences(&reply)) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("metadata extraction returned unparseable JSON: {e}");
                None
            }
        }
    }

    /// Extract entities and their relations from a chunk of text.
    ///
    /// Used by background graph extraction; temperature 0.1.
    pub async fn extract_entities(&self, text: &str) -> Option<Vec<ExtractedEntity>> {
        let schema = serde_json::to_string(&schemars::schema_for!(EntityList)).ok()?;
        let excerpt = truncate_chars(text, MAX_EXTRACT_CHARS);
        let prompt = format!(
            "Extract the named entities from the text below, with a short \
             description for each and any relations between them. Respond \
             with a single JSON object matching this schema exactly.\n\n\
             Schema:\n{schema}\n\nText:\n{excerpt}\n\nJSON:"
        );

        let reply = match self.client.generate(&prompt, &self.opts(0.1)).await {
            Ok(g) => g.text,
            Err(e) => {
                warn!("entity extraction call failed: {e}");
                return None;
            }
        };

        match serde_json::from_str::<EntityList>(strip_code_fences(&reply)) {
            Ok(list) => {
                debug!("extracted {} entities", list.entities.len());
                Some(
                    list.entities
                        .into_iter()
                        .filter(|e| !e.name.trim().is_empty())
                        .collect(),
                )
            }
            Err(e) => {
                warn!("entity extraction returned unparseable JSON: {e}");
                None
            }
        }
    }

    /// Resolve the single entity a query is mostly about, used as the
    /// start node for graph traversal.
    pub async fn primary_entity(&self, query: &str) -> Option<String> {
        let entities = self.extract_entities(query).await?;
        entities.into_iter().next().map(|e| e.name)
    }
}

/// Strip a leading/trailing markdown code fence from an LLM reply.
pub fn strip_code_fences(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") up to the first newline
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
