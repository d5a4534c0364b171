/// Provider contracts for embedding and generation.
///
/// The engine core depends only on these abstract interfaces; concrete
/// HTTP/ONNX providers live outside this crate. All implementations must
/// be `Send + Sync` to allow concurrent use behind `Arc`.
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur inside a provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Transient failure (timeout, connection reset); the caller may retry.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider rejected the input (e.g. empty text).
    #[error("invalid provider input: {0}")]
    InvalidInput(String),

    /// Permanent failure (bad model name, malformed response).
    #[error("provider failure: {0}")]
    Failed(String),
}

impl ProviderError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ── Embedding ────────────────────────────────────────────────────────

/// Produces a fixed-dimension float vector from text.
///
/// The dimension is discovered on first use and fixed for the lifetime of
/// the client.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a single text string into a vector.
    ///
    /// Fails with [`ProviderError::InvalidInput`] on empty text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;
}

// ── Generation ───────────────────────────────────────────────────────

/// Options for a single generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub model: String,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 25000,
            model: String::new(),
        }
    }
}

/// Token usage reported by a provider, when available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Result of a generation call.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    /// Provider-reported usage; `None` when the provider does not report
    /// it, in which case the tracker estimates.
    pub usage: Option<TokenUsage>,
}

/// One turn of a chat transcript passed to tool-augmented generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// A tool exposed to the model.
#[derive(Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's parameters.
    pub parameters: serde_json::Value,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .finish()
    }
}

/// A registered tool: its definition plus an optional argument validator
/// invoked before dispatch.
#[derive(Clone)]
pub struct ToolRegistration {
    pub definition: ToolDefinition,
    pub validator: Option<fn(&serde_json::Value) -> Result<(), String>>,
}

impl ToolRegistration {
    pub fn new(definition: ToolDefinition) -> Self {
        Self {
            definition,
            validator: None,
        }
    }

    pub fn with_validator(
        mut self,
        validator: fn(&serde_json::Value) -> Result<(), String>,
    ) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Validate arguments against the registered callback, if any.
    pub fn validate(&self, args: &serde_json::Value) -> Result<(), String> {
        match self.validator {
            Some(v) => v(args),
            None => Ok(()),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// JSON arguments as produced by the model.
    pub arguments: serde_json::Value,
}

/// Response from tool-augmented generation.
#[derive(Debug, Clone, Default)]
pub struct ToolAugmentedResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
}

/// Produces text, streamed tokens, or tool-augmented output.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Generate a complete response for `prompt`.
    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
    ) -> Result<Generation, ProviderError>;

    /// Stream a response, invoking `on_token` once per decoded token on
    /// the caller's task. Returns the assembled result after the final
    /// token.
    async fn stream(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Generation, ProviderError>;

    /// Generate with a tool catalog; the model may request tool calls
    /// instead of (or in addition to) content.
    async fn generate_with_tools(
        &self,
        messages: &[ChatTurn],
        tools: &[ToolDefinition],
        opts: &GenerationOptions,
    ) -> Result<ToolAugmentedResponse, ProviderError>;
}

/// Metadata map used at every boundary: open keys, JSON values.
pub type Metadata = HashMap<String, serde_json::Value>;
