//! Error types for the RAG engine.

use thiserror::Error;

/// Result type alias using [`RagError`].
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur in the RAG engine.
///
/// Storage and provider errors bubble to the caller; extraction, graph,
/// and tracker errors are swallowed with warning logs at the call site.
#[derive(Error, Debug)]
pub enum RagError {
    /// Caller-supplied input was rejected (empty query, multiple content
    /// sources, unsupported file type, unknown rerank strategy, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A document, session, query record, or tool call row is missing.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Vector store read/write failure.
    #[error("vector store failed: {0}")]
    VectorStoreFailed(String),

    /// Document store read/write failure.
    #[error("document store failed: {0}")]
    DocumentStoreFailed(String),

    /// Graph store read/write failure.
    #[error("graph store failed: {0}")]
    GraphStoreFailed(String),

    /// Chat/usage database read/write failure.
    #[error("chat store failed: {0}")]
    ChatStoreFailed(String),

    /// Metadata or entity extraction failure. Never propagated to the
    /// caller; logged and continued.
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// Embedding provider failure.
    #[error("embedding failed: {message}")]
    EmbeddingFailed { message: String, retryable: bool },

    /// Generation provider failure.
    #[error("generation failed: {message}")]
    GenerationFailed { message: String, retryable: bool },

    /// The request was cancelled via its cancellation token.
    #[error("request cancelled")]
    Cancelled,

    /// Reserved functionality (e.g. URL ingestion).
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RagError {
    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a not-found error for the given entity kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether a retry hint should be surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingFailed {
                retryable: true,
                ..
            } | Self::GenerationFailed {
                retryable: true,
                ..
            }
        )
    }

    /// Stable error code for surface layers (HTTP mapping is out of scope
    /// here, but the codes are part of the contract).
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::VectorStoreFailed(_) => "VECTOR_STORE_FAILED",
            Self::DocumentStoreFailed(_) => "DOCUMENT_STORE_FAILED",
            Self::GraphStoreFailed(_) => "GRAPH_STORE_FAILED",
            Self::ChatStoreFailed(_) => "CHAT_STORE_FAILED",
            Self::ExtractionFailed(_) => "EXTRACTION_FAILED",
            Self::EmbeddingFailed { .. } => "EMBEDDING_FAILED",
            Self::GenerationFailed { .. } => "GENERATION_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unimplemented(_) => "UNIMPLEMENTED",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}
