/// Mock providers for testing.
///
/// Deterministic, dependency-free stand-ins for the embedding and
/// generation contracts. The embedding mock hashes lowercase tokens into
/// a bag-of-words vector so related texts land near each other, which is
/// enough for retrieval-ordering tests.
use std::collections::VecDeque;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    ChatTurn, EmbeddingClient, Generation, GenerationClient, GenerationOptions, ProviderError,
    ToolAugmentedResponse, ToolDefinition,
};

// ── MockEmbedding ────────────────────────────────────────────────────

/// Token-hash embedding mock.
pub struct MockEmbedding {
    pub dimensions: usize,
}

impl MockEmbedding {
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self { dimensions: 384 }
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidInput(
                "cannot embed empty text".to_string(),
            ));
        }

        let mut embedding = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dimensions;
            embedding[idx] += 1.0;
        }

        // L2 normalize
        let norm_sq: f32 = embedding.iter().map(|v| v * v).sum();
        if norm_sq > 0.0 {
            let inv = 1.0 / norm_sq.sqrt();
            for v in &mut embedding {
                *v *= inv;
            }
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ── MockGeneration ───────────────────────────────────────────────────

/// Scripted generation mock.
///
/// Canned responses are consumed FIFO; with none queued, the mock echoes
/// the prompt so answer-content assertions can match retrieved context.
#[derive(Default)]
pub struct MockGeneration {
    responses: Mutex<VecDeque<String>>,
    stream_tokens: Mutex<Option<Vec<String>>>,
    tool_response: Mutex<Option<ToolAugmentedResponse>>,
    fail_next: Mutex<bool>,
}

impl MockGeneration {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a canned response for the next `generate` call.
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    /// Script the exact token sequence for the next `stream` call.
    pub fn set_stream_tokens(&self, tokens: Vec<&str>) {
        *self.stream_tokens.lock().unwrap() =
            Some(tokens.into_iter().map(String::from).collect());
    }

    /// Script the next `generate_with_tools` response.
    pub fn set_tool_response(&self, response: ToolAugmentedResponse) {
        *self.tool_response.lock().unwrap() = Some(response);
    }

    /// Make the next call fail with a transient error.
    pub fn fail_next(&self) {
        *self.fail_next.lock().unwrap() = true;
    }

    fn take_failure(&self) -> Result<(), ProviderError> {
        let mut flag = self.fail_next.lock().unwrap();
        if *flag {
            *flag = false;
            return Err(ProviderError::Transient("scripted failure".to_string()));
        }
        Ok(())
    }

    fn next_text(&self, prompt: &str) -> String {
        match self.responses.lock().unwrap().pop_front() {
            Some(r) => r,
            None => format!("Mock answer based on the prompt:\n{prompt}"),
        }
    }
}

#[async_trait]
impl GenerationClient for MockGeneration {
    async fn generate(
        &self,
        prompt: &str,
        _opts: &GenerationOptions,
    ) -> Result<Generation, ProviderError> {
        self.take_failure()?;
        Ok(Generation {
            text: self.next_text(prompt),
            usage: None,
        })
    }

    async fn stream(
        &self,
        prompt: &str,
        _opts: &GenerationOptions,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<Generation, ProviderError> {
        self.take_failure()?;

        let tokens: Vec<String> = match self.stream_tokens.lock().unwrap().take() {
            Some(t) => t,
            None => self
                .next_text(prompt)
                .split_inclusive(' ')
                .map(String::from)
                .collect(),
        };

        let mut full = String::new();
        for token in &tokens {
            on_token(token);
            full.push_str(token);
        }

        Ok(Generation {
            text: full,
            usage: None,
        })
    }

    async fn generate_with_tools(
        &self,
        messages: &[ChatTurn],
        _tools: &[ToolDefinition],
        _opts: &GenerationOptions,
    ) -> Result<ToolAugmentedResponse, ProviderError> {
        self.take_failure()?;
        if let Some(resp) = self.tool_response.lock().unwrap().take() {
            return Ok(resp);
        }
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        Ok(ToolAugmentedResponse {
            content: self.next_text(prompt),
            tool_calls: Vec::new(),
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_mock_embed_dimensions() {
        let embedder = MockEmbedding::new(384);
        let result = embedder.embed("hello world").await.unwrap();
        assert_eq!(result.len(), 384);
    }

    #[tokio::test]
    async fn test_mock_embed_deterministic() {
        let embedder = MockEmbedding::default();
        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        assert_eq!(a, b, "same input should produce same output");
    }

    #[tokio::test]
    async fn test_mock_embed_empty_rejected() {
        let embedder = MockEmbedding::default();
        let err = embedder.embed("   ").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_mock_embed_normalized() {
        let embedder = MockEmbedding::default();
        let vec = embedder.embed("test normalization").await.unwrap();
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!(
            (norm - 1.0).abs() < 0.01,
            "vector should be approximately unit length, got {norm}"
        );
    }

    #[tokio::test]
    async fn test_related_texts_are_closer() {
        let embedder = MockEmbedding::default();
        let doc = embedder
            .embed("Paris is the capital of France.")
            .await
            .unwrap();
        let related = embedder
            .embed("What is the capital of France?")
            .await
            .unwrap();
        let unrelated = embedder.embed("Quarterly revenue grew").await.unwrap();

        assert!(cosine(&doc, &related) > cosine(&doc, &unrelated));
        assert!(cosine(&doc, &related) > 0.5);
    }

    #[tokio::test]
    async fn test_mock_generation_canned_and_fallback() {
        let generator = MockGeneration::new();
        generator.push_response("canned");

        let opts = GenerationOptions::default();
        let first = generator.generate("prompt", &opts).await.unwrap();
        assert_eq!(first.text, "canned");

        let second = generator.generate("the prompt body", &opts).await.unwrap();
        assert!(second.text.contains("the prompt body"));
    }

    #[tokio::test]
    async fn test_mock_stream_scripted_tokens() {
        let generator = MockGeneration::new();
        generator.set_stream_tokens(vec!["answer ", "is ", "42"]);

        let mut collected = String::new();
        let result = generator
            .stream("q", &GenerationOptions::default(), &mut |t| {
                collected.push_str(t)
            })
            .await
            .unwrap();

        assert_eq!(collected, "answer is 42");
        assert_eq!(result.text, "answer is 42");
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let generator = MockGeneration::new();
        generator.fail_next();

        let err = generator
            .generate("q", &GenerationOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // Next call succeeds again
        assert!(
            generator
                .generate("q", &GenerationOptions::default())
                .await
                .is_ok()
        );
    }
}
