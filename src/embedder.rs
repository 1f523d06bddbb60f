//! # Embedders
//!
//! Turn a string into a fixed-length vector. Two implementations:
//!
//! - [`OllamaEmbedder`] calls `POST {base_url}/api/embeddings` with `{model, prompt}` and reads
//!   `{embedding: [...]}` back.
//! - [`DummyEmbedder`] is a deterministic stand-in for tests and offline runs. Its vectors are a
//!   function of the input bytes only and carry no meaning.
//!
//! Both check the output length against the dimension they were built with, so a model that
//! returns 768-d vectors into a 1024-d collection fails at the first call instead of being
//! silently padded or truncated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EmbeddingError;

/// Dimension of `mxbai-embed-large`, the default embedding model.
pub const DEFAULT_DIMENSION: usize = 1024;

/// Text to vector. Implementations hold no per-call state and may be shared across tasks.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Length of every vector this embedder returns.
    fn dimension(&self) -> usize;
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

/// Embedder backed by an Ollama server.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&EmbedRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Decode(e.to_string()))?;

        debug!(
            model = %self.model,
            dimension = body.embedding.len(),
            "received embedding"
        );

        check_dimension(body.embedding, self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic embedder: byte `i` of the input scaled into `[0, 1)` for the first
/// `len(text)` slots, `i / dimension` for the rest.
#[derive(Debug, Clone)]
pub struct DummyEmbedder {
    dimension: usize,
}

impl DummyEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for DummyEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for DummyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let bytes = text.as_bytes();
        let vector = (0..self.dimension)
            .map(|i| match bytes.get(i) {
                Some(b) => *b as f32 / 256.0,
                None => i as f32 / self.dimension as f32,
            })
            .collect();
        check_dimension(vector, self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn check_dimension(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>, EmbeddingError> {
    if vector.is_empty() {
        return Err(EmbeddingError::Empty);
    }
    if vector.len() != expected {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dummy_embedder_is_deterministic() {
        let embedder = DummyEmbedder::new(16);
        let a = embedder.embed("What is AI?").await.unwrap();
        let b = embedder.embed("What is AI?").await.unwrap();
        let c = embedder.embed("What is ML?").await.unwrap();

        assert_eq!(a.len(), 16);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_dummy_embedder_empty_text_still_has_full_length() {
        let embedder = DummyEmbedder::default();
        let v = embedder.embed("").await.unwrap();
        assert_eq!(v.len(), DEFAULT_DIMENSION);
    }

    #[tokio::test]
    async fn test_ollama_embedder_returns_vector() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(200)
                    .json_body(json!({ "embedding": [0.1, 0.2, 0.3, 0.4] }));
            })
            .await;

        let embedder = OllamaEmbedder::new(&server.base_url(), "mxbai-embed-large", 4);
        let v = embedder.embed("hello").await.unwrap();

        mock.assert_async().await;
        assert_eq!(v, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_ollama_embedder_rejects_empty_embedding() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(200).json_body(json!({ "embedding": [] }));
            })
            .await;

        let embedder = OllamaEmbedder::new(&server.base_url(), "mxbai-embed-large", 4);
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Empty), "got {err:?}");
    }

    #[tokio::test]
    async fn test_ollama_embedder_rejects_wrong_dimension() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(200).json_body(json!({ "embedding": [1.0, 2.0] }));
            })
            .await;

        let embedder = OllamaEmbedder::new(&server.base_url(), "mxbai-embed-large", 4);
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_ollama_embedder_surfaces_http_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(500).body("model not loaded");
            })
            .await;

        let embedder = OllamaEmbedder::new(&server.base_url(), "mxbai-embed-large", 4);
        match embedder.embed("hello").await {
            Err(EmbeddingError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "model not loaded");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
