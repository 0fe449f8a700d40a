//! Embedding providers.
//!
//! The index treats an embedding provider as a black box that turns text into
//! fixed-length vectors and may fail. Two implementations ship here: an
//! OpenAI-compatible HTTP client and a deterministic feature-hashing embedder
//! that needs no network.

use crate::config::EmbedderConfig;
use crate::error::EmbeddingError;
use crate::tokenizer::Analyzer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifies the model; recorded in snapshots so a server can spot a mismatch.
    fn name(&self) -> String;

    fn dimension(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        match (vectors.pop(), vectors.is_empty()) {
            (Some(v), true) => Ok(v),
            _ => Err(EmbeddingError::Transient("provider returned an unexpected number of vectors".into())),
        }
    }
}

/// Build the provider a config describes. `api_key` is only used by HTTP providers.
pub fn provider_from_config(config: &EmbedderConfig, api_key: Option<String>) -> crate::Result<Arc<dyn EmbeddingProvider>> {
    match config {
        EmbedderConfig::Hashing { dimension } => Ok(Arc::new(HashingEmbedder::new(*dimension))),
        EmbedderConfig::OpenAi { base_url, model, dimension, timeout_secs } => {
            let embedder = OpenAiEmbedder::new(base_url, model, *dimension, Duration::from_secs(*timeout_secs), api_key)?;
            Ok(Arc::new(embedder))
        }
    }
}

/// Signed feature hashing of analyzed terms, L2-normalized.
///
/// Texts sharing vocabulary land close together, which is enough to exercise the
/// dense path offline and gives reproducible vectors for tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    analyzer: Analyzer,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(1), analyzer: Analyzer::default() }
    }

    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let terms = self.analyzer.analyze(text);
        if terms.is_empty() {
            return Err(EmbeddingError::InvalidInput("text has no indexable terms".into()));
        }
        let mut vector = vec![0.0f32; self.dimension];
        for term in &terms {
            let digest = Sha1::digest(term.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn name(&self) -> String { format!("hashing-{}", self.dimension) }

    fn dimension(&self) -> usize { self.dimension }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed_text(t)).collect()
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `POST {base_url}/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize, timeout: Duration, api_key: Option<String>) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimension,
            api_key,
        })
    }
}

/// Map an HTTP failure status to the retry taxonomy.
pub fn classify_status(status: u16, body: &str) -> EmbeddingError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    match status {
        429 => EmbeddingError::RateLimited(detail),
        400 | 413 | 422 => EmbeddingError::InvalidInput(detail),
        _ => EmbeddingError::Transient(detail),
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> String { self.model.clone() }

    fn dimension(&self) -> usize { self.dimension }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut req = self.client.post(&self.endpoint).json(&EmbeddingRequest { model: &self.model, input: texts });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| EmbeddingError::Transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }
        let mut parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Transient(format!("malformed embedding response: {e}")))?;
        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::Transient(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashing_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed("parser crashes on empty input").await.unwrap();
        let b = e.embed("parser crashes on empty input").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_vocabulary_is_closer() {
        let e = HashingEmbedder::new(256);
        let dot = |x: &[f32], y: &[f32]| x.iter().zip(y).map(|(a, b)| a * b).sum::<f32>();
        let q = e.embed("parser crash").await.unwrap();
        let near = e.embed("the parser crashes").await.unwrap();
        let far = e.embed("button misaligned in settings").await.unwrap();
        assert!(dot(&q, &near) > dot(&q, &far));
    }

    #[tokio::test]
    async fn empty_text_is_invalid_input() {
        let e = HashingEmbedder::new(8);
        assert!(matches!(e.embed("   ").await, Err(EmbeddingError::InvalidInput(_))));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status(429, ""), EmbeddingError::RateLimited(_)));
        assert!(matches!(classify_status(400, "too many tokens"), EmbeddingError::InvalidInput(_)));
        assert!(matches!(classify_status(503, ""), EmbeddingError::Transient(_)));
        assert!(matches!(classify_status(401, ""), EmbeddingError::Transient(_)));
    }

    #[test]
    fn factory_builds_configured_provider() {
        let p = provider_from_config(&EmbedderConfig::Hashing { dimension: 32 }, None).unwrap();
        assert_eq!(p.dimension(), 32);
        assert_eq!(p.name(), "hashing-32");
        let p = provider_from_config(&EmbedderConfig::openai_default(), Some("k".into())).unwrap();
        assert_eq!(p.dimension(), 1536);
    }
}
