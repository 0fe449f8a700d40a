//! Tunables for analysis, both indexes, fusion, the build pipeline and the
//! embedding provider. Every field has a default, so a config file only needs
//! the values it changes.

use crate::tokenizer::AnalyzerConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// BM25 saturation and length-normalization constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    Euclidean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    /// Neighbor bound on layers above 0.
    pub m: usize,
    /// Neighbor bound on layer 0.
    pub m0: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub metric: Metric,
    /// Seeds level assignment.
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self { m: 16, m0: 32, ef_construction: 200, ef_search: 64, metric: Metric::Cosine, seed: 0x5eed_1d5 }
    }
}

/// Reciprocal rank fusion constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionParams {
    pub c: f32,
    pub sparse_weight: f32,
    pub dense_weight: f32,
    /// Candidates drawn from each index before fusing.
    pub candidate_depth: usize,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self { c: 60.0, sparse_weight: 1.0, dense_weight: 1.0, candidate_depth: 50 }
    }
}

impl FusionParams {
    /// Single relative-weighting knob: 0.0 is keyword only, 1.0 is vector only.
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        let alpha = alpha.clamp(0.0, 1.0);
        self.dense_weight = alpha;
        self.sparse_weight = 1.0 - alpha;
        self
    }
}

/// Exponential backoff for retryable embedding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per request, the first one included.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_base_ms: 250, backoff_max_ms: 10_000 }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `backoff_max_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub batch_size: usize,
    /// Embedding batches in flight at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self { batch_size: 100, concurrency: 4, retry: RetryPolicy::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EmbedderConfig {
    /// Deterministic offline feature hashing.
    Hashing { dimension: usize },
    /// OpenAI-compatible `/embeddings` endpoint. The API key comes from the environment.
    #[serde(rename = "openai")]
    OpenAi {
        base_url: String,
        model: String,
        dimension: usize,
        timeout_secs: u64,
    },
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        EmbedderConfig::Hashing { dimension: 256 }
    }
}

impl EmbedderConfig {
    pub fn openai_default() -> Self {
        EmbedderConfig::OpenAi {
            base_url: "https://api.openai.com/v1".into(),
            model: "text-embedding-ada-002".into(),
            dimension: 1536,
            timeout_secs: 30,
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            EmbedderConfig::Hashing { dimension } | EmbedderConfig::OpenAi { dimension, .. } => *dimension,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub analyzer: AnalyzerConfig,
    pub bm25: Bm25Params,
    pub hnsw: HnswParams,
    pub fusion: FusionParams,
    pub build: BuildConfig,
    pub embedder: EmbedderConfig,
}

impl SearchConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: SearchConfig =
            serde_json::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));
        if self.bm25.k1.is_nan() || self.bm25.k1 < 0.0 { return fail("bm25.k1 must be non-negative"); }
        if !(0.0..=1.0).contains(&self.bm25.b) { return fail("bm25.b must be within [0, 1]"); }
        if self.hnsw.m < 2 { return fail("hnsw.m must be at least 2"); }
        if self.hnsw.m0 < self.hnsw.m { return fail("hnsw.m0 must be at least hnsw.m"); }
        if self.hnsw.ef_construction == 0 || self.hnsw.ef_search == 0 { return fail("hnsw ef values must be positive"); }
        if self.fusion.c.is_nan() || self.fusion.c <= 0.0 { return fail("fusion.c must be positive"); }
        if self.fusion.sparse_weight < 0.0 || self.fusion.dense_weight < 0.0 { return fail("fusion weights must be non-negative"); }
        if self.build.batch_size == 0 { return fail("build.batch_size must be positive"); }
        if self.build.concurrency == 0 { return fail("build.concurrency must be positive"); }
        if self.build.retry.max_attempts == 0 { return fail("build.retry.max_attempts must be positive"); }
        if self.embedder.dimension() == 0 { return fail("embedder dimension must be positive"); }
        Ok(())
    }
}
