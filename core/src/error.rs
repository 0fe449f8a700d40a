//! Error taxonomy for ingestion, embedding, snapshot loading and queries.

use crate::index::DocId;
use thiserror::Error;

/// A raw record could not be turned into a document. The record is skipped.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("malformed record: {reason}")]
    Malformed { reason: String },
    #[error("unparseable record: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("source i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        SourceError::Malformed { reason: reason.into() }
    }
}

/// Failure reported by an embedding provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("embedding provider rate limited: {0}")]
    RateLimited(String),
    #[error("embedding provider rejected input: {0}")]
    InvalidInput(String),
    #[error("transient embedding failure: {0}")]
    Transient(String),
}

impl EmbeddingError {
    /// Rate limits and transient failures are worth another attempt; rejected input is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::RateLimited(_) | EmbeddingError::Transient(_))
    }
}

/// The persisted snapshot failed validation. Fatal: a corrupt snapshot is never served.
#[derive(Debug, Error)]
pub enum IndexCorruptionError {
    #[error("unsupported snapshot format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("snapshot part missing: {0}")]
    MissingPart(String),
    #[error("snapshot part {part} digest mismatch")]
    DigestMismatch { part: String },
    #[error("snapshot part {part} failed to decode: {reason}")]
    Decode { part: String, reason: String },
    #[error("snapshot is inconsistent: {0}")]
    Inconsistent(String),
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A query was rejected before touching any index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryValidationError {
    #[error("query string is empty")]
    EmptyQuery,
    #[error("k must be at least 1 (got {0})")]
    InvalidK(usize),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Corruption(#[from] IndexCorruptionError),
    #[error(transparent)]
    Query(#[from] QueryValidationError),
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("document {0} is already indexed")]
    DuplicateDocument(DocId),
    #[error("document ids must be sequential: expected {expected}, got {found}")]
    NonSequentialId { expected: DocId, found: DocId },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("index build cancelled")]
    Cancelled,
    #[error("snapshot encoding failed: {0}")]
    Encode(String),
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
