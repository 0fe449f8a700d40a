//! Hybrid keyword and semantic search over GitHub issues.
//!
//! Documents are indexed twice: into a BM25 inverted index and into an HNSW
//! graph of embedding vectors. A [`Snapshot`] bundles both with the document
//! store; queries run against a snapshot in keyword, semantic or fused mode.

pub mod bm25;
pub mod builder;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod hnsw;
pub mod index;
pub mod persist;
pub mod search;
pub mod snapshot;
pub mod source;
pub mod tokenizer;

pub use builder::{BuildReport, CancelHandle, IndexBuilder};
pub use config::SearchConfig;
pub use embedding::{EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
pub use error::{EmbeddingError, Error, IndexCorruptionError, QueryValidationError, Result, SourceError};
pub use index::{DocId, Document, HitSource, IssueState, Posting, RankedHit, TermId};
pub use search::{search, SearchMode, SearchRequest, SearchResult};
pub use snapshot::Snapshot;
