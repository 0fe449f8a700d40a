use crate::bm25::{CorpusStats, SparseIndex};
use crate::config::FusionParams;
use crate::error::{IndexCorruptionError, QueryValidationError};
use crate::fusion::fuse;
use crate::hnsw::DenseIndex;
use crate::index::{DocId, Document, DocumentStore, RankedHit};
use crate::tokenizer::Analyzer;
use crate::Result;
use time::OffsetDateTime;

/// An immutable, queryable index: document store, both indexes, and the analysis
/// and fusion settings they were built with. Shared read-only between queries.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub(crate) analyzer: Analyzer,
    pub(crate) store: DocumentStore,
    pub(crate) sparse: SparseIndex,
    pub(crate) dense: DenseIndex,
    pub(crate) fusion: FusionParams,
    pub(crate) embedder: String,
    pub(crate) created_at: OffsetDateTime,
}

fn check_query(query: &str, k: usize) -> std::result::Result<(), QueryValidationError> {
    if query.trim().is_empty() {
        return Err(QueryValidationError::EmptyQuery);
    }
    if k < 1 {
        return Err(QueryValidationError::InvalidK(k));
    }
    Ok(())
}

impl Snapshot {
    pub fn analyzer(&self) -> &Analyzer { &self.analyzer }

    pub fn documents(&self) -> &DocumentStore { &self.store }

    pub fn document(&self, id: DocId) -> Option<&Document> { self.store.get(id) }

    pub fn sparse(&self) -> &SparseIndex { &self.sparse }

    pub fn dense(&self) -> &DenseIndex { &self.dense }

    pub fn fusion(&self) -> FusionParams { self.fusion }

    /// Name of the embedding model the dense index was built with.
    pub fn embedder(&self) -> &str { &self.embedder }

    pub fn created_at(&self) -> OffsetDateTime { self.created_at }

    pub fn corpus_stats(&self) -> CorpusStats { self.sparse.stats() }

    /// Keyword search. The query goes through the same analyzer the documents did.
    pub fn bm25_search(&self, query: &str, k: usize) -> Result<Vec<RankedHit>> {
        check_query(query, k)?;
        let terms = self.analyzer.analyze(query);
        Ok(self.sparse.search(&terms, k))
    }

    /// Nearest neighbors of an already embedded query.
    pub fn dense_search(&self, vector: &[f32], k: usize) -> Result<Vec<RankedHit>> {
        if k < 1 {
            return Err(QueryValidationError::InvalidK(k).into());
        }
        self.dense.search(vector, k)
    }

    /// Rank-fused keyword and vector search.
    pub fn hybrid_search(&self, query: &str, vector: &[f32], k: usize) -> Result<Vec<RankedHit>> {
        check_query(query, k)?;
        let depth = k.max(self.fusion.candidate_depth);
        let sparse = self.sparse.search(&self.analyzer.analyze(query), depth);
        let dense = self.dense.search(vector, depth)?;
        Ok(fuse(&sparse, &dense, k, &self.fusion))
    }

    /// Cross-checks every structure against the document store.
    pub fn validate(&self) -> std::result::Result<(), IndexCorruptionError> {
        let bad = |msg: String| Err(IndexCorruptionError::Inconsistent(msg));
        if !self.store.ids_are_dense() {
            return bad("document ids are not sequential".into());
        }
        if self.sparse.len() != self.store.len() {
            return bad(format!("sparse index covers {} documents, store holds {}", self.sparse.len(), self.store.len()));
        }
        if let Some(missing) = self.store.iter().find(|d| !self.sparse.contains(d.id)) {
            return bad(format!("document {} is missing from the sparse index", missing.id));
        }
        self.sparse.check_consistency().map_err(IndexCorruptionError::Inconsistent)?;
        self.dense.check_consistency().map_err(IndexCorruptionError::Inconsistent)?;
        if let Some(orphan) = self.dense.doc_ids().find(|id| !self.store.contains(*id)) {
            return bad(format!("graph node refers to unknown document {orphan}"));
        }
        Ok(())
    }
}
