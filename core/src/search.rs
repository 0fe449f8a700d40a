//! Query API consumed by the presentation layer.

use crate::embedding::EmbeddingProvider;
use crate::error::QueryValidationError;
use crate::index::{DocId, Document, IssueState, RankedHit};
use crate::snapshot::Snapshot;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

pub const DEFAULT_K: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Dense semantic similarity.
    NearText,
    Bm25,
    #[default]
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "near_text" | "neartext" | "semantic" => Ok(SearchMode::NearText),
            "bm25" | "keyword" => Ok(SearchMode::Bm25),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("unknown search mode {other:?} (expected near_text, bm25 or hybrid)")),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchMode::NearText => "near_text",
            SearchMode::Bm25 => "bm25",
            SearchMode::Hybrid => "hybrid",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub k: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, mode: SearchMode) -> Self {
        Self { query: query.into(), mode, k: DEFAULT_K }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), QueryValidationError> {
        if self.query.trim().is_empty() {
            return Err(QueryValidationError::EmptyQuery);
        }
        if self.k < 1 {
            return Err(QueryValidationError::InvalidK(self.k));
        }
        Ok(())
    }
}

/// One row of the results table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub doc_id: DocId,
    pub title: String,
    pub url: String,
    pub description: String,
    pub creator: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub state: IssueState,
    pub labels: Vec<String>,
    pub score: f32,
}

impl SearchResult {
    fn from_hit(doc: &Document, hit: &RankedHit) -> Self {
        Self {
            doc_id: doc.id,
            title: doc.title.clone(),
            url: doc.url.clone(),
            description: doc.description.clone(),
            creator: doc.creator.clone(),
            created_at: doc.created_at,
            state: doc.state,
            labels: doc.labels.clone(),
            score: hit.score,
        }
    }
}

/// Ranked hits for a request, before they are joined with the document store.
pub async fn search_hits(snapshot: &Snapshot, embedder: &dyn EmbeddingProvider, request: &SearchRequest) -> Result<Vec<RankedHit>> {
    request.validate()?;
    let SearchRequest { query, mode, k } = request;
    match mode {
        SearchMode::Bm25 => snapshot.bm25_search(query, *k),
        SearchMode::NearText => {
            let vector = embed_query(embedder, query).await?;
            snapshot.dense_search(&vector, *k)
        }
        SearchMode::Hybrid => {
            let vector = embed_query(embedder, query).await?;
            snapshot.hybrid_search(query, &vector, *k)
        }
    }
}

/// Runs a query against `snapshot` and returns table rows, best first.
pub async fn search(snapshot: &Snapshot, embedder: &dyn EmbeddingProvider, request: &SearchRequest) -> Result<Vec<SearchResult>> {
    let hits = search_hits(snapshot, embedder, request).await?;
    Ok(hits
        .iter()
        .filter_map(|hit| snapshot.document(hit.doc_id).map(|doc| SearchResult::from_hit(doc, hit)))
        .collect())
}

async fn embed_query(embedder: &dyn EmbeddingProvider, query: &str) -> Result<Vec<f32>> {
    let vector = embedder.embed(query).await?;
    if vector.len() != embedder.dimension() {
        return Err(Error::DimensionMismatch { expected: embedder.dimension(), actual: vector.len() });
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_and_display() {
        for mode in [SearchMode::NearText, SearchMode::Bm25, SearchMode::Hybrid] {
            assert_eq!(mode.to_string().parse::<SearchMode>().unwrap(), mode);
        }
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }

    #[test]
    fn request_validation() {
        assert_eq!(SearchRequest::new("  ", SearchMode::Bm25).validate(), Err(QueryValidationError::EmptyQuery));
        assert_eq!(SearchRequest::new("x", SearchMode::Bm25).with_k(0).validate(), Err(QueryValidationError::InvalidK(0)));
        assert_eq!(SearchRequest::new("x", SearchMode::Bm25).k, DEFAULT_K);
    }
}
