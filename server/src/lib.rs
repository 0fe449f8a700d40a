use anyhow::{bail, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use issue_search_core::persist::load_snapshot;
use issue_search_core::{
    search, Document, EmbeddingError, EmbeddingProvider, Error, IssueState, SearchMode, SearchRequest, Snapshot,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

const MAX_K: usize = 100;

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
}
fn default_k() -> usize { issue_search_core::search::DEFAULT_K }

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub took_ms: u128,
    pub took_s: f64,
    pub total_hits: usize,
    pub results: Vec<SearchHit>,
}

#[derive(Serialize)]
pub struct SearchHit {
    pub doc_id: u32,
    pub score: f32,
    pub title: String,
    pub url: String,
    pub creator: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub state: IssueState,
    pub labels: Vec<String>,
    pub snippet: Option<String>,
}

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Query(_) | Error::Embedding(EmbeddingError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Error::Embedding(_) | Error::DimensionMismatch { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub index_root: PathBuf,
    pub snapshot: Arc<RwLock<Arc<Snapshot>>>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub admin_token: Option<String>,
}

impl AppState {
    /// Load the snapshot at `index_root`. Refuses a snapshot whose vectors the embedder cannot query.
    pub fn load(index_root: impl Into<PathBuf>, embedder: Arc<dyn EmbeddingProvider>, admin_token: Option<String>) -> Result<Self> {
        let index_root = index_root.into();
        let snapshot = load_snapshot(&index_root)?;
        check_embedder(&snapshot, embedder.as_ref())?;
        Ok(Self { index_root, snapshot: Arc::new(RwLock::new(Arc::new(snapshot))), embedder, admin_token })
    }

    /// The snapshot currently being served.
    pub fn current(&self) -> Arc<Snapshot> { self.snapshot.read().clone() }
}

fn check_embedder(snapshot: &Snapshot, embedder: &dyn EmbeddingProvider) -> Result<()> {
    if snapshot.dense().dimension() != embedder.dimension() {
        bail!(
            "snapshot vectors have dimension {} but embedder {} produces {}",
            snapshot.dense().dimension(),
            embedder.name(),
            embedder.dimension()
        );
    }
    if snapshot.embedder() != embedder.name() {
        tracing::warn!(snapshot = snapshot.embedder(), embedder = %embedder.name(), "snapshot was built with a different embedder");
    }
    Ok(())
}

pub fn build_app(index_dir: String, embedder: Arc<dyn EmbeddingProvider>) -> Result<Router> {
    let admin_token = std::env::var("ADMIN_TOKEN").ok();
    let state = AppState::load(index_dir, embedder, admin_token)?;
    Ok(router(state))
}

pub fn router(state: AppState) -> Router {
    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", get(search_handler))
        .route("/doc/:doc_id", get(doc_handler))
        .route("/admin/reload", post(reload_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn search_handler(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Result<Json<SearchResponse>, ApiError> {
    let start = std::time::Instant::now();
    let mode = match params.mode.as_deref() {
        Some(m) => m.parse::<SearchMode>().map_err(|e| ApiError(StatusCode::BAD_REQUEST, e))?,
        None => SearchMode::default(),
    };
    let k = params.k.min(MAX_K);
    let request = SearchRequest::new(params.q.clone(), mode).with_k(k);

    let snapshot = state.current();
    let rows = search(&snapshot, state.embedder.as_ref(), &request).await?;

    // Capture raw query terms for highlighting
    let raw_terms: Vec<String> = params.q.split_whitespace().map(|s| s.to_string()).collect();
    let results: Vec<SearchHit> = rows
        .into_iter()
        .map(|row| SearchHit {
            snippet: snippet_from_text(&row.description, &raw_terms),
            doc_id: row.doc_id,
            score: row.score,
            title: row.title,
            url: row.url,
            creator: row.creator,
            created_at: row.created_at,
            state: row.state,
            labels: row.labels,
        })
        .collect();

    let elapsed = start.elapsed();
    tracing::debug!(query = %params.q, %mode, hits = results.len(), took_ms = elapsed.as_millis() as u64, "search");
    Ok(Json(SearchResponse {
        query: params.q,
        mode,
        took_ms: elapsed.as_millis(),
        took_s: elapsed.as_secs_f64(),
        total_hits: results.len(),
        results,
    }))
}

pub async fn doc_handler(State(state): State<AppState>, Path(doc_id): Path<u32>) -> Result<Json<Document>, ApiError> {
    let snapshot = state.current();
    snapshot
        .document(doc_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("document {doc_id} not found")))
}

/// Reload the snapshot from disk and swap it in. A snapshot that fails to load leaves the old one serving.
pub async fn reload_handler(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let root = state.index_root.clone();
    let loaded = tokio::task::spawn_blocking(move || load_snapshot(root))
        .await
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("reload task failed: {e}")))?;
    let snapshot = match loaded {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "snapshot reload failed, keeping current snapshot");
            return Err(ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };
    check_embedder(&snapshot, state.embedder.as_ref()).map_err(|e| ApiError(StatusCode::CONFLICT, e.to_string()))?;

    let documents = snapshot.documents().len();
    let embedded = snapshot.dense().len();
    *state.snapshot.write() = Arc::new(snapshot);
    tracing::info!(documents, embedded, "snapshot reloaded");
    Ok(Json(serde_json::json!({ "status": "reloaded", "documents": documents, "embedded": embedded })))
}

fn snippet_from_text(text: &str, raw_terms: &[String]) -> Option<String> {
    if text.trim().is_empty() { return None; }
    // find first match (case-insensitive) of any raw term
    let first_idx = raw_terms
        .iter()
        .filter(|t| !t.trim().is_empty())
        .find_map(|term| find_case_insensitive(text, term));
    let snippet: String = match first_idx {
        Some(idx) => {
            let start = floor_char_boundary(text, idx.saturating_sub(100));
            let end = floor_char_boundary(text, (idx + 200).min(text.len()));
            text[start..end].to_string()
        }
        None => text.chars().take(200).collect(),
    };
    Some(highlight_terms(&snippet, raw_terms))
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let pat = regex::RegexBuilder::new(&regex::escape(needle)).case_insensitive(true).build().ok()?;
    pat.find(haystack).map(|m| m.start())
}

fn highlight_terms(snippet: &str, terms: &[String]) -> String {
    let mut s = snippet.to_string();
    for t in terms {
        if t.trim().is_empty() { continue; }
        let Ok(pat) = regex::RegexBuilder::new(&regex::escape(t)).case_insensitive(true).build() else { continue };
        s = pat.replace_all(&s, |caps: &regex::Captures| format!("<em>{}</em>", &caps[0])).to_string();
    }
    s
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let required = match &state.admin_token {
        Some(t) => t,
        None => return Err(ApiError(StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set".into())),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err(ApiError(StatusCode::UNAUTHORIZED, "invalid admin token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_highlights_query_words() {
        let s = snippet_from_text("The Parser crashes when input is empty", &["parser".into()]).unwrap();
        assert_eq!(s, "The <em>Parser</em> crashes when input is empty");
    }

    #[test]
    fn snippet_window_respects_char_boundaries() {
        let text = format!("{}needle{}", "é".repeat(120), "ü".repeat(150));
        let s = snippet_from_text(&text, &["needle".into()]).unwrap();
        assert!(s.contains("<em>needle</em>"));
    }

    #[test]
    fn empty_description_has_no_snippet() {
        assert!(snippet_from_text("  ", &["x".into()]).is_none());
    }
}
