use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use issue_search_core::config::SearchConfig;
use issue_search_core::persist::save_snapshot;
use issue_search_core::{Document, HashingEmbedder, IndexBuilder, IssueState};
use serde_json::Value;
use server::{router, AppState};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use time::macros::datetime;
use tower::ServiceExt;

const DIM: usize = 32;
const TOKEN: &str = "s3cret";

fn issue(id: u32, title: &str, description: &str) -> Document {
    Document {
        id,
        title: title.into(),
        url: format!("https://github.com/acme/widgets/issues/{}", id + 1),
        description: description.into(),
        creator: "octocat".into(),
        created_at: datetime!(2023-09-18 12:00 UTC),
        state: IssueState::Open,
        labels: vec!["bug".into()],
    }
}

async fn write_snapshot(dir: &Path, docs: Vec<Document>) {
    let builder = IndexBuilder::new(Arc::new(HashingEmbedder::new(DIM)), SearchConfig::default());
    let (snapshot, _) = builder.build(docs).await.unwrap();
    save_snapshot(dir, &snapshot).unwrap();
}

async fn app_for(dir: &Path) -> (AppState, Router) {
    write_snapshot(
        dir,
        vec![
            issue(0, "memory leak in parser", "The parser keeps every token alive."),
            issue(1, "UI button misaligned", "The save button overlaps the footer."),
            issue(2, "parser crashes on empty input", "Feeding an empty file to the parser panics."),
        ],
    )
    .await;
    let state = AppState::load(dir, Arc::new(HashingEmbedder::new(DIM)), Some(TOKEN.into())).unwrap();
    (state.clone(), router(state))
}

async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    (status, json)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    call(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn reload(app: Router, token: Option<&str>) -> (StatusCode, Value) {
    let mut req = Request::post("/admin/reload");
    if let Some(t) = token {
        req = req.header("X-ADMIN-TOKEN", t);
    }
    call(app, req.body(Body::empty()).unwrap()).await
}

#[tokio::test]
async fn health_is_ok() {
    let dir = tempdir().unwrap();
    let (_, app) = app_for(dir.path()).await;
    let (status, body) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));
}

#[tokio::test]
async fn bm25_search_returns_ranked_results() {
    let dir = tempdir().unwrap();
    let (_, app) = app_for(dir.path()).await;

    let (status, json) = get(app, "/search?q=parser%20bug&mode=bm25&k=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["mode"], "bm25");
    let arr = json["results"].as_array().unwrap();
    let ids: Vec<u64> = arr.iter().map(|r| r["doc_id"].as_u64().unwrap()).collect();
    assert!(ids.contains(&0) && ids.contains(&2));
    assert!(!ids.contains(&1));
    assert!(arr[0]["snippet"].as_str().unwrap().contains("<em>parser</em>"));
}

#[tokio::test]
async fn hybrid_is_the_default_mode() {
    let dir = tempdir().unwrap();
    let (_, app) = app_for(dir.path()).await;
    let (status, json) = get(app, "/search?q=button%20footer&k=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["mode"], "hybrid");
    assert_eq!(json["results"][0]["doc_id"], 1);
}

#[tokio::test]
async fn bad_queries_are_rejected() {
    let dir = tempdir().unwrap();
    let (_, app) = app_for(dir.path()).await;

    let (status, json) = get(app.clone(), "/search?q=%20&mode=bm25").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("empty"));

    let (status, _) = get(app.clone(), "/search?q=parser&mode=fuzzy").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(app, "/search?q=parser&k=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_k_is_capped() {
    let dir = tempdir().unwrap();
    let (_, app) = app_for(dir.path()).await;
    let (status, json) = get(app, "/search?q=parser&mode=near_text&k=5000").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn doc_lookup() {
    let dir = tempdir().unwrap();
    let (_, app) = app_for(dir.path()).await;

    let (status, json) = get(app.clone(), "/doc/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["title"], "UI button misaligned");
    assert_eq!(json["labels"][0], "bug");

    let (status, _) = get(app, "/doc/42").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reload_requires_the_admin_token() {
    let dir = tempdir().unwrap();
    let (_, app) = app_for(dir.path()).await;
    let (status, _) = reload(app.clone(), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = reload(app, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn reload_swaps_in_a_rebuilt_snapshot() {
    let dir = tempdir().unwrap();
    let (state, app) = app_for(dir.path()).await;
    assert_eq!(state.current().documents().len(), 3);

    write_snapshot(
        dir.path(),
        vec![
            issue(0, "memory leak in parser", ""),
            issue(1, "UI button misaligned", ""),
            issue(2, "parser crashes on empty input", ""),
            issue(3, "dark mode request", "Please add a dark theme."),
        ],
    )
    .await;
    let (status, json) = reload(app.clone(), Some(TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["documents"], 4);

    let (status, json) = get(app, "/search?q=dark%20theme&mode=bm25").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"][0]["doc_id"], 3);
}

#[tokio::test]
async fn corrupt_snapshot_keeps_the_old_one_serving() {
    let dir = tempdir().unwrap();
    let (state, app) = app_for(dir.path()).await;
    std::fs::write(dir.path().join("sparse.bin"), b"garbage").unwrap();

    let (status, _) = reload(app.clone(), Some(TOKEN)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(state.current().documents().len(), 3);

    let (status, json) = get(app, "/search?q=parser&mode=bm25").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn mismatched_embedder_is_refused_at_startup() {
    let dir = tempdir().unwrap();
    write_snapshot(dir.path(), vec![issue(0, "parser crash", "")]).await;
    assert!(AppState::load(dir.path(), Arc::new(HashingEmbedder::new(DIM * 2)), None).is_err());
}
