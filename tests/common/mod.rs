#![allow(dead_code)]

use axum::body::Body;
use axum::extract::Path;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use learnflow::backend::MAIN_NODE_NOT_FOUND;
use learnflow::{AppState, Args};
use std::sync::Arc;
use tower::util::ServiceExt;

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn spawn_mock(app: Router) -> String {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("Failed to bind mock server: {:?}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("Mock server has no address: {:?}", e),
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

/// A base URL nothing is listening on.
pub async fn closed_url() -> String {
    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(e) => panic!("Failed to bind: {:?}", e),
    };
    let addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => panic!("No address: {:?}", e),
    };
    drop(listener);
    format!("http://{}", addr)
}

fn sse(events: &[serde_json::Value]) -> Response {
    let mut body = String::new();
    for event in events {
        body.push_str("data: ");
        body.push_str(&event.to_string());
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

fn delta(content: &str) -> serde_json::Value {
    serde_json::json!({ "choices": [{ "delta": { "content": content } }] })
}

pub const STRUCTURED_ANSWER: &str = "{\"assertion\":\"저출산은 노동력 감소로 이어진다\",\"evidences\":[\"통계청 자료\"]}";
pub const MOCK_EMBEDDING: [f32; 3] = [0.6, 0.8, 0.0];

async fn openai_completions(Json(body): Json<serde_json::Value>) -> Response {
    if body["stream"] == serde_json::json!(true) {
        return sse(&[delta("주장"), delta(""), delta(" 및 근거")]);
    }
    Json(serde_json::json!({
        "choices": [{ "message": { "role": "assistant", "content": STRUCTURED_ANSWER }, "finish_reason": "stop" }]
    }))
    .into_response()
}

async fn embeddings(Json(body): Json<serde_json::Value>) -> Response {
    if body["input"] == "fail" {
        return (StatusCode::BAD_REQUEST, "bad input").into_response();
    }
    Json(serde_json::json!({ "data": [{ "embedding": MOCK_EMBEDDING }] })).into_response()
}

async fn cerebras_completions() -> Response {
    sse(&[
        delta("<think>검색 계획</th"),
        delta("ink>See https://a.org"),
        delta(" now."),
    ])
}

async fn perplexity_completions() -> Response {
    sse(&[
        delta("Hello"),
        serde_json::json!({
            "choices": [{ "delta": { "content": " [1]" } }],
            "citations": ["https://a.example", "https://b.example"],
            "search_results": [{ "title": "A", "url": "https://a.example" }]
        }),
    ])
}

async fn broken_completions() -> Response {
    (StatusCode::UNAUTHORIZED, "invalid api key").into_response()
}

/// One server playing every OpenAI-dialect vendor under its own prefix.
pub fn vendor_app() -> Router {
    Router::new()
        .route("/openai/chat/completions", post(openai_completions))
        .route("/openai/embeddings", post(embeddings))
        .route("/cerebras/chat/completions", post(cerebras_completions))
        .route("/pplx/chat/completions", post(perplexity_completions))
        .route("/broken/chat/completions", post(broken_completions))
}

async fn assignment(Path(id): Path<String>, headers: HeaderMap) -> Response {
    if id == "expired" {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "message": "expired" })))
            .into_response();
    }
    let auth = match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(v) => v.to_string(),
        None => String::new(),
    };
    Json(serde_json::json!({ "status": "success", "data": { "id": id, "authorization": auth } }))
        .into_response()
}

async fn tree(Path(_id): Path<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "status": "error", "data": MAIN_NODE_NOT_FOUND })),
    )
        .into_response()
}

async fn update_node(
    Path((id, node_id)): Path<(String, String)>,
    Json(node): Json<serde_json::Value>,
) -> Response {
    Json(serde_json::json!({ "status": "success", "data": { "assignment": id, "node": node_id, "echo": node } }))
        .into_response()
}

pub fn backend_app() -> Router {
    Router::new()
        .route("/api/student/assignments/:id", get(assignment))
        .route("/api/student/assignments/:id/nodes/tree", get(tree))
        .route("/api/student/assignments/:id/nodes/:node_id", put(update_node))
}

/// Builds state whose vendors all point at `vendor_url`. Extra flags are
/// appended last so they win.
pub async fn state_for(vendor_url: &str, backend_url: &str, extra: &[String]) -> Arc<AppState> {
    let mut argv: Vec<String> = vec![
        "learnflow".into(),
        "--openai-api-key=sk-test".into(),
        format!("--openai-base-url={}/openai", vendor_url),
        "--cerebras-api-key=csk-test".into(),
        format!("--cerebras-base-url={}/cerebras", vendor_url),
        "--pplx-api-key=pplx-test".into(),
        format!("--pplx-base-url={}/pplx", vendor_url),
        "--gemini-api-key=".into(),
        "--supabase-url=".into(),
        format!("--backend-api-url={}/api", backend_url),
        "--max-retries=1".into(),
    ];
    // clap rejects repeated flags, so drop any default an extra flag overrides.
    let flag_name = |s: &str| s.split('=').next().unwrap_or("").to_string();
    let overridden: Vec<String> = extra.iter().map(|e| flag_name(e)).collect();
    argv.retain(|a| !overridden.contains(&flag_name(a)));
    argv.extend(extra.iter().cloned());
    let args = Args::parse_from(argv);
    match AppState::from_args(args).await {
        Ok(s) => Arc::new(s),
        Err(e) => panic!("Failed to build state: {:?}", e),
    }
}

pub async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = match app.oneshot(request).await {
        Ok(r) => r,
        Err(e) => panic!("Request failed: {:?}", e),
    };
    let status = response.status();
    let bytes = match axum::body::to_bytes(response.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(e) => panic!("Failed to read body: {:?}", e),
    };
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    match Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
    {
        Ok(r) => r,
        Err(e) => panic!("Bad request: {:?}", e),
    }
}

pub fn parse(body: &str) -> serde_json::Value {
    match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => panic!("Body is not JSON ({:?}): {}", e, body),
    }
}
