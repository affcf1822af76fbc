//! HTTP surface: the four streaming relays, embeddings, the backend
//! pass-through and health probes.

use crate::backend::{Credentials, Forwarded};
use crate::health;
use crate::logging::request_id_middleware;
use crate::relay::cerebras::{self, CerebrasRelayRequest};
use crate::relay::gemini::{self, GeminiRelayRequest};
use crate::relay::openai::{self, OpenAiRelayRequest};
use crate::relay::perplexity::{self, PerplexityRelayRequest};
use crate::relay::{stream_response, RelaySink, WireFormat};
use crate::types::{missing_field, LearnFlowError, Result};
use crate::AppState;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

pub const EMBEDDING_FAILURE: &str = "Failed to generate embedding";

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/openai", post(openai_handler))
        .route("/api/gemini", post(gemini_handler))
        .route("/api/perplexity", post(perplexity_handler))
        .route("/api/cerebras", post(cerebras_handler))
        .route("/api/embedding", post(embedding_handler))
        .route("/api/student/assignments/:id", get(assignment_handler))
        .route("/api/student/assignments/:id/nodes/tree", get(tree_handler))
        .route(
            "/api/student/assignments/:id/nodes/:node_id",
            put(update_node_handler),
        )
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// --- Relays ---

#[tracing::instrument(name = "route.openai", skip_all, fields(stream = request.stream))]
async fn openai_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OpenAiRelayRequest>,
) -> Result<Response> {
    request.text()?;
    let client = state.vendors.openai()?.clone();

    if !request.stream {
        let completion = request.structured_request()?;
        let content = openai::structured(&client, &completion).await?;
        return Ok(Json(content).into_response());
    }

    let completion = request.streaming_request()?;
    let (sink, rx) = RelaySink::new("openai", WireFormat::PlainText);
    tokio::spawn(openai::run(client, completion, sink).in_current_span());
    Ok(stream_response(rx))
}

#[tracing::instrument(name = "route.gemini", skip_all, fields(history = request.history.len()))]
async fn gemini_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GeminiRelayRequest>,
) -> Result<Response> {
    let generate = request.generate_request()?;
    let client = state.vendors.gemini()?.clone();

    let (sink, rx) = RelaySink::new("gemini", WireFormat::NdJson);
    tokio::spawn(gemini::run(client, generate, sink).in_current_span());
    Ok(stream_response(rx))
}

#[tracing::instrument(name = "route.perplexity", skip_all, fields(history = request.history.len()))]
async fn perplexity_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PerplexityRelayRequest>,
) -> Result<Response> {
    let completion = request.completion_request()?;
    let client = state.vendors.perplexity()?.clone();

    let persist = match (&state.archive, request.scope()) {
        (Some(archive), Some(scope)) => Some((archive.clone(), scope)),
        (None, Some(_)) => {
            tracing::debug!("No chat archive configured; answer will not be saved");
            None
        }
        _ => None,
    };

    let (sink, rx) = RelaySink::new("perplexity", WireFormat::NdJson);
    tokio::spawn(perplexity::run(client, completion, sink, persist).in_current_span());
    Ok(stream_response(rx))
}

#[tracing::instrument(name = "route.cerebras", skip_all, fields(history = request.history.len()))]
async fn cerebras_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CerebrasRelayRequest>,
) -> Result<Response> {
    let completion = request.completion_request()?;
    let client = state.vendors.cerebras()?.clone();

    let (sink, rx) = RelaySink::new("cerebras", WireFormat::PlainText);
    tokio::spawn(cerebras::run(client, completion, sink).in_current_span());
    Ok(stream_response(rx))
}

// --- Embeddings ---

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequestBody {
    #[serde(default)]
    pub text: Option<String>,
}

#[tracing::instrument(name = "route.embedding", skip_all)]
async fn embedding_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EmbeddingRequestBody>,
) -> Response {
    let text = match body.text {
        Some(t) if !t.is_empty() => t,
        _ => return missing_field("text").into_response(),
    };

    let result = match state.vendors.embedder() {
        Ok(client) => client.embed(&text).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(embedding) => Json(serde_json::json!({ "embedding": embedding })).into_response(),
        Err(e) => {
            tracing::error!("Error generating embedding: {}", e.inner);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": EMBEDDING_FAILURE })),
            )
                .into_response()
        }
    }
}

// --- Backend pass-through ---

fn pass_through(result: Result<Forwarded>, failure: &str) -> Response {
    match result {
        Ok(forwarded) => forwarded.into_response(),
        Err(e) => match e.inner {
            LearnFlowError::Unauthorized => e.into_response(),
            _ => {
                tracing::error!("{}: {}", failure, e.inner);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "success": false, "message": failure })),
                )
                    .into_response()
            }
        },
    }
}

#[tracing::instrument(name = "route.assignment", skip(state, headers))]
async fn assignment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let credentials = Credentials::from_headers(&headers);
    pass_through(
        state.backend.assignment(&id, &credentials).await,
        "Failed to fetch assignment details",
    )
}

#[tracing::instrument(name = "route.tree", skip(state, headers))]
async fn tree_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let credentials = Credentials::from_headers(&headers);
    pass_through(
        state.backend.tree(&id, &credentials).await,
        "Failed to fetch assignment tree data",
    )
}

#[tracing::instrument(name = "route.update_node", skip(state, headers, node))]
async fn update_node_handler(
    State(state): State<Arc<AppState>>,
    Path((id, node_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(node): Json<serde_json::Value>,
) -> Response {
    let credentials = Credentials::from_headers(&headers);
    pass_through(
        state.backend.update_node(&id, &node_id, &node, &credentials).await,
        "Failed to update node",
    )
}
