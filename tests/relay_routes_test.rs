mod common;

use common::*;
use learnflow::consumer::{consume_all, StreamFormat};
use learnflow::routes::router;
use learnflow::types::{GENERIC_FAILURE, VENDOR_FAILURE_MESSAGE};
use serde_json::json;

async fn app() -> axum::Router {
    let vendor = spawn_mock(vendor_app()).await;
    let backend = closed_url().await;
    router(state_for(&vendor, &backend, &[]).await)
}

#[tokio::test]
async fn test_openai_structured_returns_vendor_content_verbatim() {
    let (status, body) = send(
        app().await,
        post_json("/api/openai", json!({ "text": "저출산", "history": "사용자: 안녕" })),
    )
    .await;
    assert_eq!(status, 200);
    let content: String = match serde_json::from_str(&body) {
        Ok(s) => s,
        Err(e) => panic!("expected a JSON string, got {}: {:?}", body, e),
    };
    assert_eq!(content, STRUCTURED_ANSWER);
}

#[tokio::test]
async fn test_openai_missing_text_is_bad_request() {
    let (status, body) = send(app().await, post_json("/api/openai", json!({ "stream": true }))).await;
    assert_eq!(status, 400);
    assert_eq!(parse(&body)["error"], "Missing required 'text' parameter");
}

#[tokio::test]
async fn test_openai_stream_is_plain_text() {
    let (status, body) = send(
        app().await,
        post_json("/api/openai", json!({ "text": "저출산", "stream": true })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, "주장 및 근거");
}

#[tokio::test]
async fn test_cerebras_hides_reasoning_and_appends_sources() {
    let (status, body) = send(
        app().await,
        post_json("/api/cerebras", json!({ "text": "출처를 알려줘", "history": ["사용자: 안녕", "AI: 네"] })),
    )
    .await;
    assert_eq!(status, 200);
    assert!(!body.contains("검색 계획"));

    let outcome = consume_all(StreamFormat::PlainText, [body.as_bytes()]);
    assert_eq!(outcome.full_text, "See https://a.org now.");
    assert_eq!(outcome.citations.len(), 1);
    assert_eq!(outcome.citations[0].url, "https://a.org");
    assert_eq!(outcome.citations[0].title, "Source 1");
}

#[tokio::test]
async fn test_perplexity_ndjson_decodes_to_text_and_citations() {
    let (status, body) = send(
        app().await,
        post_json("/api/perplexity", json!({ "message": "출처는?", "history": [] })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body.lines().count(), 3);

    // Byte-at-a-time delivery must decode the same as one read.
    let pieces: Vec<&[u8]> = body.as_bytes().chunks(1).collect();
    let outcome = consume_all(StreamFormat::NdJson, pieces);
    assert_eq!(outcome.full_text, "Hello [1]");
    assert_eq!(outcome.citations.len(), 2);
    assert_eq!(outcome.citations[0].title, "A");
    assert_eq!(outcome.citations[1].url, "https://b.example");
}

#[tokio::test]
async fn test_missing_vendor_key_fails_only_that_route() {
    let router = app().await;
    let (status, body) = send(
        router.clone(),
        post_json("/api/gemini", json!({ "message": "hi", "history": [] })),
    )
    .await;
    assert_eq!(status, 500);
    assert_eq!(parse(&body)["error"], GENERIC_FAILURE);

    let (status, _) = send(router, post_json("/api/openai", json!({ "text": "hi", "stream": true }))).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_vendor_failure_is_reported_in_band() {
    let vendor = spawn_mock(vendor_app()).await;
    let backend = closed_url().await;
    let state = state_for(&vendor, &backend, &[format!("--cerebras-base-url={}/broken", vendor)]).await;
    let (status, body) = send(
        router(state),
        post_json("/api/cerebras", json!({ "text": "hi" })),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body, VENDOR_FAILURE_MESSAGE);
}

#[tokio::test]
async fn test_embedding_requires_text() {
    let router = app().await;
    let (status, body) = send(router.clone(), post_json("/api/embedding", json!({}))).await;
    assert_eq!(status, 400);
    assert_eq!(parse(&body)["error"], "Missing required 'text' parameter");

    let (status, body) = send(router.clone(), post_json("/api/embedding", json!({ "text": "근거" }))).await;
    assert_eq!(status, 200);
    assert_eq!(parse(&body)["embedding"].as_array().map(|a| a.len()), Some(3));

    let (status, body) = send(router, post_json("/api/embedding", json!({ "text": "fail" }))).await;
    assert_eq!(status, 500);
    assert_eq!(parse(&body)["error"], "Failed to generate embedding");
}
