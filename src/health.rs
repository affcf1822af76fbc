use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub archive: &'static str,
    pub vendors: BTreeMap<&'static str, bool>,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

/// Ready when the chat archive (if any) answers and at least one vendor has
/// a key.
pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let archive = match &state.archive {
        Some(archive) => match archive.store().ready().await {
            Ok(()) => "ok",
            Err(e) => {
                tracing::error!("Readiness check: chat archive error: {}", e.inner);
                "error"
            }
        },
        None => "disabled",
    };

    let vendors = state.vendors.availability();
    let any_vendor = vendors.values().any(|ok| *ok);
    if !any_vendor {
        tracing::error!("Readiness check: no vendor API key configured");
    }

    let ready = archive != "error" && any_vendor;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" },
            archive,
            vendors,
        }),
    )
}
