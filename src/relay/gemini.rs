use super::{RelayReport, RelaySink};
use crate::citations::{citations_from_grounding, CitationRecord};
use crate::specs::gemini::{GenerateContentRequest, GenerateContentResponse, GroundingMetadata};
use crate::sse::FrameStream;
use crate::types::{missing_field, ApiContentItem, ApiRole, Result};
use crate::vendors::{GeminiClient, GEMINI_MODEL};
use futures_util::StreamExt;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GeminiRelayRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub history: Vec<ApiContentItem>,
}

impl GeminiRelayRequest {
    pub fn generate_request(&self) -> Result<GenerateContentRequest> {
        let message = match self.message.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => return Err(missing_field("message")),
        };
        let mut contents = self.history.clone();
        contents.push(ApiContentItem::new(ApiRole::User, message));
        Ok(GenerateContentRequest::grounded(contents))
    }
}

/// Forwards each vendor chunk as one JSON line. Grounding metadata on the
/// final chunk becomes a trailing citations line.
pub async fn relay_chunks(
    mut frames: FrameStream<GenerateContentResponse>,
    sink: &mut RelaySink,
) -> Result<RelayReport> {
    let mut report = RelayReport::default();
    let mut last_grounding: Option<GroundingMetadata> = None;

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let text = frame.chunk.chunk_text();
        sink.metric.record_chunk(text);
        if let Some(t) = text {
            report.text.push_str(t);
        }
        last_grounding = frame.chunk.grounding_metadata().cloned();

        if !sink.write_line(&frame.raw).await {
            report.client_gone = true;
            return Ok(report);
        }
    }

    if let Some(meta) = last_grounding {
        let record = CitationRecord::from_grounding(&meta);
        report.citations = citations_from_grounding(&meta);
        sink.metric.record_citations();
        if !sink.write_json_line(&record).await {
            report.client_gone = true;
        }
    }
    Ok(report)
}

#[tracing::instrument(skip_all, fields(model = GEMINI_MODEL))]
pub async fn run(client: GeminiClient, request: GenerateContentRequest, mut sink: RelaySink) {
    let outcome = match client.stream_generate(GEMINI_MODEL, &request).await {
        Ok(frames) => relay_chunks(frames, &mut sink).await,
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        tracing::error!("[gemini] Streaming relay failed: {}", e.inner);
        sink.write_failure().await;
    }
    sink.finish();
}
