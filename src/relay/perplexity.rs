use super::{RelayReport, RelaySink};
use crate::archive::ChatArchive;
use crate::citations::{zip_citations, CitationRecord};
use crate::specs::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatMessage, SearchResult};
use crate::sse::FrameStream;
use crate::types::{
    missing_field, ApiContentItem, ApiRole, ChatMode, NodeScope, Result, Sender, GLOBAL_NODE_ID,
};
use crate::vendors::{OpenAiCompatClient, PERPLEXITY_MODEL};
use futures_util::StreamExt;
use serde::Deserialize;

pub const PERPLEXITY_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PerplexityRelayRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub history: Vec<ApiContentItem>,
    #[serde(default)]
    pub assignment_id: Option<String>,
    #[serde(default)]
    pub parent_node_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
}

impl PerplexityRelayRequest {
    pub fn completion_request(&self) -> Result<ChatCompletionRequest> {
        let message = match self.message.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => return Err(missing_field("message")),
        };

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(PERPLEXITY_SYSTEM_PROMPT));
        for item in &self.history {
            messages.push(match item.role {
                ApiRole::User => ChatMessage::user(item.text()),
                ApiRole::Model => ChatMessage::assistant(item.text()),
            });
        }
        messages.push(ChatMessage::user(message));

        Ok(ChatCompletionRequest {
            model: PERPLEXITY_MODEL.to_string(),
            messages,
            stream: Some(true),
            ..Default::default()
        })
    }

    /// The node the answer belongs to, when the caller named one.
    pub fn scope(&self) -> Option<NodeScope> {
        let assignment_id = self.assignment_id.clone().filter(|s| !s.is_empty())?;
        let node_id = self.node_id.clone().filter(|s| !s.is_empty())?;
        let parent_node_id = match self.parent_node_id.clone().filter(|s| !s.is_empty()) {
            Some(p) => p,
            None => GLOBAL_NODE_ID.to_string(),
        };
        Some(NodeScope {
            assignment_id,
            parent_node_id,
            node_id,
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
        })
    }
}

/// Forwards raw chunks and, for every chunk carrying sources, a normalized
/// citations line right after it.
pub async fn relay_with_citations(
    mut frames: FrameStream<ChatCompletionChunk>,
    sink: &mut RelaySink,
) -> Result<RelayReport> {
    let mut report = RelayReport::default();

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let chunk = &frame.chunk;
        let content = chunk.delta_content();
        sink.metric.record_chunk(content);
        if let Some(c) = content {
            report.text.push_str(c);
        }

        if !sink.write_line(&frame.raw).await {
            report.client_gone = true;
            return Ok(report);
        }

        if chunk.has_citation_extension() {
            let urls: &[String] = match &chunk.citations {
                Some(u) => u,
                None => &[],
            };
            let results: &[SearchResult] = match &chunk.search_results {
                Some(r) => r.as_slice(),
                None => &[],
            };
            let record = CitationRecord::from_urls(urls, results);
            if !urls.is_empty() {
                report.citations = zip_citations(urls, results);
            }
            sink.metric.record_citations();
            if !sink.write_json_line(&record).await {
                report.client_gone = true;
                return Ok(report);
            }
        }
    }
    Ok(report)
}

#[tracing::instrument(skip_all, fields(model = %request.model))]
pub async fn run(
    client: OpenAiCompatClient,
    request: ChatCompletionRequest,
    mut sink: RelaySink,
    persist: Option<(ChatArchive, NodeScope)>,
) {
    let outcome = match client.chat_stream(&request).await {
        Ok(frames) => relay_with_citations(frames, &mut sink).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(report) => {
            if let Some((archive, scope)) = persist {
                persist_answer(&archive, &scope, &report);
            }
        }
        Err(e) => {
            tracing::error!("[perplexity] Streaming relay failed: {}", e.inner);
            sink.write_failure().await;
        }
    }
    sink.finish();
}

fn persist_answer(archive: &ChatArchive, scope: &NodeScope, report: &RelayReport) {
    if report.client_gone || report.text.is_empty() {
        tracing::debug!("[perplexity] Nothing complete to persist");
        return;
    }
    let mut item = crate::types::ChatItem::new(Sender::Ai, report.text.clone(), ChatMode::Ask);
    item.citations = Some(report.citations.clone());
    archive.save_detached(crate::types::ChatMessage::from_item(&item, scope));
}
