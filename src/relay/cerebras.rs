use super::{RelayReport, RelaySink};
use crate::citations::{citations_from_grounding, CitationRecord};
use crate::specs::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatMessage};
use crate::sse::FrameStream;
use crate::types::{missing_field, Result};
use crate::vendors::{OpenAiCompatClient, CEREBRAS_MODEL};
use futures_util::StreamExt;
use serde::Deserialize;

pub const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CerebrasRelayRequest {
    #[serde(default)]
    pub text: Option<String>,
    /// Transcript lines shaped `ROLE: content`.
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl CerebrasRelayRequest {
    pub fn completion_request(&self) -> Result<ChatCompletionRequest> {
        let text = match self.text.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => return Err(missing_field("text")),
        };
        let system = match &self.system_prompt {
            Some(s) => s.clone(),
            None => String::new(),
        };

        let mut messages = vec![ChatMessage::system(system)];
        messages.extend(self.history.iter().map(|line| history_message(line)));
        messages.push(ChatMessage::user(text));

        Ok(ChatCompletionRequest {
            model: CEREBRAS_MODEL.to_string(),
            messages,
            stream: Some(true),
            max_completion_tokens: Some(16382),
            temperature: Some(0.7),
            top_p: Some(0.95),
            ..Default::default()
        })
    }
}

/// `사용자: ...` lines are the student; everything else was the assistant.
fn history_message(line: &str) -> ChatMessage {
    let (role, content) = match line.split_once(": ") {
        Some((r, c)) => (r, c),
        None => (line, ""),
    };
    if role.to_lowercase() == "사용자" {
        ChatMessage::user(content)
    } else {
        ChatMessage::assistant(content)
    }
}

/// Holds back reasoning output until the closing `</think>` marker has been
/// seen, then lets everything after it through.
#[derive(Debug, Default)]
pub struct ThinkGate {
    pending: String,
    open: bool,
    visible: String,
}

impl ThinkGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment; returns the part that may be shown, if any.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if self.open {
            self.visible.push_str(fragment);
            return Some(fragment.to_string());
        }

        self.pending.push_str(fragment);
        let at = self.pending.find(THINK_CLOSE)?;
        let rest = self.pending[at + THINK_CLOSE.len()..].to_string();
        self.pending.clear();
        self.open = true;
        self.visible.push_str(&rest);
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn visible(&self) -> &str {
        &self.visible
    }
}

pub async fn relay_visible(
    mut frames: FrameStream<ChatCompletionChunk>,
    sink: &mut RelaySink,
) -> Result<RelayReport> {
    let mut gate = ThinkGate::new();
    let mut report = RelayReport::default();

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let content = frame.chunk.delta_content();
        sink.metric.record_chunk(content);
        let Some(content) = content else { continue };
        if let Some(shown) = gate.push(content) {
            if !sink.write_text(&shown).await {
                report.client_gone = true;
                report.text = gate.visible().to_string();
                return Ok(report);
            }
        }
    }

    if !gate.is_open() {
        tracing::warn!("[cerebras] Stream ended without {}; nothing was shown", THINK_CLOSE);
    }

    report.text = gate.visible().to_string();
    if let Some(record) = CitationRecord::from_text(&report.text) {
        report.citations = citations_from_grounding(&record.grounding_metadata);
        match serde_json::to_string(&record) {
            Ok(json) => {
                sink.metric.record_citations();
                if !sink.write_text(&format!("\n{}", json)).await {
                    report.client_gone = true;
                }
            }
            Err(e) => tracing::error!("[cerebras] Could not serialize citations: {}", e),
        }
    }
    Ok(report)
}

#[tracing::instrument(skip_all, fields(model = %request.model))]
pub async fn run(client: OpenAiCompatClient, request: ChatCompletionRequest, mut sink: RelaySink) {
    let outcome = match client.chat_stream(&request).await {
        Ok(frames) => relay_visible(frames, &mut sink).await,
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        tracing::error!("[cerebras] Streaming relay failed: {}", e.inner);
        sink.write_failure().await;
    }
    sink.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::test_support::{drain, frames};
    use crate::relay::WireFormat;

    fn feed(gate: &mut ThinkGate, parts: &[&str]) -> String {
        parts.iter().filter_map(|p| gate.push(p)).collect()
    }

    #[test]
    fn test_marker_split_at_every_position() {
        let full = "<r>hidden</r></think>visible";
        for cut_a in 0..=full.len() {
            for cut_b in cut_a..=full.len() {
                if !full.is_char_boundary(cut_a) || !full.is_char_boundary(cut_b) {
                    continue;
                }
                let mut gate = ThinkGate::new();
                let out = feed(&mut gate, &[&full[..cut_a], &full[cut_a..cut_b], &full[cut_b..]]);
                assert_eq!(out, "visible", "cuts at {} / {}", cut_a, cut_b);
                assert_eq!(gate.visible(), "visible");
            }
        }
    }

    #[test]
    fn test_no_marker_shows_nothing() {
        let mut gate = ThinkGate::new();
        assert_eq!(feed(&mut gate, &["thinking", " forever"]), "");
        assert!(!gate.is_open());
    }

    #[test]
    fn test_history_lines_split_on_first_separator() {
        let msg = history_message("사용자: 질문: 왜?");
        assert_eq!(msg, ChatMessage::user("질문: 왜?"));
        let msg = history_message("AI: 답변");
        assert_eq!(msg, ChatMessage::assistant("답변"));
    }

    #[tokio::test]
    async fn test_trailing_citation_line_after_visible_text() {
        let chunk = |c: &str| {
            let raw = serde_json::json!({ "choices": [{ "delta": { "content": c } }] }).to_string();
            let parsed: ChatCompletionChunk = match serde_json::from_str(&raw) {
                Ok(p) => p,
                Err(e) => panic!("{}", e),
            };
            (raw, parsed)
        };
        let (mut sink, rx) = RelaySink::new("cerebras", WireFormat::PlainText);
        let input = frames(vec![
            chunk("<think>plan</th"),
            chunk("ink>See https://a.org"),
            chunk(" now."),
        ]);
        let report = match relay_visible(input, &mut sink).await {
            Ok(r) => r,
            Err(e) => panic!("{}", e),
        };
        drop(sink);
        let out = drain(rx).await;
        let (text, trailer) = match out.split_once('\n') {
            Some(parts) => parts,
            None => panic!("missing trailer in {:?}", out),
        };
        assert_eq!(text, "See https://a.org now.");
        let v: serde_json::Value = match serde_json::from_str(trailer) {
            Ok(v) => v,
            Err(e) => panic!("{}", e),
        };
        assert_eq!(v["groundingMetadata"]["groundingChunks"][0]["web"]["title"], "Source 1");
        assert_eq!(report.citations.len(), 1);
    }
}
