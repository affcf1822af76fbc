use super::{RelayReport, RelaySink};
use crate::specs::openai::{
    assertion_with_evidence_format, ChatCompletionChunk, ChatCompletionRequest, ChatMessage,
};
use crate::sse::FrameStream;
use crate::types::{missing_field, LearnFlowError, Result};
use crate::vendors::{OpenAiCompatClient, OPENAI_DEFAULT_MODEL};
use futures_util::StreamExt;
use serde::Deserialize;

pub const EXPANSION_SYSTEM_PROMPT: &str = "학생이 간략하게 정리한 주장 및 근거들을 AI와의 채팅 기록을 참고하여 정교하고 상세한 내러티브로 확장하십시오.\n\n# Steps\n\n1. **주제 이해**: 학생이 제시한 주장을 파악하고, 관련된 맥락을 이해합니다.\n2. **채팅 기록 분석**: 주어진 AI와의 채팅 기록을 검토하여 학생의 주장과 근거를 강화하거나 보완할 수 있는 요소를 찾습니다.\n3. **근거 구성**: 적절하고 근거가 있는 최대 3개의 세부 근거를 개발합니다. 이때, 다양한 관점이나 자료를 활용하여 근거의 깊이를 더합니다.\n4. **논리적 흐름 구성**: 주장을 중심으로 관련된 근거들이 자연스럽고 설득력 있게 연결되도록 합니다.\n5. **재검토**: 최종 정리를 검토하여 일관성과 정확성을 유지합니다.\n\n# Output Format\n\n- **주장**: 간결하고 명료하게 주제를 요약한 주장 문장.\n- **근거**: 최대 3개의 근거를 자세히 설명하며, 각각의 근거는 새로운 문단으로 나눕니다.\n\n# Notes\n\n- 논리적 일관성을 위해 주제와 근거의 연관성을 항상 명확히 하십시오.\n- 필요한 경우, 추가적인 출처나 예시를 통해 근거를 강력하게 뒷받침하십시오.";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OpenAiRelayRequest {
    #[serde(default)]
    pub text: Option<String>,
    /// Chat transcript already flattened to text by the caller.
    #[serde(default)]
    pub history: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
}

impl OpenAiRelayRequest {
    pub fn text(&self) -> Result<&str> {
        match self.text.as_deref() {
            Some(t) if !t.is_empty() => Ok(t),
            _ => Err(missing_field("text")),
        }
    }

    fn model(&self) -> String {
        match self.model.as_deref() {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => OPENAI_DEFAULT_MODEL.to_string(),
        }
    }

    fn messages(&self) -> Result<Vec<ChatMessage>> {
        let system = match self.history.as_deref() {
            Some(h) if !h.is_empty() => format!("{}\n\n채팅 기록:\n{}", EXPANSION_SYSTEM_PROMPT, h),
            _ => EXPANSION_SYSTEM_PROMPT.to_string(),
        };
        Ok(vec![ChatMessage::system(system), ChatMessage::user(self.text()?)])
    }

    pub fn streaming_request(&self) -> Result<ChatCompletionRequest> {
        Ok(ChatCompletionRequest {
            model: self.model(),
            messages: self.messages()?,
            stream: Some(true),
            temperature: Some(0.7),
            ..Default::default()
        })
    }

    pub fn structured_request(&self) -> Result<ChatCompletionRequest> {
        Ok(ChatCompletionRequest {
            model: self.model(),
            messages: self.messages()?,
            response_format: Some(assertion_with_evidence_format()),
            temperature: Some(0.5),
            max_completion_tokens: Some(2048),
            top_p: Some(1.0),
            frequency_penalty: Some(0.0),
            presence_penalty: Some(0.0),
            ..Default::default()
        })
    }
}

/// Forwards each non-empty delta as soon as it arrives.
pub async fn relay_deltas(
    mut frames: FrameStream<ChatCompletionChunk>,
    sink: &mut RelaySink,
) -> Result<RelayReport> {
    let mut report = RelayReport::default();
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let content = frame.chunk.delta_content();
        sink.metric.record_chunk(content);
        if let Some(content) = content {
            report.text.push_str(content);
            if !sink.write_text(content).await {
                report.client_gone = true;
                break;
            }
        }
    }
    Ok(report)
}

#[tracing::instrument(skip_all, fields(model = %request.model))]
pub async fn run(client: OpenAiCompatClient, request: ChatCompletionRequest, mut sink: RelaySink) {
    let outcome = match client.chat_stream(&request).await {
        Ok(frames) => relay_deltas(frames, &mut sink).await,
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        tracing::error!("[openai] Streaming relay failed: {}", e.inner);
        sink.write_failure().await;
    }
    sink.finish();
}

/// Non-streaming call with the structured `{assertion, evidences}` format.
/// Returns the assistant content exactly as the vendor produced it.
#[tracing::instrument(skip_all, fields(model = %request.model))]
pub async fn structured(client: &OpenAiCompatClient, request: &ChatCompletionRequest) -> Result<String> {
    let response = client.chat(request).await?;
    match response.first_content() {
        Some(c) => Ok(c.to_string()),
        None => Err(LearnFlowError::Protocol("completion had no message content".to_string()).into()),
    }
}
