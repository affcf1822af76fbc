use crate::config::Args;
use crate::hardening::RetryPolicy;
use crate::specs::gemini::{GenerateContentRequest, GenerateContentResponse};
use crate::specs::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest,
    EmbeddingResponse,
};
use crate::sse::{self, FrameStream};
use crate::types::{LearnFlowError, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4.1";
pub const CEREBRAS_MODEL: &str = "qwen-3-32b";
pub const GEMINI_MODEL: &str = "gemini-2.5-flash-preview-05-20";
pub const PERPLEXITY_MODEL: &str = "perplexity/sonar";
pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";

const RETRY_BASE_DELAY_MS: u64 = 200;

/// Client for any vendor speaking the OpenAI chat-completions dialect.
#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    vendor: &'static str,
    max_retries: u32,
}

impl OpenAiCompatClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        api_key: &str,
        vendor: &'static str,
        max_retries: u32,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            vendor,
            max_retries,
        }
    }

    pub fn vendor(&self) -> &'static str {
        self.vendor
    }

    async fn post_json<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let endpoint = format!("{}{}", self.base_url, path);
        let url = endpoint.as_str();
        let policy = RetryPolicy::new(self.max_retries, RETRY_BASE_DELAY_MS);
        policy
            .execute_with_retry(|| async move {
                tracing::debug!("[{}] POST {}", self.vendor, url);
                let response = self
                    .http
                    .post(url)
                    .bearer_auth(&self.api_key)
                    .json(body)
                    .send()
                    .await?;
                ensure_success(response).await
            })
            .await
    }

    /// Opens a streamed completion. Retries cover only the request itself.
    pub async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<FrameStream<ChatCompletionChunk>> {
        let response = self.post_json("/chat/completions", request).await?;
        Ok(sse::frames(response))
    }

    pub async fn chat(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let response = self.post_json("/chat/completions", request).await?;
        Ok(response.json::<ChatCompletionResponse>().await?)
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: EMBEDDING_MODEL.to_string(),
            input: text.to_string(),
            encoding_format: "float".to_string(),
        };
        let response = self.post_json("/embeddings", &request).await?;
        let body = response.json::<EmbeddingResponse>().await?;
        match body.data.into_iter().next() {
            Some(d) => Ok(d.embedding),
            None => Err(LearnFlowError::Protocol("embedding response had no data".to_string()).into()),
        }
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: &str, max_retries: u32) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            max_retries,
        }
    }

    pub async fn stream_generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<FrameStream<GenerateContentResponse>> {
        let endpoint = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let url = endpoint.as_str();
        let policy = RetryPolicy::new(self.max_retries, RETRY_BASE_DELAY_MS);
        let response = policy
            .execute_with_retry(|| async move {
                tracing::debug!("[gemini] POST {}", url);
                let response = self
                    .http
                    .post(url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(request)
                    .send()
                    .await?;
                ensure_success(response).await
            })
            .await?;
        Ok(sse::frames(response))
    }
}

pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_body = match response.text().await {
        Ok(text) => text,
        Err(_) => "Unknown error".to_string(),
    };
    Err(LearnFlowError::Upstream(status, error_body).into())
}

/// Vendor clients, each built on first use from the startup configuration.
/// A vendor whose key is absent fails only its own routes.
pub struct VendorRegistry {
    http: reqwest::Client,
    args: Arc<Args>,
    openai: OnceLock<OpenAiCompatClient>,
    cerebras: OnceLock<OpenAiCompatClient>,
    perplexity: OnceLock<OpenAiCompatClient>,
    gemini: OnceLock<GeminiClient>,
}

impl VendorRegistry {
    pub fn new(http: reqwest::Client, args: Arc<Args>) -> Self {
        Self {
            http,
            args,
            openai: OnceLock::new(),
            cerebras: OnceLock::new(),
            perplexity: OnceLock::new(),
            gemini: OnceLock::new(),
        }
    }

    fn compat<'a>(
        &self,
        cell: &'a OnceLock<OpenAiCompatClient>,
        key: &Option<String>,
        key_name: &'static str,
        base_url: &str,
        vendor: &'static str,
    ) -> Result<&'a OpenAiCompatClient> {
        let key = require_key(key, key_name)?;
        Ok(cell.get_or_init(|| {
            tracing::info!("[{}] Client initialised for {}", vendor, base_url);
            OpenAiCompatClient::new(self.http.clone(), base_url, key, vendor, self.args.max_retries)
        }))
    }

    pub fn openai(&self) -> Result<&OpenAiCompatClient> {
        self.compat(
            &self.openai,
            &self.args.openai_api_key,
            "OPENAI_API_KEY",
            &self.args.openai_base_url,
            "openai",
        )
    }

    pub fn cerebras(&self) -> Result<&OpenAiCompatClient> {
        self.compat(
            &self.cerebras,
            &self.args.cerebras_api_key,
            "CEREBRAS_API_KEY",
            &self.args.cerebras_base_url,
            "cerebras",
        )
    }

    pub fn perplexity(&self) -> Result<&OpenAiCompatClient> {
        self.compat(
            &self.perplexity,
            &self.args.pplx_api_key,
            "PPLX_API_KEY",
            &self.args.pplx_base_url,
            "perplexity",
        )
    }

    pub fn gemini(&self) -> Result<&GeminiClient> {
        let key = require_key(&self.args.gemini_api_key, "GEMINI_API_KEY")?;
        Ok(self.gemini.get_or_init(|| {
            tracing::info!("[gemini] Client initialised for {}", self.args.gemini_base_url);
            GeminiClient::new(
                self.http.clone(),
                &self.args.gemini_base_url,
                key,
                self.args.max_retries,
            )
        }))
    }

    /// Embeddings are served by the OpenAI account.
    pub fn embedder(&self) -> Result<&OpenAiCompatClient> {
        self.openai()
    }

    /// Which vendors have a key, without building any client.
    pub fn availability(&self) -> BTreeMap<&'static str, bool> {
        [
            ("openai", &self.args.openai_api_key),
            ("gemini", &self.args.gemini_api_key),
            ("perplexity", &self.args.pplx_api_key),
            ("cerebras", &self.args.cerebras_api_key),
        ]
        .into_iter()
        .map(|(name, key)| (name, require_key(key, name).is_ok()))
        .collect()
    }
}

fn require_key<'a>(key: &'a Option<String>, name: &'static str) -> Result<&'a str> {
    match key.as_deref() {
        Some(k) if !k.is_empty() => Ok(k),
        _ => Err(LearnFlowError::MissingConfig(name).into()),
    }
}
