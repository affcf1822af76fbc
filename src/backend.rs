//! Client for the assignment backend. The HTTP routes forward the browser's
//! credentials and hand the backend's answer back unchanged; `fetch_tree`
//! additionally unwraps and converts the tree for in-process callers.

use crate::tree::{ApiNode, TreeData};
use crate::types::{LearnFlowError, Result};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

pub const MAIN_NODE_NOT_FOUND: &str = "메인 노드를 찾을 수 없습니다.";
const AUTH_COOKIE: &str = "authToken";

/// The caller's cookies and bearer token, forwarded as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub cookie: Option<String>,
    pub authorization: Option<String>,
}

impl Credentials {
    /// An explicit `Authorization` header wins; otherwise the `authToken`
    /// cookie becomes a bearer token.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let cookie = headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let authorization = match headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            Some(v) if !v.is_empty() => Some(v.to_string()),
            _ => cookie
                .as_deref()
                .and_then(|c| cookie_value(c, AUTH_COOKIE))
                .map(|token| format!("Bearer {}", token)),
        };

        Self {
            cookie,
            authorization,
        }
    }

    fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(cookie) = &self.cookie {
            request = request.header(header::COOKIE, cookie);
        }
        if let Some(auth) = &self.authorization {
            request = request.header(header::AUTHORIZATION, auth);
        }
        request
    }
}

fn cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

/// A backend answer relayed with its original status.
#[derive(Debug, Clone, PartialEq)]
pub struct Forwarded {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl IntoResponse for Forwarded {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = match reqwest::Url::parse(&self.base_url) {
            Ok(u) => u,
            Err(e) => {
                return Err(LearnFlowError::Protocol(format!(
                    "invalid backend url {}: {}",
                    self.base_url, e
                ))
                .into())
            }
        };
        match url.path_segments_mut() {
            Ok(mut path) => {
                path.pop_if_empty().extend(segments);
            }
            Err(()) => {
                return Err(LearnFlowError::Protocol(format!(
                    "backend url {} cannot carry a path",
                    self.base_url
                ))
                .into())
            }
        }
        Ok(url)
    }

    async fn forward(
        &self,
        method: reqwest::Method,
        segments: &[&str],
        credentials: &Credentials,
        body: Option<&serde_json::Value>,
    ) -> Result<Forwarded> {
        let url = self.endpoint(segments)?;
        tracing::debug!("[backend] {} {}", method, url);

        let mut request = credentials.apply(self.http.request(method, url));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("[backend] Credentials rejected");
            return Err(LearnFlowError::Unauthorized.into());
        }
        let body = response.json::<serde_json::Value>().await?;
        Ok(Forwarded { status, body })
    }

    pub async fn assignment(&self, assignment_id: &str, credentials: &Credentials) -> Result<Forwarded> {
        self.forward(
            reqwest::Method::GET,
            &["student", "assignments", assignment_id],
            credentials,
            None,
        )
        .await
    }

    pub async fn tree(&self, assignment_id: &str, credentials: &Credentials) -> Result<Forwarded> {
        self.forward(
            reqwest::Method::GET,
            &["student", "assignments", assignment_id, "nodes", "tree"],
            credentials,
            None,
        )
        .await
    }

    /// Registers a locally edited node with the backend.
    pub async fn update_node(
        &self,
        assignment_id: &str,
        node_id: &str,
        node: &serde_json::Value,
        credentials: &Credentials,
    ) -> Result<Forwarded> {
        self.forward(
            reqwest::Method::PUT,
            &["student", "assignments", assignment_id, "nodes", node_id],
            credentials,
            Some(node),
        )
        .await
    }

    /// Fetches and converts an assignment's argument tree.
    pub async fn fetch_tree(&self, assignment_id: &str, credentials: &Credentials) -> Result<TreeData> {
        let forwarded = self.tree(assignment_id, credentials).await?;
        parse_tree_response(forwarded)
    }
}

fn parse_tree_response(forwarded: Forwarded) -> Result<TreeData> {
    let envelope: Envelope = serde_json::from_value(forwarded.body)?;

    if !forwarded.status.is_success() {
        if forwarded.status == StatusCode::BAD_REQUEST
            && envelope.status == "error"
            && envelope.data.as_str() == Some(MAIN_NODE_NOT_FOUND)
        {
            return Err(LearnFlowError::MainNodeNotFound.into());
        }
        return Err(LearnFlowError::Upstream(forwarded.status, envelope.data.to_string()).into());
    }

    if envelope.status != "success" || envelope.data.is_null() {
        return Err(LearnFlowError::Protocol("Invalid API response format".to_string()).into());
    }
    let root: ApiNode = serde_json::from_value(envelope.data)?;
    TreeData::from_api(&root)
}
