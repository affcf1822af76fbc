use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

/// Generic failure text shown to students when a vendor call cannot be made.
pub const VENDOR_FAILURE_MESSAGE: &str =
    "죄송합니다. 요청을 처리하는 동안 오류가 발생했습니다. 잠시 후 다시 시도해 주세요.";

pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized. Please log in again.";

pub const GENERIC_FAILURE: &str = "Failed to process request";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Sender {
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "AI")]
    Ai,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "USER"),
            Self::Ai => write!(f, "AI"),
        }
    }
}

impl std::str::FromStr for Sender {
    type Err = LearnFlowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "AI" => Ok(Self::Ai),
            other => Err(LearnFlowError::Protocol(format!("unknown sender: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Ask,
    Create,
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ask => write!(f, "ask"),
            Self::Create => write!(f, "create"),
        }
    }
}

impl std::str::FromStr for ChatMode {
    type Err = LearnFlowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ask" => Ok(Self::Ask),
            "create" => Ok(Self::Create),
            other => Err(LearnFlowError::Protocol(format!("unknown chat mode: {}", other))),
        }
    }
}

/// A numbered source attached to an AI answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    /// Display label such as `[1]`.
    pub text: String,
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl Citation {
    /// Builds the citation at zero-based position `index`.
    pub fn numbered(index: usize, url: impl Into<String>, title: Option<&str>) -> Self {
        let title = match title {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => format!("Source {}", index + 1),
        };
        Self {
            text: format!("[{}]", index + 1),
            url: url.into(),
            title,
            index: Some(index),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    pub parent_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// One exchange turn as shown in a chat panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatItem {
    pub sender: Sender,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "created_at")]
    pub created_at: i64,
    pub mode: ChatMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_form: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeInfo>,
}

impl ChatItem {
    pub fn new(sender: Sender, message: impl Into<String>, mode: ChatMode) -> Self {
        Self {
            sender,
            message: message.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            mode,
            suggestions: None,
            citations: None,
            has_form: None,
            node_info: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApiRole {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextPart {
    #[serde(default)]
    pub text: String,
}

/// Role/text pair replayed to a vendor as conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiContentItem {
    pub role: ApiRole,
    #[serde(default)]
    pub parts: Vec<TextPart>,
}

impl ApiContentItem {
    pub fn new(role: ApiRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![TextPart { text: text.into() }],
        }
    }

    pub fn text(&self) -> &str {
        match self.parts.first() {
            Some(p) => &p.text,
            None => "",
        }
    }
}

/// A chat message as stored in the chat archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "id_as_string"
    )]
    pub id: Option<String>,
    pub assignment_id: String,
    pub parent_node_id: String,
    pub node_id: String,
    pub sender: Sender,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub mode: ChatMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub suggestions: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing)]
    pub skip_embedding: bool,
}

fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Row ids arrive as text from SQLite and as text or integers from PostgREST.
fn id_as_string<'de, D>(d: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(d)? {
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_json::Value::Null) | None => Ok(None),
        Some(other) => Err(serde::de::Error::custom(format!(
            "unexpected id value: {}",
            other
        ))),
    }
}

impl ChatMessage {
    pub fn from_item(item: &ChatItem, scope: &NodeScope) -> Self {
        Self {
            id: None,
            assignment_id: scope.assignment_id.clone(),
            parent_node_id: scope.parent_node_id.clone(),
            node_id: scope.node_id.clone(),
            sender: item.sender,
            message: item.message.clone(),
            created_at: None,
            mode: item.mode,
            user_id: scope.user_id.clone(),
            user_name: scope.user_name.clone(),
            suggestions: item.suggestions.clone().unwrap_or_default(),
            citations: item.citations.clone().unwrap_or_default(),
            skip_embedding: scope.is_global(),
        }
    }

    /// Converts a retrieved message back into a display item tagged with its node.
    pub fn into_item(self) -> ChatItem {
        let created_at = match self.created_at {
            Some(ts) => ts.timestamp_millis(),
            None => chrono::Utc::now().timestamp_millis(),
        };
        ChatItem {
            sender: self.sender,
            node_info: Some(NodeInfo {
                node_name: Some(format!("노드 {}", self.node_id)),
                node_id: self.node_id,
                parent_node_id: self.parent_node_id,
            }),
            message: self.message,
            created_at,
            mode: self.mode,
            suggestions: Some(self.suggestions),
            citations: Some(self.citations),
            has_form: Some(false),
        }
    }
}

/// The tree node a chat panel belongs to. Node `0` is the global panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeScope {
    pub assignment_id: String,
    pub parent_node_id: String,
    pub node_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
}

pub const GLOBAL_NODE_ID: &str = "0";

impl NodeScope {
    pub fn is_global(&self) -> bool {
        self.node_id == GLOBAL_NODE_ID
    }
}

#[derive(Error, Debug)]
pub enum LearnFlowError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Missing configuration: {0}")]
    MissingConfig(&'static str),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Backend rejected credentials")]
    Unauthorized,

    #[error("Main node not found")]
    MainNodeNotFound,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: LearnFlowError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<LearnFlowError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, body) = match &self.inner {
            LearnFlowError::InvalidRequest(m) => {
                (StatusCode::BAD_REQUEST, serde_json::json!({ "error": m }))
            }
            LearnFlowError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({ "success": false, "message": UNAUTHORIZED_MESSAGE }),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": GENERIC_FAILURE }),
            ),
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}\n{}", self.inner, self.span_trace);
        }

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

pub fn missing_field(name: &str) -> ObservedError {
    LearnFlowError::InvalidRequest(format!("Missing required '{}' parameter", name)).into()
}
