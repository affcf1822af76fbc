//! One chat panel's conversation: the visible log, the history replayed to
//! the model, and the single in-flight request.

use crate::archive::ChatArchive;
use crate::consumer::{StreamConsumer, StreamFormat};
use crate::types::{
    ApiContentItem, ApiRole, ChatItem, ChatMessage, ChatMode, LearnFlowError, NodeScope, Result,
    Sender,
};
use crate::vendors::ensure_success;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{Stream, StreamExt};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub const RELEVANT_INFO_MESSAGE: &str = "다른 노드에서 관련된 대화를 찾았습니다:";
pub const GLOBAL_CHAT_MODEL: &str = "gpt-4.1-mini";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRoute {
    OpenAi,
    Gemini,
    Perplexity,
    Cerebras,
}

impl RelayRoute {
    pub fn path(&self) -> &'static str {
        match self {
            Self::OpenAi => "/api/openai",
            Self::Gemini => "/api/gemini",
            Self::Perplexity => "/api/perplexity",
            Self::Cerebras => "/api/cerebras",
        }
    }

    pub fn format(&self) -> StreamFormat {
        match self {
            Self::OpenAi | Self::Cerebras => StreamFormat::PlainText,
            Self::Gemini | Self::Perplexity => StreamFormat::NdJson,
        }
    }
}

/// Opens a relay route and hands back its body as raw byte pieces.
pub trait RelayTransport: Send + Sync {
    fn open<'a>(
        &'a self,
        route: RelayRoute,
        body: serde_json::Value,
    ) -> BoxFuture<'a, Result<ByteStream>>;
}

/// Talks to a running relay server over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl RelayTransport for HttpTransport {
    fn open<'a>(
        &'a self,
        route: RelayRoute,
        body: serde_json::Value,
    ) -> BoxFuture<'a, Result<ByteStream>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, route.path());
            tracing::debug!("[session] POST {}", url);
            let response = self.http.post(&url).json(&body).send().await?;
            let response = ensure_success(response).await?;
            let stream = response
                .bytes_stream()
                .map(|r| r.map_err(crate::types::ObservedError::from));
            Ok(Box::pin(stream) as ByteStream)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseStatus {
    #[default]
    Idle,
    Streaming,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(ChatItem),
    /// Create mode records the user's text without asking the model.
    Recorded,
    Aborted,
}

pub struct ChatSession<T: RelayTransport> {
    scope: NodeScope,
    route: RelayRoute,
    transport: T,
    archive: Option<ChatArchive>,
    log: Vec<ChatItem>,
    history: Vec<ApiContentItem>,
    status: ResponseStatus,
}

impl<T: RelayTransport> ChatSession<T> {
    /// The global panel talks to OpenAI; node panels use Perplexity.
    pub fn new(scope: NodeScope, transport: T) -> Self {
        let route = if scope.is_global() {
            RelayRoute::OpenAi
        } else {
            RelayRoute::Perplexity
        };
        Self {
            scope,
            route,
            transport,
            archive: None,
            log: Vec::new(),
            history: Vec::new(),
            status: ResponseStatus::Idle,
        }
    }

    pub fn with_archive(mut self, archive: ChatArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_route(mut self, route: RelayRoute) -> Self {
        self.route = route;
        self
    }

    pub fn scope(&self) -> &NodeScope {
        &self.scope
    }

    pub fn log(&self) -> &[ChatItem] {
        &self.log
    }

    pub fn history(&self) -> &[ApiContentItem] {
        &self.history
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// Replaces the log and replay history with what the archive holds for
    /// this node. Returns the number of messages restored.
    pub async fn restore(&mut self) -> Result<usize> {
        let Some(archive) = &self.archive else {
            return Ok(0);
        };
        let stored = archive.load(&self.scope).await?;
        if stored.is_empty() {
            return Ok(0);
        }
        self.history = stored
            .iter()
            .map(|m| ApiContentItem::new(role_of(m.sender), m.message.clone()))
            .collect();
        self.log = stored
            .into_iter()
            .map(|m| {
                let mut item = m.into_item();
                item.node_info = None;
                item
            })
            .collect();
        tracing::info!("[session] Restored {} messages for node {}", self.log.len(), self.scope.node_id);
        Ok(self.log.len())
    }

    #[tracing::instrument(skip_all, fields(node = %self.scope.node_id, route = ?self.route))]
    pub async fn ask(
        &mut self,
        text: &str,
        mode: ChatMode,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LearnFlowError::InvalidRequest("message is empty".to_string()).into());
        }

        let user_item = ChatItem::new(Sender::User, text, mode);
        self.log.push(user_item.clone());

        if mode == ChatMode::Create {
            self.persist(&user_item).await;
            return Ok(TurnOutcome::Recorded);
        }

        self.status = ResponseStatus::Streaming;
        let prior = self.history.clone();
        self.history.push(ApiContentItem::new(ApiRole::User, text));

        let body = if self.scope.is_global() {
            let context = self.relevant_context(text, mode).await;
            global_request(text, &prior, &context)
        } else {
            serde_json::json!({ "message": text, "history": prior })
        };

        let outcome = match self.stream_turn(body, mode, cancel).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                tracing::info!("[session] Turn aborted by the user");
                self.status = ResponseStatus::Idle;
                return Ok(TurnOutcome::Aborted);
            }
            Err(e) => {
                tracing::warn!("[session] Turn failed: {}", e.inner);
                self.status = ResponseStatus::Error;
                self.persist(&user_item).await;
                return Err(e);
            }
        };

        self.history
            .push(ApiContentItem::new(ApiRole::Model, outcome.message.clone()));
        self.log.push(outcome.clone());
        self.status = ResponseStatus::Success;

        self.persist(&user_item).await;
        self.persist(&outcome).await;
        Ok(TurnOutcome::Completed(outcome))
    }

    /// Reads one relay response to the end. `None` means the token fired.
    async fn stream_turn(
        &self,
        body: serde_json::Value,
        mode: ChatMode,
        cancel: &CancellationToken,
    ) -> Result<Option<ChatItem>> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            opened = self.transport.open(self.route, body) => opened?,
        };

        let mut consumer = StreamConsumer::new(self.route.format());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = stream.next() => match next {
                    Some(Ok(piece)) => consumer.feed(&piece),
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
            }
        }

        let result = consumer.finish();
        let mut item = ChatItem::new(Sender::Ai, result.full_text, mode);
        item.citations = Some(result.citations);
        item.suggestions = Some(result.suggestions);
        Ok(Some(item))
    }

    /// Looks up the earlier message from another node closest to `text`,
    /// shows it in the log, and returns it as extra replay context.
    async fn relevant_context(&mut self, text: &str, mode: ChatMode) -> Vec<ApiContentItem> {
        let Some(archive) = &self.archive else {
            return Vec::new();
        };
        let found: Vec<ChatItem> = archive
            .find_relevant(&self.scope.assignment_id, text)
            .await
            .into_iter()
            .filter(|m| !m.node_id.is_empty() && m.node_id != self.scope.node_id)
            .filter(|m| !m.message.trim().is_empty())
            .map(ChatMessage::into_item)
            .collect();
        if found.is_empty() {
            return Vec::new();
        }

        tracing::debug!("[session] {} related messages from other nodes", found.len());
        self.log.push(ChatItem::new(Sender::Ai, RELEVANT_INFO_MESSAGE, mode));
        let context = found
            .iter()
            .map(|item| {
                let node = match &item.node_info {
                    Some(info) => info.node_id.as_str(),
                    None => "",
                };
                ApiContentItem::new(
                    role_of(item.sender),
                    format!("[노드 {}] {}: {}", node, speaker(item.sender), item.message),
                )
            })
            .collect();
        self.log.extend(found);
        context
    }

    async fn persist(&self, item: &ChatItem) {
        let Some(archive) = &self.archive else {
            return;
        };
        let message = ChatMessage::from_item(item, &self.scope);
        if let Err(e) = archive.save(message).await {
            tracing::error!("[session] Failed to save chat message: {}", e.inner);
        }
    }
}

fn role_of(sender: Sender) -> ApiRole {
    match sender {
        Sender::User => ApiRole::User,
        Sender::Ai => ApiRole::Model,
    }
}

fn speaker(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "사용자",
        Sender::Ai => "AI",
    }
}

/// The global panel sends its history to the OpenAI route as one transcript.
fn global_request(
    text: &str,
    prior: &[ApiContentItem],
    context: &[ApiContentItem],
) -> serde_json::Value {
    let transcript = prior
        .iter()
        .chain(context.iter())
        .map(|item| {
            let who = match item.role {
                ApiRole::User => "사용자",
                ApiRole::Model => "AI",
            };
            format!("{}: {}", who, item.text())
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    serde_json::json!({
        "text": text,
        "history": transcript,
        "stream": true,
        "model": GLOBAL_CHAT_MODEL,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Embedder;
    use crate::store::ChatStore;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedTransport {
        pieces: Vec<&'static str>,
        hang_after: bool,
        bodies: Mutex<Vec<(RelayRoute, serde_json::Value)>>,
    }

    impl RelayTransport for ScriptedTransport {
        fn open<'a>(
            &'a self,
            route: RelayRoute,
            body: serde_json::Value,
        ) -> BoxFuture<'a, Result<ByteStream>> {
            if let Ok(mut bodies) = self.bodies.lock() {
                bodies.push((route, body));
            }
            let pieces: Vec<Result<Bytes>> = self
                .pieces
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect();
            let hang = self.hang_after;
            Box::pin(async move {
                let head = futures_util::stream::iter(pieces);
                let stream: ByteStream = if hang {
                    Box::pin(head.chain(futures_util::stream::pending()))
                } else {
                    Box::pin(head)
                };
                Ok(stream)
            })
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        inserted: Mutex<Vec<ChatMessage>>,
        similar: Vec<ChatMessage>,
    }

    impl ChatStore for RecordingStore {
        fn insert<'a>(&'a self, message: &'a ChatMessage) -> BoxFuture<'a, Result<ChatMessage>> {
            Box::pin(async move {
                if let Ok(mut rows) = self.inserted.lock() {
                    rows.push(message.clone());
                }
                Ok(message.clone())
            })
        }
        fn load<'a>(&'a self, _scope: &'a NodeScope) -> BoxFuture<'a, Result<Vec<ChatMessage>>> {
            Box::pin(async move {
                match self.inserted.lock() {
                    Ok(rows) => Ok(rows.clone()),
                    Err(_) => Ok(Vec::new()),
                }
            })
        }
        fn delete<'a>(&'a self, _scope: &'a NodeScope) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn reassign_node<'a>(
            &'a self,
            _assignment_id: &'a str,
            _parent_node_id: &'a str,
            _from_node_id: &'a str,
            _to_node_id: &'a str,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn attach_embedding<'a>(&'a self, _id: &'a str, _embedding: &'a [f32]) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn search_similar<'a>(
            &'a self,
            _assignment_id: &'a str,
            _embedding: &'a [f32],
            _threshold: f32,
            _limit: usize,
        ) -> BoxFuture<'a, Result<Vec<ChatMessage>>> {
            Box::pin(async move { Ok(self.similar.clone()) })
        }
        fn ready(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct FixedEmbedder;

    impl Embedder for FixedEmbedder {
        fn embed<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Result<Vec<f32>>> {
            Box::pin(async { Ok(vec![1.0, 0.0]) })
        }
    }

    fn scope(node: &str) -> NodeScope {
        NodeScope {
            assignment_id: "7".into(),
            parent_node_id: "0".into(),
            node_id: node.into(),
            user_id: None,
            user_name: None,
        }
    }

    fn archive(store: Arc<RecordingStore>) -> ChatArchive {
        ChatArchive::new(store, Arc::new(FixedEmbedder))
    }

    fn inserted(store: &RecordingStore) -> Vec<ChatMessage> {
        match store.inserted.lock() {
            Ok(rows) => rows.clone(),
            Err(e) => panic!("lock poisoned: {}", e),
        }
    }

    #[tokio::test]
    async fn test_node_turn_collects_answer_and_sources() {
        let transport = ScriptedTransport {
            pieces: vec![
                "{\"choices\":[{\"delta\":{\"content\":\"고령화는 \"}}]}\n{\"choi",
                "ces\":[{\"delta\":{\"content\":\"심화된다\"}}],\"citations\":[\"https://a\"]}\n",
                "{\"type\":\"citations\",\"groundingMetadata\":{\"groundingChunks\":[{\"web\":{\"uri\":\"https://a\",\"title\":\"A\"}}]}}\n",
            ],
            ..Default::default()
        };
        let store = Arc::new(RecordingStore::default());
        let mut session = ChatSession::new(scope("e-1"), transport).with_archive(archive(store.clone()));

        let outcome = match session.ask("원인은?", ChatMode::Ask, &CancellationToken::new()).await {
            Ok(o) => o,
            Err(e) => panic!("ask failed: {}", e),
        };
        let item = match outcome {
            TurnOutcome::Completed(item) => item,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(item.message, "고령화는 심화된다");
        assert_eq!(item.citations.as_ref().map(|c| c.len()), Some(1));
        assert_eq!(session.status(), ResponseStatus::Success);
        assert_eq!(session.log().len(), 2);
        assert_eq!(session.history()[1].role, ApiRole::Model);

        let rows = inserted(&store);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sender, Sender::User);
        assert_eq!(rows[1].node_id, "e-1");

        let sent = match session.transport.bodies.lock() {
            Ok(b) => b.clone(),
            Err(e) => panic!("{}", e),
        };
        assert_eq!(sent[0].0, RelayRoute::Perplexity);
        assert_eq!(sent[0].1["message"], "원인은?");
        assert_eq!(sent[0].1["history"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_abort_appends_and_persists_nothing() {
        let transport = ScriptedTransport {
            pieces: vec!["partial answer"],
            hang_after: true,
            ..Default::default()
        };
        let store = Arc::new(RecordingStore::default());
        let mut session = ChatSession::new(scope("0"), transport)
            .with_route(RelayRoute::Cerebras)
            .with_archive(archive(store.clone()));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = match session.ask("hello", ChatMode::Ask, &cancel).await {
            Ok(o) => o,
            Err(e) => panic!("ask failed: {}", e),
        };
        assert_eq!(outcome, TurnOutcome::Aborted);
        assert!(session.log().iter().all(|i| i.sender == Sender::User));
        assert!(inserted(&store).is_empty());
        assert_eq!(session.status(), ResponseStatus::Idle);
    }

    #[tokio::test]
    async fn test_global_turn_pulls_in_related_message() {
        let related = ChatMessage {
            id: Some("m1".into()),
            assignment_id: "7".into(),
            parent_node_id: "0".into(),
            node_id: "c-3".into(),
            sender: Sender::Ai,
            message: "출산율 하락이 주요 원인입니다".into(),
            created_at: None,
            mode: ChatMode::Ask,
            user_id: None,
            user_name: None,
            suggestions: Vec::new(),
            citations: Vec::new(),
            skip_embedding: false,
        };
        let store = Arc::new(RecordingStore {
            similar: vec![related],
            ..Default::default()
        });
        let transport = ScriptedTransport {
            pieces: vec!["답변"],
            ..Default::default()
        };
        let mut session = ChatSession::new(scope("0"), transport).with_archive(archive(store.clone()));

        match session.ask("원인?", ChatMode::Ask, &CancellationToken::new()).await {
            Ok(TurnOutcome::Completed(item)) => assert_eq!(item.message, "답변"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }

        let messages: Vec<_> = session.log().iter().map(|i| i.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["원인?", RELEVANT_INFO_MESSAGE, "출산율 하락이 주요 원인입니다", "답변"]
        );

        let sent = match session.transport.bodies.lock() {
            Ok(b) => b.clone(),
            Err(e) => panic!("{}", e),
        };
        assert_eq!(sent[0].0, RelayRoute::OpenAi);
        assert_eq!(sent[0].1["model"], GLOBAL_CHAT_MODEL);
        assert_eq!(sent[0].1["history"], "AI: [노드 c-3] AI: 출산율 하락이 주요 원인입니다");
        assert!(inserted(&store).iter().all(|m| m.skip_embedding));
    }

    #[tokio::test]
    async fn test_create_mode_only_records() {
        let store = Arc::new(RecordingStore::default());
        let mut session = ChatSession::new(scope("e-1"), ScriptedTransport::default())
            .with_archive(archive(store.clone()));
        match session.ask("새 주장", ChatMode::Create, &CancellationToken::new()).await {
            Ok(outcome) => assert_eq!(outcome, TurnOutcome::Recorded),
            Err(e) => panic!("{}", e),
        }
        assert_eq!(inserted(&store).len(), 1);
        assert!(session.history().is_empty());
        assert!(session.ask("   ", ChatMode::Ask, &CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_rebuilds_history() {
        let store = Arc::new(RecordingStore::default());
        let transport = ScriptedTransport {
            pieces: vec!["{\"text\":\"ok\"}\n"],
            ..Default::default()
        };
        let mut first = ChatSession::new(scope("e-1"), transport)
            .with_route(RelayRoute::Gemini)
            .with_archive(archive(store.clone()));
        if let Err(e) = first.ask("q", ChatMode::Ask, &CancellationToken::new()).await {
            panic!("{}", e);
        }

        let mut second = ChatSession::new(scope("e-1"), ScriptedTransport::default())
            .with_archive(archive(store.clone()));
        match second.restore().await {
            Ok(n) => assert_eq!(n, 2),
            Err(e) => panic!("{}", e),
        }
        assert_eq!(second.history()[0].role, ApiRole::User);
        assert_eq!(second.history()[1].text(), "ok");
        assert!(second.log()[1].node_info.is_none());
    }
}
