use crate::store::{ChatStore, PROVISIONAL_NODE_ID, SIMILARITY_LIMIT, SIMILARITY_THRESHOLD};
use crate::types::{ChatMessage, NodeScope, Result};
use crate::vendors::VendorRegistry;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tracing::Instrument;

/// Turns text into an embedding vector.
pub trait Embedder: Send + Sync {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>>>;
}

impl Embedder for VendorRegistry {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>>> {
        Box::pin(async move { self.embedder()?.embed(text).await })
    }
}

/// Chat history persistence with background embeddings.
#[derive(Clone)]
pub struct ChatArchive {
    store: Arc<dyn ChatStore>,
    embedder: Arc<dyn Embedder>,
}

impl ChatArchive {
    pub fn new(store: Arc<dyn ChatStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Inserts the message, then embeds it in a detached task unless it is
    /// marked `skip_embedding` or has no text. Embedding failures are logged.
    #[tracing::instrument(skip_all, fields(node = %message.node_id))]
    pub async fn save(&self, message: ChatMessage) -> Result<ChatMessage> {
        let stored = self.store.insert(&message).await?;

        if message.skip_embedding || message.message.trim().is_empty() {
            return Ok(stored);
        }
        let id = match stored.id.clone() {
            Some(id) => id,
            None => {
                tracing::warn!("[archive] Stored message has no id; embedding skipped");
                return Ok(stored);
            }
        };

        let store = self.store.clone();
        let embedder = self.embedder.clone();
        let text = message.message.clone();
        tokio::spawn(
            async move {
                let embedding = match embedder.embed(&text).await {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!("[archive] Embedding failed: {}", e.inner);
                        return;
                    }
                };
                if let Err(e) = store.attach_embedding(&id, &embedding).await {
                    tracing::warn!("[archive] Could not attach embedding: {}", e.inner);
                } else {
                    tracing::debug!("[archive] Embedding attached to {}", id);
                }
            }
            .in_current_span(),
        );

        Ok(stored)
    }

    /// Fire-and-forget `save`; the caller never waits on or sees a failure.
    pub fn save_detached(&self, message: ChatMessage) {
        let archive = self.clone();
        tokio::spawn(
            async move {
                if let Err(e) = archive.save(message).await {
                    tracing::error!("[archive] Failed to persist chat message: {}", e.inner);
                }
            }
            .in_current_span(),
        );
    }

    pub async fn load(&self, scope: &NodeScope) -> Result<Vec<ChatMessage>> {
        self.store.load(scope).await
    }

    pub async fn delete(&self, scope: &NodeScope) -> Result<()> {
        self.store.delete(scope).await
    }

    /// Moves a node's messages from `from_node_id` (the provisional
    /// `new-node` when `None`) to the node id the backend assigned.
    pub async fn reassign_node(
        &self,
        assignment_id: &str,
        parent_node_id: &str,
        to_node_id: &str,
        from_node_id: Option<&str>,
    ) -> Result<()> {
        let from = match from_node_id {
            Some(f) => f,
            None => PROVISIONAL_NODE_ID,
        };
        self.store
            .reassign_node(assignment_id, parent_node_id, from, to_node_id)
            .await
    }

    /// The earlier message of this assignment closest to `text`, if any
    /// passes the similarity threshold. Lookup failures yield no match.
    pub async fn find_relevant(&self, assignment_id: &str, text: &str) -> Vec<ChatMessage> {
        let embedding = match self.embedder.embed(text).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("[archive] Could not embed search query: {}", e.inner);
                return Vec::new();
            }
        };
        match self
            .store
            .search_similar(assignment_id, &embedding, SIMILARITY_THRESHOLD, SIMILARITY_LIMIT)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("[archive] Similarity search failed: {}", e.inner);
                Vec::new()
            }
        }
    }
}
