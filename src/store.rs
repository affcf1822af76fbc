use crate::db::DbPool;
use crate::types::{ChatMessage, LearnFlowError, NodeScope, Result};
use futures_util::future::BoxFuture;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub const SIMILARITY_THRESHOLD: f32 = 0.5;
pub const SIMILARITY_LIMIT: usize = 1;
pub const PROVISIONAL_NODE_ID: &str = "new-node";

/// Persistence for chat messages. Boxed futures keep it usable as
/// `Arc<dyn ChatStore>` so the archive does not care which backend it has.
pub trait ChatStore: Send + Sync {
    /// Stores a message and returns it with its id and timestamp filled in.
    fn insert<'a>(&'a self, message: &'a ChatMessage) -> BoxFuture<'a, Result<ChatMessage>>;

    /// Messages of one node in ascending `created_at` order, optionally
    /// restricted to `scope.user_id`.
    fn load<'a>(&'a self, scope: &'a NodeScope) -> BoxFuture<'a, Result<Vec<ChatMessage>>>;

    fn delete<'a>(&'a self, scope: &'a NodeScope) -> BoxFuture<'a, Result<()>>;

    /// Moves messages written under a provisional node id to the real one.
    fn reassign_node<'a>(
        &'a self,
        assignment_id: &'a str,
        parent_node_id: &'a str,
        from_node_id: &'a str,
        to_node_id: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn attach_embedding<'a>(&'a self, id: &'a str, embedding: &'a [f32]) -> BoxFuture<'a, Result<()>>;

    /// Most similar messages of an assignment, best first.
    fn search_similar<'a>(
        &'a self,
        assignment_id: &'a str,
        embedding: &'a [f32],
        threshold: f32,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ChatMessage>>>;

    fn ready(&self) -> BoxFuture<'_, Result<()>>;
}

// --- Supabase (PostgREST) ---

pub struct SupabaseStore {
    http: reqwest::Client,
    rest_url: String,
    key: String,
}

impl SupabaseStore {
    pub fn new(http: reqwest::Client, url: &str, key: &str) -> Self {
        Self {
            http,
            rest_url: format!("{}/rest/v1", url.trim_end_matches('/')),
            key: key.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.rest_url, path))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    fn node_filter(scope: &NodeScope) -> Vec<(&'static str, String)> {
        vec![
            ("assignment_id", format!("eq.{}", scope.assignment_id)),
            ("parent_node_id", format!("eq.{}", scope.parent_node_id)),
            ("node_id", format!("eq.{}", scope.node_id)),
        ]
    }
}

impl ChatStore for SupabaseStore {
    fn insert<'a>(&'a self, message: &'a ChatMessage) -> BoxFuture<'a, Result<ChatMessage>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::POST, "chat_messages")
                .header("Prefer", "return=representation")
                .json(&[message])
                .send()
                .await?;
            let rows: Vec<ChatMessage> = crate::vendors::ensure_success(response).await?.json().await?;
            match rows.into_iter().next() {
                Some(row) => Ok(row),
                None => Err(LearnFlowError::Protocol("insert returned no row".to_string()).into()),
            }
        })
    }

    fn load<'a>(&'a self, scope: &'a NodeScope) -> BoxFuture<'a, Result<Vec<ChatMessage>>> {
        Box::pin(async move {
            let mut query = Self::node_filter(scope);
            query.push(("select", "*".to_string()));
            query.push(("order", "created_at.asc".to_string()));
            if let Some(user) = scope.user_id.as_deref().filter(|u| !u.is_empty()) {
                query.push(("user_id", format!("eq.{}", user)));
            }
            let response = self
                .request(reqwest::Method::GET, "chat_messages")
                .query(&query)
                .send()
                .await?;
            Ok(crate::vendors::ensure_success(response).await?.json().await?)
        })
    }

    fn delete<'a>(&'a self, scope: &'a NodeScope) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::DELETE, "chat_messages")
                .query(&Self::node_filter(scope))
                .send()
                .await?;
            crate::vendors::ensure_success(response).await?;
            Ok(())
        })
    }

    fn reassign_node<'a>(
        &'a self,
        assignment_id: &'a str,
        parent_node_id: &'a str,
        from_node_id: &'a str,
        to_node_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let query = [
                ("assignment_id", format!("eq.{}", assignment_id)),
                ("parent_node_id", format!("eq.{}", parent_node_id)),
                ("node_id", format!("eq.{}", from_node_id)),
            ];
            let response = self
                .request(reqwest::Method::PATCH, "chat_messages")
                .query(&query)
                .json(&serde_json::json!({ "node_id": to_node_id }))
                .send()
                .await?;
            crate::vendors::ensure_success(response).await?;
            Ok(())
        })
    }

    fn attach_embedding<'a>(&'a self, id: &'a str, embedding: &'a [f32]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::PATCH, "chat_messages")
                .query(&[("id", format!("eq.{}", id))])
                .json(&serde_json::json!({ "embedding": embedding }))
                .send()
                .await?;
            crate::vendors::ensure_success(response).await?;
            Ok(())
        })
    }

    fn search_similar<'a>(
        &'a self,
        assignment_id: &'a str,
        embedding: &'a [f32],
        threshold: f32,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ChatMessage>>> {
        Box::pin(async move {
            let body = serde_json::json!({
                "query_embedding": embedding,
                "match_threshold": threshold,
                "match_count": limit,
                "p_assignment_id": assignment_id,
            });
            let sent = self
                .request(reqwest::Method::POST, "rpc/match_chat_messages")
                .json(&body)
                .send()
                .await;
            // The RPC is optional on the database side; without it there are no matches.
            let response = match sent {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("[archive] Similarity search unavailable: {}", e);
                    return Ok(Vec::new());
                }
            };
            let response = match crate::vendors::ensure_success(response).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("[archive] Similarity search RPC failed: {}", e.inner);
                    return Ok(Vec::new());
                }
            };
            match response.json::<Vec<ChatMessage>>().await {
                Ok(rows) => Ok(rows),
                Err(e) => {
                    tracing::warn!("[archive] Similarity search returned unreadable rows: {}", e);
                    Ok(Vec::new())
                }
            }
        })
    }

    fn ready(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::GET, "chat_messages")
                .query(&[("select", "id"), ("limit", "1")])
                .send()
                .await?;
            crate::vendors::ensure_success(response).await?;
            Ok(())
        })
    }
}

// --- SQLite ---

pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &SqliteRow) -> Result<ChatMessage> {
        let created_at: String = row.try_get("created_at")?;
        let created_at = match chrono::DateTime::parse_from_rfc3339(&created_at) {
            Ok(ts) => Some(ts.with_timezone(&chrono::Utc)),
            Err(e) => {
                tracing::warn!("[archive] Unreadable timestamp {:?}: {}", created_at, e);
                None
            }
        };
        let sender: String = row.try_get("sender")?;
        let mode: String = row.try_get("mode")?;
        let suggestions: String = row.try_get("suggestions")?;
        let citations: String = row.try_get("citations")?;

        Ok(ChatMessage {
            id: Some(row.try_get("id")?),
            assignment_id: row.try_get("assignment_id")?,
            parent_node_id: row.try_get("parent_node_id")?,
            node_id: row.try_get("node_id")?,
            sender: sender.parse()?,
            message: row.try_get("message")?,
            created_at,
            mode: mode.parse()?,
            user_id: row.try_get("user_id")?,
            user_name: row.try_get("user_name")?,
            suggestions: serde_json::from_str(&suggestions)?,
            citations: serde_json::from_str(&citations)?,
            skip_embedding: false,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, assignment_id, parent_node_id, node_id, sender, message, \
     created_at, mode, user_id, user_name, suggestions, citations FROM chat_messages";

impl ChatStore for SqliteStore {
    fn insert<'a>(&'a self, message: &'a ChatMessage) -> BoxFuture<'a, Result<ChatMessage>> {
        Box::pin(async move {
            let mut stored = message.clone();
            stored.id = Some(uuid::Uuid::new_v4().to_string());
            let created_at = chrono::Utc::now();
            stored.created_at = Some(created_at);

            sqlx::query(
                "INSERT INTO chat_messages (id, assignment_id, parent_node_id, node_id, sender, \
                 message, created_at, mode, user_id, user_name, suggestions, citations) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&stored.id)
            .bind(&stored.assignment_id)
            .bind(&stored.parent_node_id)
            .bind(&stored.node_id)
            .bind(stored.sender.to_string())
            .bind(&stored.message)
            .bind(created_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
            .bind(stored.mode.to_string())
            .bind(&stored.user_id)
            .bind(&stored.user_name)
            .bind(serde_json::to_string(&stored.suggestions)?)
            .bind(serde_json::to_string(&stored.citations)?)
            .execute(&self.pool)
            .await?;

            Ok(stored)
        })
    }

    fn load<'a>(&'a self, scope: &'a NodeScope) -> BoxFuture<'a, Result<Vec<ChatMessage>>> {
        Box::pin(async move {
            let user = scope.user_id.as_deref().filter(|u| !u.is_empty());
            let sql = format!(
                "{} WHERE assignment_id = ? AND parent_node_id = ? AND node_id = ? \
                 AND (? IS NULL OR user_id = ?) ORDER BY created_at ASC, rowid ASC",
                SELECT_COLUMNS
            );
            let rows = sqlx::query(&sql)
                .bind(&scope.assignment_id)
                .bind(&scope.parent_node_id)
                .bind(&scope.node_id)
                .bind(user)
                .bind(user)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::row_to_message).collect()
        })
    }

    fn delete<'a>(&'a self, scope: &'a NodeScope) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM chat_messages WHERE assignment_id = ? AND parent_node_id = ? AND node_id = ?",
            )
            .bind(&scope.assignment_id)
            .bind(&scope.parent_node_id)
            .bind(&scope.node_id)
            .execute(&self.pool)
            .await?;
            tracing::debug!("[archive] Deleted {} messages", result.rows_affected());
            Ok(())
        })
    }

    fn reassign_node<'a>(
        &'a self,
        assignment_id: &'a str,
        parent_node_id: &'a str,
        from_node_id: &'a str,
        to_node_id: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE chat_messages SET node_id = ? \
                 WHERE assignment_id = ? AND parent_node_id = ? AND node_id = ?",
            )
            .bind(to_node_id)
            .bind(assignment_id)
            .bind(parent_node_id)
            .bind(from_node_id)
            .execute(&self.pool)
            .await?;
            tracing::debug!(
                "[archive] Moved {} messages from {} to {}",
                result.rows_affected(),
                from_node_id,
                to_node_id
            );
            Ok(())
        })
    }

    fn attach_embedding<'a>(&'a self, id: &'a str, embedding: &'a [f32]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query("UPDATE chat_messages SET embedding = ? WHERE id = ?")
                .bind(serde_json::to_string(embedding)?)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn search_similar<'a>(
        &'a self,
        assignment_id: &'a str,
        embedding: &'a [f32],
        threshold: f32,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<ChatMessage>>> {
        Box::pin(async move {
            let sql = format!(
                "{} WHERE assignment_id = ? AND embedding IS NOT NULL",
                SELECT_COLUMNS.replace(" FROM", ", embedding FROM")
            );
            let rows = sqlx::query(&sql)
                .bind(assignment_id)
                .fetch_all(&self.pool)
                .await?;

            let mut scored = Vec::new();
            for row in &rows {
                let raw: String = row.try_get("embedding")?;
                let stored: Vec<f32> = match serde_json::from_str(&raw) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("[archive] Skipping unreadable embedding: {}", e);
                        continue;
                    }
                };
                let score = cosine_similarity(embedding, &stored);
                if score > threshold {
                    scored.push((score, Self::row_to_message(row)?));
                }
            }
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            Ok(scored.into_iter().take(limit).map(|(_, m)| m).collect())
        })
    }

    fn ready(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(crate::db::ping(&self.pool))
    }
}

/// Cosine similarity; mismatched or zero-length vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_supabase_filters_name_the_node_triple() {
        let scope = NodeScope {
            assignment_id: "7".into(),
            parent_node_id: "a-1".into(),
            node_id: "e-2".into(),
            user_id: None,
            user_name: None,
        };
        let filter = SupabaseStore::node_filter(&scope);
        assert_eq!(filter[2], ("node_id", "eq.e-2".to_string()));
    }
}
