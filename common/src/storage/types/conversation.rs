use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::AppError, storage::db::SurrealDbClient, stored_object,
    utils::config::ConversationSettings,
};

/// One question/answer turn. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationExchange {
    pub exchange_id: String,
    pub user_id: String,
    pub user_query: String,
    pub ai_response: String,
    pub source_chunk_ids: Vec<String>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub timestamp: DateTime<Utc>,
}

stored_object!(Conversation, "conversation", {
    tenant_id: String,
    user_id: String,
    exchanges: Vec<ConversationExchange>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    expires_at: DateTime<Utc>
});

/// Read-only digest of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub exchange_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub recent_queries: Vec<String>,
}

/// Read-only per-tenant aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationStats {
    pub conversation_count: usize,
    pub exchange_count: usize,
}

const SIMILARITY_THRESHOLD: f32 = 0.3;

fn tokenize(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    intersection / union
}

/// Bounded, TTL'd conversation log. Appends to one conversation are
/// serialized through a per-conversation lock so exchange timestamps stay
/// strictly increasing.
pub struct ConversationStore {
    db: Arc<SurrealDbClient>,
    settings: ConversationSettings,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    pub fn new(db: Arc<SurrealDbClient>, settings: ConversationSettings) -> Self {
        Self {
            db,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    async fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Raw tenant-checked fetch, TTL not applied.
    async fn load_any(
        &self,
        conversation_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Conversation>, AppError> {
        let conversation: Option<Conversation> = self.db.get_item(conversation_id).await?;

        match conversation {
            Some(found) if found.tenant_id != tenant_id => {
                warn!(
                    caller_tenant = %tenant_id,
                    owner_tenant = %found.tenant_id,
                    conversation_id = %conversation_id,
                    "cross-tenant conversation access rejected"
                );
                Err(AppError::TenantMismatch(format!(
                    "conversation {conversation_id} is not owned by tenant {tenant_id}"
                )))
            }
            other => Ok(other),
        }
    }

    /// Fetch honoring the inactivity TTL; an expired conversation reads as
    /// absent.
    pub async fn load(
        &self,
        conversation_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Conversation>, AppError> {
        match self.load_any(conversation_id, tenant_id).await? {
            Some(conversation) if conversation.expires_at <= Utc::now() => {
                debug!(conversation_id = %conversation_id, "conversation expired");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Append one exchange, creating the conversation when absent. Enforces
    /// the history bound (oldest dropped first) and refreshes the TTL.
    pub async fn append(
        &self,
        conversation_id: &str,
        tenant_id: &str,
        user_id: &str,
        user_query: &str,
        ai_response: &str,
        source_chunk_ids: Vec<String>,
    ) -> Result<(), AppError> {
        let guard = self.lock_for(conversation_id).await;
        let _serialized = guard.lock().await;

        let now = Utc::now();
        let mut conversation = match self.load(conversation_id, tenant_id).await? {
            Some(existing) => existing,
            None => Conversation {
                id: conversation_id.to_string(),
                created_at: now,
                updated_at: now,
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                exchanges: Vec::new(),
                expires_at: now,
            },
        };

        // Exchange order is strictly increasing even when two appends land in
        // the same clock millisecond.
        let timestamp = match conversation.exchanges.last() {
            Some(last) if last.timestamp >= now => last.timestamp + Duration::microseconds(1),
            _ => now,
        };

        conversation.exchanges.push(ConversationExchange {
            exchange_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user_query: user_query.to_string(),
            ai_response: ai_response.to_string(),
            source_chunk_ids,
            timestamp,
        });

        let overflow = conversation
            .exchanges
            .len()
            .saturating_sub(self.settings.max_history);
        if overflow > 0 {
            conversation.exchanges.drain(0..overflow);
        }

        conversation.updated_at = now;
        conversation.expires_at = now + Duration::hours(self.settings.ttl_hours);

        self.db.upsert_item(conversation).await?;
        Ok(())
    }

    /// Restate recent turns around a follow-up question. Any failure here
    /// must never fail the outer request, so every miss falls back to the
    /// query unchanged.
    pub async fn contextualize(
        &self,
        conversation_id: &str,
        tenant_id: &str,
        new_query: &str,
    ) -> String {
        if !self.settings.enable_context {
            return new_query.to_string();
        }

        let conversation = match self.load(conversation_id, tenant_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => return new_query.to_string(),
            Err(err) => {
                debug!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "contextualization skipped"
                );
                return new_query.to_string();
            }
        };

        if conversation.exchanges.is_empty() {
            return new_query.to_string();
        }

        let window = self.settings.context_window;
        let start = conversation.exchanges.len().saturating_sub(window);
        let mut prompt = String::from("Recent conversation turns:\n");
        for exchange in &conversation.exchanges[start..] {
            prompt.push_str(&format!(
                "User: {}\nAssistant: {}\n",
                exchange.user_query, exchange.ai_response
            ));
        }
        prompt.push_str(&format!("\nFollow-up question: {new_query}"));
        prompt
    }

    /// Rank past exchanges by Jaccard similarity of their user queries.
    pub async fn find_similar(
        &self,
        conversation_id: &str,
        tenant_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ConversationExchange>, AppError> {
        let Some(conversation) = self.load(conversation_id, tenant_id).await? else {
            return Ok(Vec::new());
        };

        let query_tokens = tokenize(query);
        let mut scored: Vec<(f32, ConversationExchange)> = conversation
            .exchanges
            .into_iter()
            .filter_map(|exchange| {
                let score = jaccard_similarity(&query_tokens, &tokenize(&exchange.user_query));
                (score >= SIMILARITY_THRESHOLD).then_some((score, exchange))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        Ok(scored.into_iter().map(|(_, exchange)| exchange).collect())
    }

    /// Remove the conversation and all its exchanges.
    pub async fn delete(&self, conversation_id: &str, tenant_id: &str) -> Result<bool, AppError> {
        let existing = self.load_any(conversation_id, tenant_id).await?;
        if existing.is_none() {
            return Ok(false);
        }

        self.db.delete_item::<Conversation>(conversation_id).await?;
        Ok(true)
    }

    pub async fn summary(
        &self,
        conversation_id: &str,
        tenant_id: &str,
    ) -> Result<Option<ConversationSummary>, AppError> {
        let Some(conversation) = self.load(conversation_id, tenant_id).await? else {
            return Ok(None);
        };

        let recent_queries = conversation
            .exchanges
            .iter()
            .rev()
            .take(3)
            .map(|exchange| exchange.user_query.clone())
            .collect();

        Ok(Some(ConversationSummary {
            conversation_id: conversation.id,
            exchange_count: conversation.exchanges.len(),
            created_at: conversation.created_at,
            last_updated_at: conversation.updated_at,
            recent_queries,
        }))
    }

    pub async fn stats(&self, tenant_id: &str) -> Result<ConversationStats, AppError> {
        let conversations: Vec<Conversation> = self
            .db
            .client
            .query("SELECT * FROM type::table($table) WHERE tenant_id = $tenant_id;")
            .bind(("table", Conversation::table_name()))
            .bind(("tenant_id", tenant_id.to_string()))
            .await?
            .take(0)?;

        let exchange_count = conversations.iter().map(|c| c.exchanges.len()).sum();
        Ok(ConversationStats {
            conversation_count: conversations.len(),
            exchange_count,
        })
    }
}
