use std::sync::Arc;

use chrono::Duration;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    error::AppError, storage::db::SurrealDbClient, stored_object, utils::text::collapse_whitespace,
};

stored_object!(EmbeddingCacheEntry, "embedding_cache", {
    tenant_id: String,
    model: String,
    vector: Vec<f32>,
    ttl_secs: i64
});

/// Content-addressed, tenant-scoped vector cache. Strictly an optimization:
/// a miss is the normal first-query path and a write failure is swallowed.
pub struct EmbeddingCache {
    db: Arc<SurrealDbClient>,
    ttl_secs: i64,
}

impl EmbeddingCache {
    pub fn new(db: Arc<SurrealDbClient>, ttl_secs: i64) -> Self {
        Self { db, ttl_secs }
    }

    /// Tenant-prefixed fingerprint. Whitespace is collapsed before hashing;
    /// case is preserved because embeddings are case-sensitive.
    pub fn cache_key(tenant_id: &str, text: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b"|");
        hasher.update(collapse_whitespace(text).as_bytes());
        hasher.update(b"|");
        hasher.update(model.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, tenant_id: &str, text: &str, model: &str) -> Option<Vec<f32>> {
        let key = Self::cache_key(tenant_id, text, model);

        match self.db.get_item::<EmbeddingCacheEntry>(&key).await {
            Ok(Some(entry)) => {
                let expires_at = entry.created_at + Duration::seconds(entry.ttl_secs);
                if expires_at <= Utc::now() {
                    debug!(tenant_id = %tenant_id, "embedding cache entry expired");
                    if let Err(err) = self.db.delete_item::<EmbeddingCacheEntry>(&key).await {
                        warn!(error = %err, "failed to evict expired embedding cache entry");
                    }
                    None
                } else {
                    Some(entry.vector)
                }
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "embedding cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, tenant_id: &str, text: &str, model: &str, vector: Vec<f32>) {
        let now = Utc::now();
        let entry = EmbeddingCacheEntry {
            id: Self::cache_key(tenant_id, text, model),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.to_string(),
            model: model.to_string(),
            vector,
            ttl_secs: self.ttl_secs,
        };

        if let Err(err) = self.db.upsert_item(entry).await {
            warn!(error = %err, "embedding cache write failed");
        }
    }

    /// Periodic sweep of expired entries.
    pub async fn purge_expired(&self) -> Result<(), AppError> {
        self.db
            .client
            .query(
                "DELETE embedding_cache
                 WHERE created_at + duration::from::secs(ttl_secs) < time::now();",
            )
            .await?
            .check()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn cache_with_ttl(ttl_secs: i64) -> EmbeddingCache {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        EmbeddingCache::new(Arc::new(db), ttl_secs)
    }

    #[tokio::test]
    async fn test_roundtrip_and_miss() {
        let cache = cache_with_ttl(3600).await;

        assert!(cache.get("tenant-a", "hello", "model-x").await.is_none());

        cache
            .put("tenant-a", "hello", "model-x", vec![0.1, 0.2])
            .await;

        let hit = cache.get("tenant-a", "hello", "model-x").await;
        assert_eq!(hit, Some(vec![0.1, 0.2]));
    }

    #[tokio::test]
    async fn test_whitespace_normalized_key() {
        let cache = cache_with_ttl(3600).await;

        cache
            .put("tenant-a", "hello   world", "model-x", vec![1.0])
            .await;

        let hit = cache.get("tenant-a", "hello world", "model-x").await;
        assert_eq!(hit, Some(vec![1.0]));

        // Case matters.
        assert!(cache
            .get("tenant-a", "Hello world", "model-x")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_tenant_and_model_scoping() {
        let cache = cache_with_ttl(3600).await;

        cache.put("tenant-a", "hello", "model-x", vec![1.0]).await;

        assert!(cache.get("tenant-b", "hello", "model-x").await.is_none());
        assert!(cache.get("tenant-a", "hello", "model-y").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss() {
        let cache = cache_with_ttl(0).await;

        cache.put("tenant-a", "hello", "model-x", vec![1.0]).await;

        assert!(cache.get("tenant-a", "hello", "model-x").await.is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = cache_with_ttl(0).await;
        cache.put("tenant-a", "old", "model-x", vec![1.0]).await;

        cache.purge_expired().await.expect("purge");

        let remaining: Vec<EmbeddingCacheEntry> = cache
            .db
            .get_all_stored_items::<EmbeddingCacheEntry>()
            .await
            .expect("select all");
        assert!(remaining.is_empty());
    }
}
