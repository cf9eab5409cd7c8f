use std::sync::Arc;

use chrono::Duration;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use common::{error::AppError, storage::db::SurrealDbClient, stored_object};

use crate::orchestrator::RagResponse;

pub const DEFAULT_RESPONSE_TTL_SECS: i64 = 3600;

stored_object!(ResponseCacheEntry, "response_cache", {
    tenant_id: String,
    response: RagResponse,
    ttl_secs: i64
});

/// Tenant-scoped full-response cache keyed by a canonicalized query
/// fingerprint. Best-effort on both ends: a miss is normal, a write failure
/// is logged and swallowed.
#[derive(Clone)]
pub struct ResponseCache {
    db: Arc<SurrealDbClient>,
    ttl_secs: i64,
}

impl ResponseCache {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self::with_ttl(db, DEFAULT_RESPONSE_TTL_SECS)
    }

    pub fn with_ttl(db: Arc<SurrealDbClient>, ttl_secs: i64) -> Self {
        Self { db, ttl_secs }
    }

    fn canonicalize(query: &str) -> String {
        query.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Tenant-prefixed fingerprint; a colliding query from another tenant
    /// can never resolve to this entry.
    pub fn cache_key(tenant_id: &str, query: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b"|");
        hasher.update(Self::canonicalize(query).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn get(&self, tenant_id: &str, query: &str) -> Option<RagResponse> {
        let key = Self::cache_key(tenant_id, query);

        match self.db.get_item::<ResponseCacheEntry>(&key).await {
            Ok(Some(entry)) => {
                if entry.tenant_id != tenant_id {
                    warn!(
                        caller_tenant = %tenant_id,
                        owner_tenant = %entry.tenant_id,
                        "response cache key collision across tenants; treating as miss"
                    );
                    return None;
                }
                let expires_at = entry.created_at + Duration::seconds(entry.ttl_secs);
                if expires_at <= Utc::now() {
                    debug!(tenant_id = %tenant_id, "response cache entry expired");
                    if let Err(err) = self.db.delete_item::<ResponseCacheEntry>(&key).await {
                        warn!(error = %err, "failed to evict expired response cache entry");
                    }
                    None
                } else {
                    Some(entry.response)
                }
            }
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "response cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, tenant_id: &str, query: &str, response: &RagResponse) {
        let now = Utc::now();
        let entry = ResponseCacheEntry {
            id: Self::cache_key(tenant_id, query),
            created_at: now,
            updated_at: now,
            tenant_id: tenant_id.to_string(),
            response: response.clone(),
            ttl_secs: self.ttl_secs,
        };

        if let Err(err) = self.db.upsert_item(entry).await {
            warn!(error = %err, "response cache write failed");
        }
    }

    /// Clear every cached response of one tenant, e.g. after its documents
    /// changed materially.
    pub async fn invalidate_tenant(&self, tenant_id: &str) -> Result<(), AppError> {
        self.db
            .client
            .query("DELETE response_cache WHERE tenant_id = $tenant_id;")
            .bind(("tenant_id", tenant_id.to_string()))
            .await?
            .check()?;

        Ok(())
    }
}
