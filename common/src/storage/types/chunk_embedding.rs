use std::cmp::Ordering;
use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ChunkEmbedding, "chunk_embedding", {
    chunk_id: String,
    document_id: String,
    tenant_id: String,
    model: String,
    embedding: Vec<f32>,
    metadata: HashMap<String, String>
});

/// One retrieval hit: a chunk reference with its cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunkRef {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

/// How many raw neighbours to pull before threshold/filter pruning. Wider
/// than k so post-filtering does not silently drop qualifying entries.
fn candidate_fetch(k: usize) -> usize {
    k.saturating_mul(4).max(32).min(256)
}

impl ChunkEmbedding {
    /// Record key derived from the index identity. Upserting the same
    /// `(tenant, model, chunk)` always lands on the same record.
    pub fn record_key(tenant_id: &str, model: &str, chunk_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update(b"|");
        hasher.update(model.as_bytes());
        hasher.update(b"|");
        hasher.update(chunk_id.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn new(
        tenant_id: String,
        model: String,
        chunk_id: String,
        document_id: String,
        embedding: Vec<f32>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::record_key(&tenant_id, &model, &chunk_id),
            created_at: now,
            updated_at: now,
            chunk_id,
            document_id,
            tenant_id,
            model,
            embedding,
            metadata,
        }
    }

    /// Idempotent on `(tenant, model, chunk)`: replaces any prior vector.
    pub async fn upsert(db: &SurrealDbClient, entry: Self) -> Result<(), AppError> {
        db.upsert_item(entry)
            .await
            .map_err(|e| AppError::VectorStore(e.to_string()))?;
        Ok(())
    }

    /// Idempotent delete; a missing entry is not an error.
    pub async fn delete(
        db: &SurrealDbClient,
        tenant_id: &str,
        model: &str,
        chunk_id: &str,
    ) -> Result<(), AppError> {
        let key = Self::record_key(tenant_id, model, chunk_id);
        db.delete_item::<Self>(&key)
            .await
            .map_err(|e| AppError::VectorStore(e.to_string()))?;
        Ok(())
    }

    /// Drop every vector one document contributed under one model. Used by
    /// re-embedding and reprocessing.
    pub async fn delete_for_document(
        db: &SurrealDbClient,
        tenant_id: &str,
        model: &str,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "DELETE chunk_embedding
                 WHERE tenant_id = $tenant_id AND model = $model AND document_id = $document_id;",
            )
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("model", model.to_string()))
            .bind(("document_id", document_id.to_string()))
            .await
            .map_err(|e| AppError::VectorStore(e.to_string()))?
            .check()
            .map_err(|e| AppError::VectorStore(e.to_string()))?;

        Ok(())
    }

    /// Cosine top-k over one tenant's vectors for one model.
    ///
    /// Result contract: only entries with `score >= threshold`, sorted by
    /// score descending with ties broken by ascending chunk id, at most `k`
    /// entries. A zero-norm query has no defined cosine and yields nothing.
    /// Requires the runtime HNSW index (`ensure_runtime_indexes`).
    pub async fn top_k(
        db: &SurrealDbClient,
        tenant_id: &str,
        model: &str,
        query_vector: &[f32],
        k: usize,
        threshold: f32,
        filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<ScoredChunkRef>, AppError> {
        if k == 0 || query_vector.is_empty() {
            return Ok(Vec::new());
        }

        let norm_squared: f32 = query_vector.iter().map(|v| v * v).sum();
        if norm_squared <= f32::EPSILON {
            return Ok(Vec::new());
        }

        #[derive(Deserialize)]
        struct Row {
            chunk_id: String,
            document_id: String,
            metadata: HashMap<String, String>,
            score: f32,
        }

        let fetch = candidate_fetch(k);
        let sql = format!(
            "SELECT chunk_id, document_id, metadata,
                    vector::similarity::cosine(embedding, $embedding) AS score
             FROM chunk_embedding
             WHERE tenant_id = $tenant_id AND model = $model
               AND embedding <|{fetch},100|> $embedding;"
        );

        let mut response = db
            .client
            .query(sql)
            .bind(("embedding", query_vector.to_vec()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("model", model.to_string()))
            .await
            .map_err(|e| AppError::VectorStore(e.to_string()))?;

        let rows: Vec<Row> = response
            .take(0)
            .map_err(|e| AppError::VectorStore(e.to_string()))?;

        let mut hits: Vec<ScoredChunkRef> = rows
            .into_iter()
            .filter(|row| row.score >= threshold)
            .filter(|row| match filter {
                Some(predicates) => predicates
                    .iter()
                    .all(|(key, value)| row.metadata.get(key) == Some(value)),
                None => true,
            })
            .map(|row| ScoredChunkRef {
                chunk_id: row.chunk_id,
                document_id: row.document_id,
                score: row.score,
                metadata: row.metadata,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);

        Ok(hits)
    }

    /// True iff the backing store answers queries.
    pub async fn health_check(db: &SurrealDbClient) -> bool {
        db.is_healthy().await
    }
}
