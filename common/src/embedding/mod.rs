pub mod cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, Semaphore};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{debug, error, warn};

use crate::{
    error::AppError,
    llm::{
        failover::{EmbedOutcome, EmbeddingFailover},
        ProviderError,
    },
    storage::{
        db::SurrealDbClient,
        types::{chunk_embedding::ChunkEmbedding, document_chunk::DocumentChunk},
    },
    utils::config::EmbeddingSettings,
};

use cache::EmbeddingCache;

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEmbedStatus {
    Success,
    Failed(String),
}

/// Per-chunk outcome, in the same order as the input chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEmbedResult {
    pub chunk_id: String,
    pub ordinal: u32,
    pub status: ChunkEmbedStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedChunksStatus {
    Complete,
    Partial,
    Failed,
}

#[derive(Debug)]
pub struct EmbedChunksOutcome {
    pub status: EmbedChunksStatus,
    pub results: Vec<ChunkEmbedResult>,
    pub provider: Option<String>,
}

impl EmbedChunksOutcome {
    pub fn failed_chunks(&self) -> impl Iterator<Item = &ChunkEmbedResult> {
        self.results
            .iter()
            .filter(|result| matches!(result.status, ChunkEmbedStatus::Failed(_)))
    }
}

/// Batched embedding with cache consultation, provider failover, bounded
/// retries and per-tenant concurrency caps. Successful vectors are committed
/// to the cache and the vector index before the call returns.
pub struct EmbeddingEngine {
    db: Arc<SurrealDbClient>,
    backend: EmbeddingFailover,
    cache: EmbeddingCache,
    settings: EmbeddingSettings,
    tenant_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl EmbeddingEngine {
    pub fn new(
        db: Arc<SurrealDbClient>,
        backend: EmbeddingFailover,
        settings: EmbeddingSettings,
    ) -> Self {
        let cache = EmbeddingCache::new(Arc::clone(&db), settings.cache_ttl_seconds);
        Self {
            db,
            backend,
            cache,
            settings,
            tenant_slots: Mutex::new(HashMap::new()),
        }
    }

    /// The model name vectors are indexed and cached under.
    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub fn dimensions(&self) -> usize {
        self.backend.dimensions()
    }

    pub fn last_used_provider(&self) -> Option<String> {
        self.backend.last_used()
    }

    pub async fn probe(&self) -> bool {
        self.backend.probe().await
    }

    async fn tenant_slot(&self, tenant_id: &str) -> Arc<Semaphore> {
        let mut slots = self.tenant_slots.lock().await;
        Arc::clone(slots.entry(tenant_id.to_string()).or_insert_with(|| {
            Arc::new(Semaphore::new(self.settings.per_tenant_concurrency.max(1)))
        }))
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        // 250ms, 500ms, capped at 5s; two retries after the initial attempt.
        ExponentialBackoff::from_millis(2)
            .factor(125)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(2)
    }

    async fn embed_with_retry(&self, texts: Vec<String>) -> Result<EmbedOutcome, ProviderError> {
        RetryIf::spawn(
            self.retry_strategy(),
            || self.backend.embed_batch(&texts),
            |err: &ProviderError| err.is_transient(),
        )
        .await
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), AppError> {
        let expected = self.dimensions();
        if vector.len() != expected {
            let message = format!(
                "embedding dimension mismatch: expected {expected}, got {}",
                vector.len()
            );
            error!("{message}");
            return Err(AppError::InvariantViolated(message));
        }
        Ok(())
    }

    /// Embed a single query string: cache, then provider, then cache write.
    pub async fn embed_query(&self, tenant_id: &str, text: &str) -> Result<Vec<f32>, AppError> {
        let model = self.model().to_string();

        if let Some(vector) = self.cache.get(tenant_id, text, &model).await {
            debug!(tenant_id = %tenant_id, "query embedding served from cache");
            return Ok(vector);
        }

        let outcome = self
            .backend
            .embed_batch(&[text.to_string()])
            .await
            .map_err(AppError::Provider)?;

        let vector = outcome
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::InvariantViolated("provider returned no vector".into()))?;
        self.check_dimension(&vector)?;

        self.cache
            .put(tenant_id, text, &model, vector.clone())
            .await;

        Ok(vector)
    }

    /// Embed a document's chunks. Sub-batches run concurrently under the
    /// tenant's cap; per-sub-batch transient failures retry with bounded
    /// backoff; results come back in input order.
    ///
    /// Vector index write failures abort the call so the caller can leave
    /// the document in PROCESSING for redelivery; provider failures degrade
    /// to per-chunk FAILED results instead.
    pub async fn embed_chunks(
        &self,
        tenant_id: &str,
        chunks: &[DocumentChunk],
    ) -> Result<EmbedChunksOutcome, AppError> {
        if chunks.is_empty() {
            return Ok(EmbedChunksOutcome {
                status: EmbedChunksStatus::Complete,
                results: Vec::new(),
                provider: None,
            });
        }

        let slot = self.tenant_slot(tenant_id).await;
        let batch_size = self.settings.batch_size.max(1);
        let concurrency = self.settings.per_tenant_concurrency.max(1);

        let sub_batches: Vec<&[DocumentChunk]> = chunks.chunks(batch_size).collect();
        let outcomes: Vec<Result<Vec<ChunkEmbedResult>, AppError>> =
            stream::iter(sub_batches.into_iter().map(|batch| {
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    let _permit = slot
                        .acquire_owned()
                        .await
                        .map_err(|_| AppError::Internal("tenant limiter closed".to_string()))?;
                    self.process_sub_batch(tenant_id, batch).await
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<ChunkEmbedResult>, AppError>> + Send + '_>>
            }))
            .buffered(concurrency)
            .collect()
            .await;

        let mut results = Vec::with_capacity(chunks.len());
        for outcome in outcomes {
            results.extend(outcome?);
        }

        let failed = results
            .iter()
            .filter(|r| matches!(r.status, ChunkEmbedStatus::Failed(_)))
            .count();
        let status = if failed == 0 {
            EmbedChunksStatus::Complete
        } else if failed == results.len() {
            EmbedChunksStatus::Failed
        } else {
            EmbedChunksStatus::Partial
        };

        Ok(EmbedChunksOutcome {
            status,
            results,
            provider: self.backend.last_used(),
        })
    }

    fn process_sub_batch<'a>(
        &'a self,
        tenant_id: &'a str,
        batch: &'a [DocumentChunk],
    ) -> impl std::future::Future<Output = Result<Vec<ChunkEmbedResult>, AppError>> + Send + 'a
    {
        async move {
            let model = self.model().to_string();

            let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(batch.len());
            let mut uncached: Vec<usize> = Vec::new();
            for (position, chunk) in batch.iter().enumerate() {
                match self.cache.get(tenant_id, &chunk.content, &model).await {
                    Some(vector) => vectors.push(Some(vector)),
                    None => {
                        vectors.push(None);
                        uncached.push(position);
                    }
                }
            }

            let mut failures: HashMap<usize, String> = HashMap::new();
            if !uncached.is_empty() {
                let texts: Vec<String> = uncached
                    .iter()
                    .filter_map(|&position| batch.get(position))
                    .map(|chunk| chunk.content.clone())
                    .collect();

                match self.embed_with_retry(texts).await {
                    Ok(outcome) => {
                        for (offset, &position) in uncached.iter().enumerate() {
                            match outcome.vectors.get(offset) {
                                Some(vector) => {
                                    if let Some(slot) = vectors.get_mut(position) {
                                        *slot = Some(vector.clone());
                                    }
                                }
                                None => {
                                    failures.insert(
                                        position,
                                        "provider returned fewer vectors than inputs".to_string(),
                                    );
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            tenant_id = %tenant_id,
                            error = %err,
                            batch_len = batch.len(),
                            "embedding sub-batch failed after retries"
                        );
                        let message = err.to_string();
                        for &position in &uncached {
                            failures.insert(position, message.clone());
                        }
                    }
                }
            }

            let mut results = Vec::with_capacity(batch.len());
            for (position, chunk) in batch.iter().enumerate() {
                if let Some(message) = failures.get(&position) {
                    results.push(ChunkEmbedResult {
                        chunk_id: chunk.id.clone(),
                        ordinal: chunk.ordinal,
                        status: ChunkEmbedStatus::Failed(message.clone()),
                    });
                    continue;
                }

                let Some(vector) = vectors.get(position).and_then(|v| v.clone()) else {
                    results.push(ChunkEmbedResult {
                        chunk_id: chunk.id.clone(),
                        ordinal: chunk.ordinal,
                        status: ChunkEmbedStatus::Failed("no vector produced".to_string()),
                    });
                    continue;
                };

                if let Err(err) = self.check_dimension(&vector) {
                    results.push(ChunkEmbedResult {
                        chunk_id: chunk.id.clone(),
                        ordinal: chunk.ordinal,
                        status: ChunkEmbedStatus::Failed(err.to_string()),
                    });
                    continue;
                }

                // Index write failures are infrastructure trouble, not content
                // trouble: abort so nothing gets half-committed silently.
                ChunkEmbedding::upsert(
                    &self.db,
                    ChunkEmbedding::new(
                        tenant_id.to_string(),
                        model.clone(),
                        chunk.id.clone(),
                        chunk.document_id.clone(),
                        vector.clone(),
                        chunk.metadata.clone(),
                    ),
                )
                .await?;

                self.cache
                    .put(tenant_id, &chunk.content, &model, vector)
                    .await;

                results.push(ChunkEmbedResult {
                    chunk_id: chunk.id.clone(),
                    ordinal: chunk.ordinal,
                    status: ChunkEmbedStatus::Success,
                });
            }

            Ok(results)
        }
    }

    /// Drop a document's vectors for the current model, then embed its
    /// current chunks from scratch.
    pub async fn re_embed(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<EmbedChunksOutcome, AppError> {
        let model = self.model().to_string();
        ChunkEmbedding::delete_for_document(&self.db, tenant_id, &model, document_id).await?;

        let chunks = DocumentChunk::load_for_document(&self.db, tenant_id, document_id).await?;
        self.embed_chunks(tenant_id, &chunks).await
    }

    /// Sweep expired embedding cache entries. Meant for a periodic janitor
    /// task; reads already evict lazily.
    pub async fn purge_expired_cache(&self) -> Result<(), AppError> {
        self.cache.purge_expired().await
    }

    /// Remove a document's vectors for the current model.
    pub async fn delete_document_vectors(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<(), AppError> {
        let model = self.model().to_string();
        ChunkEmbedding::delete_for_document(&self.db, tenant_id, &model, document_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedEmbeddingBackend;
    use crate::storage::indexes::ensure_runtime_indexes;
    use uuid::Uuid;

    async fn engine_with(
        backend: Arc<ScriptedEmbeddingBackend>,
        fallback: Option<Arc<ScriptedEmbeddingBackend>>,
        settings: EmbeddingSettings,
    ) -> EmbeddingEngine {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");
        ensure_runtime_indexes(&db, 3).await.expect("indexes");

        let failover = EmbeddingFailover::new(
            backend as _,
            fallback.map(|f| f as _),
            Duration::from_secs(5),
        );
        EmbeddingEngine::new(Arc::new(db), failover, settings)
    }

    fn settings() -> EmbeddingSettings {
        EmbeddingSettings {
            batch_size: 2,
            ..EmbeddingSettings::default()
        }
    }

    fn chunk(tenant: &str, ordinal: u32, content: &str) -> DocumentChunk {
        DocumentChunk::new(
            tenant.to_string(),
            "doc-1".to_string(),
            ordinal,
            content.to_string(),
            1,
            0,
            content.len() as u64,
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_embed_query_uses_cache_second_time() {
        let backend = Arc::new(ScriptedEmbeddingBackend::new("primary", 3));
        let engine = engine_with(Arc::clone(&backend), None, settings()).await;

        let first = engine
            .embed_query("tenant-a", "hello")
            .await
            .expect("embed");
        assert_eq!(first.len(), 3);
        assert_eq!(backend.call_count(), 1);

        let second = engine
            .embed_query("tenant-a", "hello")
            .await
            .expect("embed");
        assert_eq!(second, first);
        assert_eq!(backend.call_count(), 1, "second call must hit the cache");
    }

    #[tokio::test]
    async fn test_embed_query_both_providers_down() {
        let backend = Arc::new(ScriptedEmbeddingBackend::new("primary", 3));
        backend.set_failure(ProviderError::Unavailable("down".into()));
        let engine = engine_with(Arc::clone(&backend), None, settings()).await;

        let err = engine
            .embed_query("tenant-a", "hello")
            .await
            .expect_err("provider down");
        assert!(matches!(err, AppError::Provider(_)));
    }

    #[tokio::test]
    async fn test_embed_chunks_commits_vectors_in_order() {
        let backend = Arc::new(ScriptedEmbeddingBackend::new("primary", 3));
        let engine = engine_with(Arc::clone(&backend), None, settings()).await;

        let chunks = vec![
            chunk("tenant-a", 0, "first chunk"),
            chunk("tenant-a", 1, "second chunk"),
            chunk("tenant-a", 2, "third chunk"),
        ];

        let outcome = engine
            .embed_chunks("tenant-a", &chunks)
            .await
            .expect("embed chunks");

        assert_eq!(outcome.status, EmbedChunksStatus::Complete);
        assert_eq!(outcome.results.len(), 3);
        let ordinals: Vec<u32> = outcome.results.iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2], "results keep input order");
        assert_eq!(outcome.provider.as_deref(), Some("primary"));

        let stored = ChunkEmbedding::top_k(
            &engine.db,
            "tenant-a",
            "test-model",
            &[1.0, 0.0, 0.0],
            10,
            0.5,
            None,
        )
        .await
        .expect("top_k");
        assert_eq!(stored.len(), 3, "all vectors are committed to the index");
    }

    #[tokio::test]
    async fn test_embed_chunks_all_failed_on_outage() {
        let backend = Arc::new(ScriptedEmbeddingBackend::new("primary", 3));
        backend.set_failure(ProviderError::Other("hard failure".into()));
        let engine = engine_with(Arc::clone(&backend), None, settings()).await;

        let chunks = vec![
            chunk("tenant-a", 0, "first"),
            chunk("tenant-a", 1, "second"),
        ];
        let outcome = engine
            .embed_chunks("tenant-a", &chunks)
            .await
            .expect("call returns an outcome");

        assert_eq!(outcome.status, EmbedChunksStatus::Failed);
        assert_eq!(outcome.failed_chunks().count(), 2);

        let stored = ChunkEmbedding::top_k(
            &engine.db,
            "tenant-a",
            "test-model",
            &[1.0, 0.0, 0.0],
            10,
            0.0,
            None,
        )
        .await
        .expect("top_k");
        assert!(stored.is_empty(), "no partial commits on full outage");
    }

    #[tokio::test]
    async fn test_embed_chunks_empty_input() {
        let backend = Arc::new(ScriptedEmbeddingBackend::new("primary", 3));
        let engine = engine_with(Arc::clone(&backend), None, settings()).await;

        let outcome = engine.embed_chunks("tenant-a", &[]).await.expect("embed");
        assert_eq!(outcome.status, EmbedChunksStatus::Complete);
        assert!(outcome.results.is_empty());
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_embed_chunks_dimension_mismatch_is_failed_chunk() {
        let backend = Arc::new(ScriptedEmbeddingBackend::new("primary", 3));
        backend.script("bad chunk", vec![1.0, 0.0]);
        let engine = engine_with(Arc::clone(&backend), None, settings()).await;

        let chunks = vec![
            chunk("tenant-a", 0, "good chunk"),
            chunk("tenant-a", 1, "bad chunk"),
        ];
        let outcome = engine
            .embed_chunks("tenant-a", &chunks)
            .await
            .expect("embed chunks");

        assert_eq!(outcome.status, EmbedChunksStatus::Partial);
        let statuses: Vec<bool> = outcome
            .results
            .iter()
            .map(|r| matches!(r.status, ChunkEmbedStatus::Success))
            .collect();
        assert_eq!(statuses, vec![true, false]);
    }

    #[tokio::test]
    async fn test_re_embed_replaces_vectors() {
        let backend = Arc::new(ScriptedEmbeddingBackend::new("primary", 3));
        // Zero cache TTL so the re-embed reaches the provider instead of the
        // content-addressed cache.
        let uncached = EmbeddingSettings {
            batch_size: 2,
            cache_ttl_seconds: 0,
            ..EmbeddingSettings::default()
        };
        let engine = engine_with(Arc::clone(&backend), None, uncached).await;

        let chunks = vec![chunk("tenant-a", 0, "re-embed me")];
        DocumentChunk::insert_many(&engine.db, chunks.clone())
            .await
            .expect("insert chunks");

        engine
            .embed_chunks("tenant-a", &chunks)
            .await
            .expect("initial embed");

        backend.script("re-embed me", vec![0.0, 1.0, 0.0]);
        let outcome = engine
            .re_embed("tenant-a", "doc-1")
            .await
            .expect("re-embed");
        assert_eq!(outcome.status, EmbedChunksStatus::Complete);

        let stored = ChunkEmbedding::top_k(
            &engine.db,
            "tenant-a",
            "test-model",
            &[0.0, 1.0, 0.0],
            10,
            0.9,
            None,
        )
        .await
        .expect("top_k");
        assert_eq!(stored.len(), 1, "old vector replaced by the new one");
    }
}
