pub mod prompts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use common::{
    embedding::EmbeddingEngine,
    error::AppError,
    llm::{failover::ChatFailover, ChatRequest},
    storage::{
        db::SurrealDbClient,
        types::{
            chunk_embedding::ChunkEmbedding, conversation::ConversationStore,
            document_chunk::DocumentChunk,
        },
    },
    utils::config::{ContextSettings, LlmSettings, OptimizationSettings, RagSettings},
};

use crate::{
    assembler::{self, RetrievedChunk},
    optimizer,
    response_cache::ResponseCache,
};

const DEFAULT_MAX_CHUNKS: usize = 10;
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Empty,
    Failed,
}

/// One cited chunk, ordered by descending relevance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceChunk {
    pub document_id: String,
    pub chunk_id: String,
    pub title: String,
    pub excerpt: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryMetrics {
    pub retrieval_ms: u64,
    pub assembly_ms: u64,
    pub generation_ms: u64,
    pub chunks_retrieved: usize,
    pub chunks_used: usize,
    pub tokens_estimated: usize,
    pub avg_relevance: f32,
    pub provider_used: Option<String>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagResponse {
    pub status: ResponseStatus,
    pub answer: Option<String>,
    pub sources: Vec<SourceChunk>,
    pub metrics: QueryMetrics,
    pub error: Option<String>,
}

impl RagResponse {
    fn failed(reason: &str) -> Self {
        Self {
            status: ResponseStatus::Failed,
            answer: None,
            sources: Vec::new(),
            metrics: QueryMetrics::default(),
            error: Some(reason.to_string()),
        }
    }
}

/// Per-request knobs; anything unset falls back to configuration defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub max_chunks: Option<usize>,
    pub relevance_threshold: Option<f32>,
    pub max_tokens: Option<usize>,
    pub filter: Option<HashMap<String, String>>,
    /// Free-form caller hint woven into the system prompt.
    pub intent: Option<String>,
    pub system_prompt: Option<String>,
    /// Per-request override of conversation contextualization.
    pub use_context: Option<bool>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub query: String,
    pub options: QueryOptions,
}

/// Streaming surface: answer fragments in emission order, then exactly one
/// terminal event with the assembled response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment(String),
    Completed(RagResponse),
}

enum RetrievalPhase {
    Resolved(RagResponse),
    Ready(Box<PreparedGeneration>),
}

struct PreparedGeneration {
    chat_request: ChatRequest,
    sources: Vec<SourceChunk>,
    source_chunk_ids: Vec<String>,
    metrics: QueryMetrics,
}

/// The top-level query pipeline: cache → optimize → contextualize → embed →
/// retrieve → assemble → generate → record → cache write.
pub struct QueryOrchestrator {
    db: Arc<SurrealDbClient>,
    engine: Arc<EmbeddingEngine>,
    chat: Arc<ChatFailover>,
    conversations: Arc<ConversationStore>,
    cache: ResponseCache,
    rag: RagSettings,
    llm: LlmSettings,
    optimization: OptimizationSettings,
}

impl QueryOrchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        engine: Arc<EmbeddingEngine>,
        chat: Arc<ChatFailover>,
        conversations: Arc<ConversationStore>,
        rag: RagSettings,
        llm: LlmSettings,
        optimization: OptimizationSettings,
    ) -> Self {
        let cache = ResponseCache::new(Arc::clone(&db));
        Self {
            db,
            engine,
            chat,
            conversations,
            cache,
            rag,
            llm,
            optimization,
        }
    }

    pub fn response_cache(&self) -> &ResponseCache {
        &self.cache
    }

    fn request_deadline(&self, request: &QueryRequest) -> Duration {
        request
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.llm.timeout_seconds))
    }

    /// Answer a query, always returning a response: failures fold into a
    /// FAILED response with a short human-readable reason.
    pub async fn answer_query(&self, request: &QueryRequest) -> RagResponse {
        let deadline = self.request_deadline(request);
        match timeout(deadline, self.run_query(request)).await {
            Ok(response) => response,
            Err(_) => RagResponse::failed("deadline exceeded"),
        }
    }

    async fn run_query(&self, request: &QueryRequest) -> RagResponse {
        match self.retrieve_phase(request).await {
            RetrievalPhase::Resolved(response) => response,
            RetrievalPhase::Ready(prepared) => self.generate_phase(request, *prepared).await,
        }
    }

    /// Steps 1–6: everything before talking to the language model.
    async fn retrieve_phase(&self, request: &QueryRequest) -> RetrievalPhase {
        if request.tenant_id.trim().is_empty() {
            return RetrievalPhase::Resolved(RagResponse::failed("tenant id must not be empty"));
        }
        if request.query.trim().is_empty() {
            return RetrievalPhase::Resolved(RagResponse::failed("query must not be empty"));
        }

        // Step 1: response cache.
        if let Some(mut cached) = self.cache.get(&request.tenant_id, &request.query).await {
            cached.metrics.from_cache = true;
            self.maybe_append_on_cache_hit(request, &cached).await;
            debug!(tenant_id = %request.tenant_id, "query served from response cache");
            return RetrievalPhase::Resolved(cached);
        }

        // Step 2: optimization.
        let optimized = optimizer::optimize(&request.query, &self.optimization);
        debug!(
            complexity = ?optimized.analysis.complexity,
            words = optimized.analysis.word_count,
            "query optimized"
        );

        // Step 3: conversation contextualization (absorbs its own failures).
        let contextualize = request.options.use_context.unwrap_or(true);
        let contextualized = match &request.conversation_id {
            Some(conversation_id) if contextualize => {
                self.conversations
                    .contextualize(conversation_id, &request.tenant_id, &optimized.text)
                    .await
            }
            _ => optimized.text.clone(),
        };

        // Step 4: query embedding.
        let retrieval_started = Instant::now();
        let query_vector = match self
            .engine
            .embed_query(&request.tenant_id, &contextualized)
            .await
        {
            Ok(vector) => vector,
            Err(err) => {
                warn!(error = %err, "query embedding failed");
                let reason = match err {
                    AppError::Provider(_) => "embedding provider unavailable",
                    _ => "embedding failed",
                };
                return RetrievalPhase::Resolved(RagResponse::failed(reason));
            }
        };

        // Step 5: vector retrieval.
        let k = request.options.max_chunks.unwrap_or(DEFAULT_MAX_CHUNKS);
        let threshold = request
            .options
            .relevance_threshold
            .unwrap_or(self.rag.context.relevance_threshold);
        let hits = match ChunkEmbedding::top_k(
            &self.db,
            &request.tenant_id,
            self.engine.model(),
            &query_vector,
            k,
            threshold,
            request.options.filter.as_ref(),
        )
        .await
        {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "vector retrieval failed");
                return RetrievalPhase::Resolved(RagResponse::failed("vector search unavailable"));
            }
        };
        let retrieval_ms = retrieval_started.elapsed().as_millis() as u64;

        if hits.is_empty() {
            let response = RagResponse {
                status: ResponseStatus::Empty,
                answer: None,
                sources: Vec::new(),
                metrics: QueryMetrics {
                    retrieval_ms,
                    chunks_retrieved: 0,
                    ..QueryMetrics::default()
                },
                error: None,
            };
            // An empty result is a valid, cacheable answer.
            self.cache
                .put(&request.tenant_id, &request.query, &response)
                .await;
            return RetrievalPhase::Resolved(response);
        }

        // Hydrate chunk rows for assembly and citations.
        let chunk_ids: Vec<String> = hits.iter().map(|hit| hit.chunk_id.clone()).collect();
        let chunk_rows =
            match DocumentChunk::load_many(&self.db, &request.tenant_id, &chunk_ids).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(error = %err, "chunk hydration failed");
                    return RetrievalPhase::Resolved(RagResponse::failed(
                        "vector search unavailable",
                    ));
                }
            };
        let mut by_id: HashMap<String, DocumentChunk> = chunk_rows
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        let mut retrieved: Vec<RetrievedChunk> = Vec::with_capacity(hits.len());
        for hit in &hits {
            match by_id.remove(&hit.chunk_id) {
                Some(chunk) => retrieved.push(RetrievedChunk {
                    chunk,
                    score: hit.score,
                }),
                None => warn!(
                    chunk_id = %hit.chunk_id,
                    "indexed vector without a chunk row; skipping"
                ),
            }
        }

        let sources: Vec<SourceChunk> = retrieved
            .iter()
            .map(|entry| SourceChunk {
                document_id: entry.chunk.document_id.clone(),
                chunk_id: entry.chunk.id.clone(),
                title: entry
                    .chunk
                    .metadata
                    .get("title")
                    .cloned()
                    .unwrap_or_else(|| "untitled".to_string()),
                excerpt: excerpt_of(&entry.chunk.content),
                score: entry.score,
            })
            .collect();

        // Step 6: context assembly.
        let assembly_started = Instant::now();
        let context_settings = ContextSettings {
            max_tokens: request
                .options
                .max_tokens
                .unwrap_or(self.rag.context.max_tokens),
            relevance_threshold: threshold,
            include_metadata: self.rag.context.include_metadata,
        };
        let context = assembler::assemble(&retrieved, &context_settings);
        let assembly_ms = assembly_started.elapsed().as_millis() as u64;

        let avg_relevance = if hits.is_empty() {
            0.0
        } else {
            hits.iter().map(|hit| hit.score).sum::<f32>() / hits.len() as f32
        };

        let chat_request = ChatRequest {
            system_prompt: prompts::system_prompt(&request.options),
            user_prompt: prompts::user_prompt(&contextualized, &context.text),
            max_tokens: self.llm.max_tokens,
            temperature: self.llm.temperature,
        };

        RetrievalPhase::Ready(Box::new(PreparedGeneration {
            chat_request,
            source_chunk_ids: chunk_ids,
            sources,
            metrics: QueryMetrics {
                retrieval_ms,
                assembly_ms,
                generation_ms: 0,
                chunks_retrieved: hits.len(),
                chunks_used: context.stats.chunks_included,
                tokens_estimated: context.stats.tokens_estimated,
                avg_relevance,
                provider_used: None,
                from_cache: false,
            },
        }))
    }

    /// Steps 7–10, non-streaming.
    async fn generate_phase(
        &self,
        request: &QueryRequest,
        prepared: PreparedGeneration,
    ) -> RagResponse {
        let deadline = self.request_deadline(request);
        let generation_started = Instant::now();
        let outcome = match self
            .chat
            .chat_with_deadline(&prepared.chat_request, deadline)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "generation failed");
                return RagResponse::failed("language model unavailable");
            }
        };

        let mut metrics = prepared.metrics;
        metrics.generation_ms = generation_started.elapsed().as_millis() as u64;
        metrics.provider_used = Some(outcome.provider);

        let response = RagResponse {
            status: ResponseStatus::Success,
            answer: Some(outcome.text),
            sources: prepared.sources,
            metrics,
            error: None,
        };

        self.record_and_cache(request, &response, &prepared.source_chunk_ids)
            .await;

        response
    }

    /// Steps 8–9: conversation append (best-effort) and cache write.
    async fn record_and_cache(
        &self,
        request: &QueryRequest,
        response: &RagResponse,
        source_chunk_ids: &[String],
    ) {
        if let (Some(conversation_id), Some(user_id), Some(answer)) = (
            request.conversation_id.as_ref(),
            request.user_id.as_ref(),
            response.answer.as_ref(),
        ) {
            if let Err(err) = self
                .conversations
                .append(
                    conversation_id,
                    &request.tenant_id,
                    user_id,
                    &request.query,
                    answer,
                    source_chunk_ids.to_vec(),
                )
                .await
            {
                warn!(
                    error = %err,
                    conversation_id = %conversation_id,
                    "conversation append failed after successful generation"
                );
            }
        }

        self.cache
            .put(&request.tenant_id, &request.query, response)
            .await;
    }

    async fn maybe_append_on_cache_hit(&self, request: &QueryRequest, cached: &RagResponse) {
        if !self.conversations.settings().append_on_cache_hit {
            return;
        }
        let (Some(conversation_id), Some(user_id), Some(answer)) = (
            request.conversation_id.as_ref(),
            request.user_id.as_ref(),
            cached.answer.as_ref(),
        ) else {
            return;
        };

        let chunk_ids: Vec<String> = cached
            .sources
            .iter()
            .map(|source| source.chunk_id.clone())
            .collect();
        if let Err(err) = self
            .conversations
            .append(
                conversation_id,
                &request.tenant_id,
                user_id,
                &request.query,
                answer,
                chunk_ids,
            )
            .await
        {
            warn!(error = %err, "conversation append on cache hit failed");
        }
    }

    /// Streaming variant: fragments as the provider emits them, then one
    /// Completed event. Dropping the stream mid-way cancels the provider
    /// stream and skips the conversation append and cache write.
    pub async fn answer_query_stream(
        &self,
        request: &QueryRequest,
    ) -> BoxStream<'static, StreamEvent> {
        let deadline = self.request_deadline(request);
        match timeout(deadline, self.prepare_stream(request)).await {
            Ok(stream) => stream,
            Err(_) => terminal_stream(RagResponse::failed("deadline exceeded")),
        }
    }

    async fn prepare_stream(&self, request: &QueryRequest) -> BoxStream<'static, StreamEvent> {
        let prepared = match self.retrieve_phase(request).await {
            RetrievalPhase::Resolved(response) => {
                let mut events = Vec::new();
                if let Some(answer) = response.answer.clone() {
                    events.push(StreamEvent::Fragment(answer));
                }
                events.push(StreamEvent::Completed(response));
                return futures::stream::iter(events).boxed();
            }
            RetrievalPhase::Ready(prepared) => *prepared,
        };

        let deadline = self.request_deadline(request);
        let generation_started = Instant::now();
        let (token_stream, provider) = match self
            .chat
            .chat_stream(&prepared.chat_request, deadline)
            .await
        {
            Ok(opened) => opened,
            Err(err) => {
                warn!(error = %err, "opening generation stream failed");
                return terminal_stream(RagResponse::failed("language model unavailable"));
            }
        };

        let conversations = Arc::clone(&self.conversations);
        let cache = self.cache.clone();
        let request = request.clone();
        let PreparedGeneration {
            sources,
            source_chunk_ids,
            mut metrics,
            ..
        } = prepared;
        metrics.provider_used = Some(provider);

        let events = stream! {
            let mut token_stream = token_stream;
            let mut answer = String::new();

            while let Some(item) = token_stream.next().await {
                match item {
                    Ok(fragment) => {
                        answer.push_str(&fragment);
                        yield StreamEvent::Fragment(fragment);
                    }
                    Err(err) => {
                        warn!(error = %err, "generation stream failed mid-way");
                        yield StreamEvent::Completed(RagResponse::failed(
                            "language model stream failed",
                        ));
                        return;
                    }
                }
            }

            metrics.generation_ms = generation_started.elapsed().as_millis() as u64;
            let response = RagResponse {
                status: ResponseStatus::Success,
                answer: Some(answer),
                sources,
                metrics,
                error: None,
            };

            // Post-stream side effects only run when the consumer drained us.
            if let (Some(conversation_id), Some(user_id), Some(answer)) = (
                request.conversation_id.as_ref(),
                request.user_id.as_ref(),
                response.answer.as_ref(),
            ) {
                if let Err(err) = conversations
                    .append(
                        conversation_id,
                        &request.tenant_id,
                        user_id,
                        &request.query,
                        answer,
                        source_chunk_ids.clone(),
                    )
                    .await
                {
                    warn!(error = %err, "conversation append after stream failed");
                }
            }
            cache.put(&request.tenant_id, &request.query, &response).await;

            yield StreamEvent::Completed(response);
        };

        events.boxed()
    }
}

fn excerpt_of(content: &str) -> String {
    if content.chars().count() <= EXCERPT_CHARS {
        return content.to_string();
    }
    let mut excerpt: String = content.chars().take(EXCERPT_CHARS).collect();
    excerpt.push('…');
    excerpt
}

fn terminal_stream(response: RagResponse) -> BoxStream<'static, StreamEvent> {
    futures::stream::iter(vec![StreamEvent::Completed(response)]).boxed()
}
