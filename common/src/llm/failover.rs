use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Future;
use tokio::time::timeout;
use tracing::warn;

use super::{ChatBackend, ChatRequest, ChatTokenStream, EmbeddingBackend, ProviderError};

/// Batch of vectors plus the provider that produced them.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    pub vectors: Vec<Vec<f32>>,
    pub provider: String,
}

/// Answer text plus the provider that produced it.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub provider: String,
}

async fn with_deadline<T>(
    deadline: Duration,
    provider_id: &str,
    fut: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(format!(
            "{provider_id} gave no response within {}s",
            deadline.as_secs()
        ))),
    }
}

/// Primary/fallback pair for embeddings. The fallback is attempted exactly
/// once, and only on transient primary failures.
pub struct EmbeddingFailover {
    primary: Arc<dyn EmbeddingBackend>,
    fallback: Option<Arc<dyn EmbeddingBackend>>,
    deadline: Duration,
    last_used: Mutex<Option<String>>,
}

impl EmbeddingFailover {
    pub fn new(
        primary: Arc<dyn EmbeddingBackend>,
        fallback: Option<Arc<dyn EmbeddingBackend>>,
        deadline: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            deadline,
            last_used: Mutex::new(None),
        }
    }

    /// The model name the index and caches are keyed by.
    pub fn model(&self) -> &str {
        self.primary.model()
    }

    pub fn dimensions(&self) -> usize {
        self.primary.dimensions()
    }

    /// Monitoring-only view of which provider served last.
    pub fn last_used(&self) -> Option<String> {
        self.last_used
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(None)
    }

    fn record(&self, provider: &str) {
        if let Ok(mut slot) = self.last_used.lock() {
            *slot = Some(provider.to_string());
        }
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<EmbedOutcome, ProviderError> {
        let primary_id = self.primary.id().to_string();
        match with_deadline(self.deadline, &primary_id, self.primary.embed_batch(texts)).await {
            Ok(vectors) => {
                self.record(&primary_id);
                Ok(EmbedOutcome {
                    vectors,
                    provider: primary_id,
                })
            }
            Err(primary_err) if primary_err.is_transient() => {
                let Some(fallback) = self.fallback.as_ref() else {
                    return Err(primary_err);
                };
                let fallback_id = fallback.id().to_string();
                warn!(
                    primary = %primary_id,
                    fallback = %fallback_id,
                    error = %primary_err,
                    "embedding primary failed, trying fallback"
                );
                match with_deadline(self.deadline, &fallback_id, fallback.embed_batch(texts)).await
                {
                    Ok(vectors) => {
                        self.record(&fallback_id);
                        Ok(EmbedOutcome {
                            vectors,
                            provider: fallback_id,
                        })
                    }
                    Err(fallback_err) => Err(primary_err.with_fallback_cause(&fallback_err)),
                }
            }
            Err(primary_err) => Err(primary_err),
        }
    }

    pub async fn probe(&self) -> bool {
        self.primary.probe().await
            || match self.fallback.as_ref() {
                Some(fallback) => fallback.probe().await,
                None => false,
            }
    }
}

/// Primary/fallback pair for chat, blocking and streaming.
pub struct ChatFailover {
    primary: Arc<dyn ChatBackend>,
    fallback: Option<Arc<dyn ChatBackend>>,
    deadline: Duration,
    last_used: Mutex<Option<String>>,
}

impl ChatFailover {
    pub fn new(
        primary: Arc<dyn ChatBackend>,
        fallback: Option<Arc<dyn ChatBackend>>,
        deadline: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            deadline,
            last_used: Mutex::new(None),
        }
    }

    pub fn last_used(&self) -> Option<String> {
        self.last_used
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(None)
    }

    fn record(&self, provider: &str) {
        if let Ok(mut slot) = self.last_used.lock() {
            *slot = Some(provider.to_string());
        }
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, ProviderError> {
        self.chat_with_deadline(request, self.deadline).await
    }

    /// Same as [`chat`](Self::chat) with a caller-supplied deadline, used by
    /// the query path to honor per-request timeouts.
    pub async fn chat_with_deadline(
        &self,
        request: &ChatRequest,
        deadline: Duration,
    ) -> Result<ChatOutcome, ProviderError> {
        let primary_id = self.primary.id().to_string();
        match with_deadline(deadline, &primary_id, self.primary.chat(request)).await {
            Ok(text) => {
                self.record(&primary_id);
                Ok(ChatOutcome {
                    text,
                    provider: primary_id,
                })
            }
            Err(primary_err) if primary_err.is_transient() => {
                let Some(fallback) = self.fallback.as_ref() else {
                    return Err(primary_err);
                };
                let fallback_id = fallback.id().to_string();
                warn!(
                    primary = %primary_id,
                    fallback = %fallback_id,
                    error = %primary_err,
                    "chat primary failed, trying fallback"
                );
                match with_deadline(deadline, &fallback_id, fallback.chat(request)).await {
                    Ok(text) => {
                        self.record(&fallback_id);
                        Ok(ChatOutcome {
                            text,
                            provider: fallback_id,
                        })
                    }
                    Err(fallback_err) => Err(primary_err.with_fallback_cause(&fallback_err)),
                }
            }
            Err(primary_err) => Err(primary_err),
        }
    }

    /// Open a token stream. The deadline covers opening the stream; once the
    /// stream is live, cancellation is the consumer dropping it.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
        deadline: Duration,
    ) -> Result<(ChatTokenStream, String), ProviderError> {
        let primary_id = self.primary.id().to_string();
        match with_deadline(deadline, &primary_id, self.primary.chat_stream(request)).await {
            Ok(stream) => {
                self.record(&primary_id);
                Ok((stream, primary_id))
            }
            Err(primary_err) if primary_err.is_transient() => {
                let Some(fallback) = self.fallback.as_ref() else {
                    return Err(primary_err);
                };
                let fallback_id = fallback.id().to_string();
                warn!(
                    primary = %primary_id,
                    fallback = %fallback_id,
                    error = %primary_err,
                    "chat stream primary failed, trying fallback"
                );
                match with_deadline(deadline, &fallback_id, fallback.chat_stream(request)).await {
                    Ok(stream) => {
                        self.record(&fallback_id);
                        Ok((stream, fallback_id))
                    }
                    Err(fallback_err) => Err(primary_err.with_fallback_cause(&fallback_err)),
                }
            }
            Err(primary_err) => Err(primary_err),
        }
    }

    pub async fn probe(&self) -> bool {
        self.primary.probe().await
            || match self.fallback.as_ref() {
                Some(fallback) => fallback.probe().await,
                None => false,
            }
    }
}
