//! Scripted in-memory providers for tests. Deterministic, no network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{ChatBackend, ChatRequest, ChatTokenStream, EmbeddingBackend, ProviderError};

/// Embedding backend returning scripted vectors: per-text overrides with a
/// deterministic default, and an optional injected failure.
pub struct ScriptedEmbeddingBackend {
    id: String,
    dimensions: usize,
    default_vector: Vec<f32>,
    responses: Mutex<HashMap<String, Vec<f32>>>,
    failure: Mutex<Option<ProviderError>>,
    calls: AtomicUsize,
}

impl ScriptedEmbeddingBackend {
    pub fn new(id: &str, dimensions: usize) -> Self {
        let mut default_vector = vec![0.0; dimensions];
        if let Some(first) = default_vector.first_mut() {
            *first = 1.0;
        }
        Self {
            id: id.to_string(),
            dimensions,
            default_vector,
            responses: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_default_vector(id: &str, vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        Self {
            id: id.to_string(),
            dimensions,
            default_vector: vector,
            responses: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Pin the vector returned for one exact input text.
    pub fn script(&self, text: &str, vector: Vec<f32>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(text.to_string(), vector);
        }
    }

    pub fn set_failure(&self, error: ProviderError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(error);
        }
    }

    pub fn clear_failure(&self) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = None;
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingBackend for ScriptedEmbeddingBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        "test-model"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let injected = self.failure.lock().ok().and_then(|f| f.clone());
        if let Some(error) = injected {
            return Err(error);
        }

        let responses = self
            .responses
            .lock()
            .map_err(|_| ProviderError::Other("scripted responses poisoned".to_string()))?;

        Ok(texts
            .iter()
            .map(|text| {
                responses
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| self.default_vector.clone())
            })
            .collect())
    }

    async fn probe(&self) -> bool {
        self.failure.lock().map(|f| f.is_none()).unwrap_or(false)
    }
}

/// Chat backend returning a scripted reply, optionally failing or stalling.
pub struct ScriptedChatBackend {
    id: String,
    reply: Mutex<String>,
    failure: Mutex<Option<ProviderError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedChatBackend {
    pub fn new(id: &str, reply: &str) -> Self {
        Self {
            id: id.to_string(),
            reply: Mutex::new(reply.to_string()),
            failure: Mutex::new(None),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_reply(&self, reply: &str) {
        if let Ok(mut slot) = self.reply.lock() {
            *slot = reply.to_string();
        }
    }

    pub fn set_failure(&self, error: ProviderError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(error);
        }
    }

    pub fn clear_failure(&self) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = None;
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = Some(delay);
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self.failure.lock().ok().and_then(|f| f.clone());
        if let Some(error) = injected {
            return Err(error);
        }

        self.reply
            .lock()
            .map(|reply| reply.clone())
            .map_err(|_| ProviderError::Other("scripted reply poisoned".to_string()))
    }
}

#[async_trait]
impl ChatBackend for ScriptedChatBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, _request: &ChatRequest) -> Result<String, ProviderError> {
        self.respond().await
    }

    async fn chat_stream(&self, _request: &ChatRequest) -> Result<ChatTokenStream, ProviderError> {
        let reply = self.respond().await?;

        // Word-level fragments that concatenate back to the full reply.
        let mut fragments: Vec<Result<String, ProviderError>> = Vec::new();
        for (i, word) in reply.split_whitespace().enumerate() {
            if i == 0 {
                fragments.push(Ok(word.to_string()));
            } else {
                fragments.push(Ok(format!(" {word}")));
            }
        }

        Ok(futures::stream::iter(fragments).boxed())
    }

    async fn probe(&self) -> bool {
        self.failure.lock().map(|f| f.is_none()).unwrap_or(false)
    }
}
