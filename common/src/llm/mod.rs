pub mod failover;
pub mod openai;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Transient-vs-terminal classification of provider failures. The failover
/// and retry layers branch on the kind, never on message text.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("provider timed out: {0}")]
    Timeout(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider rate limited: {0}")]
    RateLimited(String),
    #[error("provider stream failed: {0}")]
    Stream(String),
    #[error("provider call failed: {0}")]
    Other(String),
}

impl ProviderError {
    /// Errors worth a fallback attempt or a retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::Unavailable(_)
                | ProviderError::RateLimited(_)
        )
    }

    /// Keep the primary error's kind, attach what the fallback said.
    pub(crate) fn with_fallback_cause(self, fallback: &ProviderError) -> Self {
        let attach = |message: String| format!("{message} (fallback: {fallback})");
        match self {
            ProviderError::Timeout(m) => ProviderError::Timeout(attach(m)),
            ProviderError::Unavailable(m) => ProviderError::Unavailable(attach(m)),
            ProviderError::RateLimited(m) => ProviderError::RateLimited(attach(m)),
            ProviderError::Stream(m) => ProviderError::Stream(attach(m)),
            ProviderError::Other(m) => ProviderError::Other(attach(m)),
        }
    }
}

/// One grounded generation request: a system prompt plus the already-built
/// user prompt (question + assembled context).
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Lazy, finite, single-pass sequence of response fragments in emission
/// order. Dropping it cancels the underlying provider stream.
pub type ChatTokenStream = BoxStream<'static, Result<String, ProviderError>>;

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn id(&self) -> &str;
    fn model(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
    /// Minimal health call; must not change observable provider state.
    async fn probe(&self) -> bool;
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;
    async fn chat(&self, request: &ChatRequest) -> Result<String, ProviderError>;
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatTokenStream, ProviderError>;
    async fn probe(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout("t".into()).is_transient());
        assert!(ProviderError::Unavailable("u".into()).is_transient());
        assert!(ProviderError::RateLimited("r".into()).is_transient());
        assert!(!ProviderError::Other("o".into()).is_transient());
        assert!(!ProviderError::Stream("s".into()).is_transient());
    }

    #[test]
    fn fallback_cause_keeps_primary_kind() {
        let primary = ProviderError::Unavailable("primary down".into());
        let fallback = ProviderError::RateLimited("fallback limited".into());
        let combined = primary.with_fallback_cause(&fallback);

        assert!(matches!(combined, ProviderError::Unavailable(_)));
        assert!(combined.to_string().contains("fallback limited"));
    }
}
