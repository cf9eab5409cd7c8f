use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use futures::StreamExt;

use crate::utils::config::ProviderSettings;

use super::{ChatBackend, ChatRequest, ChatTokenStream, EmbeddingBackend, ProviderError};

const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

fn client_for(settings: &ProviderSettings) -> Client<OpenAIConfig> {
    Client::with_config(
        OpenAIConfig::new()
            .with_api_key(&settings.api_key)
            .with_api_base(&settings.base_url),
    )
}

fn classify_openai_error(err: OpenAIError) -> ProviderError {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else if e.is_connect() {
                ProviderError::Unavailable(e.to_string())
            } else {
                match e.status().map(|s| s.as_u16()) {
                    Some(429) => ProviderError::RateLimited(e.to_string()),
                    Some(code) if code >= 500 => ProviderError::Unavailable(e.to_string()),
                    _ => ProviderError::Other(e.to_string()),
                }
            }
        }
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            let message = api.message.clone();
            let lowered = message.to_lowercase();
            if kind == "insufficient_quota" || lowered.contains("rate limit") {
                ProviderError::RateLimited(message)
            } else if kind == "server_error" || lowered.contains("overloaded") {
                ProviderError::Unavailable(message)
            } else {
                ProviderError::Other(message)
            }
        }
        other => ProviderError::Other(other.to_string()),
    }
}

/// Embeddings served through an OpenAI-compatible endpoint.
pub struct OpenAiEmbeddingBackend {
    id: String,
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbeddingBackend {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self {
            id: settings.id.clone(),
            client: client_for(settings),
            model: settings.model.clone(),
            dimensions: settings
                .dimensions
                .map(|d| d as usize)
                .unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddingBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(self.dimensions as u32)
            .input(texts.to_vec())
            .build()
            .map_err(classify_openai_error)?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(classify_openai_error)?;

        let mut data = response.data;
        data.sort_by_key(|entry| entry.index);

        if data.len() != texts.len() {
            return Err(ProviderError::Other(format!(
                "embedding count mismatch: asked {}, got {}",
                texts.len(),
                data.len()
            )));
        }

        Ok(data.into_iter().map(|entry| entry.embedding).collect())
    }

    async fn probe(&self) -> bool {
        self.embed_batch(&["ping".to_string()])
            .await
            .map(|vectors| {
                vectors
                    .first()
                    .is_some_and(|vector| vector.len() == self.dimensions)
            })
            .unwrap_or(false)
    }
}

/// Chat completion (blocking and streaming) through an OpenAI-compatible
/// endpoint.
pub struct OpenAiChatBackend {
    id: String,
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiChatBackend {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self {
            id: settings.id.clone(),
            client: client_for(settings),
            model: settings.model.clone(),
        }
    }

    fn build_request(
        &self,
        request: &ChatRequest,
    ) -> Result<CreateChatCompletionRequest, ProviderError> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&self.model).messages([
            ChatCompletionRequestSystemMessage::from(request.system_prompt.clone()).into(),
            ChatCompletionRequestUserMessage::from(request.user_prompt.clone()).into(),
        ]);
        if let Some(max_tokens) = request.max_tokens {
            builder.max_tokens(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            builder.temperature(temperature);
        }
        builder.build().map_err(classify_openai_error)
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let request = self.build_request(request)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify_openai_error)?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| ProviderError::Other("no content in chat response".to_string()))
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatTokenStream, ProviderError> {
        let request = self.build_request(request)?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(classify_openai_error)?;

        let fragments = stream.filter_map(|item| async move {
            match item {
                Ok(chunk) => chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                    .map(Ok),
                Err(err) => Some(Err(classify_openai_error(err))),
            }
        });

        Ok(Box::pin(fragments))
    }

    async fn probe(&self) -> bool {
        let probe_request = ChatRequest {
            system_prompt: "You are a health probe.".to_string(),
            user_prompt: "ping".to_string(),
            max_tokens: Some(1),
            temperature: Some(0.0),
        };
        self.chat(&probe_request).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(message: &str, kind: &str) -> OpenAIError {
        let api = serde_json::from_value(serde_json::json!({
            "message": message,
            "type": kind,
        }))
        .expect("deserialize ApiError");
        OpenAIError::ApiError(api)
    }

    #[test]
    fn api_error_classification() {
        let rate_limited =
            classify_openai_error(api_error("Rate limit reached for requests", "requests"));
        assert!(matches!(rate_limited, ProviderError::RateLimited(_)));

        let unavailable =
            classify_openai_error(api_error("The server is overloaded", "server_error"));
        assert!(matches!(unavailable, ProviderError::Unavailable(_)));

        let other = classify_openai_error(api_error("invalid model", "invalid_request_error"));
        assert!(matches!(other, ProviderError::Other(_)));
    }
}
