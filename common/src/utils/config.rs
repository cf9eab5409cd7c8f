use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// A single OpenAI-compatible endpoint plus the model served through it.
#[derive(Clone, Deserialize, Debug)]
pub struct ProviderSettings {
    pub id: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub dimensions: Option<u32>,
}

fn default_chat_provider() -> ProviderSettings {
    ProviderSettings {
        id: "chat-primary".to_string(),
        base_url: default_base_url(),
        api_key: String::new(),
        model: "gpt-4o-mini".to_string(),
        dimensions: None,
    }
}

fn default_embedding_provider() -> ProviderSettings {
    ProviderSettings {
        id: "embedding-primary".to_string(),
        base_url: default_base_url(),
        api_key: String::new(),
        model: "text-embedding-3-small".to_string(),
        dimensions: Some(1536),
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct ContextSettings {
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
}

#[derive(Clone, Deserialize, Debug)]
pub struct RagSettings {
    #[serde(default)]
    pub context: ContextSettings,
}

#[derive(Clone, Deserialize, Debug)]
pub struct LlmSettings {
    #[serde(default = "default_chat_provider")]
    pub default_provider: ProviderSettings,
    #[serde(default)]
    pub fallback_provider: Option<ProviderSettings>,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct ConversationSettings {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    #[serde(default = "default_true")]
    pub enable_context: bool,
    /// Whether a response served from the cache still appends to the
    /// conversation history. Off by default: a cache hit re-answers an
    /// already-recorded question.
    #[serde(default)]
    pub append_on_cache_hit: bool,
}

#[derive(Clone, Deserialize, Debug)]
pub struct OptimizationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_true")]
    pub expand_acronyms: bool,
    #[serde(default)]
    pub remove_stopwords: bool,
}

#[derive(Clone, Deserialize, Debug, Default)]
pub struct QuerySettings {
    #[serde(default)]
    pub optimization: OptimizationSettings,
}

#[derive(Clone, Deserialize, Debug)]
pub struct EmbeddingSettings {
    #[serde(default = "default_embedding_provider")]
    pub primary: ProviderSettings,
    #[serde(default)]
    pub fallback: Option<ProviderSettings>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: i64,
    #[serde(default = "default_per_tenant_concurrency")]
    pub per_tenant_concurrency: usize,
    #[serde(default = "default_llm_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Clone, Deserialize, Debug)]
pub struct ChunkingSettings {
    #[serde(default = "default_chunk_strategy")]
    pub strategy: String,
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_window_tokens")]
    pub window_tokens: usize,
    #[serde(default = "default_stride_tokens")]
    pub stride_tokens: usize,
}

#[derive(Clone, Deserialize, Debug)]
pub struct IngestionSettings {
    /// Upper bound on documents processed concurrently by one worker.
    #[serde(default = "default_worker_in_flight")]
    pub worker_in_flight: usize,
    #[serde(default)]
    pub chunking: ChunkingSettings,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default)]
    pub rag: RagSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub conversation: ConversationSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    #[serde(default)]
    pub ingestion: IngestionSettings,
}

fn default_true() -> bool {
    true
}

fn default_context_max_tokens() -> usize {
    4000
}

fn default_relevance_threshold() -> f32 {
    0.7
}

fn default_llm_timeout_seconds() -> u64 {
    30
}

fn default_max_history() -> usize {
    20
}

fn default_context_window() -> usize {
    5
}

fn default_ttl_hours() -> i64 {
    24
}

fn default_min_length() -> usize {
    3
}

fn default_batch_size() -> usize {
    32
}

fn default_cache_ttl_seconds() -> i64 {
    3600
}

fn default_per_tenant_concurrency() -> usize {
    4
}

fn default_worker_in_flight() -> usize {
    4
}

fn default_chunk_strategy() -> String {
    "semantic".to_string()
}

fn default_target_tokens() -> usize {
    400
}

fn default_overlap_tokens() -> usize {
    40
}

fn default_min_tokens() -> usize {
    64
}

fn default_max_tokens() -> usize {
    512
}

fn default_window_tokens() -> usize {
    400
}

fn default_stride_tokens() -> usize {
    200
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_context_max_tokens(),
            relevance_threshold: default_relevance_threshold(),
            include_metadata: true,
        }
    }
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            context: ContextSettings::default(),
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_provider: default_chat_provider(),
            fallback_provider: None,
            timeout_seconds: default_llm_timeout_seconds(),
            max_tokens: None,
            temperature: None,
        }
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            context_window: default_context_window(),
            ttl_hours: default_ttl_hours(),
            enable_context: true,
            append_on_cache_hit: false,
        }
    }
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_length: default_min_length(),
            expand_acronyms: true,
            remove_stopwords: false,
        }
    }
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            primary: default_embedding_provider(),
            fallback: None,
            batch_size: default_batch_size(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            per_tenant_concurrency: default_per_tenant_concurrency(),
            timeout_seconds: default_llm_timeout_seconds(),
        }
    }
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            strategy: default_chunk_strategy(),
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            window_tokens: default_window_tokens(),
            stride_tokens: default_stride_tokens(),
        }
    }
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            worker_in_flight: default_worker_in_flight(),
            chunking: ChunkingSettings::default(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    config.try_deserialize()
}
