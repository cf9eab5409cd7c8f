use std::sync::Arc;
use std::time::Duration;

use common::{
    embedding::EmbeddingEngine,
    llm::{
        failover::EmbeddingFailover, openai::OpenAiEmbeddingBackend, EmbeddingBackend,
    },
    storage::{
        db::SurrealDbClient,
        indexes::{ensure_base_indexes, ensure_runtime_indexes},
        store::StorageManager,
    },
    utils::config::get_config,
};
use ingestion_pipeline::{run_worker_loop, DocumentPipeline};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    ensure_base_indexes(&db).await?;

    let embedding_primary: Arc<dyn EmbeddingBackend> =
        Arc::new(OpenAiEmbeddingBackend::from_settings(&config.embedding.primary));
    let embedding_fallback: Option<Arc<dyn EmbeddingBackend>> = config
        .embedding
        .fallback
        .as_ref()
        .map(|settings| Arc::new(OpenAiEmbeddingBackend::from_settings(settings)) as _);
    let embedding_failover = EmbeddingFailover::new(
        embedding_primary,
        embedding_fallback,
        Duration::from_secs(config.embedding.timeout_seconds),
    );

    ensure_runtime_indexes(&db, embedding_failover.dimensions()).await?;

    let engine = Arc::new(EmbeddingEngine::new(
        Arc::clone(&db),
        embedding_failover,
        config.embedding.clone(),
    ));

    info!(
        vector_store_healthy = db.is_healthy().await,
        embedding_provider_healthy = engine.probe().await,
        model = engine.model(),
        dimensions = engine.dimensions(),
        "startup health snapshot"
    );

    let storage = StorageManager::new(&config).await?;

    let pipeline = Arc::new(DocumentPipeline::new(
        Arc::clone(&db),
        storage,
        Arc::clone(&engine),
        config.ingestion.chunking.clone(),
    ));

    // Hourly sweep of expired embedding cache entries; reads evict lazily,
    // this keeps the table from accumulating cold garbage.
    let janitor_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tick.tick().await;
            if let Err(err) = janitor_engine.purge_expired_cache().await {
                warn!(error = %err, "embedding cache sweep failed");
            }
        }
    });

    run_worker_loop(db, pipeline, config.ingestion.worker_in_flight).await
}
