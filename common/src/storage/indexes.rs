use tracing::info;

use crate::{error::AppError, storage::db::SurrealDbClient};

/// Indexes that do not depend on the embedding dimension. Safe to re-run.
pub async fn ensure_base_indexes(db: &SurrealDbClient) -> Result<(), AppError> {
    db.client
        .query(
            "DEFINE INDEX IF NOT EXISTS idx_document_tenant ON TABLE document FIELDS tenant_id;
             DEFINE INDEX IF NOT EXISTS idx_document_status ON TABLE document FIELDS status;
             DEFINE INDEX IF NOT EXISTS idx_chunk_document ON TABLE document_chunk FIELDS tenant_id, document_id;
             DEFINE INDEX IF NOT EXISTS idx_chunk_ordinal ON TABLE document_chunk FIELDS document_id, ordinal UNIQUE;
             DEFINE INDEX IF NOT EXISTS idx_embedding_tenant_model ON TABLE chunk_embedding FIELDS tenant_id, model;
             DEFINE INDEX IF NOT EXISTS idx_upload_event_status ON TABLE upload_event FIELDS status;
             DEFINE INDEX IF NOT EXISTS idx_upload_event_created ON TABLE upload_event FIELDS created_at;
             DEFINE INDEX IF NOT EXISTS idx_conversation_tenant ON TABLE conversation FIELDS tenant_id;
             DEFINE INDEX IF NOT EXISTS idx_embedding_cache_tenant ON TABLE embedding_cache FIELDS tenant_id;
             DEFINE INDEX IF NOT EXISTS idx_response_cache_tenant ON TABLE response_cache FIELDS tenant_id;",
        )
        .await?
        .check()?;

    Ok(())
}

/// The HNSW index over stored vectors. Redefined at startup because its
/// dimension follows the configured embedding model.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<(), AppError> {
    db.client
        .query(format!(
            "DEFINE INDEX OVERWRITE idx_embedding_chunk_embedding ON TABLE chunk_embedding \
             FIELDS embedding HNSW DIMENSION {embedding_dimension} DIST COSINE TYPE F32 EFC 100 M 8;"
        ))
        .await?
        .check()?;

    info!(
        dimension = embedding_dimension,
        "vector index ready for configured embedding dimension"
    );

    Ok(())
}
