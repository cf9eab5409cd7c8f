use std::collections::HashMap;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(DocumentChunk, "document_chunk", {
    tenant_id: String,
    document_id: String,
    ordinal: u32,
    content: String,
    token_count: u32,
    start_char: u64,
    end_char: u64,
    metadata: HashMap<String, String>
});

impl DocumentChunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: String,
        document_id: String,
        ordinal: u32,
        content: String,
        token_count: u32,
        start_char: u64,
        end_char: u64,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            document_id,
            ordinal,
            content,
            token_count,
            start_char,
            end_char,
            metadata,
        }
    }

    /// Persist a document's chunks in one statement so a crash cannot leave a
    /// partial sequence behind.
    pub async fn insert_many(db: &SurrealDbClient, chunks: Vec<Self>) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }

        db.client
            .query("INSERT INTO document_chunk $chunks;")
            .bind(("chunks", chunks))
            .await?
            .check()?;

        Ok(())
    }

    /// All chunks of one document in ordinal order.
    pub async fn load_for_document(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let chunks: Vec<Self> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND document_id = $document_id
                 ORDER BY ordinal ASC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .take(0)?;

        Ok(chunks)
    }

    /// Hydrate chunks by id, tenant-scoped. Ids from other tenants simply do
    /// not come back.
    pub async fn load_many(
        db: &SurrealDbClient,
        tenant_id: &str,
        chunk_ids: &[String],
    ) -> Result<Vec<Self>, AppError> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let chunks: Vec<Self> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND record::id(id) INSIDE $chunk_ids;",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("chunk_ids", chunk_ids.to_vec()))
            .await?
            .take(0)?;

        Ok(chunks)
    }

    pub async fn delete_for_document(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "DELETE document_chunk
                 WHERE tenant_id = $tenant_id AND document_id = $document_id;",
            )
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .check()?;

        Ok(())
    }
}
