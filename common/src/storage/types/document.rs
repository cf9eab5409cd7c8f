use tracing::warn;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Lifecycle of an uploaded document. FAILED is terminal from the pipeline's
/// point of view; an operator reprocess creates a fresh PENDING attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DocumentStatus::Pending => "Pending",
            DocumentStatus::Processing => "Processing",
            DocumentStatus::Completed => "Completed",
            DocumentStatus::Failed => "Failed",
        };
        f.write_str(label)
    }
}

/// Per-chunk embedding failure retained on a FAILED document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub ordinal: u32,
    pub error: String,
}

stored_object!(Document, "document", {
    tenant_id: String,
    user_id: String,
    title: String,
    storage_ref: String,
    content_type: String,
    status: DocumentStatus,
    chunk_count: u32,
    failure_reason: Option<String>,
    chunk_failures: Vec<ChunkFailure>
});

impl Document {
    pub fn new(
        tenant_id: String,
        user_id: String,
        title: String,
        storage_ref: String,
        content_type: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            user_id,
            title,
            storage_ref,
            content_type,
            status: DocumentStatus::Pending,
            chunk_count: 0,
            failure_reason: None,
            chunk_failures: Vec::new(),
        }
    }

    /// Tenant-scoped load. A record owned by another tenant is rejected, not
    /// returned.
    pub async fn load(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let document: Option<Self> = db.get_item(document_id).await?;

        match document {
            Some(doc) if doc.tenant_id != tenant_id => {
                warn!(
                    caller_tenant = %tenant_id,
                    owner_tenant = %doc.tenant_id,
                    document_id = %document_id,
                    "cross-tenant document access rejected"
                );
                Err(AppError::TenantMismatch(format!(
                    "document {document_id} is not owned by tenant {tenant_id}"
                )))
            }
            other => Ok(other),
        }
    }

    /// Optimistic check-and-set status transition. Returns false when another
    /// writer got there first; losing the race is not an error.
    pub async fn transition_status(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> Result<bool, AppError> {
        let mut response = db
            .client
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = $to, updated_at = time::now()
                 WHERE tenant_id = $tenant_id AND status = $from
                 RETURN AFTER;",
            )
            .bind(("id", document_id.to_string()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("from", from))
            .bind(("to", to))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Completion: PROCESSING → COMPLETED plus the final chunk count.
    pub async fn mark_completed(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
        chunk_count: u32,
    ) -> Result<bool, AppError> {
        let mut response = db
            .client
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = $to, chunk_count = $chunk_count, updated_at = time::now()
                 WHERE tenant_id = $tenant_id AND status = $from
                 RETURN AFTER;",
            )
            .bind(("id", document_id.to_string()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("from", DocumentStatus::Processing))
            .bind(("to", DocumentStatus::Completed))
            .bind(("chunk_count", chunk_count))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Failure: PROCESSING → FAILED with a cause and any per-chunk errors.
    pub async fn mark_failed(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
        reason: &str,
        chunk_failures: Vec<ChunkFailure>,
    ) -> Result<bool, AppError> {
        let mut response = db
            .client
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = $to, failure_reason = $reason, chunk_failures = $chunk_failures,
                     updated_at = time::now()
                 WHERE tenant_id = $tenant_id AND status = $from
                 RETURN AFTER;",
            )
            .bind(("id", document_id.to_string()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("from", DocumentStatus::Processing))
            .bind(("to", DocumentStatus::Failed))
            .bind(("reason", reason.to_string()))
            .bind(("chunk_failures", chunk_failures))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Operator-requested fresh attempt after a terminal failure. Not a
    /// state-machine transition: failure details are cleared and the document
    /// re-enters the pipeline as if newly uploaded.
    pub async fn request_reprocess(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<bool, AppError> {
        let mut response = db
            .client
            .query(
                "UPDATE type::thing('document', $id)
                 SET status = $to, failure_reason = NONE, chunk_failures = [],
                     chunk_count = 0, updated_at = time::now()
                 WHERE tenant_id = $tenant_id AND status = $from
                 RETURN AFTER;",
            )
            .bind(("id", document_id.to_string()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("from", DocumentStatus::Failed))
            .bind(("to", DocumentStatus::Pending))
            .await?;

        let updated: Vec<Self> = response.take(0)?;
        Ok(!updated.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    fn test_document(tenant: &str) -> Document {
        Document::new(
            tenant.to_string(),
            "user-1".to_string(),
            "Handbook".to_string(),
            format!("{tenant}/handbook.txt"),
            "text/plain".to_string(),
        )
    }

    #[tokio::test]
    async fn test_transition_cas_wins_once() {
        let db = test_db().await;
        let doc = test_document("tenant-a");
        let doc_id = doc.id.clone();
        db.store_item(doc).await.expect("store document");

        let first = Document::transition_status(
            &db,
            "tenant-a",
            &doc_id,
            DocumentStatus::Pending,
            DocumentStatus::Processing,
        )
        .await
        .expect("first transition");
        assert!(first, "first CAS should win");

        let second = Document::transition_status(
            &db,
            "tenant-a",
            &doc_id,
            DocumentStatus::Pending,
            DocumentStatus::Processing,
        )
        .await
        .expect("second transition");
        assert!(!second, "losing CAS is observable, not an error");
    }

    #[tokio::test]
    async fn test_transition_rejects_other_tenant() {
        let db = test_db().await;
        let doc = test_document("tenant-a");
        let doc_id = doc.id.clone();
        db.store_item(doc).await.expect("store document");

        let crossed = Document::transition_status(
            &db,
            "tenant-b",
            &doc_id,
            DocumentStatus::Pending,
            DocumentStatus::Processing,
        )
        .await
        .expect("transition call");
        assert!(!crossed, "another tenant must not move the status");

        let reloaded = Document::load(&db, "tenant-a", &doc_id)
            .await
            .expect("load")
            .expect("document present");
        assert_eq!(reloaded.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn test_load_cross_tenant_is_mismatch() {
        let db = test_db().await;
        let doc = test_document("tenant-a");
        let doc_id = doc.id.clone();
        db.store_item(doc).await.expect("store document");

        let result = Document::load(&db, "tenant-b", &doc_id).await;
        assert!(matches!(result, Err(AppError::TenantMismatch(_))));
    }

    #[tokio::test]
    async fn test_mark_failed_then_reprocess() {
        let db = test_db().await;
        let doc = test_document("tenant-a");
        let doc_id = doc.id.clone();
        db.store_item(doc).await.expect("store document");

        Document::transition_status(
            &db,
            "tenant-a",
            &doc_id,
            DocumentStatus::Pending,
            DocumentStatus::Processing,
        )
        .await
        .expect("to processing");

        let failed = Document::mark_failed(&db, "tenant-a", &doc_id, "empty document", vec![])
            .await
            .expect("mark failed");
        assert!(failed);

        let reloaded = Document::load(&db, "tenant-a", &doc_id)
            .await
            .expect("load")
            .expect("document present");
        assert_eq!(reloaded.status, DocumentStatus::Failed);
        assert_eq!(reloaded.failure_reason.as_deref(), Some("empty document"));

        let reset = Document::request_reprocess(&db, "tenant-a", &doc_id)
            .await
            .expect("reprocess");
        assert!(reset);

        let fresh = Document::load(&db, "tenant-a", &doc_id)
            .await
            .expect("load")
            .expect("document present");
        assert_eq!(fresh.status, DocumentStatus::Pending);
        assert!(fresh.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_reprocess_requires_failed() {
        let db = test_db().await;
        let doc = test_document("tenant-a");
        let doc_id = doc.id.clone();
        db.store_item(doc).await.expect("store document");

        let reset = Document::request_reprocess(&db, "tenant-a", &doc_id)
            .await
            .expect("reprocess call");
        assert!(!reset, "PENDING documents are not reprocessable");
    }
}
