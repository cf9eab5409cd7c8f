use chrono::Duration;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Queue state of a `document-uploaded` delivery. A lease that expires while
/// InFlight makes the event claimable again, which is what gives the queue
/// its at-least-once behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UploadEventStatus {
    Queued,
    InFlight,
}

stored_object!(UploadEvent, "upload_event", {
    tenant_id: String,
    document_id: String,
    user_id: String,
    storage_ref: String,
    content_type: String,
    status: UploadEventStatus,
    attempts: u32,
    worker_id: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    lease_expires_at: Option<DateTime<Utc>>
});

impl UploadEvent {
    pub fn new(
        tenant_id: String,
        document_id: String,
        user_id: String,
        storage_ref: String,
        content_type: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            document_id,
            user_id,
            storage_ref,
            content_type,
            status: UploadEventStatus::Queued,
            attempts: 0,
            worker_id: None,
            lease_expires_at: None,
        }
    }

    /// Enqueue a delivery. When this fails the caller falls back to
    /// processing the document synchronously.
    pub async fn publish(db: &SurrealDbClient, event: Self) -> Result<(), AppError> {
        db.store_item(event).await?;
        Ok(())
    }

    /// Claim the oldest ready event with an optimistic check-and-set. A
    /// worker that loses the race on one candidate simply tries the next.
    pub async fn claim_next(
        db: &SurrealDbClient,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Self>, AppError> {
        let now_value = surrealdb::sql::Datetime::from(now);
        let until_value = surrealdb::sql::Datetime::from(now + lease);

        let candidates: Vec<Self> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE status = $queued
                    OR (status = $in_flight
                        AND lease_expires_at != NONE
                        AND lease_expires_at < $now)
                 ORDER BY created_at ASC
                 LIMIT 5;",
            )
            .bind(("table", Self::table_name()))
            .bind(("queued", UploadEventStatus::Queued))
            .bind(("in_flight", UploadEventStatus::InFlight))
            .bind(("now", now_value.clone()))
            .await?
            .take(0)?;

        for candidate in candidates {
            let claimed: Vec<Self> = db
                .client
                .query(
                    "UPDATE type::thing('upload_event', $id)
                     SET status = $in_flight, attempts += 1, worker_id = $worker,
                         lease_expires_at = $until, updated_at = time::now()
                     WHERE status = $queued
                        OR (status = $in_flight
                            AND lease_expires_at != NONE
                            AND lease_expires_at < $now)
                     RETURN AFTER;",
                )
                .bind(("id", candidate.id.clone()))
                .bind(("queued", UploadEventStatus::Queued))
                .bind(("in_flight", UploadEventStatus::InFlight))
                .bind(("worker", worker_id.to_string()))
                .bind(("now", now_value.clone()))
                .bind(("until", until_value.clone()))
                .await?
                .take(0)?;

            if let Some(event) = claimed.into_iter().next() {
                return Ok(Some(event));
            }
        }

        Ok(None)
    }

    /// Acknowledge a processed delivery. Removing the row is what stops
    /// redelivery; the document status machine handles duplicates that were
    /// already claimed.
    pub async fn ack(db: &SurrealDbClient, event_id: &str) -> Result<(), AppError> {
        db.delete_item::<Self>(event_id).await?;
        Ok(())
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

    fn event(tenant: &str, document: &str) -> UploadEvent {
        UploadEvent::new(
            tenant.to_string(),
            document.to_string(),
            "user-1".to_string(),
            format!("{tenant}/{document}.txt"),
            "text/plain".to_string(),
        )
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_and_leases() {
        let db = test_db().await;

        let mut first = event("tenant-a", "doc-1");
        first.created_at = Utc::now() - Duration::seconds(10);
        let second = event("tenant-a", "doc-2");

        UploadEvent::publish(&db, first.clone())
            .await
            .expect("publish");
        UploadEvent::publish(&db, second).await.expect("publish");

        let claimed = UploadEvent::claim_next(&db, "worker-1", Utc::now(), Duration::seconds(30))
            .await
            .expect("claim")
            .expect("event available");

        assert_eq!(claimed.document_id, "doc-1");
        assert_eq!(claimed.status, UploadEventStatus::InFlight);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn test_claimed_event_not_reclaimable_during_lease() {
        let db = test_db().await;
        UploadEvent::publish(&db, event("tenant-a", "doc-1"))
            .await
            .expect("publish");

        let now = Utc::now();
        let first = UploadEvent::claim_next(&db, "worker-1", now, Duration::seconds(30))
            .await
            .expect("claim");
        assert!(first.is_some());

        let second = UploadEvent::claim_next(&db, "worker-2", now, Duration::seconds(30))
            .await
            .expect("claim");
        assert!(second.is_none(), "lease must block a second claim");
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let db = test_db().await;
        UploadEvent::publish(&db, event("tenant-a", "doc-1"))
            .await
            .expect("publish");

        let start = Utc::now();
        let first = UploadEvent::claim_next(&db, "worker-1", start, Duration::seconds(5))
            .await
            .expect("claim")
            .expect("claimed");
        assert_eq!(first.attempts, 1);

        let later = start + Duration::seconds(10);
        let redelivered = UploadEvent::claim_next(&db, "worker-2", later, Duration::seconds(5))
            .await
            .expect("claim")
            .expect("redelivered after lease expiry");
        assert_eq!(redelivered.document_id, "doc-1");
        assert_eq!(redelivered.attempts, 2);
        assert_eq!(redelivered.worker_id.as_deref(), Some("worker-2"));
    }

    #[tokio::test]
    async fn test_ack_stops_redelivery() {
        let db = test_db().await;
        UploadEvent::publish(&db, event("tenant-a", "doc-1"))
            .await
            .expect("publish");

        let claimed = UploadEvent::claim_next(&db, "worker-1", Utc::now(), Duration::seconds(0))
            .await
            .expect("claim")
            .expect("claimed");

        UploadEvent::ack(&db, &claimed.id).await.expect("ack");

        let after_ack = UploadEvent::claim_next(
            &db,
            "worker-2",
            Utc::now() + Duration::seconds(1),
            Duration::seconds(5),
        )
        .await
        .expect("claim");
        assert!(after_ack.is_none());
    }
}
