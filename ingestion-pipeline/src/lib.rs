#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunker;
pub mod extract;
pub mod pipeline;

pub use pipeline::DocumentPipeline;

use std::sync::Arc;

use chrono::Utc;
use common::storage::{db::SurrealDbClient, types::upload_event::UploadEvent};
use tokio::{
    sync::Semaphore,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// How long a claimed delivery stays invisible to other workers before it is
/// considered abandoned and redelivered.
pub const DEFAULT_LEASE_SECS: i64 = 120;

/// Claim-and-process loop over `document-uploaded` deliveries. `in_flight`
/// bounds concurrent documents per worker; the loop does not prefetch beyond
/// that, so a slow embedding provider slows claiming instead of growing
/// memory.
pub async fn run_worker_loop(
    bus: Arc<SurrealDbClient>,
    pipeline: Arc<DocumentPipeline>,
    in_flight: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker_id = format!("document-worker-{}", Uuid::new_v4());
    let lease = chrono::Duration::seconds(DEFAULT_LEASE_SECS);
    let limiter = Arc::new(Semaphore::new(in_flight.max(1)));
    let idle_backoff = Duration::from_millis(500);

    info!(%worker_id, in_flight, "document worker started");

    loop {
        let permit = Arc::clone(&limiter).acquire_owned().await?;

        match UploadEvent::claim_next(&bus, &worker_id, Utc::now(), lease).await {
            Ok(Some(event)) => {
                info!(
                    %worker_id,
                    tenant_id = %event.tenant_id,
                    document_id = %event.document_id,
                    attempt = event.attempts,
                    "claimed document event"
                );
                let pipeline = Arc::clone(&pipeline);
                let bus = Arc::clone(&bus);
                tokio::spawn(async move {
                    let _in_flight = permit;
                    match pipeline.handle_event(&event).await {
                        Ok(()) => {
                            if let Err(err) = UploadEvent::ack(&bus, &event.id).await {
                                error!(
                                    event_id = %event.id,
                                    error = %err,
                                    "failed to ack processed event; it may be redelivered"
                                );
                            }
                        }
                        Err(err) => {
                            error!(
                                tenant_id = %event.tenant_id,
                                document_id = %event.document_id,
                                error = %err,
                                "document event failed; leaving for redelivery"
                            );
                        }
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                sleep(idle_backoff).await;
            }
            Err(err) => {
                drop(permit);
                error!(%worker_id, error = %err, "failed to claim document event");
                warn!("backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
