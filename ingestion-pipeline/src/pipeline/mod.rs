mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    embedding::{ChunkEmbedStatus, EmbedChunksStatus, EmbeddingEngine},
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            document::{ChunkFailure, Document, DocumentStatus},
            document_chunk::DocumentChunk,
            outbound_event::OutboundEvent,
            upload_event::UploadEvent,
        },
    },
    utils::config::ChunkingSettings,
};
use state_machines::core::GuardError;
use tracing::{debug, info, warn, Instrument};

use crate::{
    chunker::{self, ChunkStrategy},
    extract,
};

use self::state::claimed;

fn stage_error(stage: &str, guard: &GuardError) -> AppError {
    AppError::Internal(format!(
        "document pipeline stage {stage} refused transition: {guard:?}"
    ))
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// How one processing attempt ended, status-machine-wise. Infrastructure
/// trouble is not a verdict; it propagates as an error and leaves the
/// document in PROCESSING for redelivery.
enum PipelineVerdict {
    Completed {
        chunk_count: u32,
    },
    Rejected {
        reason: String,
        chunk_failures: Vec<ChunkFailure>,
    },
}

/// Consumes `document-uploaded` deliveries and drives each document through
/// extract → chunk → embed, ending in COMPLETED or FAILED.
pub struct DocumentPipeline {
    db: Arc<SurrealDbClient>,
    bus: Arc<SurrealDbClient>,
    storage: StorageManager,
    engine: Arc<EmbeddingEngine>,
    chunking: ChunkingSettings,
}

impl DocumentPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        engine: Arc<EmbeddingEngine>,
        chunking: ChunkingSettings,
    ) -> Self {
        let bus = Arc::clone(&db);
        Self::with_bus(db, bus, storage, engine, chunking)
    }

    /// The queue may live on a separate connection than the entity store.
    pub fn with_bus(
        db: Arc<SurrealDbClient>,
        bus: Arc<SurrealDbClient>,
        storage: StorageManager,
        engine: Arc<EmbeddingEngine>,
        chunking: ChunkingSettings,
    ) -> Self {
        Self {
            db,
            bus,
            storage,
            engine,
            chunking,
        }
    }

    /// Upload entry point: persist the document and enqueue its event. When
    /// the bus is unreachable the same pipeline runs synchronously in the
    /// caller, no configuration involved.
    pub async fn ingest_document(&self, document: Document) -> Result<(), AppError> {
        let event = UploadEvent::new(
            document.tenant_id.clone(),
            document.id.clone(),
            document.user_id.clone(),
            document.storage_ref.clone(),
            document.content_type.clone(),
        );

        self.db.store_item(document).await?;

        match UploadEvent::publish(&self.bus, event.clone()).await {
            Ok(()) => {
                debug!(
                    tenant_id = %event.tenant_id,
                    document_id = %event.document_id,
                    "document queued for asynchronous processing"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    tenant_id = %event.tenant_id,
                    document_id = %event.document_id,
                    error = %err,
                    "message bus unreachable; processing document synchronously"
                );
                self.handle_event(&event).await
            }
        }
    }

    /// Operator entry: reset a FAILED document and run a fresh attempt.
    pub async fn reprocess_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<bool, AppError> {
        if !Document::request_reprocess(&self.db, tenant_id, document_id).await? {
            return Ok(false);
        }

        let document = Document::load(&self.db, tenant_id, document_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;

        let event = UploadEvent::new(
            document.tenant_id.clone(),
            document.id.clone(),
            document.user_id.clone(),
            document.storage_ref.clone(),
            document.content_type.clone(),
        );

        if let Err(err) = UploadEvent::publish(&self.bus, event.clone()).await {
            warn!(
                tenant_id = %tenant_id,
                document_id = %document_id,
                error = %err,
                "message bus unreachable; reprocessing synchronously"
            );
            self.handle_event(&event).await?;
        }

        Ok(true)
    }

    /// Process one delivery. Returning `Ok` means the event can be acked;
    /// an error means the delivery should happen again later.
    pub fn handle_event<'a>(
        &'a self,
        event: &'a UploadEvent,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), AppError>> + Send + 'a>> {
        let span = tracing::info_span!(
            "handle_event",
            tenant_id = %event.tenant_id,
            document_id = %event.document_id,
            attempt = event.attempts
        );
        Box::pin(self.handle_event_inner(event).instrument(span))
    }

    async fn handle_event_inner(&self, event: &UploadEvent) -> Result<(), AppError> {
        let document = match Document::load(&self.db, &event.tenant_id, &event.document_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                warn!("delivery for unknown document; acking");
                return Ok(());
            }
            Err(AppError::TenantMismatch(message)) => {
                warn!(%message, "delivery with mismatched tenant; acking");
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        // A PROCESSING document on a redelivered event means the previous
        // attempt died mid-flight (its lease expired); resume it. Any other
        // non-PENDING status is a duplicate delivery.
        let resumed = document.status == DocumentStatus::Processing && event.attempts > 1;
        if document.status != DocumentStatus::Pending && !resumed {
            info!(
                status = %document.status,
                "document already picked up; duplicate delivery acked"
            );
            return Ok(());
        }

        if resumed {
            info!("resuming document left in PROCESSING by an expired attempt");
        } else {
            let won = Document::transition_status(
                &self.db,
                &event.tenant_id,
                &event.document_id,
                DocumentStatus::Pending,
                DocumentStatus::Processing,
            )
            .await?;
            if !won {
                info!("lost the processing race; duplicate delivery acked");
                return Ok(());
            }
        }

        let started = Instant::now();
        match self.drive_pipeline(event, &document).await {
            Ok(PipelineVerdict::Completed { chunk_count }) => {
                Document::mark_completed(&self.db, &event.tenant_id, &event.document_id, chunk_count)
                    .await?;
                self.publish_outbound(OutboundEvent::embedding_completed(
                    &event.tenant_id,
                    &event.document_id,
                    chunk_count,
                ))
                .await;
                info!(
                    chunk_count,
                    total_ms = duration_millis(started.elapsed()),
                    "document processing finished"
                );
                Ok(())
            }
            Ok(PipelineVerdict::Rejected {
                reason,
                chunk_failures,
            }) => {
                Document::mark_failed(
                    &self.db,
                    &event.tenant_id,
                    &event.document_id,
                    &reason,
                    chunk_failures,
                )
                .await?;
                self.publish_outbound(OutboundEvent::document_failed(
                    &event.tenant_id,
                    &event.document_id,
                    &reason,
                ))
                .await;
                warn!(
                    %reason,
                    total_ms = duration_millis(started.elapsed()),
                    "document processing failed"
                );
                Ok(())
            }
            Err(err) if err.is_transient_infrastructure() => {
                warn!(
                    error = %err,
                    "transient infrastructure failure; document stays in PROCESSING for redelivery"
                );
                Err(err)
            }
            Err(err) => {
                let reason = "internal processing error".to_string();
                warn!(error = %err, "unexpected failure; marking document FAILED");
                Document::mark_failed(
                    &self.db,
                    &event.tenant_id,
                    &event.document_id,
                    &reason,
                    Vec::new(),
                )
                .await?;
                self.publish_outbound(OutboundEvent::document_failed(
                    &event.tenant_id,
                    &event.document_id,
                    &reason,
                ))
                .await;
                Ok(())
            }
        }
    }

    async fn drive_pipeline(
        &self,
        event: &UploadEvent,
        document: &Document,
    ) -> Result<PipelineVerdict, AppError> {
        let machine = claimed();

        // Extract.
        let stage_start = Instant::now();
        let bytes = match self.storage.get(&event.storage_ref).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = machine.abort();
                return Ok(PipelineVerdict::Rejected {
                    reason: format!("document could not be read: {err}"),
                    chunk_failures: Vec::new(),
                });
            }
        };
        let content_type = extract::resolve_content_type(&document.content_type, &event.storage_ref);
        let text = match extract::extract_text(&bytes, &content_type) {
            Ok(text) => text,
            Err(err) => {
                let _ = machine.abort();
                return Ok(PipelineVerdict::Rejected {
                    reason: err.to_string(),
                    chunk_failures: Vec::new(),
                });
            }
        };
        let machine = machine
            .extract()
            .map_err(|(_, guard)| stage_error("extract", &guard))?;
        let extract_ms = duration_millis(stage_start.elapsed());

        // Chunk and persist.
        let stage_start = Instant::now();
        let strategy = ChunkStrategy::from_settings(&self.chunking)?;
        let pieces = chunker::split_text(&text, strategy)?;
        if pieces.is_empty() {
            let _ = machine.abort();
            return Ok(PipelineVerdict::Rejected {
                reason: "empty document".to_string(),
                chunk_failures: Vec::new(),
            });
        }

        // A prior attempt may have left chunks or vectors behind; this keeps
        // redelivery and reprocessing idempotent.
        DocumentChunk::delete_for_document(&self.db, &event.tenant_id, &event.document_id).await?;
        self.engine
            .delete_document_vectors(&event.tenant_id, &event.document_id)
            .await?;

        let chunks: Vec<DocumentChunk> = pieces
            .into_iter()
            .map(|piece| {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert("title".to_string(), document.title.clone());
                metadata.insert("content_type".to_string(), content_type.to_string());
                metadata.insert("ordinal".to_string(), piece.ordinal.to_string());
                DocumentChunk::new(
                    event.tenant_id.clone(),
                    event.document_id.clone(),
                    piece.ordinal,
                    piece.content,
                    piece.token_count,
                    piece.start_char as u64,
                    piece.end_char as u64,
                    metadata,
                )
            })
            .collect();
        DocumentChunk::insert_many(&self.db, chunks.clone()).await?;
        let machine = machine
            .chunk()
            .map_err(|(_, guard)| stage_error("chunk", &guard))?;
        let chunk_ms = duration_millis(stage_start.elapsed());

        // Embed.
        let stage_start = Instant::now();
        let outcome = self.engine.embed_chunks(&event.tenant_id, &chunks).await?;
        let machine = machine
            .embed()
            .map_err(|(_, guard)| stage_error("embed", &guard))?;
        let embed_ms = duration_millis(stage_start.elapsed());

        info!(
            chunks = chunks.len(),
            extract_ms, chunk_ms, embed_ms,
            provider = outcome.provider.as_deref().unwrap_or("cache"),
            "document pipeline stages finished"
        );

        let chunk_failures: Vec<ChunkFailure> = outcome
            .results
            .iter()
            .filter_map(|result| match &result.status {
                ChunkEmbedStatus::Failed(error) => Some(ChunkFailure {
                    chunk_id: result.chunk_id.clone(),
                    ordinal: result.ordinal,
                    error: error.clone(),
                }),
                ChunkEmbedStatus::Success => None,
            })
            .collect();

        match outcome.status {
            EmbedChunksStatus::Complete => {
                let _machine = machine
                    .finish()
                    .map_err(|(_, guard)| stage_error("finish", &guard))?;
                Ok(PipelineVerdict::Completed {
                    chunk_count: chunks.len() as u32,
                })
            }
            EmbedChunksStatus::Partial => {
                let _ = machine.abort();
                Ok(PipelineVerdict::Rejected {
                    reason: format!(
                        "{} of {} chunks failed embedding",
                        chunk_failures.len(),
                        chunks.len()
                    ),
                    chunk_failures,
                })
            }
            EmbedChunksStatus::Failed => {
                let _ = machine.abort();
                Ok(PipelineVerdict::Rejected {
                    reason: "embedding failed for all chunks".to_string(),
                    chunk_failures,
                })
            }
        }
    }

    async fn publish_outbound(&self, event: OutboundEvent) {
        if let Err(err) = OutboundEvent::publish(&self.bus, event).await {
            warn!(error = %err, "outbound event publish failed; continuing");
        }
    }
}
