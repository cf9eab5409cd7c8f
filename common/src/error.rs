use thiserror::Error;
use tokio::task::JoinError;

use crate::llm::ProviderError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Vector store unavailable: {0}")]
    VectorStore(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Tenant mismatch: {0}")]
    TenantMismatch(String),
    #[error("Extraction error: {0}")]
    Extraction(anyhow::Error),
    #[error("Empty document")]
    EmptyDocument,
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for failures caused by unreachable infrastructure rather than by
    /// the content being processed. The ingestion pipeline leaves documents in
    /// PROCESSING on these so a later redelivery can finish the work.
    pub fn is_transient_infrastructure(&self) -> bool {
        matches!(
            self,
            AppError::VectorStore(_) | AppError::Database(_) | AppError::DeadlineExceeded
        ) || matches!(self, AppError::Provider(p) if p.is_transient())
    }
}
