#![allow(clippy::missing_docs_in_private_items)]

pub mod assembler;
pub mod optimizer;
pub mod orchestrator;
pub mod response_cache;

pub use orchestrator::{
    QueryMetrics, QueryOptions, QueryOrchestrator, QueryRequest, RagResponse, ResponseStatus,
    SourceChunk, StreamEvent,
};
