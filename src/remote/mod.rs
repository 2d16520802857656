pub mod dto;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Evaluation, EvaluationFilter};

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network failure, timeout, 5xx or a reply that could not be read.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("not found on remote store: {0}")]
    NotFound(String),

    #[error("conflict on remote store: {0}")]
    Conflict(String),

    #[error("remote store rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    /// Worth retrying later with the same payload.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// The shared evaluation store the sync client mirrors into.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn health(&self) -> Result<(), RemoteError>;
    /// Newest first, at most 100 records.
    async fn list(&self, filter: &EvaluationFilter) -> Result<Vec<Evaluation>, RemoteError>;
    async fn get(&self, id: &str) -> Result<Evaluation, RemoteError>;
    async fn create(&self, evaluation: &Evaluation) -> Result<Evaluation, RemoteError>;
    async fn delete(&self, id: &str) -> Result<(), RemoteError>;
    /// Upsert by id; returns how many records were written.
    async fn bulk_upsert(&self, evaluations: &[Evaluation]) -> Result<usize, RemoteError>;
}
