use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("state error: {0}")]
    State(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("sequence error: {0}")]
    Sequence(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ChainError {
    /// Errors that must not be retried against the same input.
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::Validation(_) | ChainError::Consensus(_) | ChainError::Config(_)
        )
    }
}

pub type ChainResult<T> = Result<T, ChainError>;
