//! Error types for the address index.
use thiserror::Error;

use skiff_core::error::{BlockFileError, ChainError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("storage: {0}")] Storage(String),
    #[error("block read: {0}")] BlockRead(String),
    #[error("undo data unavailable: {0}")] UndoUnavailable(String),
    #[error("index is not running")] NotRunning,
    #[error("invariant violation: {0}")] InvariantViolation(String),
}

impl From<BlockFileError> for IndexError {
    fn from(e: BlockFileError) -> Self {
        Self::BlockRead(e.to_string())
    }
}

impl From<ChainError> for IndexError {
    fn from(e: ChainError) -> Self {
        Self::BlockRead(e.to_string())
    }
}
