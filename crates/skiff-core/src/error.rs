//! Error types for the Skiff core crate.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockFileError {
    #[error("io: {0}")] Io(String),
    #[error("block file {0} not found")] FileNotFound(u32),
    #[error("decode at file {file} offset {offset}: {reason}")] Decode { file: u32, offset: u64, reason: String },
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("empty chain: no blocks connected")] EmptyChain,
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("block does not extend the current tip: {0}")] NotOnTip(String),
    #[error("missing UTXO while building undo data: {0}")] MissingUtxo(String),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] BlockFile(#[from] BlockFileError),
}
