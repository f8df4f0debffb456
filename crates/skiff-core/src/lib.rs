//! # skiff-core
//! Chain primitives and collaborator interfaces consumed by the Skiff
//! address index: transaction and block types, flat block-file storage,
//! and the chain-view/event contract a host node implements.

pub mod blockfile;
pub mod chain;
pub mod constants;
pub mod error;
pub mod types;
