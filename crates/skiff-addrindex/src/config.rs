//! Address index configuration.
//!
//! Provides [`IndexConfig`] with the conventional on-disk location for
//! the index database: a sibling of the node's chain data under
//! `indexes/addrindex`.

use std::path::PathBuf;

/// Configuration for an address index instance.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Root directory for all persistent node data.
    pub data_dir: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skiff");
        Self { data_dir }
    }
}

impl IndexConfig {
    /// Configuration rooted at an explicit data directory.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Path to the RocksDB database backing the address index.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("indexes").join("addrindex")
    }
}
