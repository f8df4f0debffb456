//! RocksDB adapter for the index database.
//!
//! A thin layer over the ordered key-value engine: batched atomic
//! writes, prefix-scoped iteration, and the two singletons (hash seed,
//! best-block locator). All entry keys live in the `index` column
//! family; the locator lives in `metadata` so the entry keyspace stays
//! exactly the documented byte layout.

use std::path::Path;

use rocksdb::{
    ColumnFamilyDescriptor, DBIteratorWithThreadMode, Direction, IteratorMode, Options,
    WriteBatch, DB,
};

use skiff_core::chain::BlockLocator;

use crate::error::IndexError;
use crate::keys::{IndexKey, INDEX_TAG};

const CF_INDEX: &str = "index";
const CF_METADATA: &str = "metadata";

const ALL_CFS: &[&str] = &[CF_INDEX, CF_METADATA];

const META_BEST_BLOCK: &[u8] = b"best_block";

/// RocksDB-backed store for index records.
pub(crate) struct IndexStore {
    db: DB,
}

impl IndexStore {
    /// Open or create the index database at the given path.
    pub(crate) fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(Self { db })
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, IndexError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| IndexError::Storage(format!("missing column family: {name}")))
    }

    // --- Singletons ---

    /// Read the hash-seed record, if present.
    pub(crate) fn seed(&self) -> Result<Option<Vec<u8>>, IndexError> {
        let cf = self.cf_handle(CF_INDEX)?;
        self.db
            .get_cf(&cf, IndexKey::Seed.encode())
            .map_err(|e| IndexError::Storage(e.to_string()))
    }

    /// Write the hash-seed record. Called exactly once, at first open.
    pub(crate) fn put_seed(&self, seed: &[u8]) -> Result<(), IndexError> {
        let cf = self.cf_handle(CF_INDEX)?;
        self.db
            .put_cf(&cf, IndexKey::Seed.encode(), seed)
            .map_err(|e| IndexError::Storage(e.to_string()))
    }

    /// Read the persisted best-block locator. An absent record means the
    /// index has never ingested a block.
    pub(crate) fn best_block(&self) -> Result<BlockLocator, IndexError> {
        let cf = self.cf_handle(CF_METADATA)?;
        let raw = self
            .db
            .get_cf(&cf, META_BEST_BLOCK)
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        match raw {
            Some(bytes) => bincode::decode_from_slice(&bytes, bincode::config::standard())
                .map(|(locator, _)| locator)
                .map_err(|e| IndexError::Storage(format!("best_block decode: {e}"))),
            None => Ok(BlockLocator::default()),
        }
    }

    // --- Batched writes ---

    /// Atomically apply one block's worth of changes: entry writes,
    /// entry erasures, and the new best-block locator. Either everything
    /// becomes visible or nothing does.
    pub(crate) fn write_batch(
        &self,
        writes: &[(Vec<u8>, Vec<u8>)],
        erasures: &[Vec<u8>],
        locator: &BlockLocator,
    ) -> Result<(), IndexError> {
        let cf_index = self.cf_handle(CF_INDEX)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for (key, value) in writes {
            batch.put_cf(cf_index, key, value);
        }
        for key in erasures {
            batch.delete_cf(cf_index, key);
        }
        let locator_bytes = bincode::encode_to_vec(locator, bincode::config::standard())
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        batch.put_cf(cf_meta, META_BEST_BLOCK, locator_bytes);

        self.db
            .write(batch)
            .map_err(|e| IndexError::Storage(e.to_string()))
    }

    // --- Iteration ---

    /// Lazy scan over every key starting with `prefix`, in lexicographic
    /// order. Finite and non-restartable; an engine error terminates the
    /// scan and surfaces as a storage failure.
    pub(crate) fn prefix_scan(&self, prefix: Vec<u8>) -> Result<PrefixScan<'_>, IndexError> {
        let cf = self.cf_handle(CF_INDEX)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        Ok(PrefixScan {
            iter,
            prefix,
            done: false,
        })
    }

    /// Scan the full tagged keyspace: every entry plus the seed record.
    /// Used by the disconnect fallback to erase by disk position.
    pub(crate) fn scan_all(&self) -> Result<PrefixScan<'_>, IndexError> {
        self.prefix_scan(vec![INDEX_TAG])
    }
}

/// Snapshot-style iterator over one key prefix.
pub(crate) struct PrefixScan<'a> {
    iter: DBIteratorWithThreadMode<'a, DB>,
    prefix: Vec<u8>,
    done: bool,
}

impl Iterator for PrefixScan<'_> {
    type Item = Result<(Box<[u8]>, Box<[u8]>), IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.iter.next() {
            Some(Ok((key, value))) => {
                if key.starts_with(&self.prefix) {
                    Some(Ok((key, value)))
                } else {
                    self.done = true;
                    None
                }
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(IndexError::Storage(e.to_string())))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{EntryKind, IndexValue};
    use skiff_core::blockfile::DiskTxPos;
    use skiff_core::types::{Hash256, OutPoint, Script};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn temp_store() -> (IndexStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(dir.path().join("addrindex")).unwrap();
        (store, dir)
    }

    fn entry(addr_id: u32, kind: EntryKind, seed: u8, vout: u32) -> (Vec<u8>, Vec<u8>) {
        let key = IndexKey::Full {
            addr_id,
            kind,
            outpoint: OutPoint { txid: Hash256([seed; 32]), vout },
        };
        let value = IndexValue {
            pos: DiskTxPos { file: 0, block_offset: 4, tx_offset: vout as u64 },
            script: Script::new(vec![seed]),
        };
        (key.encode(), value.to_bytes().unwrap())
    }

    fn scan_keys(store: &IndexStore, addr_id: u32) -> Vec<Vec<u8>> {
        store
            .prefix_scan(IndexKey::Search { addr_id }.encode())
            .unwrap()
            .map(|r| r.unwrap().0.to_vec())
            .collect()
    }

    // ------------------------------------------------------------------
    // Singletons
    // ------------------------------------------------------------------

    #[test]
    fn seed_absent_then_present() {
        let (store, _dir) = temp_store();
        assert_eq!(store.seed().unwrap(), None);

        store.put_seed(&[0xAB; 32]).unwrap();
        assert_eq!(store.seed().unwrap(), Some(vec![0xAB; 32]));
    }

    #[test]
    fn best_block_defaults_to_empty() {
        let (store, _dir) = temp_store();
        assert!(store.best_block().unwrap().is_empty());
    }

    #[test]
    fn best_block_rides_the_batch() {
        let (store, _dir) = temp_store();
        let locator = BlockLocator::single(9, Hash256([1; 32]));
        store.write_batch(&[], &[], &locator).unwrap();
        assert_eq!(store.best_block().unwrap(), locator);
    }

    // ------------------------------------------------------------------
    // Batched writes
    // ------------------------------------------------------------------

    #[test]
    fn batch_applies_writes_and_erasures_together() {
        let (store, _dir) = temp_store();
        let a = entry(1, EntryKind::Created, 0x01, 0);
        let b = entry(1, EntryKind::Created, 0x02, 0);
        let locator = BlockLocator::single(0, Hash256([1; 32]));
        store
            .write_batch(&[a.clone(), b.clone()], &[], &locator)
            .unwrap();
        assert_eq!(scan_keys(&store, 1).len(), 2);

        // One batch that erases `a` and writes a third entry.
        let c = entry(1, EntryKind::Spent, 0x03, 0);
        let locator2 = BlockLocator::single(1, Hash256([2; 32]));
        store
            .write_batch(&[c.clone()], &[a.0.clone()], &locator2)
            .unwrap();

        let keys = scan_keys(&store, 1);
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains(&a.0));
        assert!(keys.contains(&b.0));
        assert!(keys.contains(&c.0));
        assert_eq!(store.best_block().unwrap(), locator2);
    }

    // ------------------------------------------------------------------
    // Prefix scans
    // ------------------------------------------------------------------

    #[test]
    fn prefix_scan_is_scoped_and_ordered() {
        let (store, _dir) = temp_store();
        let locator = BlockLocator::single(0, Hash256([1; 32]));
        let mut writes = Vec::new();
        for addr_id in [5u32, 6, 7] {
            for vout in [2u32, 0, 1] {
                writes.push(entry(addr_id, EntryKind::Created, addr_id as u8, vout));
            }
        }
        store.write_batch(&writes, &[], &locator).unwrap();

        let keys = scan_keys(&store, 6);
        assert_eq!(keys.len(), 3, "only addr_id 6 entries in range");
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted, "scan yields lexicographic order");
        for key in &keys {
            assert!(IndexKey::decode(key).unwrap().matches_search(6));
        }
    }

    #[test]
    fn prefix_scan_empty_range() {
        let (store, _dir) = temp_store();
        let keys = scan_keys(&store, 12345);
        assert!(keys.is_empty());
    }

    #[test]
    fn prefix_scan_never_yields_seed_record() {
        let (store, _dir) = temp_store();
        store.put_seed(&[0xCD; 32]).unwrap();

        // Adjacent entries around the seed's first addr byte ('K').
        let near = (b'K' as u32) << 24;
        let locator = BlockLocator::single(0, Hash256([1; 32]));
        store
            .write_batch(
                &[entry(near, EntryKind::Created, 0x01, 0)],
                &[],
                &locator,
            )
            .unwrap();

        for addr_id in [0u32, near, u32::MAX] {
            for key in scan_keys(&store, addr_id) {
                assert_ne!(
                    IndexKey::decode(&key).unwrap(),
                    IndexKey::Seed,
                    "seed leaked into scan for {addr_id:#x}"
                );
            }
        }
        // The adjacent entry itself is still found.
        assert_eq!(scan_keys(&store, near).len(), 1);
    }

    #[test]
    fn whole_tag_scan_sees_all_entries() {
        let (store, _dir) = temp_store();
        store.put_seed(&[0xCD; 32]).unwrap();
        let locator = BlockLocator::single(0, Hash256([1; 32]));
        let writes = vec![
            entry(1, EntryKind::Created, 0x01, 0),
            entry(u32::MAX, EntryKind::Spent, 0x02, 7),
        ];
        store.write_batch(&writes, &[], &locator).unwrap();

        let all: Vec<_> = store
            .scan_all()
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        // Both entries plus the seed record share the tag byte.
        assert_eq!(all.len(), 3);
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    #[test]
    fn persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addrindex");
        let locator = BlockLocator::single(3, Hash256([9; 32]));
        let e = entry(42, EntryKind::Created, 0x0A, 0);

        {
            let store = IndexStore::open(&path).unwrap();
            store.put_seed(&[0x11; 32]).unwrap();
            store.write_batch(&[e.clone()], &[], &locator).unwrap();
        }

        let store = IndexStore::open(&path).unwrap();
        assert_eq!(store.seed().unwrap(), Some(vec![0x11; 32]));
        assert_eq!(store.best_block().unwrap(), locator);
        assert_eq!(scan_keys(&store, 42), vec![e.0]);
    }
}
