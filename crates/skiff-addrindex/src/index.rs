//! The public address-index handle.
//!
//! [`AddrIndex`] is an explicit value the host constructs and wires to
//! its chain-event source: construct with [`AddrIndex::open`], call
//! [`start`](AddrIndex::start), feed it [`ChainEvent`]s via
//! [`notify`](AddrIndex::notify), query with
//! [`find_txs_by_script`](AddrIndex::find_txs_by_script), and
//! [`stop`](AddrIndex::stop) before shutdown. The sync worker is the
//! sole writer; queries run on caller threads against the engine's
//! snapshot iterators.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use skiff_core::blockfile::{BlockFileStore, FlatFilePos};
use skiff_core::chain::{BlockData, BlockLocator, ChainEvent, ChainView};
use skiff_core::types::{Hash256, OutPoint, Script, Transaction};

use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::hasher::{ScriptHasher, SEED_LEN};
use crate::ingest;
use crate::keys::{EntryKind, IndexKey, IndexValue, KeyDecodeError};
use crate::store::IndexStore;
use crate::sync::{SyncMessage, SyncShared, SyncStatus};

/// One transaction referencing the queried script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptTxEntry {
    /// The outpoint paying the script: the created output for creation
    /// records, the consumed prior output for spend records.
    pub outpoint: OutPoint,
    /// The referencing transaction, read back from the block files.
    pub tx: Transaction,
    /// Hash of the block containing the transaction.
    pub block_hash: Hash256,
}

/// Result of a script query: the transactions that spent outputs paying
/// the script, and the transactions that created such outputs.
///
/// Within each list, entries surface in index-key order. No ordering is
/// promised between the two lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptHistory {
    /// Transactions spending outputs that paid the script.
    pub spends: Vec<ScriptTxEntry>,
    /// Transactions that created outputs paying the script.
    pub creations: Vec<ScriptTxEntry>,
}

pub(crate) struct WorkerHandle {
    pub(crate) sender: Sender<SyncMessage>,
    pub(crate) thread: JoinHandle<()>,
}

/// Script-to-transaction address index.
pub struct AddrIndex {
    pub(crate) store: IndexStore,
    pub(crate) hasher: ScriptHasher,
    pub(crate) chain: Arc<dyn ChainView>,
    pub(crate) block_files: Arc<BlockFileStore>,
    pub(crate) shared: SyncShared,
    pub(crate) worker: Mutex<Option<WorkerHandle>>,
    /// Back-reference handed to the sync worker thread.
    self_ref: Weak<AddrIndex>,
}

impl AddrIndex {
    /// Open or create the index database, reading the persisted hash
    /// seed or generating a fresh random one on first open.
    pub fn open(
        config: &IndexConfig,
        chain: Arc<dyn ChainView>,
        block_files: Arc<BlockFileStore>,
    ) -> Result<Arc<Self>, IndexError> {
        Self::open_inner(config, chain, block_files, None)
    }

    /// Open with an explicit hash seed.
    ///
    /// The seed only applies to a freshly created database; an existing
    /// database keeps the seed it was created with. Intended for
    /// deterministic setups and tests.
    pub fn open_with_seed(
        config: &IndexConfig,
        chain: Arc<dyn ChainView>,
        block_files: Arc<BlockFileStore>,
        seed: [u8; SEED_LEN],
    ) -> Result<Arc<Self>, IndexError> {
        Self::open_inner(config, chain, block_files, Some(seed))
    }

    fn open_inner(
        config: &IndexConfig,
        chain: Arc<dyn ChainView>,
        block_files: Arc<BlockFileStore>,
        seed: Option<[u8; SEED_LEN]>,
    ) -> Result<Arc<Self>, IndexError> {
        let store = IndexStore::open(config.db_path())?;

        let hasher = match store.seed()? {
            Some(bytes) => {
                let key: [u8; SEED_LEN] = bytes.as_slice().try_into().map_err(|_| {
                    IndexError::Storage(format!(
                        "seed record has invalid length {}",
                        bytes.len()
                    ))
                })?;
                ScriptHasher::new(key)
            }
            None => {
                let hasher = match seed {
                    Some(key) => ScriptHasher::new(key),
                    None => ScriptHasher::random(),
                };
                store.put_seed(hasher.key())?;
                tracing::debug!("initialized address hash seed");
                hasher
            }
        };

        let best = store.best_block()?.best();
        Ok(Arc::new_cyclic(|self_ref| Self {
            store,
            hasher,
            chain,
            block_files,
            shared: SyncShared::new(best),
            worker: Mutex::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    // --- Lifecycle ---

    /// Start the sync worker. A second call while running is a no-op.
    pub fn start(&self) -> Result<(), IndexError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            tracing::debug!("address index already running");
            return Ok(());
        }

        {
            let mut inner = self.shared.inner.lock();
            inner.status = SyncStatus::CatchingUp;
        }

        // Upgrading cannot fail here: `self` is only reachable through a
        // live Arc.
        let index = self.self_ref.upgrade().ok_or(IndexError::NotRunning)?;
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("addrindex-sync".into())
            .spawn(move || index.run_sync(receiver))
            .map_err(|e| IndexError::Storage(format!("failed to spawn sync thread: {e}")))?;

        *worker = Some(WorkerHandle { sender, thread });
        Ok(())
    }

    /// Stop the sync worker and wait for it to finish. Committed batches
    /// stay on disk; the index can be started again.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.sender.send(SyncMessage::Stop);
            let _ = handle.thread.join();
        }
        let mut inner = self.shared.inner.lock();
        inner.status = SyncStatus::Stopped;
        self.shared.cond.notify_all();
    }

    /// Deliver one chain event to the sync worker.
    pub fn notify(&self, event: ChainEvent) -> Result<(), IndexError> {
        let worker = self.worker.lock();
        let handle = worker.as_ref().ok_or(IndexError::NotRunning)?;
        handle
            .sender
            .send(SyncMessage::Event(event))
            .map_err(|_| IndexError::NotRunning)
    }

    /// Block until the last ingested block equals the canonical tip.
    ///
    /// Returns `false` if the index is not running or its sync worker
    /// has halted on an error.
    pub fn block_until_synced_to_current_chain(&self) -> bool {
        {
            let worker = self.worker.lock();
            let Some(handle) = worker.as_ref() else {
                return false;
            };
            if handle.sender.send(SyncMessage::Synchronize).is_err() {
                return false;
            }
        }

        let mut inner = self.shared.inner.lock();
        loop {
            match inner.status {
                SyncStatus::Stopped | SyncStatus::Failed => return false,
                SyncStatus::InSync => match self.chain.tip() {
                    Ok(tip) if tip == inner.best_block => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                },
                SyncStatus::CatchingUp => {}
            }
            self.shared.cond.wait(&mut inner);
        }
    }

    // --- Queries ---

    /// Find every canonical-chain transaction that created an output
    /// paying `script` or spent an output that did.
    ///
    /// An unseen script yields an empty history, not an error. Any
    /// block-file failure aborts the query with no partial result.
    pub fn find_txs_by_script(&self, script: &Script) -> Result<ScriptHistory, IndexError> {
        self.ensure_running()?;
        let mut history = ScriptHistory::default();
        for (kind, outpoint, value) in self.matching_entries(script)? {
            let (header, tx) = self.block_files.read_transaction(&value.pos)?;
            let entry = ScriptTxEntry {
                outpoint,
                tx,
                block_hash: header.hash(),
            };
            match kind {
                EntryKind::Created => history.creations.push(entry),
                EntryKind::Spent => history.spends.push(entry),
            }
        }
        Ok(history)
    }

    /// Find the outpoints associated with `script` without materializing
    /// transactions: created outputs paying it and prior outputs spent
    /// from it. An outpoint both created and spent on-chain appears once
    /// per kind.
    pub fn find_outpoints_by_script(
        &self,
        script: &Script,
    ) -> Result<Vec<OutPoint>, IndexError> {
        self.ensure_running()?;
        Ok(self
            .matching_entries(script)?
            .into_iter()
            .map(|(_, outpoint, _)| outpoint)
            .collect())
    }

    /// Decode and collision-filter every record under the script's
    /// address id, in key order.
    fn matching_entries(
        &self,
        script: &Script,
    ) -> Result<Vec<(EntryKind, OutPoint, IndexValue)>, IndexError> {
        let addr_id = self.hasher.addr_id(script);
        let prefix = IndexKey::Search { addr_id }.encode();
        let mut out = Vec::new();
        for item in self.store.prefix_scan(prefix)? {
            let (key_bytes, value_bytes) = item?;
            let IndexKey::Full { kind, outpoint, .. } = decode_key(&key_bytes)? else {
                return Err(IndexError::InvariantViolation(format!(
                    "non-record key in scan for addr id {addr_id:#010x}"
                )));
            };
            let value =
                IndexValue::from_bytes(&value_bytes).map_err(IndexError::Storage)?;
            if value.script != *script {
                // AddrId collision with a different script.
                continue;
            }
            out.push((kind, outpoint, value));
        }
        Ok(out)
    }

    fn ensure_running(&self) -> Result<(), IndexError> {
        match self.shared.inner.lock().status {
            SyncStatus::Stopped => Err(IndexError::NotRunning),
            _ => Ok(()),
        }
    }

    // --- Ingest commits (called from the sync worker) ---

    pub(crate) fn best_block(&self) -> Option<(u64, Hash256)> {
        self.shared.inner.lock().best_block
    }

    fn set_best(&self, best: Option<(u64, Hash256)>) {
        let mut inner = self.shared.inner.lock();
        inner.best_block = best;
        self.shared.cond.notify_all();
    }

    /// Write one block's entries and the advanced locator in one batch.
    pub(crate) fn connect_block(&self, data: &BlockData) -> Result<(), IndexError> {
        let entries = ingest::block_entries(&self.hasher, data)?;
        let mut writes = Vec::with_capacity(entries.len());
        for (key, value) in &entries {
            writes.push((key.encode(), value.to_bytes().map_err(IndexError::Storage)?));
        }

        let hash = data.hash();
        let locator = BlockLocator::for_block(self.chain.as_ref(), data.height, hash)?;
        self.store.write_batch(&writes, &[], &locator)?;
        self.set_best(Some((data.height, hash)));
        tracing::debug!(height = data.height, entries = writes.len(), "indexed block");
        Ok(())
    }

    /// Erase one block's entries and rewind the locator in one batch.
    ///
    /// Reconstructs the key set from the block and its undo record; when
    /// the undo record is gone, falls back to erasing every entry whose
    /// disk position lies inside the block.
    pub(crate) fn disconnect_block(&self, data: &BlockData) -> Result<(), IndexError> {
        let locator = if data.height == 0 {
            BlockLocator::default()
        } else {
            BlockLocator::single(data.height - 1, data.block.header.prev_hash)
        };

        let erasures = match ingest::block_entries(&self.hasher, data) {
            Ok(entries) => entries
                .into_iter()
                .map(|(key, _)| key.encode())
                .collect(),
            Err(IndexError::UndoUnavailable(reason)) => {
                tracing::warn!(
                    height = data.height,
                    %reason,
                    "disconnecting by position scan"
                );
                self.entries_in_block(&data.pos)?
            }
            Err(e) => return Err(e),
        };

        self.store.write_batch(&[], &erasures, &locator)?;
        self.set_best(locator.best());
        tracing::debug!(height = data.height, erased = erasures.len(), "unindexed block");
        Ok(())
    }

    /// Every record key whose disk position points inside the block at
    /// `pos`. Disk position uniquely identifies residency in a block
    /// file, so this recovers the disconnect set without undo data.
    fn entries_in_block(&self, pos: &FlatFilePos) -> Result<Vec<Vec<u8>>, IndexError> {
        let mut keys = Vec::new();
        for item in self.store.scan_all()? {
            let (key_bytes, value_bytes) = item?;
            match decode_key(&key_bytes)? {
                IndexKey::Full { .. } => {}
                _ => continue,
            }
            let value =
                IndexValue::from_bytes(&value_bytes).map_err(IndexError::Storage)?;
            if value.pos.is_in_block(pos) {
                keys.push(key_bytes.to_vec());
            }
        }
        Ok(keys)
    }
}

/// Map key-decode failures onto the error taxonomy: an unknown kind byte
/// is an invariant violation, anything else is storage corruption.
fn decode_key(bytes: &[u8]) -> Result<IndexKey, IndexError> {
    IndexKey::decode(bytes).map_err(|e| match e {
        KeyDecodeError::UnknownKind(_) => IndexError::InvariantViolation(e.to_string()),
        KeyDecodeError::WrongTag(_) | KeyDecodeError::BadLength(_) => {
            IndexError::Storage(e.to_string())
        }
    })
}
