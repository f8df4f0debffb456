//! Chain-state collaborator interface.
//!
//! The address index does not own the chain: it observes it. A host node
//! implements [`ChainView`] and delivers [`ChainEvent`]s in chain order
//! (at-least-once, duplicates tolerated). [`MemoryChain`] is the
//! in-memory implementation used by tests; the production node backs the
//! same trait with its block database.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::blockfile::{BlockFileStore, FlatFilePos};
use crate::error::ChainError;
use crate::types::{Block, BlockUndo, Hash256, OutPoint, TxOutput};

/// Everything a secondary index needs to know about one connected block:
/// the block itself, where it sits in the chain and on disk, and the undo
/// record describing the prior outputs its inputs consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockData {
    /// The full block.
    pub block: Block,
    /// Height the block was connected at.
    pub height: u64,
    /// Position of the block's payload in the flat block files.
    pub pos: FlatFilePos,
    /// Undo record. `None` when the undo data is no longer readable
    /// (e.g. after pruning); consumers must cope.
    pub undo: Option<BlockUndo>,
}

impl BlockData {
    /// Hash of the block's header.
    pub fn hash(&self) -> Hash256 {
        self.block.header.hash()
    }
}

/// Chain events delivered to subscribers, in chain-event order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    /// A block was connected to the canonical chain.
    BlockConnected(BlockData),
    /// A block was disconnected from the canonical chain (reorg).
    BlockDisconnected(BlockData),
    /// The canonical tip changed without an accompanying block event
    /// (catch-up nudge).
    TipChanged,
}

/// Read-only view of the canonical chain.
///
/// `block_data` must also serve blocks that have been disconnected, as
/// long as they were connected once: a restarting subscriber may need
/// stale blocks to rewind across a reorg it slept through.
pub trait ChainView: Send + Sync {
    /// Canonical tip as `(height, hash)`, or `None` for an empty chain.
    fn tip(&self) -> Result<Option<(u64, Hash256)>, ChainError>;

    /// Hash of the canonical block at `height`, if any.
    fn block_hash_at(&self, height: u64) -> Result<Option<Hash256>, ChainError>;

    /// Full block data by hash, canonical or stale.
    fn block_data(&self, hash: &Hash256) -> Result<Option<BlockData>, ChainError>;
}

/// Sparse list of `(height, hash)` ancestors, newest first, with
/// exponentially growing steps.
///
/// Enough for a restarting subscriber to rediscover the most recent
/// common ancestor with the canonical chain, even when the chain
/// reorganized while the subscriber was down.
#[derive(
    Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockLocator {
    /// `(height, hash)` entries, newest first.
    pub entries: Vec<(u64, Hash256)>,
}

impl BlockLocator {
    /// Locator with a single entry.
    pub fn single(height: u64, hash: Hash256) -> Self {
        Self {
            entries: vec![(height, hash)],
        }
    }

    /// The newest entry, i.e. the block the locator was built for.
    pub fn best(&self) -> Option<(u64, Hash256)> {
        self.entries.first().copied()
    }

    /// Whether the locator names no block at all (empty chain).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a locator for the canonical block at `(height, hash)`,
    /// sampling ancestors at exponentially growing distances.
    pub fn for_block(
        view: &dyn ChainView,
        height: u64,
        hash: Hash256,
    ) -> Result<Self, ChainError> {
        let mut entries = vec![(height, hash)];
        let mut step = 1u64;
        let mut h = height;
        while h > 0 {
            h = h.saturating_sub(step);
            match view.block_hash_at(h)? {
                Some(ancestor) => entries.push((h, ancestor)),
                None => break,
            }
            if h == 0 {
                break;
            }
            step = step.saturating_mul(2);
        }
        Ok(Self { entries })
    }
}

struct ChainInner {
    /// Every block ever connected, stale ones included.
    blocks: HashMap<Hash256, BlockData>,
    /// Canonical height -> hash.
    canonical: HashMap<u64, Hash256>,
    /// UTXO set of the canonical chain, tracked to build undo records.
    utxos: HashMap<OutPoint, TxOutput>,
    tip: Option<(u64, Hash256)>,
}

/// In-memory chain for tests.
///
/// Tracks the UTXO set so it can hand out real [`BlockUndo`] records,
/// appends connected blocks to a shared [`BlockFileStore`], and keeps
/// disconnected blocks reachable by hash.
pub struct MemoryChain {
    files: Arc<BlockFileStore>,
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    /// Create an empty chain writing blocks into `files`.
    pub fn new(files: Arc<BlockFileStore>) -> Self {
        Self {
            files,
            inner: RwLock::new(ChainInner {
                blocks: HashMap::new(),
                canonical: HashMap::new(),
                utxos: HashMap::new(),
                tip: None,
            }),
        }
    }

    /// Connect a block on top of the current tip.
    ///
    /// Builds the undo record from the tracked UTXO set, appends the
    /// block to the block files, and returns the event to deliver to
    /// subscribers.
    pub fn connect_tip(&self, block: Block) -> Result<ChainEvent, ChainError> {
        let hash = block.header.hash();
        let mut inner = self.inner.write();

        let height = match inner.tip {
            Some((h, tip_hash)) => {
                if block.header.prev_hash != tip_hash {
                    return Err(ChainError::NotOnTip(hash.to_string()));
                }
                h + 1
            }
            None => {
                if !block.header.prev_hash.is_zero() {
                    return Err(ChainError::NotOnTip(hash.to_string()));
                }
                0
            }
        };

        // Spend inputs, recording prior outputs in consumption order.
        let mut undo = BlockUndo::empty();
        for tx in block.transactions.iter().skip(1) {
            for input in &tx.inputs {
                let prev = inner
                    .utxos
                    .remove(&input.previous_output)
                    .ok_or_else(|| {
                        ChainError::MissingUtxo(input.previous_output.to_string())
                    })?;
                undo.spent_outputs.push((input.previous_output, prev));
            }
        }

        // Create outputs.
        for tx in &block.transactions {
            let txid = tx.txid()?;
            for (vout, output) in tx.outputs.iter().enumerate() {
                inner.utxos.insert(
                    OutPoint { txid, vout: vout as u32 },
                    output.clone(),
                );
            }
        }

        let pos = self.files.append_block(&block)?;
        let data = BlockData {
            block,
            height,
            pos,
            undo: Some(undo),
        };
        inner.blocks.insert(hash, data.clone());
        inner.canonical.insert(height, hash);
        inner.tip = Some((height, hash));

        Ok(ChainEvent::BlockConnected(data))
    }

    /// Disconnect the current tip, reverting the UTXO set.
    ///
    /// The block stays reachable via [`ChainView::block_data`] so that a
    /// restarting subscriber can rewind through it.
    pub fn disconnect_tip(&self) -> Result<ChainEvent, ChainError> {
        let mut inner = self.inner.write();
        let (height, hash) = inner.tip.ok_or(ChainError::EmptyChain)?;
        let data = inner
            .blocks
            .get(&hash)
            .cloned()
            .ok_or_else(|| ChainError::BlockNotFound(hash.to_string()))?;

        // Remove created outputs.
        for tx in data.block.transactions.iter().rev() {
            let txid = tx.txid()?;
            for (vout, _) in tx.outputs.iter().enumerate() {
                inner.utxos.remove(&OutPoint { txid, vout: vout as u32 });
            }
        }

        // Restore spent outputs.
        if let Some(undo) = &data.undo {
            for (outpoint, output) in &undo.spent_outputs {
                inner.utxos.insert(*outpoint, output.clone());
            }
        }

        inner.canonical.remove(&height);
        inner.tip = if height == 0 {
            None
        } else {
            Some((height - 1, data.block.header.prev_hash))
        };

        Ok(ChainEvent::BlockDisconnected(data))
    }

    /// Drop the undo record of a stored block, simulating pruned undo
    /// data. Subscribers must fall back to their scan strategy.
    pub fn strip_undo(&self, hash: &Hash256) {
        if let Some(data) = self.inner.write().blocks.get_mut(hash) {
            data.undo = None;
        }
    }

    /// Number of unspent outputs currently tracked.
    pub fn utxo_count(&self) -> usize {
        self.inner.read().utxos.len()
    }
}

impl ChainView for MemoryChain {
    fn tip(&self) -> Result<Option<(u64, Hash256)>, ChainError> {
        Ok(self.inner.read().tip)
    }

    fn block_hash_at(&self, height: u64) -> Result<Option<Hash256>, ChainError> {
        Ok(self.inner.read().canonical.get(&height).copied())
    }

    fn block_data(&self, hash: &Hash256) -> Result<Option<BlockData>, ChainError> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }
}
