//! Sync controller: follows chain events and drives ingest.
//!
//! A single worker thread owns all writes. It drains a channel of chain
//! events (plus internal synchronize/stop messages), applying one atomic
//! batch per block. On startup it rewinds entries for blocks that are no
//! longer canonical (reorg across restart, located via the persisted
//! best-block locator) and then replays forward to the tip. Any error
//! halts the worker and leaves the database at the last committed batch.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use skiff_core::chain::ChainEvent;
use skiff_core::types::Hash256;

use crate::error::IndexError;
use crate::index::AddrIndex;

/// Messages consumed by the sync worker.
pub(crate) enum SyncMessage {
    /// A chain event delivered by the host.
    Event(ChainEvent),
    /// Catch up with the canonical tip (sync-barrier nudge).
    Synchronize,
    /// Shut the worker down.
    Stop,
}

/// Controller lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncStatus {
    /// Not started, or stopped.
    Stopped,
    /// Processing blocks behind the canonical tip.
    CatchingUp,
    /// Last ingested block equals the canonical tip.
    InSync,
    /// Halted on an error; the database holds the last committed batch.
    Failed,
}

pub(crate) struct SyncInner {
    pub(crate) status: SyncStatus,
    /// Last ingested block, mirrored from the persisted locator.
    pub(crate) best_block: Option<(u64, Hash256)>,
}

/// State shared between the worker, the sync barrier, and queries.
pub(crate) struct SyncShared {
    pub(crate) inner: Mutex<SyncInner>,
    pub(crate) cond: Condvar,
}

impl SyncShared {
    pub(crate) fn new(best_block: Option<(u64, Hash256)>) -> Self {
        Self {
            inner: Mutex::new(SyncInner {
                status: SyncStatus::Stopped,
                best_block,
            }),
            cond: Condvar::new(),
        }
    }
}

impl AddrIndex {
    /// Worker thread body.
    pub(crate) fn run_sync(self: Arc<Self>, rx: Receiver<SyncMessage>) {
        tracing::info!("address index sync starting");
        if let Err(e) = self.sync_to_tip() {
            self.fail(e);
        } else {
            self.refresh_status();
            loop {
                match rx.recv() {
                    Ok(SyncMessage::Stop) | Err(_) => break,
                    Ok(SyncMessage::Synchronize) => {
                        if let Err(e) = self.sync_to_tip() {
                            self.fail(e);
                            break;
                        }
                    }
                    Ok(SyncMessage::Event(event)) => {
                        if let Err(e) = self.handle_event(event) {
                            self.fail(e);
                            break;
                        }
                    }
                }
                self.refresh_status();
            }
        }
        tracing::info!("address index sync stopped");
    }

    /// Apply one chain event. Duplicates and events for already-ingested
    /// blocks degrade to no-ops or a catch-up pass.
    fn handle_event(&self, event: ChainEvent) -> Result<(), IndexError> {
        match event {
            ChainEvent::BlockConnected(data) => {
                let hash = data.hash();
                match self.best_block() {
                    Some((_, best_hash)) if best_hash == hash => Ok(()),
                    Some((height, best_hash))
                        if data.block.header.prev_hash == best_hash
                            && data.height == height + 1 =>
                    {
                        self.connect_block(&data)
                    }
                    None if data.height == 0 => self.connect_block(&data),
                    _ => self.sync_to_tip(),
                }
            }
            ChainEvent::BlockDisconnected(data) => match self.best_block() {
                Some((height, best_hash))
                    if best_hash == data.hash() && height == data.height =>
                {
                    self.disconnect_block(&data)
                }
                _ => {
                    tracing::warn!(
                        height = data.height,
                        "ignoring disconnect for non-best block"
                    );
                    Ok(())
                }
            },
            ChainEvent::TipChanged => self.sync_to_tip(),
        }
    }

    /// Rewind entries for blocks that fell off the canonical chain, then
    /// replay forward until the last ingested block is the tip.
    pub(crate) fn sync_to_tip(&self) -> Result<(), IndexError> {
        while let Some((height, hash)) = self.best_block() {
            if self.chain.block_hash_at(height)? == Some(hash) {
                break;
            }
            let data = self.chain.block_data(&hash)?.ok_or_else(|| {
                IndexError::BlockRead(format!("stale block {hash} unavailable for rewind"))
            })?;
            tracing::info!(height, "rewinding stale block");
            self.disconnect_block(&data)?;
        }

        loop {
            let Some((tip_height, _)) = self.chain.tip()? else {
                break;
            };
            let next_height = match self.best_block() {
                Some((height, _)) => height + 1,
                None => 0,
            };
            if next_height > tip_height {
                break;
            }
            let hash = self.chain.block_hash_at(next_height)?.ok_or_else(|| {
                IndexError::BlockRead(format!("no canonical block at height {next_height}"))
            })?;
            let data = self.chain.block_data(&hash)?.ok_or_else(|| {
                IndexError::BlockRead(format!("block {hash} unavailable"))
            })?;
            self.connect_block(&data)?;
        }
        Ok(())
    }

    /// Recompute in-sync/catching-up from the current tip and wake
    /// barrier waiters.
    fn refresh_status(&self) {
        let mut inner = self.shared.inner.lock();
        if !matches!(inner.status, SyncStatus::Failed | SyncStatus::Stopped) {
            let in_sync = match self.chain.tip() {
                Ok(tip) => tip == inner.best_block,
                Err(_) => false,
            };
            inner.status = if in_sync {
                SyncStatus::InSync
            } else {
                SyncStatus::CatchingUp
            };
        }
        self.shared.cond.notify_all();
    }

    fn fail(&self, error: IndexError) {
        tracing::error!(error = %error, "address index sync halted");
        let mut inner = self.shared.inner.lock();
        inner.status = SyncStatus::Failed;
        self.shared.cond.notify_all();
    }
}
