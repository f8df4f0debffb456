//! Turning blocks into index entries.
//!
//! Connect and disconnect are the same computation: a block plus its
//! undo record deterministically yields the full `(key, value)` set.
//! Connect writes that set in one batch; disconnect erases the same
//! keys. When undo data is missing at disconnect time, the caller falls
//! back to erasing by disk-position residency instead.

use skiff_core::blockfile::{varint_len, DiskTxPos};
use skiff_core::chain::BlockData;
use skiff_core::types::OutPoint;

use crate::error::IndexError;
use crate::hasher::ScriptHasher;
use crate::keys::{EntryKind, IndexKey, IndexValue};

/// Compute every index entry the given block contributes.
///
/// Transaction disk offsets are derived the way the block files lay
/// transactions out: the first transaction sits right after the
/// transaction-count prefix, each later one after its predecessor's
/// serialized bytes. Spent entries consume the undo record in input
/// order; a missing, exhausted, or mismatched undo record aborts with
/// `UndoUnavailable` before anything is written.
pub(crate) fn block_entries(
    hasher: &ScriptHasher,
    data: &BlockData,
) -> Result<Vec<(IndexKey, IndexValue)>, IndexError> {
    let cfg = bincode::config::standard();
    let block_hash = data.hash();
    let txs = &data.block.transactions;

    let mut entries = Vec::new();
    let mut tx_offset = varint_len(txs.len() as u64);
    let mut spent_cursor = 0usize;

    for (tx_index, tx) in txs.iter().enumerate() {
        let txid = tx
            .txid()
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        let pos = DiskTxPos {
            file: data.pos.file,
            block_offset: data.pos.offset,
            tx_offset,
        };

        for (vout, output) in tx.outputs.iter().enumerate() {
            let key = IndexKey::Full {
                addr_id: hasher.addr_id(&output.script_pubkey),
                kind: EntryKind::Created,
                outpoint: OutPoint { txid, vout: vout as u32 },
            };
            let value = IndexValue {
                pos,
                script: output.script_pubkey.clone(),
            };
            entries.push((key, value));
        }

        // The first transaction is the coinbase: it spends nothing.
        if tx_index > 0 {
            let undo = data.undo.as_ref().ok_or_else(|| {
                IndexError::UndoUnavailable(format!("no undo record for block {block_hash}"))
            })?;
            for input in &tx.inputs {
                let (outpoint, prev) =
                    undo.spent_outputs.get(spent_cursor).ok_or_else(|| {
                        IndexError::UndoUnavailable(format!(
                            "undo record for block {block_hash} exhausted at input {spent_cursor}"
                        ))
                    })?;
                if *outpoint != input.previous_output {
                    return Err(IndexError::UndoUnavailable(format!(
                        "undo record for block {block_hash} does not match input {}",
                        input.previous_output
                    )));
                }
                spent_cursor += 1;

                let key = IndexKey::Full {
                    addr_id: hasher.addr_id(&prev.script_pubkey),
                    kind: EntryKind::Spent,
                    outpoint: input.previous_output,
                };
                let value = IndexValue {
                    pos,
                    script: prev.script_pubkey.clone(),
                };
                entries.push((key, value));
            }
        }

        let encoded = bincode::encode_to_vec(tx, cfg)
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        tx_offset += encoded.len() as u64;
    }

    Ok(entries)
}
