//! Flat block-file storage.
//!
//! Blocks live in append-only `blkNNNNN.dat` files. Each record is a
//! `u32` little-endian length prefix followed by the bincode-encoded
//! block. A [`FlatFilePos`] names the start of a block's payload (the
//! header, not the length prefix); a [`DiskTxPos`] additionally carries
//! the byte offset of one transaction past the header, so a reader can
//! open the file, decode the header, seek forward, and decode exactly
//! one transaction without touching the rest of the block.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BlockFileError;
use crate::types::{Block, BlockHeader, Transaction};

/// Default cap on a single block file before rolling to the next one.
const MAX_BLOCKFILE_SIZE: u64 = 16 * 1024 * 1024;

/// Position of a block's serialized bytes inside the block files.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct FlatFilePos {
    /// Block file number (`blkNNNNN.dat`).
    pub file: u32,
    /// Byte offset of the block payload within the file.
    pub offset: u64,
}

/// Position of a single transaction inside the block files.
///
/// `tx_offset` counts bytes after the block header, including the
/// transaction-count prefix, so the read path is: seek to
/// `block_offset`, decode the header, seek forward `tx_offset`, decode
/// one transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct DiskTxPos {
    /// Block file number.
    pub file: u32,
    /// Byte offset of the containing block's payload.
    pub block_offset: u64,
    /// Byte offset of the transaction, measured after the header.
    pub tx_offset: u64,
}

impl DiskTxPos {
    /// Build a transaction position inside the block at `pos`.
    pub fn new(pos: FlatFilePos, tx_offset: u64) -> Self {
        Self {
            file: pos.file,
            block_offset: pos.offset,
            tx_offset,
        }
    }

    /// Whether this transaction lives inside the block at `pos`.
    pub fn is_in_block(&self, pos: &FlatFilePos) -> bool {
        self.file == pos.file && self.block_offset == pos.offset
    }
}

/// Encoded size of a bincode standard-config collection-length prefix.
///
/// The standard configuration writes lengths as variable-width u64:
/// one byte below 251, then 3/5/9 bytes behind a width marker.
pub fn varint_len(n: u64) -> u64 {
    match n {
        0..=250 => 1,
        251..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

struct WriteState {
    file: u32,
    offset: u64,
}

/// Append-only writer and random-access reader over flat block files.
pub struct BlockFileStore {
    dir: PathBuf,
    max_file_size: u64,
    state: Mutex<WriteState>,
}

impl BlockFileStore {
    /// Open or create a block-file directory.
    ///
    /// Scans existing `blkNNNNN.dat` files and resumes appending to the
    /// highest-numbered one.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, BlockFileError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| BlockFileError::Io(e.to_string()))?;

        let mut last: Option<(u32, u64)> = None;
        let entries = std::fs::read_dir(&dir).map_err(|e| BlockFileError::Io(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| BlockFileError::Io(e.to_string()))?;
            let name = entry.file_name();
            let Some(id) = parse_file_id(&name.to_string_lossy()) else {
                continue;
            };
            let len = entry
                .metadata()
                .map_err(|e| BlockFileError::Io(e.to_string()))?
                .len();
            if last.map_or(true, |(prev, _)| id > prev) {
                last = Some((id, len));
            }
        }

        let (file, offset) = last.unwrap_or((0, 0));
        Ok(Self {
            dir,
            max_file_size: MAX_BLOCKFILE_SIZE,
            state: Mutex::new(WriteState { file, offset }),
        })
    }

    /// Append a block and return the position of its payload.
    pub fn append_block(&self, block: &Block) -> Result<FlatFilePos, BlockFileError> {
        let bytes = bincode::encode_to_vec(block, bincode::config::standard())
            .map_err(|e| BlockFileError::Serialization(e.to_string()))?;
        let record_len = 4 + bytes.len() as u64;

        let mut state = self.state.lock();
        if state.offset > 0 && state.offset + record_len > self.max_file_size {
            state.file += 1;
            state.offset = 0;
        }

        let path = self.file_path(state.file);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BlockFileError::Io(e.to_string()))?;
        file.write_all(&(bytes.len() as u32).to_le_bytes())
            .map_err(|e| BlockFileError::Io(e.to_string()))?;
        file.write_all(&bytes)
            .map_err(|e| BlockFileError::Io(e.to_string()))?;

        let pos = FlatFilePos {
            file: state.file,
            offset: state.offset + 4,
        };
        state.offset += record_len;
        Ok(pos)
    }

    /// Read one transaction at the given position, together with the
    /// header of its containing block.
    pub fn read_transaction(
        &self,
        pos: &DiskTxPos,
    ) -> Result<(BlockHeader, Transaction), BlockFileError> {
        let path = self.file_path(pos.file);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlockFileError::FileNotFound(pos.file));
            }
            Err(e) => return Err(BlockFileError::Io(e.to_string())),
        };

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(pos.block_offset))
            .map_err(|e| BlockFileError::Io(e.to_string()))?;
        let header: BlockHeader = decode_one(&mut reader, pos)?;
        reader
            .seek(SeekFrom::Current(pos.tx_offset as i64))
            .map_err(|e| BlockFileError::Io(e.to_string()))?;
        let tx: Transaction = decode_one(&mut reader, pos)?;
        Ok((header, tx))
    }

    fn file_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("blk{id:05}.dat"))
    }
}

fn decode_one<T: bincode::Decode<()>, R: Read>(
    reader: &mut R,
    pos: &DiskTxPos,
) -> Result<T, BlockFileError> {
    bincode::decode_from_std_read(reader, bincode::config::standard()).map_err(|e| {
        BlockFileError::Decode {
            file: pos.file,
            offset: pos.block_offset,
            reason: e.to_string(),
        }
    })
}

fn parse_file_id(name: &str) -> Option<u32> {
    let id = name.strip_prefix("blk")?.strip_suffix(".dat")?;
    if id.len() != 5 {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;
    use crate::types::{Hash256, OutPoint, Script, TxInput, TxOutput};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn temp_store() -> (BlockFileStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockFileStore::open(dir.path().join("blocks")).unwrap();
        (store, dir)
    }

    fn script(tag: u8) -> Script {
        Script::new(vec![0x76, 0xa9, tag, 0x88, 0xac])
    }

    fn coinbase(tag: u8, nonce: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: Script::new(nonce.to_le_bytes().to_vec()),
            }],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                script_pubkey: script(tag),
            }],
            lock_time: nonce,
        }
    }

    fn spend(txid: Hash256, vout: u32, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid, vout },
                script_sig: Script::new(vec![0x51]),
            }],
            outputs: vec![TxOutput {
                value: 49 * COIN,
                script_pubkey: script(tag),
            }],
            lock_time: 0,
        }
    }

    fn make_block(txs: Vec<Transaction>) -> Block {
        Block {
            header: crate::types::BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256([0xEE; 32]),
                timestamp: 1_700_000_000,
                difficulty_target: u64::MAX,
                nonce: 7,
            },
            transactions: txs,
        }
    }

    /// Per-transaction offsets after the header, the same arithmetic the
    /// ingest pipeline uses.
    fn tx_offsets(block: &Block) -> Vec<u64> {
        let cfg = bincode::config::standard();
        let mut offsets = Vec::new();
        let mut off = varint_len(block.transactions.len() as u64);
        for tx in &block.transactions {
            offsets.push(off);
            off += bincode::encode_to_vec(tx, cfg).unwrap().len() as u64;
        }
        offsets
    }

    // ------------------------------------------------------------------
    // varint_len
    // ------------------------------------------------------------------

    #[test]
    fn varint_len_matches_bincode() {
        let cfg = bincode::config::standard();
        for n in [0u64, 1, 100, 250, 251, 1000, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, 0x1_0000_0000] {
            let encoded = bincode::encode_to_vec(n, cfg).unwrap();
            assert_eq!(
                varint_len(n),
                encoded.len() as u64,
                "length prefix width mismatch for {n}"
            );
        }
    }

    #[test]
    fn varint_len_matches_collection_prefix() {
        let cfg = bincode::config::standard();
        // A Vec<u8> of n single-byte elements encodes as prefix + n bytes.
        for n in [0usize, 1, 250, 251, 300] {
            let v = vec![0u8; n];
            let encoded = bincode::encode_to_vec(&v, cfg).unwrap();
            assert_eq!(encoded.len() as u64, varint_len(n as u64) + n as u64);
        }
    }

    // ------------------------------------------------------------------
    // Append and read back
    // ------------------------------------------------------------------

    #[test]
    fn append_then_read_first_tx() {
        let (store, _dir) = temp_store();
        let block = make_block(vec![coinbase(0xAA, 0)]);
        let pos = store.append_block(&block).unwrap();

        let offsets = tx_offsets(&block);
        let (header, tx) = store
            .read_transaction(&DiskTxPos::new(pos, offsets[0]))
            .unwrap();
        assert_eq!(header, block.header);
        assert_eq!(tx, block.transactions[0]);
    }

    #[test]
    fn read_every_tx_in_multi_tx_block() {
        let (store, _dir) = temp_store();
        let cb = coinbase(0xAA, 0);
        let cb_txid = cb.txid().unwrap();
        let block = make_block(vec![
            cb,
            spend(cb_txid, 0, 0xBB),
            spend(Hash256([9; 32]), 1, 0xCC),
        ]);
        let pos = store.append_block(&block).unwrap();

        for (i, off) in tx_offsets(&block).into_iter().enumerate() {
            let (_, tx) = store.read_transaction(&DiskTxPos::new(pos, off)).unwrap();
            assert_eq!(tx, block.transactions[i], "transaction {i} mismatch");
        }
    }

    #[test]
    fn positions_distinguish_blocks() {
        let (store, _dir) = temp_store();
        let b1 = make_block(vec![coinbase(0xAA, 1)]);
        let b2 = make_block(vec![coinbase(0xBB, 2)]);
        let p1 = store.append_block(&b1).unwrap();
        let p2 = store.append_block(&b2).unwrap();
        assert_ne!(p1, p2);

        let off = tx_offsets(&b2)[0];
        let (_, tx) = store.read_transaction(&DiskTxPos::new(p2, off)).unwrap();
        assert_eq!(tx, b2.transactions[0]);
        assert!(DiskTxPos::new(p2, off).is_in_block(&p2));
        assert!(!DiskTxPos::new(p2, off).is_in_block(&p1));
    }

    #[test]
    fn rotates_past_file_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockFileStore {
            dir: dir.path().to_path_buf(),
            max_file_size: 256,
            state: Mutex::new(WriteState { file: 0, offset: 0 }),
        };

        let mut positions = Vec::new();
        for i in 0..8 {
            let block = make_block(vec![coinbase(i, i as u64)]);
            positions.push((store.append_block(&block).unwrap(), block));
        }
        assert!(
            positions.iter().any(|(p, _)| p.file > 0),
            "expected at least one rotation"
        );

        // Everything stays readable across file boundaries.
        for (pos, block) in &positions {
            let off = tx_offsets(block)[0];
            let (_, tx) = store.read_transaction(&DiskTxPos::new(*pos, off)).unwrap();
            assert_eq!(tx, block.transactions[0]);
        }
    }

    #[test]
    fn reopen_resumes_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks");

        let b1 = make_block(vec![coinbase(0xAA, 1)]);
        let p1 = {
            let store = BlockFileStore::open(&path).unwrap();
            store.append_block(&b1).unwrap()
        };

        let store = BlockFileStore::open(&path).unwrap();
        let b2 = make_block(vec![coinbase(0xBB, 2)]);
        let p2 = store.append_block(&b2).unwrap();
        assert!(p2.offset > p1.offset);

        let (_, tx1) = store
            .read_transaction(&DiskTxPos::new(p1, tx_offsets(&b1)[0]))
            .unwrap();
        let (_, tx2) = store
            .read_transaction(&DiskTxPos::new(p2, tx_offsets(&b2)[0]))
            .unwrap();
        assert_eq!(tx1, b1.transactions[0]);
        assert_eq!(tx2, b2.transactions[0]);
    }

    // ------------------------------------------------------------------
    // Failure paths
    // ------------------------------------------------------------------

    #[test]
    fn missing_file_is_typed_error() {
        let (store, _dir) = temp_store();
        let pos = DiskTxPos { file: 42, block_offset: 0, tx_offset: 0 };
        assert_eq!(
            store.read_transaction(&pos).unwrap_err(),
            BlockFileError::FileNotFound(42)
        );
    }

    #[test]
    fn garbage_offset_is_decode_error() {
        let (store, _dir) = temp_store();
        let block = make_block(vec![coinbase(0xAA, 0)]);
        let pos = store.append_block(&block).unwrap();

        // Point into the middle of the payload; header decode cannot
        // reconstruct a valid block header from there.
        let bad = DiskTxPos {
            file: pos.file,
            block_offset: pos.offset + 1_000_000,
            tx_offset: 0,
        };
        assert!(matches!(
            store.read_transaction(&bad).unwrap_err(),
            BlockFileError::Decode { .. } | BlockFileError::Io(_)
        ));
    }

    #[test]
    fn parse_file_id_accepts_only_block_files() {
        assert_eq!(parse_file_id("blk00000.dat"), Some(0));
        assert_eq!(parse_file_id("blk00123.dat"), Some(123));
        assert_eq!(parse_file_id("blk123.dat"), None);
        assert_eq!(parse_file_id("index.dat"), None);
        assert_eq!(parse_file_id("blk00001.log"), None);
    }
}
