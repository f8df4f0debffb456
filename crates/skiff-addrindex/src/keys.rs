//! Key and value codec for the index database.
//!
//! The underlying engine compares keys lexicographically, so the layout
//! keeps every record for one `AddrId` in a contiguous range regardless
//! of kind and outpoint:
//!
//! ```text
//! full   = [ b'a' ][ addr_id : u32 BE ][ kind : b'C' | b'S' ][ txid : 32 ][ vout : u32 BE ]
//! search = [ b'a' ][ addr_id : u32 BE ]
//! seed   = [ b'a' ][ b'K' ]
//! ```
//!
//! The seed key is two bytes long, so it can never be yielded by a
//! five-byte-prefix scan: a strict prefix sorts before every key that
//! extends it. Values carry the transaction's disk position plus the
//! full script bytes; the script is what disambiguates `AddrId`
//! collisions at query time.

use thiserror::Error;

use skiff_core::blockfile::DiskTxPos;
use skiff_core::types::{Hash256, OutPoint, Script};

/// Seeded hash of a script, used as the ordered-scan prefix.
pub type AddrId = u32;

/// Leading tag byte of every index key.
pub const INDEX_TAG: u8 = b'a';

const KIND_CREATED: u8 = b'C';
const KIND_SPENT: u8 = b'S';
const KIND_SEED: u8 = b'K';

const SEED_KEY_LEN: usize = 2;
const SEARCH_KEY_LEN: usize = 1 + 4;
const FULL_KEY_LEN: usize = 1 + 4 + 1 + 32 + 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyDecodeError {
    #[error("wrong tag byte {0:#04x}")] WrongTag(u8),
    #[error("unexpected key length {0}")] BadLength(usize),
    #[error("unknown kind byte {0:#04x}")] UnknownKind(u8),
}

/// What a full record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// The transaction created an output paying the script.
    Created,
    /// The transaction spent an output that paid the script.
    Spent,
}

impl EntryKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Created => KIND_CREATED,
            Self::Spent => KIND_SPENT,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            KIND_CREATED => Some(Self::Created),
            KIND_SPENT => Some(Self::Spent),
            _ => None,
        }
    }
}

/// A key in the index keyspace.
///
/// `Search` is never stored: it is the prefix used to scan for all
/// `Full` records of one `AddrId`. `Seed` is the singleton under which
/// the hash seed lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexKey {
    /// The hash-seed singleton.
    Seed,
    /// Scan prefix for one address id.
    Search { addr_id: AddrId },
    /// One index record.
    Full {
        addr_id: AddrId,
        kind: EntryKind,
        outpoint: OutPoint,
    },
}

impl IndexKey {
    /// Serialize to the on-disk byte layout.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Seed => vec![INDEX_TAG, KIND_SEED],
            Self::Search { addr_id } => {
                let mut out = Vec::with_capacity(SEARCH_KEY_LEN);
                out.push(INDEX_TAG);
                out.extend_from_slice(&addr_id.to_be_bytes());
                out
            }
            Self::Full { addr_id, kind, outpoint } => {
                let mut out = Vec::with_capacity(FULL_KEY_LEN);
                out.push(INDEX_TAG);
                out.extend_from_slice(&addr_id.to_be_bytes());
                out.push(kind.to_byte());
                out.extend_from_slice(outpoint.txid.as_bytes());
                out.extend_from_slice(&outpoint.vout.to_be_bytes());
                out
            }
        }
    }

    /// Decode a key from its byte layout. The length discriminates the
    /// variant; an unrecognized kind byte in a full-length key is the
    /// caller's invariant-violation case.
    pub fn decode(bytes: &[u8]) -> Result<Self, KeyDecodeError> {
        match bytes.first() {
            Some(&INDEX_TAG) => {}
            Some(&other) => return Err(KeyDecodeError::WrongTag(other)),
            None => return Err(KeyDecodeError::BadLength(0)),
        }
        match bytes.len() {
            SEED_KEY_LEN => {
                if bytes[1] == KIND_SEED {
                    Ok(Self::Seed)
                } else {
                    Err(KeyDecodeError::UnknownKind(bytes[1]))
                }
            }
            SEARCH_KEY_LEN => Ok(Self::Search {
                addr_id: be_u32(&bytes[1..5]),
            }),
            FULL_KEY_LEN => {
                let kind = EntryKind::from_byte(bytes[5])
                    .ok_or(KeyDecodeError::UnknownKind(bytes[5]))?;
                let mut txid = [0u8; 32];
                txid.copy_from_slice(&bytes[6..38]);
                Ok(Self::Full {
                    addr_id: be_u32(&bytes[1..5]),
                    kind,
                    outpoint: OutPoint {
                        txid: Hash256(txid),
                        vout: be_u32(&bytes[38..42]),
                    },
                })
            }
            other => Err(KeyDecodeError::BadLength(other)),
        }
    }

    /// Whether this key falls inside the scan range for `addr_id`.
    pub fn matches_search(&self, addr_id: AddrId) -> bool {
        match self {
            Self::Search { addr_id: a } | Self::Full { addr_id: a, .. } => *a == addr_id,
            Self::Seed => false,
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Value stored under a full key: where the referencing transaction
/// lives on disk, plus the script itself for collision verification.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct IndexValue {
    /// Disk position of the transaction that created or spent the output.
    pub pos: DiskTxPos,
    /// Full script bytes. Length-prefixed by the encoding.
    pub script: Script,
}

impl IndexValue {
    /// Serialize with the canonical encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        bincode::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    /// Deserialize from the canonical encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(v, _)| v)
            .map_err(|e| e.to_string())
    }
}
