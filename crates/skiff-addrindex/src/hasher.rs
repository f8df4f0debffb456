//! Seeded script hashing.
//!
//! Every database draws a random 32-byte seed at first open and keeps it
//! for life. `AddrId`s are the first four bytes of a keyed BLAKE3 hash of
//! the script, so an attacker who does not know the seed cannot cheaply
//! construct scripts colliding to a chosen id. Collisions still happen
//! (the id is 32 bits wide); stored records carry the full script so
//! queries can tell colliding scripts apart.

use std::fmt;

use rand::RngCore;

use skiff_core::types::Script;

use crate::keys::AddrId;

/// Length of the hash seed in bytes.
pub const SEED_LEN: usize = 32;

/// Script hasher keyed with the database's seed.
///
/// The seed is secret: it is persisted in the database, never logged,
/// and `Debug` output redacts it.
#[derive(Clone)]
pub struct ScriptHasher {
    key: [u8; SEED_LEN],
}

impl ScriptHasher {
    /// Hasher with an explicit seed.
    pub fn new(key: [u8; SEED_LEN]) -> Self {
        Self { key }
    }

    /// Hasher with a fresh cryptographically random seed.
    pub fn random() -> Self {
        let mut key = [0u8; SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Derive the address id for a script.
    pub fn addr_id(&self, script: &Script) -> AddrId {
        let hash = blake3::keyed_hash(&self.key, script.as_bytes());
        let bytes = hash.as_bytes();
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// The raw seed, for persisting into the seed record.
    pub(crate) fn key(&self) -> &[u8; SEED_LEN] {
        &self.key
    }
}

impl fmt::Debug for ScriptHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptHasher(..)")
    }
}
