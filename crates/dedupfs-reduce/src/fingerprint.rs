//! Content fingerprinting: BLAKE3 hashing of data blocks

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash identifying a block's content. Used as the CAS key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short identifier built from the first `len` bytes, as lowercase hex.
    pub fn short_hex(&self, len: usize) -> String {
        hex::encode(&self.0[..len.min(32)])
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute BLAKE3 hash of data
pub fn blake3_hash(data: &[u8]) -> BlockHash {
    let hash = blake3::hash(data);
    BlockHash(*hash.as_bytes())
}
