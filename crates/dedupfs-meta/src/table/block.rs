//! Global `block` table: stored (possibly compressed) bytes per hash.

use super::{id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{HashId, MetaError};

/// Data access for the `block` table.
pub struct BlockTable {
    raw: RawTable,
}

impl BlockTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("block")?),
        })
    }

    /// Stores the bytes for a hash, replacing any previous value.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, hash: HashId, data: &[u8]) -> Result<(), MetaError> {
        self.raw.put(txn, &id_key(hash.as_u64()), &data.to_vec())
    }

    /// Stored bytes of a hash.
    pub fn get(&self, txn: &impl KvRead, hash: HashId) -> Result<Vec<u8>, MetaError> {
        self.raw
            .get::<Vec<u8>>(txn, &id_key(hash.as_u64()))?
            .ok_or(MetaError::HashNotFound(hash))
    }

    /// Whether bytes are stored for a hash.
    pub fn contains(&self, txn: &impl KvRead, hash: HashId) -> Result<bool, MetaError> {
        self.raw.contains(txn, &id_key(hash.as_u64()))
    }

    /// Removes the bytes of a hash.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, hash: HashId) -> Result<bool, MetaError> {
        self.raw.remove(txn, &id_key(hash.as_u64()))
    }
}

impl Table for BlockTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}
