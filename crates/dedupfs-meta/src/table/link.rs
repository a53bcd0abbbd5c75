//! Per-subvolume `link_{hash}` table: symlink targets.

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{InodeId, MetaError};

/// Data access for one subvolume's symlink table.
pub struct LinkTable {
    raw: RawTable,
}

impl LinkTable {
    /// Handle for the link table suffixed with `hash`.
    pub fn new(hash: &str) -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::scoped("link", hash)?),
        })
    }

    /// Stores the target of a symlink inode.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, inode: InodeId, target: &[u8]) -> Result<(), MetaError> {
        self.raw.put(txn, &id_key(inode.as_u64()), &target.to_vec())
    }

    /// Target of a symlink inode.
    pub fn find_by_inode(&self, txn: &impl KvRead, inode: InodeId) -> Result<Option<Vec<u8>>, MetaError> {
        self.raw.get(txn, &id_key(inode.as_u64()))
    }

    /// Removes the target of a symlink inode.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, inode: InodeId) -> Result<bool, MetaError> {
        self.raw.remove(txn, &id_key(inode.as_u64()))
    }

    /// Every (inode, target) pair.
    pub fn all(&self, txn: &impl KvRead) -> Result<Vec<(InodeId, Vec<u8>)>, MetaError> {
        self.raw
            .scan::<Vec<u8>>(txn, &[])?
            .into_iter()
            .map(|(pk, target)| Ok((InodeId::new(decode_id(&pk)?), target)))
            .collect()
    }
}

impl Table for LinkTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}
