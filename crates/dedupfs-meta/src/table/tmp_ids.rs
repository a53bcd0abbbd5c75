//! Global `tmp_ids` scratch table used while collecting garbage.

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::MetaError;

/// Data access for the `tmp_ids` table.
pub struct TmpIdsTable {
    raw: RawTable,
}

impl TmpIdsTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("tmp_ids")?),
        })
    }

    /// Drops and recreates the table, leaving it empty.
    pub fn reset(&self, txn: &mut WriteTxn<'_>) -> Result<(), MetaError> {
        self.raw.drop_table(txn)?;
        self.raw.create(txn)?;
        Ok(())
    }

    /// Adds an id. Adding a present id is a no-op.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, id: u64) -> Result<(), MetaError> {
        self.raw.put(txn, &id_key(id), &())
    }

    /// Whether `id` was added.
    pub fn contains(&self, txn: &impl KvRead, id: u64) -> Result<bool, MetaError> {
        self.raw.contains(txn, &id_key(id))
    }

    /// Every id, ascending.
    pub fn ids(&self, txn: &impl KvRead) -> Result<Vec<u64>, MetaError> {
        self.raw
            .scan::<()>(txn, &[])?
            .into_iter()
            .map(|(pk, _)| decode_id(&pk))
            .collect()
    }
}

impl Table for TmpIdsTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}
