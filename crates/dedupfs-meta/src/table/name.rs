//! Global `name` table: interned directory entry names.

use serde::{Deserialize, Serialize};

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{MetaError, NameId};

const INDEX_VALUE: &str = "value";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NameRow {
    value: Vec<u8>,
}

/// Data access for the `name` table.
pub struct NameTable {
    raw: RawTable,
}

impl NameTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("name")?),
        })
    }

    /// Approximate stored size of a name row: id, length and bytes.
    pub fn get_row_size(value: &[u8]) -> u64 {
        8 + 4 + value.len() as u64
    }

    /// Inserts a new name. Fails with a conflict if it is already interned.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, value: &[u8]) -> Result<NameId, MetaError> {
        self.raw.ensure(&*txn)?;
        let id = self.raw.next_id(txn, 1)?;
        self.raw
            .index_insert_unique(txn, INDEX_VALUE, value, &id_key(id))?;
        self.raw.put(
            txn,
            &id_key(id),
            &NameRow {
                value: value.to_vec(),
            },
        )?;
        Ok(NameId::new(id))
    }

    /// Id of an interned name.
    pub fn find(&self, txn: &impl KvRead, value: &[u8]) -> Result<Option<NameId>, MetaError> {
        self.raw
            .index_get_unique(txn, INDEX_VALUE, value)?
            .map(|pk| decode_id(&pk).map(NameId::new))
            .transpose()
    }

    /// Id of `value`, interning it first if needed.
    pub fn intern(&self, txn: &mut WriteTxn<'_>, value: &[u8]) -> Result<NameId, MetaError> {
        match self.find(&*txn, value)? {
            Some(id) => Ok(id),
            None => self.insert(txn, value),
        }
    }

    /// Bytes of an interned name.
    pub fn get(&self, txn: &impl KvRead, id: NameId) -> Result<Vec<u8>, MetaError> {
        self.raw
            .get::<NameRow>(txn, &id_key(id.as_u64()))?
            .map(|row| row.value)
            .ok_or(MetaError::NameNotFound(id))
    }

    /// Removes a name. Returns false if it did not exist.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, id: NameId) -> Result<bool, MetaError> {
        let pk = id_key(id.as_u64());
        let Some(row) = self.raw.get::<NameRow>(&*txn, &pk)? else {
            return Ok(false);
        };
        self.raw.index_remove_unique(txn, INDEX_VALUE, &row.value);
        self.raw.remove(txn, &pk)
    }

    /// Every name id, ascending.
    pub fn ids(&self, txn: &impl KvRead) -> Result<Vec<NameId>, MetaError> {
        self.raw
            .scan::<NameRow>(txn, &[])?
            .into_iter()
            .map(|(pk, _)| decode_id(&pk).map(NameId::new))
            .collect()
    }
}

impl Table for NameTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}
