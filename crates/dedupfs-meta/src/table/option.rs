//! Global `option` table: store-wide settings fixed when the store is created.

use super::{RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::MetaError;

/// Option holding the file block size in bytes.
pub const BLOCK_SIZE: &str = "block_size";

/// Data access for the `option` table.
pub struct OptionTable {
    raw: RawTable,
}

impl OptionTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("option")?),
        })
    }

    /// Value of an option, if set.
    pub fn get(&self, txn: &impl KvRead, name: &str) -> Result<Option<String>, MetaError> {
        self.raw.get(txn, name.as_bytes())
    }

    /// Sets an option, replacing any previous value.
    pub fn set(&self, txn: &mut WriteTxn<'_>, name: &str, value: &str) -> Result<(), MetaError> {
        self.raw.put(txn, name.as_bytes(), &value.to_string())
    }

    /// Integer option. A value that does not parse is a serialization error.
    pub fn get_u64(&self, txn: &impl KvRead, name: &str) -> Result<Option<u64>, MetaError> {
        self.get(txn, name)?
            .map(|value| {
                value.parse::<u64>().map_err(|_| {
                    MetaError::Serialization(format!("option {} is not an integer: {:?}", name, value))
                })
            })
            .transpose()
    }
}

impl Table for OptionTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}
