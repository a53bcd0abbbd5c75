//! Global `compression_type` table: persisted ids of compression methods.

use serde::{Deserialize, Serialize};

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{CompressionTypeId, MetaError};

const INDEX_METHOD: &str = "method";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CompressionTypeRow {
    method: String,
}

/// Data access for the `compression_type` table.
pub struct CompressionTypeTable {
    raw: RawTable,
}

impl CompressionTypeTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("compression_type")?),
        })
    }

    /// Id of `method`, registering it on first use.
    pub fn get_or_insert(
        &self,
        txn: &mut WriteTxn<'_>,
        method: &str,
    ) -> Result<CompressionTypeId, MetaError> {
        if let Some(id) = self.find(&*txn, method)? {
            return Ok(id);
        }
        self.raw.ensure(&*txn)?;
        let id = self.raw.next_id(txn, 1)?;
        self.raw
            .index_insert_unique(txn, INDEX_METHOD, method.as_bytes(), &id_key(id))?;
        self.raw.put(
            txn,
            &id_key(id),
            &CompressionTypeRow {
                method: method.to_string(),
            },
        )?;
        Ok(CompressionTypeId::new(id))
    }

    /// Id registered for `method`.
    pub fn find(
        &self,
        txn: &impl KvRead,
        method: &str,
    ) -> Result<Option<CompressionTypeId>, MetaError> {
        self.raw
            .index_get_unique(txn, INDEX_METHOD, method.as_bytes())?
            .map(|pk| decode_id(&pk).map(CompressionTypeId::new))
            .transpose()
    }

    /// Method name registered under `id`.
    pub fn get(&self, txn: &impl KvRead, id: CompressionTypeId) -> Result<String, MetaError> {
        self.raw
            .get::<CompressionTypeRow>(txn, &id_key(id.as_u64()))?
            .map(|row| row.method)
            .ok_or_else(|| MetaError::KvError(format!("unknown compression type id {}", id)))
    }
}

impl Table for CompressionTypeTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::Database;

    #[test]
    fn test_ids_are_stable() {
        let db = Database::in_memory();
        let table = CompressionTypeTable::new().unwrap();
        let mut txn = db.write();
        table.create(&mut txn).unwrap();
        let zstd = table.get_or_insert(&mut txn, "zstd").unwrap();
        let lz4 = table.get_or_insert(&mut txn, "lz4").unwrap();
        assert_ne!(zstd, lz4);
        assert_eq!(table.get_or_insert(&mut txn, "zstd").unwrap(), zstd);
        assert_eq!(table.get(&txn, lz4).unwrap(), "lz4");
        assert!(table.get(&txn, CompressionTypeId::new(42)).is_err());
    }
}
