//! Global `hash_compression_type` table: method each block was stored with.

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{CompressionTypeId, HashId, MetaError};

/// Data access for the `hash_compression_type` table.
pub struct HashCompressionTypeTable {
    raw: RawTable,
}

impl HashCompressionTypeTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("hash_compression_type")?),
        })
    }

    /// Records the compression type of a hash.
    pub fn insert(
        &self,
        txn: &mut WriteTxn<'_>,
        hash: HashId,
        type_id: CompressionTypeId,
    ) -> Result<(), MetaError> {
        self.raw.put(txn, &id_key(hash.as_u64()), &type_id)
    }

    /// Compression type of a hash, if recorded.
    pub fn get(
        &self,
        txn: &impl KvRead,
        hash: HashId,
    ) -> Result<Option<CompressionTypeId>, MetaError> {
        self.raw.get(txn, &id_key(hash.as_u64()))
    }

    /// Removes the record for a hash.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, hash: HashId) -> Result<bool, MetaError> {
        self.raw.remove(txn, &id_key(hash.as_u64()))
    }

    /// Hashes stored with `type_id`.
    pub fn hashes_with_type(
        &self,
        txn: &impl KvRead,
        type_id: CompressionTypeId,
    ) -> Result<Vec<HashId>, MetaError> {
        let mut out = Vec::new();
        for (pk, stored) in self.raw.scan::<CompressionTypeId>(txn, &[])? {
            if stored == type_id {
                out.push(HashId::new(decode_id(&pk)?));
            }
        }
        Ok(out)
    }
}

impl Table for HashCompressionTypeTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::Database;

    #[test]
    fn test_type_per_hash() {
        let db = Database::in_memory();
        let table = HashCompressionTypeTable::new().unwrap();
        let mut txn = db.write();
        table.create(&mut txn).unwrap();
        let zstd = CompressionTypeId::new(1);
        let none = CompressionTypeId::new(2);
        table.insert(&mut txn, HashId::new(10), zstd).unwrap();
        table.insert(&mut txn, HashId::new(11), none).unwrap();
        table.insert(&mut txn, HashId::new(12), zstd).unwrap();
        assert_eq!(table.get(&txn, HashId::new(11)).unwrap(), Some(none));
        assert_eq!(
            table.hashes_with_type(&txn, zstd).unwrap(),
            vec![HashId::new(10), HashId::new(12)]
        );
        assert!(table.delete(&mut txn, HashId::new(10)).unwrap());
        assert_eq!(table.get(&txn, HashId::new(10)).unwrap(), None);
    }
}
