//! Global `hash_sizes` table: logical and stored size of each block.

use serde::{Deserialize, Serialize};

use super::{id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{HashId, MetaError};

/// Sizes recorded for one hash.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSizes {
    /// Uncompressed length
    pub real_size: u64,
    /// Stored length
    pub compressed_size: u64,
}

/// Data access for the `hash_sizes` table.
pub struct HashSizesTable {
    raw: RawTable,
}

impl HashSizesTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("hash_sizes")?),
        })
    }

    /// Records sizes for a hash.
    pub fn insert(
        &self,
        txn: &mut WriteTxn<'_>,
        hash: HashId,
        sizes: HashSizes,
    ) -> Result<(), MetaError> {
        self.raw.put(txn, &id_key(hash.as_u64()), &sizes)
    }

    /// Sizes of a hash, if recorded.
    pub fn get(&self, txn: &impl KvRead, hash: HashId) -> Result<Option<HashSizes>, MetaError> {
        self.raw.get(txn, &id_key(hash.as_u64()))
    }

    /// Removes the sizes of a hash.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, hash: HashId) -> Result<bool, MetaError> {
        self.raw.remove(txn, &id_key(hash.as_u64()))
    }
}

impl Table for HashSizesTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::Database;

    #[test]
    fn test_sizes_roundtrip() {
        let db = Database::in_memory();
        let table = HashSizesTable::new().unwrap();
        let mut txn = db.write();
        table.create(&mut txn).unwrap();
        let sizes = HashSizes {
            real_size: 131072,
            compressed_size: 4000,
        };
        table.insert(&mut txn, HashId::new(1), sizes).unwrap();
        assert_eq!(table.get(&txn, HashId::new(1)).unwrap(), Some(sizes));
        assert_eq!(table.get(&txn, HashId::new(2)).unwrap(), None);
    }
}
