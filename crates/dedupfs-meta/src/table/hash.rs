//! Global `hash` table: content digests of stored blocks.

use serde::{Deserialize, Serialize};

use dedupfs_reduce::BlockHash;

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{HashId, MetaError};

const INDEX_DIGEST: &str = "digest";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct HashRow {
    digest: BlockHash,
}

/// Data access for the `hash` table.
pub struct HashTable {
    raw: RawTable,
}

impl HashTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("hash")?),
        })
    }

    /// Records a new digest.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, digest: &BlockHash) -> Result<HashId, MetaError> {
        self.raw.ensure(&*txn)?;
        let id = self.raw.next_id(txn, 1)?;
        self.raw
            .index_insert_unique(txn, INDEX_DIGEST, digest.as_bytes(), &id_key(id))?;
        self.raw
            .put(txn, &id_key(id), &HashRow { digest: *digest })?;
        Ok(HashId::new(id))
    }

    /// Id of a known digest.
    pub fn find(&self, txn: &impl KvRead, digest: &BlockHash) -> Result<Option<HashId>, MetaError> {
        self.raw
            .index_get_unique(txn, INDEX_DIGEST, digest.as_bytes())?
            .map(|pk| decode_id(&pk).map(HashId::new))
            .transpose()
    }

    /// Digest recorded for `id`.
    pub fn get(&self, txn: &impl KvRead, id: HashId) -> Result<BlockHash, MetaError> {
        self.raw
            .get::<HashRow>(txn, &id_key(id.as_u64()))?
            .map(|row| row.digest)
            .ok_or(MetaError::HashNotFound(id))
    }

    /// Removes a digest. Returns false if it did not exist.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, id: HashId) -> Result<bool, MetaError> {
        let pk = id_key(id.as_u64());
        let Some(row) = self.raw.get::<HashRow>(&*txn, &pk)? else {
            return Ok(false);
        };
        self.raw
            .index_remove_unique(txn, INDEX_DIGEST, row.digest.as_bytes());
        self.raw.remove(txn, &pk)
    }

    /// Every hash id, ascending.
    pub fn ids(&self, txn: &impl KvRead) -> Result<Vec<HashId>, MetaError> {
        self.raw
            .scan::<HashRow>(txn, &[])?
            .into_iter()
            .map(|(pk, _)| decode_id(&pk).map(HashId::new))
            .collect()
    }
}

impl Table for HashTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}
