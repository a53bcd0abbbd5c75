//! Per-subvolume `inode_hash_block_{hash}` table.
//!
//! Maps each logical block of a file to the content hash stored for it. The
//! rows of every subvolume's table together form the reference count of a
//! hash; see [`crate::block_store`].

use serde::{Deserialize, Serialize};

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{HashId, InodeId, MetaError};

const INDEX_HASH: &str = "hash";

/// One block reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Owning file
    pub inode_id: InodeId,
    /// Block offset within the file, in blocks
    pub block_number: u64,
    /// Content stored for the block
    pub hash_id: HashId,
}

fn pk(inode: InodeId, block: u64) -> Vec<u8> {
    let mut key = id_key(inode.as_u64()).to_vec();
    key.extend_from_slice(&id_key(block));
    key
}

/// Data access for one subvolume's block index.
pub struct InodeHashBlockTable {
    raw: RawTable,
}

impl InodeHashBlockTable {
    /// Handle for the index table suffixed with `hash`.
    pub fn new(hash: &str) -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::scoped("inode_hash_block", hash)?),
        })
    }

    /// Adds a reference. Fails with a conflict if the block is already mapped.
    pub fn insert(
        &self,
        txn: &mut WriteTxn<'_>,
        inode: InodeId,
        block: u64,
        hash: HashId,
    ) -> Result<(), MetaError> {
        let key = pk(inode, block);
        if self.raw.contains(&*txn, &key)? {
            return Err(MetaError::UniqueViolation {
                table: self.raw.name().to_string(),
                index: "inode_block".to_string(),
            });
        }
        self.put_row(txn, inode, block, hash)
    }

    fn put_row(
        &self,
        txn: &mut WriteTxn<'_>,
        inode: InodeId,
        block: u64,
        hash: HashId,
    ) -> Result<(), MetaError> {
        let key = pk(inode, block);
        self.raw
            .index_insert(txn, INDEX_HASH, &id_key(hash.as_u64()), &key);
        self.raw.put(
            txn,
            &key,
            &BlockRef {
                inode_id: inode,
                block_number: block,
                hash_id: hash,
            },
        )
    }

    /// Points an existing or new block at `hash`. Returns the hash it
    /// replaced, if any.
    pub fn update(
        &self,
        txn: &mut WriteTxn<'_>,
        inode: InodeId,
        block: u64,
        hash: HashId,
    ) -> Result<Option<HashId>, MetaError> {
        let previous = self.delete_by_inode_number(txn, inode, block)?;
        self.put_row(txn, inode, block, hash)?;
        Ok(previous)
    }

    /// Hash stored for one block.
    pub fn hash_by_inode_number(
        &self,
        txn: &impl KvRead,
        inode: InodeId,
        block: u64,
    ) -> Result<Option<HashId>, MetaError> {
        Ok(self
            .raw
            .get::<BlockRef>(txn, &pk(inode, block))?
            .map(|row| row.hash_id))
    }

    /// Removes one block reference. Returns the hash it pointed at.
    pub fn delete_by_inode_number(
        &self,
        txn: &mut WriteTxn<'_>,
        inode: InodeId,
        block: u64,
    ) -> Result<Option<HashId>, MetaError> {
        let key = pk(inode, block);
        let Some(row) = self.raw.get::<BlockRef>(&*txn, &key)? else {
            return Ok(None);
        };
        self.raw
            .index_remove(txn, INDEX_HASH, &id_key(row.hash_id.as_u64()), &key);
        self.raw.remove(txn, &key)?;
        Ok(Some(row.hash_id))
    }

    /// Removes every block of an inode. Returns the released references.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, inode: InodeId) -> Result<Vec<BlockRef>, MetaError> {
        let rows = self.get_by_inode(&*txn, inode)?;
        for row in &rows {
            self.delete_by_inode_number(txn, row.inode_id, row.block_number)?;
        }
        Ok(rows)
    }

    /// Removes blocks of several inodes.
    pub fn remove_by_inodes(
        &self,
        txn: &mut WriteTxn<'_>,
        inodes: &[InodeId],
    ) -> Result<Vec<BlockRef>, MetaError> {
        let mut released = Vec::new();
        for inode in inodes {
            released.extend(self.delete(txn, *inode)?);
        }
        Ok(released)
    }

    /// Every block of an inode, ordered by block number.
    pub fn get_by_inode(&self, txn: &impl KvRead, inode: InodeId) -> Result<Vec<BlockRef>, MetaError> {
        Ok(self
            .raw
            .scan::<BlockRef>(txn, &id_key(inode.as_u64()))?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    /// Hashes of an inode's blocks, in block order.
    pub fn get_hashes_by_inode(
        &self,
        txn: &impl KvRead,
        inode: InodeId,
    ) -> Result<Vec<HashId>, MetaError> {
        Ok(self
            .get_by_inode(txn, inode)?
            .into_iter()
            .map(|row| row.hash_id)
            .collect())
    }

    /// Number of blocks mapped for an inode.
    pub fn get_count_by_inode(&self, txn: &impl KvRead, inode: InodeId) -> Result<usize, MetaError> {
        Ok(self.get_by_inode(txn, inode)?.len())
    }

    /// Number of references to `hash` in this table.
    pub fn get_count_hash(&self, txn: &impl KvRead, hash: HashId) -> Result<usize, MetaError> {
        Ok(self
            .raw
            .index_scan(txn, INDEX_HASH, &id_key(hash.as_u64()))?
            .len())
    }

    /// Number of distinct inodes with at least one block.
    pub fn get_count_uniq_inodes(&self, txn: &impl KvRead) -> Result<usize, MetaError> {
        let mut inodes = self.get_inode_ids(txn, None, None)?;
        inodes.dedup();
        Ok(inodes.len())
    }

    /// Distinct inodes with blocks, in `[start, end)` when bounds are given.
    pub fn get_inode_ids(
        &self,
        txn: &impl KvRead,
        start: Option<InodeId>,
        end: Option<InodeId>,
    ) -> Result<Vec<InodeId>, MetaError> {
        let mut inodes: Vec<InodeId> = self
            .all(txn)?
            .into_iter()
            .map(|row| row.inode_id)
            .filter(|ino| start.map_or(true, |s| *ino >= s) && end.map_or(true, |e| *ino < e))
            .collect();
        inodes.dedup();
        Ok(inodes)
    }

    /// Which of `hashes` are referenced by this table.
    pub fn get_hashes_by_hashes(
        &self,
        txn: &impl KvRead,
        hashes: &[HashId],
    ) -> Result<Vec<HashId>, MetaError> {
        let mut found = Vec::new();
        for hash in hashes {
            if self.get_count_hash(txn, *hash)? > 0 {
                found.push(*hash);
            }
        }
        Ok(found)
    }

    /// Hash of every row, duplicates included, in (inode, block) order.
    pub fn get_hash_ids(&self, txn: &impl KvRead) -> Result<Vec<HashId>, MetaError> {
        Ok(self.all(txn)?.into_iter().map(|row| row.hash_id).collect())
    }

    /// Every row, in (inode, block) order.
    pub fn all(&self, txn: &impl KvRead) -> Result<Vec<BlockRef>, MetaError> {
        Ok(self
            .raw
            .scan::<BlockRef>(txn, &[])?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    /// Distinct hash ids referenced by this table, ascending.
    pub fn distinct_hash_ids(&self, txn: &impl KvRead) -> Result<Vec<HashId>, MetaError> {
        let mut hashes = self.get_hash_ids(txn)?;
        hashes.sort();
        hashes.dedup();
        Ok(hashes)
    }

    /// Highest block number mapped for an inode.
    pub fn last_block(&self, txn: &impl KvRead, inode: InodeId) -> Result<Option<u64>, MetaError> {
        let rows = self.raw.scan::<BlockRef>(txn, &id_key(inode.as_u64()))?;
        rows.last()
            .map(|(key, _)| decode_id(&key[8..]))
            .transpose()
    }
}

impl Table for InodeHashBlockTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::Database;

    fn setup(db: &Database) -> InodeHashBlockTable {
        let table = InodeHashBlockTable::new("00aa").unwrap();
        let mut txn = db.write();
        table.create(&mut txn).unwrap();
        txn.commit().unwrap();
        table
    }

    #[test]
    fn test_block_is_unique_per_inode() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let ino = InodeId::new(3);
        table.insert(&mut txn, ino, 0, HashId::new(1)).unwrap();
        assert!(matches!(
            table.insert(&mut txn, ino, 0, HashId::new(2)),
            Err(MetaError::UniqueViolation { .. })
        ));
    }

    #[test]
    fn test_update_returns_previous_hash() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let ino = InodeId::new(3);
        assert_eq!(table.update(&mut txn, ino, 0, HashId::new(1)).unwrap(), None);
        assert_eq!(
            table.update(&mut txn, ino, 0, HashId::new(2)).unwrap(),
            Some(HashId::new(1))
        );
        assert_eq!(table.get_count_hash(&txn, HashId::new(1)).unwrap(), 0);
        assert_eq!(table.get_count_hash(&txn, HashId::new(2)).unwrap(), 1);
        assert_eq!(
            table.hash_by_inode_number(&txn, ino, 0).unwrap(),
            Some(HashId::new(2))
        );
    }

    #[test]
    fn test_counts_and_hash_listing() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let h = HashId::new(7);
        table.insert(&mut txn, InodeId::new(3), 0, h).unwrap();
        table.insert(&mut txn, InodeId::new(3), 1, h).unwrap();
        table.insert(&mut txn, InodeId::new(4), 0, HashId::new(8)).unwrap();
        table.insert(&mut txn, InodeId::new(9), 0, h).unwrap();

        assert_eq!(table.get_count_hash(&txn, h).unwrap(), 3);
        assert_eq!(table.get_count_by_inode(&txn, InodeId::new(3)).unwrap(), 2);
        assert_eq!(table.get_count_uniq_inodes(&txn).unwrap(), 3);
        assert_eq!(table.get_hash_ids(&txn).unwrap().len(), 4);
        assert_eq!(table.distinct_hash_ids(&txn).unwrap(), vec![h, HashId::new(8)]);
        assert_eq!(
            table
                .get_inode_ids(&txn, Some(InodeId::new(4)), Some(InodeId::new(9)))
                .unwrap(),
            vec![InodeId::new(4)]
        );
        assert_eq!(
            table
                .get_hashes_by_hashes(&txn, &[HashId::new(8), HashId::new(100)])
                .unwrap(),
            vec![HashId::new(8)]
        );
        assert_eq!(table.last_block(&txn, InodeId::new(3)).unwrap(), Some(1));
    }

    #[test]
    fn test_delete_inode_blocks() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let ino = InodeId::new(3);
        for block in 0..4 {
            table.insert(&mut txn, ino, block, HashId::new(block + 1)).unwrap();
        }
        table.insert(&mut txn, InodeId::new(4), 0, HashId::new(1)).unwrap();
        let released = table.remove_by_inodes(&mut txn, &[ino]).unwrap();
        assert_eq!(released.len(), 4);
        assert_eq!(table.get_count_by_inode(&txn, ino).unwrap(), 0);
        assert_eq!(table.get_count_hash(&txn, HashId::new(1)).unwrap(), 1);
    }
}
