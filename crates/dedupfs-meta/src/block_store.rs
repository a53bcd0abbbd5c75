//! Content-addressable block store.
//!
//! Every distinct block is stored exactly once, keyed by its BLAKE3 digest.
//! References live in the per-subvolume `inode_hash_block` tables; the sum of
//! rows pointing at a hash across all subvolumes is its reference count.
//! When a reference is dropped the count is taken again inside the same
//! write transaction, and at zero the bytes and size records are purged.
//!
//! Write path: data → BLAKE3 → digest lookup → (new) compress + store → index row
//! Read path:  index row → stored bytes → decompress (method recorded per hash) → verify size

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use dedupfs_reduce::{blake3_hash, CompressionPlan, CompressionRegistry};

use crate::kvstore::{KvRead, WriteTxn};
use crate::table::hash_sizes::HashSizes;
use crate::table::{GlobalTables, SubvolumeTables, Table};
use crate::types::{HashId, InodeId, MetaError};

/// Counters since the store was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStoreStats {
    /// Blocks whose content was new and got stored
    pub blocks_written: u64,
    /// Blocks whose content was already stored
    pub blocks_deduplicated: u64,
    /// Hashes purged after their last reference went away
    pub blocks_released: u64,
    /// Stored (compressed) bytes written
    pub bytes_stored: u64,
}

/// Result of [`BlockStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlock {
    /// Hash row of the content
    pub hash_id: HashId,
    /// False when the content was already stored
    pub is_new: bool,
}

/// Content-addressable block store over the global hash tables.
pub struct BlockStore {
    registry: CompressionRegistry,
    plan: CompressionPlan,
    tables: GlobalTables,
    stats: Mutex<BlockStoreStats>,
}

impl BlockStore {
    /// Creates a block store compressing new blocks with `plan`.
    pub fn new(registry: CompressionRegistry, plan: CompressionPlan) -> Result<Self, MetaError> {
        Ok(Self {
            registry,
            plan,
            tables: GlobalTables::new()?,
            stats: Mutex::new(BlockStoreStats::default()),
        })
    }

    /// The compression registry used for decoding.
    pub fn registry(&self) -> &CompressionRegistry {
        &self.registry
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BlockStoreStats {
        self.stats.lock().clone()
    }

    /// Stores `data` unless identical content is already present.
    #[instrument(skip(self, txn, data), fields(len = data.len()))]
    pub fn store(&self, txn: &mut WriteTxn<'_>, data: &[u8]) -> Result<StoredBlock, MetaError> {
        let digest = blake3_hash(data);
        if let Some(hash_id) = self.tables.hash.find(&*txn, &digest)? {
            trace!(%hash_id, "block already stored");
            self.stats.lock().blocks_deduplicated += 1;
            return Ok(StoredBlock {
                hash_id,
                is_new: false,
            });
        }

        let compressed = self.plan.compress(data)?;
        let hash_id = self.tables.hash.insert(txn, &digest)?;
        let type_id = self
            .tables
            .compression_type
            .get_or_insert(txn, compressed.method)?;
        self.tables.block.insert(txn, hash_id, &compressed.data)?;
        self.tables.hash_sizes.insert(
            txn,
            hash_id,
            HashSizes {
                real_size: data.len() as u64,
                compressed_size: compressed.data.len() as u64,
            },
        )?;
        self.tables
            .hash_compression_type
            .insert(txn, hash_id, type_id)?;

        debug!(
            %hash_id,
            method = compressed.method,
            real = data.len(),
            stored = compressed.data.len(),
            "stored new block"
        );
        let mut stats = self.stats.lock();
        stats.blocks_written += 1;
        stats.bytes_stored += compressed.data.len() as u64;
        Ok(StoredBlock {
            hash_id,
            is_new: true,
        })
    }

    /// Stores `data` as block `block` of `inode`, replacing whatever the block
    /// held before. A replaced hash is released.
    pub fn write_block(
        &self,
        txn: &mut WriteTxn<'_>,
        subvol: &SubvolumeTables,
        inode: InodeId,
        block: u64,
        data: &[u8],
    ) -> Result<StoredBlock, MetaError> {
        let stored = self.store(txn, data)?;
        let previous = subvol
            .inode_hash_block
            .update(txn, inode, block, stored.hash_id)?;
        if let Some(old) = previous {
            if old != stored.hash_id {
                self.release(txn, old)?;
            }
        }
        Ok(stored)
    }

    /// Content of block `block` of `inode`, or `None` for a hole.
    pub fn read_block(
        &self,
        txn: &impl KvRead,
        subvol: &SubvolumeTables,
        inode: InodeId,
        block: u64,
    ) -> Result<Option<Vec<u8>>, MetaError> {
        match subvol.inode_hash_block.hash_by_inode_number(txn, inode, block)? {
            Some(hash_id) => self.load(txn, hash_id).map(Some),
            None => Ok(None),
        }
    }

    /// Decompressed content stored for `hash_id`.
    pub fn load(&self, txn: &impl KvRead, hash_id: HashId) -> Result<Vec<u8>, MetaError> {
        let stored = self.tables.block.get(txn, hash_id)?;
        let method = self.compression_method(txn, hash_id)?;
        let data = self.registry.decompress(&method, &stored)?;
        let sizes = self
            .tables
            .hash_sizes
            .get(txn, hash_id)?
            .ok_or(MetaError::HashNotFound(hash_id))?;
        if data.len() as u64 != sizes.real_size {
            return Err(MetaError::CorruptBlock {
                hash: hash_id,
                expected: sizes.real_size,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    /// Method name the block of `hash_id` was stored with.
    pub fn compression_method(&self, txn: &impl KvRead, hash_id: HashId) -> Result<String, MetaError> {
        let type_id = self
            .tables
            .hash_compression_type
            .get(txn, hash_id)?
            .ok_or(MetaError::HashNotFound(hash_id))?;
        self.tables.compression_type.get(txn, type_id)
    }

    /// Sizes recorded for `hash_id`.
    pub fn hash_sizes(&self, txn: &impl KvRead, hash_id: HashId) -> Result<Option<HashSizes>, MetaError> {
        self.tables.hash_sizes.get(txn, hash_id)
    }

    /// Removes one block reference. Returns whether the block was mapped.
    pub fn delete_block(
        &self,
        txn: &mut WriteTxn<'_>,
        subvol: &SubvolumeTables,
        inode: InodeId,
        block: u64,
    ) -> Result<bool, MetaError> {
        match subvol
            .inode_hash_block
            .delete_by_inode_number(txn, inode, block)?
        {
            Some(hash_id) => {
                self.release(txn, hash_id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes every block reference of `inode`. Returns how many there were.
    pub fn delete_inode_blocks(
        &self,
        txn: &mut WriteTxn<'_>,
        subvol: &SubvolumeTables,
        inode: InodeId,
    ) -> Result<usize, MetaError> {
        let released = subvol.inode_hash_block.delete(txn, inode)?;
        let hashes: BTreeSet<HashId> = released.iter().map(|r| r.hash_id).collect();
        for hash_id in hashes {
            self.release(txn, hash_id)?;
        }
        Ok(released.len())
    }

    /// Removes the references of blocks at or past `keep_blocks`.
    pub fn truncate_blocks(
        &self,
        txn: &mut WriteTxn<'_>,
        subvol: &SubvolumeTables,
        inode: InodeId,
        keep_blocks: u64,
    ) -> Result<usize, MetaError> {
        let doomed: Vec<u64> = subvol
            .inode_hash_block
            .get_by_inode(&*txn, inode)?
            .into_iter()
            .map(|r| r.block_number)
            .filter(|b| *b >= keep_blocks)
            .collect();
        for block in &doomed {
            self.delete_block(txn, subvol, inode, *block)?;
        }
        Ok(doomed.len())
    }

    /// References to `hash_id` across every subvolume's block index.
    pub fn count_hash_refs(&self, txn: &impl KvRead, hash_id: HashId) -> Result<usize, MetaError> {
        let mut total = 0;
        for record in self.tables.subvolume.get_all(txn)? {
            let index = SubvolumeTables::new(&record.hash)?.inode_hash_block;
            if index.exists(txn)? {
                total += index.get_count_hash(txn, hash_id)?;
            }
        }
        Ok(total)
    }

    /// Purges `hash_id` if nothing references it any more.
    /// Returns whether it was purged.
    pub fn release(&self, txn: &mut WriteTxn<'_>, hash_id: HashId) -> Result<bool, MetaError> {
        let refs = self.count_hash_refs(&*txn, hash_id)?;
        if refs > 0 {
            trace!(%hash_id, refs, "hash still referenced");
            return Ok(false);
        }
        self.purge_hash(txn, hash_id)?;
        Ok(true)
    }

    /// Deletes the stored bytes and every record of `hash_id` without
    /// looking at references. Returns the stored bytes reclaimed.
    pub fn purge_hash(&self, txn: &mut WriteTxn<'_>, hash_id: HashId) -> Result<u64, MetaError> {
        let reclaimed = self
            .tables
            .hash_sizes
            .get(&*txn, hash_id)?
            .map_or(0, |s| s.compressed_size);
        self.tables.block.delete(txn, hash_id)?;
        self.tables.hash_sizes.delete(txn, hash_id)?;
        self.tables.hash_compression_type.delete(txn, hash_id)?;
        self.tables.hash.delete(txn, hash_id)?;
        debug!(%hash_id, reclaimed, "purged block");
        self.stats.lock().blocks_released += 1;
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::Database;
    use crate::table::subvolume::SubvolumeTable;
    use crate::types::Timestamp;

    struct Fixture {
        db: Database,
        store: BlockStore,
        sv: SubvolumeTables,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory();
        let store = BlockStore::new(CompressionRegistry::builtin(), CompressionPlan::default()).unwrap();
        let subvolumes = SubvolumeTable::new().unwrap();
        let mut txn = db.write();
        GlobalTables::new().unwrap().create_all(&mut txn).unwrap();
        let rec = subvolumes.insert(&mut txn, b"sv", Timestamp::from_secs(0)).unwrap();
        let sv = SubvolumeTables::new(&rec.hash).unwrap();
        sv.create_all(&mut txn).unwrap();
        txn.commit().unwrap();
        Fixture { db, store, sv }
    }

    fn block(seed: u8) -> Vec<u8> {
        (0..4096u32).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    #[test]
    fn test_identical_blocks_stored_once() {
        let f = fixture();
        let mut txn = f.db.write();
        let a = f.store.write_block(&mut txn, &f.sv, InodeId::new(3), 0, &block(3)).unwrap();
        let b = f.store.write_block(&mut txn, &f.sv, InodeId::new(4), 0, &block(3)).unwrap();
        assert!(a.is_new);
        assert!(!b.is_new);
        assert_eq!(a.hash_id, b.hash_id);
        assert_eq!(f.store.count_hash_refs(&txn, a.hash_id).unwrap(), 2);
        let tables = GlobalTables::new().unwrap();
        assert_eq!(tables.block.count(&txn).unwrap(), 1);
        assert_eq!(tables.hash_sizes.count(&txn).unwrap(), 1);
        let stats = f.store.stats();
        assert_eq!(stats.blocks_written, 1);
        assert_eq!(stats.blocks_deduplicated, 1);
    }

    #[test]
    fn test_read_back_and_holes() {
        let f = fixture();
        let mut txn = f.db.write();
        let data = block(7);
        f.store.write_block(&mut txn, &f.sv, InodeId::new(3), 2, &data).unwrap();
        txn.commit().unwrap();
        let txn = f.db.read();
        assert_eq!(f.store.read_block(&txn, &f.sv, InodeId::new(3), 2).unwrap(), Some(data));
        assert_eq!(f.store.read_block(&txn, &f.sv, InodeId::new(3), 0).unwrap(), None);
    }

    #[test]
    fn test_last_reference_purges() {
        let f = fixture();
        let mut txn = f.db.write();
        let s = f.store.write_block(&mut txn, &f.sv, InodeId::new(3), 0, &block(5)).unwrap();
        assert!(f.store.delete_block(&mut txn, &f.sv, InodeId::new(3), 0).unwrap());
        let tables = GlobalTables::new().unwrap();
        assert!(!tables.block.contains(&txn, s.hash_id).unwrap());
        assert_eq!(tables.hash_sizes.get(&txn, s.hash_id).unwrap(), None);
        assert_eq!(tables.hash.count(&txn).unwrap(), 0);
    }

    #[test]
    fn test_shared_reference_survives() {
        let f = fixture();
        let mut txn = f.db.write();
        let s = f.store.write_block(&mut txn, &f.sv, InodeId::new(3), 0, &block(5)).unwrap();
        f.store.write_block(&mut txn, &f.sv, InodeId::new(3), 1, &block(5)).unwrap();
        f.store.delete_block(&mut txn, &f.sv, InodeId::new(3), 1).unwrap();
        assert_eq!(f.store.count_hash_refs(&txn, s.hash_id).unwrap(), 1);
        assert_eq!(f.store.load(&txn, s.hash_id).unwrap(), block(5));
    }

    #[test]
    fn test_overwrite_releases_old_hash() {
        let f = fixture();
        let mut txn = f.db.write();
        let old = f.store.write_block(&mut txn, &f.sv, InodeId::new(3), 0, &block(5)).unwrap();
        let new = f.store.write_block(&mut txn, &f.sv, InodeId::new(3), 0, &block(9)).unwrap();
        assert_ne!(old.hash_id, new.hash_id);
        assert!(matches!(
            f.store.load(&txn, old.hash_id),
            Err(MetaError::HashNotFound(_))
        ));
        assert_eq!(f.store.stats().blocks_released, 1);
    }

    #[test]
    fn test_truncate_blocks() {
        let f = fixture();
        let mut txn = f.db.write();
        for b in 0..4 {
            f.store.write_block(&mut txn, &f.sv, InodeId::new(3), b, &block(b as u8 + 1)).unwrap();
        }
        assert_eq!(f.store.truncate_blocks(&mut txn, &f.sv, InodeId::new(3), 1).unwrap(), 3);
        assert_eq!(f.sv.inode_hash_block.get_count_by_inode(&txn, InodeId::new(3)).unwrap(), 1);
        assert_eq!(GlobalTables::new().unwrap().hash.count(&txn).unwrap(), 1);
    }

    #[test]
    fn test_small_block_stored_raw() {
        let f = fixture();
        let mut txn = f.db.write();
        let s = f.store.store(&mut txn, b"tiny").unwrap();
        assert_eq!(f.store.compression_method(&txn, s.hash_id).unwrap(), "none");
        let sizes = f.store.hash_sizes(&txn, s.hash_id).unwrap().unwrap();
        assert_eq!(sizes.real_size, 4);
        assert_eq!(sizes.compressed_size, 4);
    }

    #[test]
    fn test_compressible_block_is_compressed() {
        let f = fixture();
        let mut txn = f.db.write();
        let data = vec![b'a'; 64 * 1024];
        let s = f.store.store(&mut txn, &data).unwrap();
        let sizes = f.store.hash_sizes(&txn, s.hash_id).unwrap().unwrap();
        assert!(sizes.compressed_size < sizes.real_size);
        assert_ne!(f.store.compression_method(&txn, s.hash_id).unwrap(), "none");
        assert_eq!(f.store.load(&txn, s.hash_id).unwrap(), data);
    }
}
