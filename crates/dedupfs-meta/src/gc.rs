//! Garbage collection of names and hashes no subvolume references any more.
//!
//! Both passes fill `tmp_ids` with the ids in use across every subvolume and
//! then delete whatever the global table holds beyond that set, all inside
//! one write transaction.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::block_store::BlockStore;
use crate::kvstore::Database;
use crate::subvolume::SubvolumeManager;
use crate::table::GlobalTables;
use crate::types::MetaError;

/// Counters from one collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    /// Names examined
    pub names_scanned: u64,
    /// Names deleted
    pub names_reclaimed: u64,
    /// Hashes examined
    pub hashes_scanned: u64,
    /// Hashes purged
    pub hashes_reclaimed: u64,
    /// Stored bytes freed by purged hashes
    pub bytes_reclaimed: u64,
}

impl GcStats {
    /// Adds the counters of `other`.
    pub fn merge(&mut self, other: &GcStats) {
        self.names_scanned += other.names_scanned;
        self.names_reclaimed += other.names_reclaimed;
        self.hashes_scanned += other.hashes_scanned;
        self.hashes_reclaimed += other.hashes_reclaimed;
        self.bytes_reclaimed += other.bytes_reclaimed;
    }
}

/// Runs collection passes over the global tables.
pub struct GarbageCollector<'a> {
    db: &'a Database,
    blocks: &'a BlockStore,
    subvolumes: &'a SubvolumeManager,
    tables: GlobalTables,
}

impl<'a> GarbageCollector<'a> {
    /// Creates a collector.
    pub fn new(
        db: &'a Database,
        blocks: &'a BlockStore,
        subvolumes: &'a SubvolumeManager,
    ) -> Result<Self, MetaError> {
        Ok(Self {
            db,
            blocks,
            subvolumes,
            tables: GlobalTables::new()?,
        })
    }

    /// Deletes every name no tree references. The empty root name is kept.
    pub fn collect_names(&self) -> Result<GcStats, MetaError> {
        let mut stats = GcStats::default();
        let mut txn = self.db.write();
        let in_use = self.subvolumes.prepare_tree_name_ids(&mut txn)?;
        let root_name = self.tables.name.find(&txn, b"")?;
        for name_id in self.tables.name.ids(&txn)? {
            stats.names_scanned += 1;
            if Some(name_id) == root_name || self.tables.tmp_ids.contains(&txn, name_id.as_u64())? {
                continue;
            }
            self.tables.name.delete(&mut txn, name_id)?;
            stats.names_reclaimed += 1;
        }
        self.tables.tmp_ids.reset(&mut txn)?;
        txn.commit()?;
        debug!(in_use, reclaimed = stats.names_reclaimed, "name collection done");
        Ok(stats)
    }

    /// Purges every hash no block index references.
    pub fn collect_hashes(&self) -> Result<GcStats, MetaError> {
        let mut stats = GcStats::default();
        let mut txn = self.db.write();
        let in_use = self.subvolumes.prepare_index_hash_ids(&mut txn)?;
        for hash_id in self.tables.hash.ids(&txn)? {
            stats.hashes_scanned += 1;
            if self.tables.tmp_ids.contains(&txn, hash_id.as_u64())? {
                continue;
            }
            stats.bytes_reclaimed += self.blocks.purge_hash(&mut txn, hash_id)?;
            stats.hashes_reclaimed += 1;
        }
        self.tables.tmp_ids.reset(&mut txn)?;
        txn.commit()?;
        debug!(in_use, reclaimed = stats.hashes_reclaimed, "hash collection done");
        Ok(stats)
    }

    /// Both passes.
    pub fn run(&self) -> Result<GcStats, MetaError> {
        let mut stats = self.collect_names()?;
        stats.merge(&self.collect_hashes()?);
        info!(
            names = stats.names_reclaimed,
            hashes = stats.hashes_reclaimed,
            bytes = stats.bytes_reclaimed,
            "garbage collection finished"
        );
        Ok(stats)
    }
}
