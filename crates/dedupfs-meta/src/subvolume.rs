//! Subvolume lifecycle: create, list, snapshot, remove, read-only toggling
//! and usage reporting.
//!
//! Creation and snapshot copies run in a single write transaction. Removal is
//! an ordered list of teardown steps, each in its own transaction; dropping
//! an absent table is a no-op, so a partially failed removal can be re-run.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::block_store::BlockStore;
use crate::kvstore::{Database, WriteTxn};
use crate::table::inode::{InodeRow, InodeTable};
use crate::table::name::NameTable;
use crate::table::subvolume::SubvolumeRecord;
use crate::table::tree::TreeTable;
use crate::table::{GlobalTables, SubvolumeTables, Table};
use crate::types::{FileType, HashId, MetaError, Timestamp};
use crate::usage::{compute_usage, UsageReport};

/// Permission bits of a new subvolume root.
pub const ROOT_PERMISSIONS: u32 = 0o755;

/// Real uid and gid of this process.
pub(crate) fn process_owner() -> (u32, u32) {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    unsafe { (libc::getuid(), libc::getgid()) }
}

/// One teardown step of [`SubvolumeManager::remove`], in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeardownStep {
    /// Drop `tree_{hash}`
    DropTree,
    /// Drop `inode_{hash}`
    DropInode,
    /// Drop `inode_hash_block_{hash}` and release every hash it referenced
    DropInodeHashBlock,
    /// Drop `xattr_{hash}`
    DropXattr,
    /// Drop `link_{hash}`
    DropLink,
    /// Delete the `subvolume` row
    DeleteSubvolumeRow,
}

impl TeardownStep {
    /// Every step, in order.
    pub const ALL: [TeardownStep; 6] = [
        TeardownStep::DropTree,
        TeardownStep::DropInode,
        TeardownStep::DropInodeHashBlock,
        TeardownStep::DropXattr,
        TeardownStep::DropLink,
        TeardownStep::DeleteSubvolumeRow,
    ];
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TeardownStep::DropTree => "drop tree",
            TeardownStep::DropInode => "drop inode",
            TeardownStep::DropInodeHashBlock => "drop inode_hash_block",
            TeardownStep::DropXattr => "drop xattr",
            TeardownStep::DropLink => "drop link",
            TeardownStep::DeleteSubvolumeRow => "delete subvolume row",
        };
        f.write_str(s)
    }
}

/// Outcome of one teardown step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Completed; number of rows removed
    Done(usize),
    /// Failed with this error; nothing of the step was applied
    Failed(String),
    /// Not attempted because an earlier step failed
    Skipped,
}

/// Result of [`SubvolumeManager::remove`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveReport {
    /// Subvolume name
    pub name: String,
    /// Every step with its outcome, in execution order
    pub steps: Vec<(TeardownStep, StepOutcome)>,
    /// Hashes purged because the removed subvolume held their last reference
    pub hashes_released: usize,
}

impl RemoveReport {
    /// True when every step completed.
    pub fn is_complete(&self) -> bool {
        self.steps
            .iter()
            .all(|(_, outcome)| matches!(outcome, StepOutcome::Done(_)))
    }

    /// Steps that failed or were skipped.
    pub fn pending_steps(&self) -> Vec<TeardownStep> {
        self.steps
            .iter()
            .filter(|(_, outcome)| !matches!(outcome, StepOutcome::Done(_)))
            .map(|(step, _)| *step)
            .collect()
    }
}

/// A subvolume with its apparent size, as shown by `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeListing {
    /// Stored record
    pub record: SubvolumeRecord,
    /// Sum of inode sizes
    pub apparent_size: u64,
}

/// Orchestrates subvolume operations over the table layer.
pub struct SubvolumeManager {
    db: Arc<Database>,
    blocks: Arc<BlockStore>,
    tables: GlobalTables,
}

impl SubvolumeManager {
    /// Creates a manager. The global tables must already exist.
    pub fn new(db: Arc<Database>, blocks: Arc<BlockStore>) -> Result<Self, MetaError> {
        Ok(Self {
            db,
            blocks,
            tables: GlobalTables::new()?,
        })
    }

    /// Creates a subvolume with an empty root directory. If `name` already
    /// exists the existing record is returned unchanged.
    pub fn create(&self, name: &[u8]) -> Result<SubvolumeRecord, MetaError> {
        if name.is_empty() {
            return Err(MetaError::InvalidName("subvolume name is empty".to_string()));
        }
        let mut txn = self.db.write();
        if let Some(existing) = self.tables.subvolume.find(&txn, name)? {
            warn!(name = %existing.display_name(), "subvolume already exists");
            return Ok(existing);
        }
        let record = self.create_in(&mut txn, name, Timestamp::now())?;
        txn.commit()?;
        info!(name = %record.display_name(), id = %record.id, hash = %record.hash, "created subvolume");
        Ok(record)
    }

    fn create_in(
        &self,
        txn: &mut WriteTxn<'_>,
        name: &[u8],
        now: Timestamp,
    ) -> Result<SubvolumeRecord, MetaError> {
        let record = self.tables.subvolume.insert(txn, name, now)?;
        let sv = SubvolumeTables::new(&record.hash)?;
        sv.create_all(txn)?;

        let root_name = self.tables.name.intern(txn, b"")?;
        let (uid, gid) = process_owner();
        let mut root = InodeRow::new(FileType::Directory, ROOT_PERMISSIONS, uid, gid, now);
        root.size =
            NameTable::get_row_size(b"") + InodeTable::get_row_size() + TreeTable::get_row_size();
        let root = sv.inode.insert(txn, root)?;
        sv.tree.insert(txn, record.id, None, root_name, root.id)?;
        debug!(root_inode = %root.id, size = root.size, "inserted subvolume root");
        Ok(record)
    }

    /// Record of `name`.
    pub fn get(&self, name: &[u8]) -> Result<SubvolumeRecord, MetaError> {
        self.tables
            .subvolume
            .find(&self.db.read(), name)?
            .ok_or_else(|| MetaError::SubvolumeNotFound(String::from_utf8_lossy(name).into_owned()))
    }

    /// Every subvolume with its apparent size, ordered by id.
    pub fn list(&self) -> Result<Vec<SubvolumeListing>, MetaError> {
        let txn = self.db.read();
        let mut out = Vec::new();
        for record in self.tables.subvolume.get_all(&txn)? {
            let sv = SubvolumeTables::new(&record.hash)?;
            let apparent_size = if sv.inode.exists(&txn)? {
                sv.inode.get_sizes(&txn)?
            } else {
                0
            };
            out.push(SubvolumeListing {
                record,
                apparent_size,
            });
        }
        Ok(out)
    }

    /// Tears the subvolume down step by step. Fails only when the subvolume
    /// does not exist; step failures are reported in the [`RemoveReport`].
    pub fn remove(&self, name: &[u8]) -> Result<RemoveReport, MetaError> {
        let record = self.get(name)?;
        let sv = SubvolumeTables::new(&record.hash)?;
        let mut report = RemoveReport {
            name: record.display_name(),
            steps: Vec::with_capacity(TeardownStep::ALL.len()),
            hashes_released: 0,
        };
        let mut failed = false;
        for step in TeardownStep::ALL {
            if failed && step == TeardownStep::DeleteSubvolumeRow {
                report.steps.push((step, StepOutcome::Skipped));
                continue;
            }
            match self.run_step(step, &record, &sv, &mut report.hashes_released) {
                Ok(rows) => {
                    debug!(name = %report.name, %step, rows, "teardown step done");
                    report.steps.push((step, StepOutcome::Done(rows)));
                }
                Err(e) => {
                    error!(name = %report.name, %step, error = %e, "teardown step failed");
                    failed = true;
                    report.steps.push((step, StepOutcome::Failed(e.to_string())));
                }
            }
        }
        if report.is_complete() {
            info!(name = %report.name, released = report.hashes_released, "removed subvolume");
        }
        Ok(report)
    }

    fn run_step(
        &self,
        step: TeardownStep,
        record: &SubvolumeRecord,
        sv: &SubvolumeTables,
        released: &mut usize,
    ) -> Result<usize, MetaError> {
        let mut txn = self.db.write();
        let rows = match step {
            TeardownStep::DropTree => sv.tree.drop_table(&mut txn)?,
            TeardownStep::DropInode => sv.inode.drop_table(&mut txn)?,
            TeardownStep::DropInodeHashBlock => {
                let hashes: Vec<HashId> = if sv.inode_hash_block.exists(&txn)? {
                    sv.inode_hash_block.distinct_hash_ids(&txn)?
                } else {
                    Vec::new()
                };
                let rows = sv.inode_hash_block.drop_table(&mut txn)?;
                let mut purged = 0;
                for hash_id in hashes {
                    if self.blocks.release(&mut txn, hash_id)? {
                        purged += 1;
                    }
                }
                txn.commit()?;
                *released += purged;
                return Ok(rows);
            }
            TeardownStep::DropXattr => sv.xattr.drop_table(&mut txn)?,
            TeardownStep::DropLink => sv.link.drop_table(&mut txn)?,
            TeardownStep::DeleteSubvolumeRow => {
                usize::from(self.tables.subvolume.delete(&mut txn, record.id)?)
            }
        };
        txn.commit()?;
        Ok(rows)
    }

    /// Sets the read-only flag. Returns whether anything changed; false
    /// also when the subvolume does not exist.
    pub fn readonly(&self, name: &[u8], flag: bool) -> Result<bool, MetaError> {
        let mut txn = self.db.write();
        let Some(record) = self.tables.subvolume.find(&txn, name)? else {
            error!(name = %String::from_utf8_lossy(name), "subvolume not found");
            return Ok(false);
        };
        let changed = self.tables.subvolume.set_readonly(&mut txn, record.id, flag)?;
        txn.commit()?;
        if changed {
            info!(name = %record.display_name(), readonly = flag, "changed read-only flag");
        }
        Ok(changed)
    }

    /// Records a mount of `name` now.
    pub fn mark_mounted(&self, name: &[u8]) -> Result<SubvolumeRecord, MetaError> {
        self.touch(name, |record, now| record.mounted_at = Some(now))
    }

    /// Records a modification of `name` now.
    pub fn mark_updated(&self, name: &[u8]) -> Result<SubvolumeRecord, MetaError> {
        self.touch(name, |record, now| record.updated_at = Some(now))
    }

    fn touch(
        &self,
        name: &[u8],
        apply: impl FnOnce(&mut SubvolumeRecord, Timestamp),
    ) -> Result<SubvolumeRecord, MetaError> {
        let mut txn = self.db.write();
        let mut record = self
            .tables
            .subvolume
            .find(&txn, name)?
            .ok_or_else(|| MetaError::SubvolumeNotFound(String::from_utf8_lossy(name).into_owned()))?;
        apply(&mut record, Timestamp::now());
        self.tables.subvolume.update(&mut txn, &record)?;
        txn.commit()?;
        Ok(record)
    }

    /// Creates `target` as a copy of `source`'s namespace. Blocks are shared,
    /// never copied.
    pub fn snapshot(
        &self,
        source: &[u8],
        target: &[u8],
        readonly: bool,
    ) -> Result<SubvolumeRecord, MetaError> {
        if target.is_empty() {
            return Err(MetaError::InvalidName("subvolume name is empty".to_string()));
        }
        let mut txn = self.db.write();
        let src = self
            .tables
            .subvolume
            .find(&txn, source)?
            .ok_or_else(|| MetaError::SubvolumeNotFound(String::from_utf8_lossy(source).into_owned()))?;
        if self.tables.subvolume.find(&txn, target)?.is_some() {
            return Err(MetaError::SubvolumeExists(
                String::from_utf8_lossy(target).into_owned(),
            ));
        }

        let mut record = self.tables.subvolume.insert(&mut txn, target, Timestamp::now())?;
        let from = SubvolumeTables::new(&src.hash)?;
        let to = SubvolumeTables::new(&record.hash)?;
        to.create_all(&mut txn)?;

        let mut nodes = 0;
        for mut node in from.tree.all(&txn)? {
            node.subvol_id = record.id;
            to.tree.insert_node(&mut txn, &node)?;
            nodes += 1;
        }
        to.tree.copy_sequence(&mut txn, &from.tree)?;
        for row in from.inode.all(&txn)? {
            to.inode.insert_row(&mut txn, &row)?;
        }
        to.inode.copy_sequence(&mut txn, &from.inode)?;
        let mut refs = 0;
        for r in from.inode_hash_block.all(&txn)? {
            to.inode_hash_block
                .insert(&mut txn, r.inode_id, r.block_number, r.hash_id)?;
            refs += 1;
        }
        for (inode, attrs) in from.xattr.all(&txn)? {
            to.xattr.insert(&mut txn, inode, &attrs)?;
        }
        for (inode, link_target) in from.link.all(&txn)? {
            to.link.insert(&mut txn, inode, &link_target)?;
        }
        if readonly {
            self.tables.subvolume.set_readonly(&mut txn, record.id, true)?;
            record.readonly = true;
        }
        txn.commit()?;
        info!(
            source = %src.display_name(),
            target = %record.display_name(),
            nodes,
            block_refs = refs,
            "created snapshot"
        );
        Ok(record)
    }

    /// Space accounting for `name`.
    pub fn get_usage(&self, name: &[u8], with_types: bool) -> Result<UsageReport, MetaError> {
        let record = self.get(name)?;
        let sv = SubvolumeTables::new(&record.hash)?;
        compute_usage(&self.db.read(), &self.blocks, &sv, with_types)
    }

    /// Resets `tmp_ids` to every name id used by any subvolume's tree.
    /// Returns the number of ids collected.
    pub fn prepare_tree_name_ids(&self, txn: &mut WriteTxn<'_>) -> Result<usize, MetaError> {
        self.tables.tmp_ids.reset(txn)?;
        for record in self.tables.subvolume.get_all(&*txn)? {
            let tree = TreeTable::new(&record.hash)?;
            if !tree.exists(&*txn)? {
                continue;
            }
            for name_id in tree.distinct_name_ids(&*txn)? {
                self.tables.tmp_ids.insert(txn, name_id.as_u64())?;
            }
        }
        self.tables.tmp_ids.count(&*txn)
    }

    /// Resets `tmp_ids` to every hash id referenced by any subvolume's
    /// block index. Returns the number of ids collected.
    pub fn prepare_index_hash_ids(&self, txn: &mut WriteTxn<'_>) -> Result<usize, MetaError> {
        self.tables.tmp_ids.reset(txn)?;
        for record in self.tables.subvolume.get_all(&*txn)? {
            let index = SubvolumeTables::new(&record.hash)?.inode_hash_block;
            if !index.exists(&*txn)? {
                continue;
            }
            for hash_id in index.distinct_hash_ids(&*txn)? {
                self.tables.tmp_ids.insert(txn, hash_id.as_u64())?;
            }
        }
        self.tables.tmp_ids.count(&*txn)
    }

    /// Tables of an existing subvolume together with its record.
    pub fn open_tables(&self, name: &[u8]) -> Result<(SubvolumeRecord, SubvolumeTables), MetaError> {
        let record = self.get(name)?;
        let sv = SubvolumeTables::new(&record.hash)?;
        Ok((record, sv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InodeId;
    use dedupfs_reduce::{CompressionPlan, CompressionRegistry};

    fn manager() -> SubvolumeManager {
        let db = Arc::new(Database::in_memory());
        {
            let mut txn = db.write();
            GlobalTables::new().unwrap().create_all(&mut txn).unwrap();
            txn.commit().unwrap();
        }
        let blocks = Arc::new(
            BlockStore::new(CompressionRegistry::builtin(), CompressionPlan::default()).unwrap(),
        );
        SubvolumeManager::new(db, blocks).unwrap()
    }

    #[test]
    fn test_create_root_layout() {
        let mgr = manager();
        let rec = mgr.create(b"@main").unwrap();
        let sv = SubvolumeTables::new(&rec.hash).unwrap();
        let txn = mgr.db.read();
        let root = sv.inode.get(&txn, InodeId::ROOT_INODE).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.nlink, 2);
        assert_eq!(root.mode & 0o7777, 0o755);
        assert_eq!(root.size, 12 + 104 + 65);
        let node = sv.tree.find_root(&txn, rec.id).unwrap().unwrap();
        assert_eq!(node.inode_id, InodeId::ROOT_INODE);
        assert_eq!(node.parent_id, None);
    }

    #[test]
    fn test_create_is_idempotent() {
        let mgr = manager();
        let a = mgr.create(b"snap").unwrap();
        let b = mgr.create(b"snap").unwrap();
        assert_eq!(a, b);
        assert_eq!(mgr.list().unwrap().len(), 1);
    }

    #[test]
    fn test_create_rejects_empty_name() {
        let mgr = manager();
        match mgr.create(b"") {
            Err(MetaError::InvalidName(_)) => {}
            other => panic!("expected InvalidName, got {:?}", other),
        }
    }

    #[test]
    fn test_readonly_toggle() {
        let mgr = manager();
        mgr.create(b"a").unwrap();
        assert!(mgr.readonly(b"a", true).unwrap());
        assert!(!mgr.readonly(b"a", true).unwrap());
        assert!(mgr.get(b"a").unwrap().readonly);
        assert!(mgr.readonly(b"a", false).unwrap());
        assert!(!mgr.readonly(b"missing", true).unwrap());
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let mgr = manager();
        match mgr.remove(b"ghost") {
            Err(e) => assert_eq!(e.kind(), crate::types::ErrorKind::NotFound),
            Ok(report) => panic!("expected NotFound, got {:?}", report),
        }
    }

    #[test]
    fn test_remove_reports_every_step() {
        let mgr = manager();
        mgr.create(b"a").unwrap();
        let report = mgr.remove(b"a").unwrap();
        assert!(report.is_complete());
        let steps: Vec<TeardownStep> = report.steps.iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, TeardownStep::ALL.to_vec());
        assert_eq!(report.steps[0].1, StepOutcome::Done(1));
        assert!(mgr.get(b"a").is_err());
    }

    #[test]
    fn test_mark_timestamps() {
        let mgr = manager();
        let rec = mgr.create(b"a").unwrap();
        assert!(rec.mounted_at.is_none());
        let rec = mgr.mark_mounted(b"a").unwrap();
        assert!(rec.mounted_at.is_some());
        let rec = mgr.mark_updated(b"a").unwrap();
        assert!(rec.updated_at.is_some());
        assert!(matches!(
            mgr.mark_updated(b"b"),
            Err(MetaError::SubvolumeNotFound(_))
        ));
    }

    #[test]
    fn test_snapshot_conflicts_and_missing_source() {
        let mgr = manager();
        mgr.create(b"a").unwrap();
        mgr.create(b"b").unwrap();
        assert!(matches!(
            mgr.snapshot(b"a", b"b", false),
            Err(MetaError::SubvolumeExists(_))
        ));
        assert!(matches!(
            mgr.snapshot(b"x", b"c", false),
            Err(MetaError::SubvolumeNotFound(_))
        ));
    }

    #[test]
    fn test_prepare_tree_name_ids() {
        let mgr = manager();
        mgr.create(b"a").unwrap();
        mgr.create(b"b").unwrap();
        let mut txn = mgr.db.write();
        // both roots share the interned empty name
        assert_eq!(mgr.prepare_tree_name_ids(&mut txn).unwrap(), 1);
        assert_eq!(mgr.prepare_index_hash_ids(&mut txn).unwrap(), 0);
    }
}
