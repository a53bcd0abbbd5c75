//! Per-subvolume `inode_{hash}` table.
//!
//! Rows are keyed by inode number; numbers are allocated from
//! [`InodeId::ROOT_INODE`] upward so the first inode of a subvolume is its root.

use serde::{Deserialize, Serialize};

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{FileType, InodeId, MetaError, Timestamp};

/// Inode attributes as stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRow {
    /// Inode number
    pub id: InodeId,
    /// Hard link count
    pub nlink: u32,
    /// File type and permission bits
    pub mode: u32,
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Device number for device nodes
    pub rdev: u64,
    /// Apparent size in bytes
    pub size: u64,
    /// Last access time
    pub atime: Timestamp,
    /// Last data modification time
    pub mtime: Timestamp,
    /// Last status change time
    pub ctime: Timestamp,
}

impl InodeRow {
    /// Attributes for a new inode. The id is assigned on insert.
    pub fn new(file_type: FileType, perm: u32, uid: u32, gid: u32, now: Timestamp) -> Self {
        let nlink = if file_type == FileType::Directory { 2 } else { 1 };
        Self {
            id: InodeId::new(0),
            nlink,
            mode: file_type.mode_bits() | (perm & 0o7777),
            uid,
            gid,
            rdev: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Decoded file type.
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    /// Whether this inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }
}

/// Data access for one subvolume's inode table.
pub struct InodeTable {
    raw: RawTable,
}

impl InodeTable {
    /// Handle for the inode table suffixed with `hash`.
    pub fn new(hash: &str) -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::scoped("inode", hash)?),
        })
    }

    /// Approximate stored size of an inode row: thirteen 8-byte columns.
    pub fn get_row_size() -> u64 {
        13 * 8
    }

    /// Inserts `row` under a freshly allocated inode number.
    pub fn insert(&self, txn: &mut WriteTxn<'_>, mut row: InodeRow) -> Result<InodeRow, MetaError> {
        self.raw.ensure(&*txn)?;
        row.id = InodeId::new(self.raw.next_id(txn, InodeId::ROOT_INODE.as_u64())?);
        self.raw.put(txn, &id_key(row.id.as_u64()), &row)?;
        Ok(row)
    }

    /// Inserts a row keeping its inode number. Used when copying a subvolume.
    pub fn insert_row(&self, txn: &mut WriteTxn<'_>, row: &InodeRow) -> Result<(), MetaError> {
        self.raw.put(txn, &id_key(row.id.as_u64()), row)
    }

    /// Continues numbering after the rows copied from `from`.
    pub fn copy_sequence(&self, txn: &mut WriteTxn<'_>, from: &InodeTable) -> Result<(), MetaError> {
        self.raw.copy_sequence(txn, &from.raw)
    }

    /// Row by inode number, if present.
    pub fn find(&self, txn: &impl KvRead, id: InodeId) -> Result<Option<InodeRow>, MetaError> {
        self.raw.get(txn, &id_key(id.as_u64()))
    }

    /// Row by inode number.
    pub fn get(&self, txn: &impl KvRead, id: InodeId) -> Result<InodeRow, MetaError> {
        self.find(txn, id)?.ok_or(MetaError::InodeNotFound(id))
    }

    /// Rewrites an existing row.
    pub fn update(&self, txn: &mut WriteTxn<'_>, row: &InodeRow) -> Result<(), MetaError> {
        let pk = id_key(row.id.as_u64());
        if !self.raw.contains(&*txn, &pk)? {
            return Err(MetaError::InodeNotFound(row.id));
        }
        self.raw.put(txn, &pk, row)
    }

    /// Adds `delta` to the link count and bumps ctime. Returns the new count.
    pub fn adjust_nlink(
        &self,
        txn: &mut WriteTxn<'_>,
        id: InodeId,
        delta: i32,
        now: Timestamp,
    ) -> Result<u32, MetaError> {
        let mut row = self.get(&*txn, id)?;
        row.nlink = (row.nlink as i64 + delta as i64).max(0) as u32;
        row.ctime = now;
        self.raw.put(txn, &id_key(id.as_u64()), &row)?;
        Ok(row.nlink)
    }

    /// Deletes a row. Returns false if it did not exist.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, id: InodeId) -> Result<bool, MetaError> {
        self.raw.remove(txn, &id_key(id.as_u64()))
    }

    /// Every row, ordered by inode number.
    pub fn all(&self, txn: &impl KvRead) -> Result<Vec<InodeRow>, MetaError> {
        Ok(self
            .raw
            .scan::<InodeRow>(txn, &[])?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    /// Every inode number, ascending.
    pub fn ids(&self, txn: &impl KvRead) -> Result<Vec<InodeId>, MetaError> {
        self.raw
            .scan::<InodeRow>(txn, &[])?
            .into_iter()
            .map(|(pk, _)| decode_id(&pk).map(InodeId::new))
            .collect()
    }

    /// Sum of the apparent sizes of every inode.
    pub fn get_sizes(&self, txn: &impl KvRead) -> Result<u64, MetaError> {
        Ok(self.all(txn)?.iter().map(|row| row.size).sum())
    }
}

impl Table for InodeTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::Database;

    fn setup(db: &Database) -> InodeTable {
        let table = InodeTable::new("00aa").unwrap();
        let mut txn = db.write();
        table.create(&mut txn).unwrap();
        txn.commit().unwrap();
        table
    }

    #[test]
    fn test_first_inode_is_root() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let now = Timestamp::from_secs(100);
        let root = table
            .insert(&mut txn, InodeRow::new(FileType::Directory, 0o755, 0, 0, now))
            .unwrap();
        let file = table
            .insert(&mut txn, InodeRow::new(FileType::RegularFile, 0o644, 0, 0, now))
            .unwrap();
        assert_eq!(root.id, InodeId::ROOT_INODE);
        assert_eq!(root.nlink, 2);
        assert!(root.is_dir());
        assert_eq!(file.id.as_u64(), 3);
        assert_eq!(file.nlink, 1);
    }

    #[test]
    fn test_get_missing() {
        let db = Database::in_memory();
        let table = setup(&db);
        match table.get(&db.read(), InodeId::new(42)) {
            Err(MetaError::InodeNotFound(id)) => assert_eq!(id.as_u64(), 42),
            other => panic!("expected InodeNotFound, got {:?}", other),
        };
    }

    #[test]
    fn test_update_and_sizes() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let now = Timestamp::from_secs(1);
        let mut a = table
            .insert(&mut txn, InodeRow::new(FileType::RegularFile, 0o644, 0, 0, now))
            .unwrap();
        let mut b = table
            .insert(&mut txn, InodeRow::new(FileType::RegularFile, 0o644, 0, 0, now))
            .unwrap();
        a.size = 100;
        b.size = 23;
        table.update(&mut txn, &a).unwrap();
        table.update(&mut txn, &b).unwrap();
        assert_eq!(table.get_sizes(&txn).unwrap(), 123);

        let mut ghost = a.clone();
        ghost.id = InodeId::new(999);
        assert!(matches!(
            table.update(&mut txn, &ghost),
            Err(MetaError::InodeNotFound(_))
        ));
    }

    #[test]
    fn test_adjust_nlink() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let now = Timestamp::from_secs(1);
        let f = table
            .insert(&mut txn, InodeRow::new(FileType::RegularFile, 0o644, 0, 0, now))
            .unwrap();
        assert_eq!(table.adjust_nlink(&mut txn, f.id, 1, now).unwrap(), 2);
        assert_eq!(table.adjust_nlink(&mut txn, f.id, -2, now).unwrap(), 0);
        assert_eq!(table.adjust_nlink(&mut txn, f.id, -1, now).unwrap(), 0);
    }
}
