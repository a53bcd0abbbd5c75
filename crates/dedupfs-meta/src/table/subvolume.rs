//! Global `subvolume` table: one row per named snapshot.

use serde::{Deserialize, Serialize};

use dedupfs_reduce::blake3_hash;

use super::{id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{MetaError, SubvolumeId, Timestamp};

const INDEX_NAME: &str = "name";
const INDEX_HASH: &str = "hash";

/// Bytes of the name digest used as the per-subvolume table suffix.
pub const SUBVOLUME_HASH_BYTES: usize = 8;

/// Derives the short identifier that suffixes a subvolume's tables.
pub fn subvolume_hash(name: &[u8]) -> String {
    blake3_hash(name).short_hex(SUBVOLUME_HASH_BYTES)
}

/// A subvolume row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeRecord {
    /// Row id
    pub id: SubvolumeId,
    /// Unique name
    pub name: Vec<u8>,
    /// Suffix of the per-subvolume tables
    pub hash: String,
    /// Creation time
    pub created_at: Timestamp,
    /// Last mount time
    pub mounted_at: Option<Timestamp>,
    /// Last modification time
    pub updated_at: Option<Timestamp>,
    /// Writes refused while set
    pub readonly: bool,
}

impl SubvolumeRecord {
    /// Name for display, lossy on invalid UTF-8.
    pub fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Data access for the `subvolume` table.
pub struct SubvolumeTable {
    raw: RawTable,
}

impl SubvolumeTable {
    /// Handle for the global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::global("subvolume")?),
        })
    }

    /// Inserts a new subvolume. Fails with a conflict if the name, or the
    /// table suffix derived from it, is already taken.
    pub fn insert(
        &self,
        txn: &mut WriteTxn<'_>,
        name: &[u8],
        created_at: Timestamp,
    ) -> Result<SubvolumeRecord, MetaError> {
        self.raw.ensure(&*txn)?;
        let id = self.raw.next_id(txn, 1)?;
        let hash = subvolume_hash(name);
        self.raw
            .index_insert_unique(txn, INDEX_NAME, name, &id_key(id))?;
        self.raw
            .index_insert_unique(txn, INDEX_HASH, hash.as_bytes(), &id_key(id))?;
        let record = SubvolumeRecord {
            id: SubvolumeId::new(id),
            name: name.to_vec(),
            hash,
            created_at,
            mounted_at: None,
            updated_at: None,
            readonly: false,
        };
        self.raw.put(txn, &id_key(id), &record)?;
        Ok(record)
    }

    /// Row by id.
    pub fn get(
        &self,
        txn: &impl KvRead,
        id: SubvolumeId,
    ) -> Result<Option<SubvolumeRecord>, MetaError> {
        self.raw.get(txn, &id_key(id.as_u64()))
    }

    /// Row by name.
    pub fn find(&self, txn: &impl KvRead, name: &[u8]) -> Result<Option<SubvolumeRecord>, MetaError> {
        match self.raw.index_get_unique(txn, INDEX_NAME, name)? {
            Some(pk) => self.raw.get(txn, &pk),
            None => Ok(None),
        }
    }

    /// Rewrites an existing row. Name and hash are immutable.
    pub fn update(&self, txn: &mut WriteTxn<'_>, record: &SubvolumeRecord) -> Result<(), MetaError> {
        let pk = id_key(record.id.as_u64());
        if !self.raw.contains(&*txn, &pk)? {
            return Err(MetaError::SubvolumeNotFound(record.display_name()));
        }
        self.raw.put(txn, &pk, record)
    }

    /// Sets the read-only flag. Returns whether the row changed.
    pub fn set_readonly(
        &self,
        txn: &mut WriteTxn<'_>,
        id: SubvolumeId,
        flag: bool,
    ) -> Result<bool, MetaError> {
        let Some(mut record) = self.get(&*txn, id)? else {
            return Ok(false);
        };
        if record.readonly == flag {
            return Ok(false);
        }
        record.readonly = flag;
        self.raw.put(txn, &id_key(id.as_u64()), &record)?;
        Ok(true)
    }

    /// Deletes a row together with its index entries.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, id: SubvolumeId) -> Result<bool, MetaError> {
        let Some(record) = self.get(&*txn, id)? else {
            return Ok(false);
        };
        self.raw.index_remove_unique(txn, INDEX_NAME, &record.name);
        self.raw
            .index_remove_unique(txn, INDEX_HASH, record.hash.as_bytes());
        self.raw.remove(txn, &id_key(id.as_u64()))
    }

    /// Every subvolume, ordered by id.
    pub fn get_all(&self, txn: &impl KvRead) -> Result<Vec<SubvolumeRecord>, MetaError> {
        Ok(self
            .raw
            .scan::<SubvolumeRecord>(txn, &[])?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}

impl Table for SubvolumeTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::Database;

    fn setup(db: &Database) -> SubvolumeTable {
        let table = SubvolumeTable::new().unwrap();
        let mut txn = db.write();
        table.create(&mut txn).unwrap();
        txn.commit().unwrap();
        table
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let h = subvolume_hash(b"@daily");
        assert_eq!(h.len(), 16);
        assert_eq!(h, subvolume_hash(b"@daily"));
        assert!(TableName::scoped("tree", &h).is_ok());
    }

    #[test]
    fn test_insert_find_delete() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let rec = table.insert(&mut txn, b"snap", Timestamp::from_secs(10)).unwrap();
        assert_eq!(rec.id.as_u64(), 1);
        assert_eq!(table.find(&txn, b"snap").unwrap(), Some(rec.clone()));
        assert!(table.delete(&mut txn, rec.id).unwrap());
        assert_eq!(table.find(&txn, b"snap").unwrap(), None);
        assert!(!table.delete(&mut txn, rec.id).unwrap());
    }

    #[test]
    fn test_duplicate_name_conflicts() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        table.insert(&mut txn, b"a", Timestamp::from_secs(1)).unwrap();
        match table.insert(&mut txn, b"a", Timestamp::from_secs(2)) {
            Err(MetaError::UniqueViolation { index, .. }) => assert_eq!(index, "name"),
            other => panic!("expected UniqueViolation, got {:?}", other),
        }
    }

    #[test]
    fn test_set_readonly_reports_change() {
        let db = Database::in_memory();
        let table = setup(&db);
        let mut txn = db.write();
        let rec = table.insert(&mut txn, b"a", Timestamp::from_secs(1)).unwrap();
        assert!(table.set_readonly(&mut txn, rec.id, true).unwrap());
        assert!(!table.set_readonly(&mut txn, rec.id, true).unwrap());
        assert!(table.get(&txn, rec.id).unwrap().unwrap().readonly);
        assert!(!table.set_readonly(&mut txn, SubvolumeId::new(99), true).unwrap());
    }
}
