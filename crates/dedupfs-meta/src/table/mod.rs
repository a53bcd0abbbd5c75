//! Relational table layer on top of the transactional KV store.
//!
//! Every logical table owns the key range `t/{table}/`:
//!
//! ```text
//! c/{table}                       catalog entry (present while the table exists)
//! t/{table}/s                     auto-increment sequence
//! t/{table}/r/{pk}                row, bincode encoded
//! t/{table}/i/{index}/{cols}      unique index entry, value = pk
//! t/{table}/i/{index}/{cols}{pk}  non-unique index entry, value = pk
//! ```
//!
//! Table identifiers come from [`TableName`], the only place names are built,
//! so per-subvolume suffixes can never smuggle key separators in.
//! Every operation runs inside a caller-managed transaction.

pub mod block;
pub mod compression_type;
pub mod hash;
pub mod hash_compression_type;
pub mod hash_sizes;
pub mod inode;
pub mod inode_hash_block;
pub mod link;
pub mod name;
pub mod option;
pub mod subvolume;
pub mod tmp_ids;
pub mod tree;
pub mod xattr;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::kvstore::{KvRead, WriteTxn};
use crate::types::MetaError;

const MAX_TABLE_NAME: usize = 64;

/// Validated table identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    fn validate(name: &str) -> Result<(), MetaError> {
        let valid = !name.is_empty()
            && name.len() <= MAX_TABLE_NAME
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if valid {
            Ok(())
        } else {
            Err(MetaError::InvalidTableName(name.to_string()))
        }
    }

    /// Global table, named without suffix.
    pub fn global(base: &'static str) -> Result<Self, MetaError> {
        Self::validate(base)?;
        Ok(Self(base.to_string()))
    }

    /// Per-subvolume table: `{base}_{suffix}`.
    pub fn scoped(base: &'static str, suffix: &str) -> Result<Self, MetaError> {
        let name = format!("{}_{}", base, suffix);
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Big-endian encoding of an integer key column.
pub fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Encoding of a nullable integer key column. `None` sorts first and never
/// shares a prefix with `Some`.
pub fn opt_key(id: Option<u64>) -> Vec<u8> {
    match id {
        None => vec![0],
        Some(id) => {
            let mut key = Vec::with_capacity(9);
            key.push(1);
            key.extend_from_slice(&id.to_be_bytes());
            key
        }
    }
}

/// Decode an 8-byte big-endian key.
pub fn decode_id(bytes: &[u8]) -> Result<u64, MetaError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MetaError::Serialization(format!("bad id key length {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn encode<T: Serialize>(row: &T) -> Result<Vec<u8>, MetaError> {
    Ok(bincode::serialize(row)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MetaError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Key-range bookkeeping shared by every table.
#[derive(Clone, Debug)]
pub struct RawTable {
    name: TableName,
    prefix: Vec<u8>,
}

impl RawTable {
    /// Handle for the table `name`. Does not create it.
    pub fn new(name: TableName) -> Self {
        let mut prefix = b"t/".to_vec();
        prefix.extend_from_slice(name.as_str().as_bytes());
        prefix.push(b'/');
        Self { name, prefix }
    }

    /// Table identifier.
    pub fn name(&self) -> &TableName {
        &self.name
    }

    fn catalog_key(&self) -> Vec<u8> {
        let mut key = b"c/".to_vec();
        key.extend_from_slice(self.name.as_str().as_bytes());
        key
    }

    fn seq_key(&self) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.push(b's');
        key
    }

    fn rows_prefix(&self) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(b"r/");
        key
    }

    fn row_key(&self, pk: &[u8]) -> Vec<u8> {
        let mut key = self.rows_prefix();
        key.extend_from_slice(pk);
        key
    }

    fn index_prefix(&self, index: &str) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(b"i/");
        key.extend_from_slice(index.as_bytes());
        key.push(b'/');
        key
    }

    /// Idempotent DDL. Returns true if the table did not exist before.
    pub fn create(&self, txn: &mut WriteTxn<'_>) -> Result<bool, MetaError> {
        let key = self.catalog_key();
        if txn.contains_key(&key)? {
            return Ok(false);
        }
        txn.put(key, self.name.as_str().as_bytes().to_vec());
        Ok(true)
    }

    /// Drops the table with all rows, indexes and its sequence.
    /// Dropping an absent table removes nothing and is not an error.
    pub fn drop_table(&self, txn: &mut WriteTxn<'_>) -> Result<usize, MetaError> {
        let rows = if self.exists(&*txn)? {
            self.count(&*txn)?
        } else {
            0
        };
        txn.delete_prefix(&self.prefix)?;
        txn.delete(&self.catalog_key());
        Ok(rows)
    }

    /// Whether the table currently exists.
    pub fn exists(&self, txn: &impl KvRead) -> Result<bool, MetaError> {
        txn.contains_key(&self.catalog_key())
    }

    /// Fails with [`MetaError::NoSuchTable`] unless the table exists.
    pub fn ensure(&self, txn: &impl KvRead) -> Result<(), MetaError> {
        if self.exists(txn)? {
            Ok(())
        } else {
            Err(MetaError::NoSuchTable(self.name.to_string()))
        }
    }

    /// Allocates the next auto-increment id; the first id handed out is `first`.
    pub fn next_id(&self, txn: &mut WriteTxn<'_>, first: u64) -> Result<u64, MetaError> {
        let key = self.seq_key();
        let next = match txn.get(&key)? {
            Some(bytes) => decode_id(&bytes)?,
            None => first,
        };
        txn.put(key, id_key(next + 1).to_vec());
        Ok(next)
    }

    /// Copies the auto-increment position from another table.
    pub fn copy_sequence(&self, txn: &mut WriteTxn<'_>, from: &RawTable) -> Result<(), MetaError> {
        if let Some(bytes) = txn.get(&from.seq_key())? {
            txn.put(self.seq_key(), bytes);
        }
        Ok(())
    }

    /// Reads one row.
    pub fn get<T: DeserializeOwned>(
        &self,
        txn: &impl KvRead,
        pk: &[u8],
    ) -> Result<Option<T>, MetaError> {
        self.ensure(txn)?;
        txn.get(&self.row_key(pk))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Writes one row, replacing any previous value.
    pub fn put<T: Serialize>(
        &self,
        txn: &mut WriteTxn<'_>,
        pk: &[u8],
        row: &T,
    ) -> Result<(), MetaError> {
        self.ensure(&*txn)?;
        let value = encode(row)?;
        txn.put(self.row_key(pk), value);
        Ok(())
    }

    /// Whether a row with this primary key exists.
    pub fn contains(&self, txn: &impl KvRead, pk: &[u8]) -> Result<bool, MetaError> {
        self.ensure(txn)?;
        txn.contains_key(&self.row_key(pk))
    }

    /// Removes one row. Returns false if it did not exist.
    pub fn remove(&self, txn: &mut WriteTxn<'_>, pk: &[u8]) -> Result<bool, MetaError> {
        self.ensure(&*txn)?;
        let key = self.row_key(pk);
        if !txn.contains_key(&key)? {
            return Ok(false);
        }
        txn.delete(&key);
        Ok(true)
    }

    /// Rows whose primary key starts with `pk_prefix`, in key order.
    pub fn scan<T: DeserializeOwned>(
        &self,
        txn: &impl KvRead,
        pk_prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>, MetaError> {
        self.ensure(txn)?;
        let rows_prefix = self.rows_prefix();
        let mut prefix = rows_prefix.clone();
        prefix.extend_from_slice(pk_prefix);
        txn.scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, value)| Ok((key[rows_prefix.len()..].to_vec(), decode(&value)?)))
            .collect()
    }

    /// Number of rows.
    pub fn count(&self, txn: &impl KvRead) -> Result<usize, MetaError> {
        self.ensure(txn)?;
        Ok(txn.scan_prefix(&self.rows_prefix())?.len())
    }

    /// Inserts a unique index entry, failing if `cols` is already taken.
    pub fn index_insert_unique(
        &self,
        txn: &mut WriteTxn<'_>,
        index: &str,
        cols: &[u8],
        pk: &[u8],
    ) -> Result<(), MetaError> {
        let mut key = self.index_prefix(index);
        key.extend_from_slice(cols);
        if txn.contains_key(&key)? {
            return Err(MetaError::UniqueViolation {
                table: self.name.to_string(),
                index: index.to_string(),
            });
        }
        txn.put(key, pk.to_vec());
        Ok(())
    }

    /// Looks up a unique index entry.
    pub fn index_get_unique(
        &self,
        txn: &impl KvRead,
        index: &str,
        cols: &[u8],
    ) -> Result<Option<Vec<u8>>, MetaError> {
        self.ensure(txn)?;
        let mut key = self.index_prefix(index);
        key.extend_from_slice(cols);
        txn.get(&key)
    }

    /// Removes a unique index entry.
    pub fn index_remove_unique(&self, txn: &mut WriteTxn<'_>, index: &str, cols: &[u8]) {
        let mut key = self.index_prefix(index);
        key.extend_from_slice(cols);
        txn.delete(&key);
    }

    /// Inserts a non-unique index entry. `cols` must be fixed width per index.
    pub fn index_insert(&self, txn: &mut WriteTxn<'_>, index: &str, cols: &[u8], pk: &[u8]) {
        let mut key = self.index_prefix(index);
        key.extend_from_slice(cols);
        key.extend_from_slice(pk);
        txn.put(key, pk.to_vec());
    }

    /// Removes a non-unique index entry.
    pub fn index_remove(&self, txn: &mut WriteTxn<'_>, index: &str, cols: &[u8], pk: &[u8]) {
        let mut key = self.index_prefix(index);
        key.extend_from_slice(cols);
        key.extend_from_slice(pk);
        txn.delete(&key);
    }

    /// Primary keys of every index entry whose columns start with `cols_prefix`.
    pub fn index_scan(
        &self,
        txn: &impl KvRead,
        index: &str,
        cols_prefix: &[u8],
    ) -> Result<Vec<Vec<u8>>, MetaError> {
        self.ensure(txn)?;
        let mut key = self.index_prefix(index);
        key.extend_from_slice(cols_prefix);
        Ok(txn
            .scan_prefix(&key)?
            .into_iter()
            .map(|(_, pk)| pk)
            .collect())
    }
}

/// DDL shared by every table handle.
pub trait Table {
    /// Underlying key range.
    fn raw(&self) -> &RawTable;

    /// Table identifier.
    fn name(&self) -> &TableName {
        self.raw().name()
    }

    /// Idempotent `CREATE TABLE IF NOT EXISTS` (indexes included).
    fn create(&self, txn: &mut WriteTxn<'_>) -> Result<bool, MetaError> {
        self.raw().create(txn)
    }

    /// `DROP TABLE IF EXISTS`. Returns the number of rows dropped.
    fn drop_table(&self, txn: &mut WriteTxn<'_>) -> Result<usize, MetaError> {
        self.raw().drop_table(txn)
    }

    /// Whether the table exists.
    fn exists(&self, txn: &impl KvRead) -> Result<bool, MetaError> {
        self.raw().exists(txn)
    }

    /// Number of rows.
    fn count(&self, txn: &impl KvRead) -> Result<usize, MetaError> {
        self.raw().count(txn)
    }
}

/// The global tables, shared by every subvolume.
pub struct GlobalTables {
    /// `subvolume`
    pub subvolume: subvolume::SubvolumeTable,
    /// `name`
    pub name: name::NameTable,
    /// `hash`
    pub hash: hash::HashTable,
    /// `block`
    pub block: block::BlockTable,
    /// `hash_sizes`
    pub hash_sizes: hash_sizes::HashSizesTable,
    /// `hash_compression_type`
    pub hash_compression_type: hash_compression_type::HashCompressionTypeTable,
    /// `compression_type`
    pub compression_type: compression_type::CompressionTypeTable,
    /// `tmp_ids`
    pub tmp_ids: tmp_ids::TmpIdsTable,
    /// `option`
    pub option: option::OptionTable,
}

impl GlobalTables {
    /// Handles for every global table.
    pub fn new() -> Result<Self, MetaError> {
        Ok(Self {
            subvolume: subvolume::SubvolumeTable::new()?,
            name: name::NameTable::new()?,
            hash: hash::HashTable::new()?,
            block: block::BlockTable::new()?,
            hash_sizes: hash_sizes::HashSizesTable::new()?,
            hash_compression_type: hash_compression_type::HashCompressionTypeTable::new()?,
            compression_type: compression_type::CompressionTypeTable::new()?,
            tmp_ids: tmp_ids::TmpIdsTable::new()?,
            option: option::OptionTable::new()?,
        })
    }

    /// Creates every global table that does not exist yet.
    pub fn create_all(&self, txn: &mut WriteTxn<'_>) -> Result<(), MetaError> {
        self.subvolume.create(txn)?;
        self.name.create(txn)?;
        self.hash.create(txn)?;
        self.block.create(txn)?;
        self.hash_sizes.create(txn)?;
        self.hash_compression_type.create(txn)?;
        self.compression_type.create(txn)?;
        self.tmp_ids.create(txn)?;
        self.option.create(txn)?;
        Ok(())
    }
}

/// The tables owned by one subvolume, suffixed with its hash.
pub struct SubvolumeTables {
    /// `tree_{hash}`
    pub tree: tree::TreeTable,
    /// `inode_{hash}`
    pub inode: inode::InodeTable,
    /// `inode_hash_block_{hash}`
    pub inode_hash_block: inode_hash_block::InodeHashBlockTable,
    /// `xattr_{hash}`
    pub xattr: xattr::XattrTable,
    /// `link_{hash}`
    pub link: link::LinkTable,
}

impl SubvolumeTables {
    /// Handles for the tables suffixed with `hash`.
    pub fn new(hash: &str) -> Result<Self, MetaError> {
        Ok(Self {
            tree: tree::TreeTable::new(hash)?,
            inode: inode::InodeTable::new(hash)?,
            inode_hash_block: inode_hash_block::InodeHashBlockTable::new(hash)?,
            xattr: xattr::XattrTable::new(hash)?,
            link: link::LinkTable::new(hash)?,
        })
    }

    /// Creates all five tables.
    pub fn create_all(&self, txn: &mut WriteTxn<'_>) -> Result<(), MetaError> {
        self.tree.create(txn)?;
        self.inode.create(txn)?;
        self.inode_hash_block.create(txn)?;
        self.xattr.create(txn)?;
        self.link.create(txn)?;
        Ok(())
    }
}
