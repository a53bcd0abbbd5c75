//! Per-subvolume `xattr_{hash}` table: extended attributes.
//!
//! All attributes of one inode live in a single row: a name → value map
//! wrapped in a versioned envelope and encoded with bincode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{decode_id, id_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{InodeId, MetaError};

/// Current envelope version.
pub const XATTR_FORMAT_VERSION: u16 = 1;

/// Attribute map of one inode.
pub type XattrMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct XattrEnvelope {
    version: u16,
    entries: XattrMap,
}

fn encode_map(entries: &XattrMap) -> Result<Vec<u8>, MetaError> {
    Ok(bincode::serialize(&XattrEnvelope {
        version: XATTR_FORMAT_VERSION,
        entries: entries.clone(),
    })?)
}

fn decode_map(bytes: &[u8]) -> Result<XattrMap, MetaError> {
    let envelope: XattrEnvelope = bincode::deserialize(bytes)?;
    if envelope.version != XATTR_FORMAT_VERSION {
        return Err(MetaError::Serialization(format!(
            "unsupported xattr format version {}",
            envelope.version
        )));
    }
    Ok(envelope.entries)
}

/// Data access for one subvolume's xattr table.
pub struct XattrTable {
    raw: RawTable,
}

impl XattrTable {
    /// Handle for the xattr table suffixed with `hash`.
    pub fn new(hash: &str) -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::scoped("xattr", hash)?),
        })
    }

    /// Replaces the attribute map of an inode. An empty map removes the row.
    pub fn insert(
        &self,
        txn: &mut WriteTxn<'_>,
        inode: InodeId,
        entries: &XattrMap,
    ) -> Result<(), MetaError> {
        if entries.is_empty() {
            self.raw.remove(txn, &id_key(inode.as_u64()))?;
            return Ok(());
        }
        self.raw
            .put(txn, &id_key(inode.as_u64()), &encode_map(entries)?)
    }

    /// Attribute map of an inode; empty when none are set.
    pub fn find(&self, txn: &impl KvRead, inode: InodeId) -> Result<XattrMap, MetaError> {
        match self.raw.get::<Vec<u8>>(txn, &id_key(inode.as_u64()))? {
            Some(bytes) => decode_map(&bytes),
            None => Ok(XattrMap::new()),
        }
    }

    /// Removes every attribute of an inode.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, inode: InodeId) -> Result<bool, MetaError> {
        self.raw.remove(txn, &id_key(inode.as_u64()))
    }

    /// Every (inode, attributes) pair.
    pub fn all(&self, txn: &impl KvRead) -> Result<Vec<(InodeId, XattrMap)>, MetaError> {
        self.raw
            .scan::<Vec<u8>>(txn, &[])?
            .into_iter()
            .map(|(pk, bytes)| Ok((InodeId::new(decode_id(&pk)?), decode_map(&bytes)?)))
            .collect()
    }
}

impl Table for XattrTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}
