//! Per-subvolume `tree_{hash}` table: the directory hierarchy.
//!
//! Each row is one (parent, name) → inode edge. The subvolume a row belongs
//! to is always passed explicitly; the handle holds no selection state.

use serde::{Deserialize, Serialize};

use super::{decode_id, id_key, opt_key, RawTable, Table, TableName};
use crate::kvstore::{KvRead, WriteTxn};
use crate::types::{InodeId, MetaError, NameId, NodeId, SubvolumeId};

const INDEX_SUBVOL_PARENT_NAME: &str = "subvol_parent_name";
const INDEX_INODE: &str = "inode";
const INDEX_PARENT: &str = "parent";
const INDEX_SUBVOL: &str = "subvol";
const INDEX_NAME: &str = "name";

/// First node id handed out; the root node shares its id with the root inode.
pub const FIRST_NODE_ID: u64 = 2;

/// A tree row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Row id
    pub id: NodeId,
    /// Owning subvolume
    pub subvol_id: SubvolumeId,
    /// Parent node, `None` for the root
    pub parent_id: Option<NodeId>,
    /// Entry name
    pub name_id: NameId,
    /// Inode the entry points at
    pub inode_id: InodeId,
}

/// Data access for one subvolume's tree table.
pub struct TreeTable {
    raw: RawTable,
}

fn unique_cols(subvol: SubvolumeId, parent: Option<NodeId>, name: NameId) -> Vec<u8> {
    let mut cols = id_key(subvol.as_u64()).to_vec();
    cols.extend_from_slice(&opt_key(parent.map(|p| p.as_u64())));
    cols.extend_from_slice(&id_key(name.as_u64()));
    cols
}

impl TreeTable {
    /// Handle for the tree table suffixed with `hash`.
    pub fn new(hash: &str) -> Result<Self, MetaError> {
        Ok(Self {
            raw: RawTable::new(TableName::scoped("tree", hash)?),
        })
    }

    /// Approximate stored size of a tree row: five 13-byte columns.
    pub fn get_row_size() -> u64 {
        5 * 13
    }

    /// Inserts an edge. Fails with a conflict if `parent` already has an
    /// entry called `name` in this subvolume.
    pub fn insert(
        &self,
        txn: &mut WriteTxn<'_>,
        subvol_id: SubvolumeId,
        parent_id: Option<NodeId>,
        name_id: NameId,
        inode_id: InodeId,
    ) -> Result<NodeId, MetaError> {
        self.raw.ensure(&*txn)?;
        let id = NodeId::new(self.raw.next_id(txn, FIRST_NODE_ID)?);
        self.insert_node(
            txn,
            &TreeNode {
                id,
                subvol_id,
                parent_id,
                name_id,
                inode_id,
            },
        )?;
        Ok(id)
    }

    /// Inserts a row keeping its id. Used when copying a tree.
    pub fn insert_node(&self, txn: &mut WriteTxn<'_>, node: &TreeNode) -> Result<(), MetaError> {
        let pk = id_key(node.id.as_u64());
        self.raw.index_insert_unique(
            txn,
            INDEX_SUBVOL_PARENT_NAME,
            &unique_cols(node.subvol_id, node.parent_id, node.name_id),
            &pk,
        )?;
        self.raw
            .index_insert(txn, INDEX_INODE, &id_key(node.inode_id.as_u64()), &pk);
        self.raw.index_insert(
            txn,
            INDEX_PARENT,
            &opt_key(node.parent_id.map(|p| p.as_u64())),
            &pk,
        );
        self.raw
            .index_insert(txn, INDEX_SUBVOL, &id_key(node.subvol_id.as_u64()), &pk);
        self.raw
            .index_insert(txn, INDEX_NAME, &id_key(node.name_id.as_u64()), &pk);
        self.raw.put(txn, &pk, node)
    }

    /// Continues node numbering after the rows copied from `from`.
    pub fn copy_sequence(&self, txn: &mut WriteTxn<'_>, from: &TreeTable) -> Result<(), MetaError> {
        self.raw.copy_sequence(txn, &from.raw)
    }

    /// Row by id.
    pub fn get(&self, txn: &impl KvRead, id: NodeId) -> Result<Option<TreeNode>, MetaError> {
        self.raw.get(txn, &id_key(id.as_u64()))
    }

    /// Deletes exactly one row. Returns false if it did not exist.
    pub fn delete(&self, txn: &mut WriteTxn<'_>, id: NodeId) -> Result<bool, MetaError> {
        let Some(node) = self.get(&*txn, id)? else {
            return Ok(false);
        };
        let pk = id_key(id.as_u64());
        self.raw.index_remove_unique(
            txn,
            INDEX_SUBVOL_PARENT_NAME,
            &unique_cols(node.subvol_id, node.parent_id, node.name_id),
        );
        self.raw
            .index_remove(txn, INDEX_INODE, &id_key(node.inode_id.as_u64()), &pk);
        self.raw.index_remove(
            txn,
            INDEX_PARENT,
            &opt_key(node.parent_id.map(|p| p.as_u64())),
            &pk,
        );
        self.raw
            .index_remove(txn, INDEX_SUBVOL, &id_key(node.subvol_id.as_u64()), &pk);
        self.raw
            .index_remove(txn, INDEX_NAME, &id_key(node.name_id.as_u64()), &pk);
        self.raw.remove(txn, &pk)
    }

    /// Deletes every row tagged with `subvol_id`, plus the row whose own id
    /// equals it. Returns the number of rows removed.
    pub fn delete_subvolume(
        &self,
        txn: &mut WriteTxn<'_>,
        subvol_id: SubvolumeId,
    ) -> Result<usize, MetaError> {
        let mut ids = self.node_ids_of(&*txn, subvol_id)?;
        ids.push(NodeId::new(subvol_id.as_u64()));
        ids.sort();
        ids.dedup();
        let mut removed = 0;
        for id in ids {
            if self.delete(txn, id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn load_all(&self, txn: &impl KvRead, pks: Vec<Vec<u8>>) -> Result<Vec<TreeNode>, MetaError> {
        let mut nodes = Vec::with_capacity(pks.len());
        for pk in pks {
            if let Some(node) = self.raw.get(txn, &pk)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    fn node_ids_of(
        &self,
        txn: &impl KvRead,
        subvol_id: SubvolumeId,
    ) -> Result<Vec<NodeId>, MetaError> {
        self.raw
            .index_scan(txn, INDEX_SUBVOL, &id_key(subvol_id.as_u64()))?
            .into_iter()
            .map(|pk| decode_id(&pk).map(NodeId::new))
            .collect()
    }

    /// The entry `name_id` under `parent_id`.
    pub fn find_by_parent_name(
        &self,
        txn: &impl KvRead,
        subvol_id: SubvolumeId,
        parent_id: Option<NodeId>,
        name_id: NameId,
    ) -> Result<Option<TreeNode>, MetaError> {
        match self.raw.index_get_unique(
            txn,
            INDEX_SUBVOL_PARENT_NAME,
            &unique_cols(subvol_id, parent_id, name_id),
        )? {
            Some(pk) => self.raw.get(txn, &pk),
            None => Ok(None),
        }
    }

    /// First node pointing at `inode_id` (hardlinks have several).
    pub fn find_by_inode(
        &self,
        txn: &impl KvRead,
        inode_id: InodeId,
    ) -> Result<Option<TreeNode>, MetaError> {
        Ok(self.find_all_by_inode(txn, inode_id)?.into_iter().next())
    }

    /// Every node pointing at `inode_id`.
    pub fn find_all_by_inode(
        &self,
        txn: &impl KvRead,
        inode_id: InodeId,
    ) -> Result<Vec<TreeNode>, MetaError> {
        let pks = self
            .raw
            .index_scan(txn, INDEX_INODE, &id_key(inode_id.as_u64()))?;
        self.load_all(txn, pks)
    }

    /// Root node of a subvolume.
    pub fn find_root(
        &self,
        txn: &impl KvRead,
        subvol_id: SubvolumeId,
    ) -> Result<Option<TreeNode>, MetaError> {
        let pks = self.raw.index_scan(txn, INDEX_PARENT, &opt_key(None))?;
        Ok(self
            .load_all(txn, pks)?
            .into_iter()
            .find(|node| node.subvol_id == subvol_id))
    }

    /// Direct children of `parent_id`, ordered by node id.
    pub fn get_children(
        &self,
        txn: &impl KvRead,
        parent_id: NodeId,
    ) -> Result<Vec<TreeNode>, MetaError> {
        let pks = self
            .raw
            .index_scan(txn, INDEX_PARENT, &opt_key(Some(parent_id.as_u64())))?;
        self.load_all(txn, pks)
    }

    /// Inodes of the direct children of `parent_id`.
    pub fn get_children_inodes(
        &self,
        txn: &impl KvRead,
        parent_id: NodeId,
    ) -> Result<Vec<InodeId>, MetaError> {
        Ok(self
            .get_children(txn, parent_id)?
            .into_iter()
            .map(|node| node.inode_id)
            .collect())
    }

    /// Page through a subvolume's nodes in id order.
    pub fn fetch(
        &self,
        txn: &impl KvRead,
        subvol_id: SubvolumeId,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<TreeNode>, MetaError> {
        let mut ids = self.node_ids_of(txn, subvol_id)?;
        ids.sort();
        let page = ids
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .map(|id| id_key(id.as_u64()).to_vec())
            .collect();
        self.load_all(txn, page)
    }

    /// Every row, ordered by id.
    pub fn all(&self, txn: &impl KvRead) -> Result<Vec<TreeNode>, MetaError> {
        Ok(self
            .raw
            .scan::<TreeNode>(txn, &[])?
            .into_iter()
            .map(|(_, node)| node)
            .collect())
    }

    /// Number of rows in a subvolume.
    pub fn count_subvolume_nodes(
        &self,
        txn: &impl KvRead,
        subvol_id: SubvolumeId,
    ) -> Result<usize, MetaError> {
        Ok(self.node_ids_of(txn, subvol_id)?.len())
    }

    /// Number of distinct inodes referenced by a subvolume.
    pub fn count_subvolume_inodes(
        &self,
        txn: &impl KvRead,
        subvol_id: SubvolumeId,
    ) -> Result<usize, MetaError> {
        let mut inodes: Vec<InodeId> = self
            .fetch(txn, subvol_id, None, 0)?
            .into_iter()
            .map(|node| node.inode_id)
            .collect();
        inodes.sort();
        inodes.dedup();
        Ok(inodes.len())
    }

    /// Number of distinct names used by a subvolume.
    pub fn count_subvolume_names(
        &self,
        txn: &impl KvRead,
        subvol_id: SubvolumeId,
    ) -> Result<usize, MetaError> {
        let mut names: Vec<NameId> = self
            .fetch(txn, subvol_id, None, 0)?
            .into_iter()
            .map(|node| node.name_id)
            .collect();
        names.sort();
        names.dedup();
        Ok(names.len())
    }

    /// Distinct name ids used anywhere in this table, ascending.
    pub fn distinct_name_ids(&self, txn: &impl KvRead) -> Result<Vec<NameId>, MetaError> {
        let mut names: Vec<NameId> = self.all(txn)?.into_iter().map(|n| n.name_id).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

impl Table for TreeTable {
    fn raw(&self) -> &RawTable {
        &self.raw
    }
}
