//! Path-level operations on one subvolume.
//!
//! A thin synchronous layer over the tree, inode, link, xattr and block
//! tables. Every mutating call runs in one write transaction, refuses to
//! touch a read-only subvolume and stamps the subvolume's `updated_at`.
//! Files are split into fixed-size blocks; missing blocks read as zeros.

use std::sync::Arc;

use tracing::debug;

use crate::block_store::BlockStore;
use crate::kvstore::{Database, KvRead, WriteTxn};
use crate::subvolume::process_owner;
use crate::table::inode::InodeRow;
use crate::table::name::NameTable;
use crate::table::subvolume::{SubvolumeRecord, SubvolumeTable};
use crate::table::tree::TreeNode;
use crate::table::xattr::XattrMap;
use crate::table::SubvolumeTables;
use crate::types::{FileType, InodeId, MetaError, SubvolumeId, Timestamp};

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name
    pub name: Vec<u8>,
    /// Inode the entry points at
    pub inode: InodeId,
    /// File type of that inode
    pub file_type: Option<FileType>,
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").collect()
}

fn split_leaf(path: &str) -> Result<(Vec<&str>, &str), MetaError> {
    let mut parts = components(path);
    match parts.pop() {
        Some(leaf) if leaf != ".." => Ok((parts, leaf)),
        _ => Err(MetaError::InvalidName(format!("{:?} has no final component", path))),
    }
}

/// Path-level view of one subvolume.
pub struct Namespace {
    db: Arc<Database>,
    blocks: Arc<BlockStore>,
    subvolumes: SubvolumeTable,
    names: NameTable,
    subvol_id: SubvolumeId,
    subvol_name: String,
    tables: SubvolumeTables,
    block_size: usize,
}

impl Namespace {
    /// Opens the namespace of `record`.
    pub fn new(
        db: Arc<Database>,
        blocks: Arc<BlockStore>,
        record: &SubvolumeRecord,
        block_size: usize,
    ) -> Result<Self, MetaError> {
        if block_size == 0 {
            return Err(MetaError::InvalidConfig("block_size must be positive".to_string()));
        }
        Ok(Self {
            db,
            blocks,
            subvolumes: SubvolumeTable::new()?,
            names: NameTable::new()?,
            subvol_id: record.id,
            subvol_name: record.display_name(),
            tables: SubvolumeTables::new(&record.hash)?,
            block_size,
        })
    }

    /// Tables backing this namespace.
    pub fn tables(&self) -> &SubvolumeTables {
        &self.tables
    }

    fn begin_write(&self, now: Timestamp) -> Result<WriteTxn<'_>, MetaError> {
        let mut txn = self.db.write();
        let mut record = self
            .subvolumes
            .get(&txn, self.subvol_id)?
            .ok_or_else(|| MetaError::SubvolumeNotFound(self.subvol_name.clone()))?;
        if record.readonly {
            return Err(MetaError::ReadOnly(self.subvol_name.clone()));
        }
        record.updated_at = Some(now);
        self.subvolumes.update(&mut txn, &record)?;
        Ok(txn)
    }

    fn root(&self, txn: &impl KvRead) -> Result<TreeNode, MetaError> {
        self.tables
            .tree
            .find_root(txn, self.subvol_id)?
            .ok_or(MetaError::InodeNotFound(InodeId::ROOT_INODE))
    }

    fn child(
        &self,
        txn: &impl KvRead,
        parent: &TreeNode,
        name: &str,
    ) -> Result<Option<TreeNode>, MetaError> {
        let Some(name_id) = self.names.find(txn, name.as_bytes())? else {
            return Ok(None);
        };
        self.tables
            .tree
            .find_by_parent_name(txn, self.subvol_id, Some(parent.id), name_id)
    }

    fn walk(&self, txn: &impl KvRead, parts: &[&str]) -> Result<TreeNode, MetaError> {
        let mut node = self.root(txn)?;
        let mut trail: Vec<TreeNode> = Vec::new();
        for part in parts {
            if *part == ".." {
                if let Some(parent) = trail.pop() {
                    node = parent;
                }
                continue;
            }
            if !self.tables.inode.get(txn, node.inode_id)?.is_dir() {
                return Err(MetaError::NotADirectory(node.inode_id));
            }
            let next = self
                .child(txn, &node, part)?
                .ok_or_else(|| MetaError::EntryNotFound {
                    parent: node.inode_id,
                    name: part.to_string(),
                })?;
            trail.push(node);
            node = next;
        }
        Ok(node)
    }

    fn resolve(&self, txn: &impl KvRead, path: &str) -> Result<TreeNode, MetaError> {
        self.walk(txn, &components(path))
    }

    fn resolve_dir(&self, txn: &impl KvRead, parts: &[&str]) -> Result<TreeNode, MetaError> {
        let node = self.walk(txn, parts)?;
        if !self.tables.inode.get(txn, node.inode_id)?.is_dir() {
            return Err(MetaError::NotADirectory(node.inode_id));
        }
        Ok(node)
    }

    /// Inserts a new entry `path` pointing at a fresh inode built from `row`.
    fn add_entry(
        &self,
        txn: &mut WriteTxn<'_>,
        path: &str,
        row: InodeRow,
        now: Timestamp,
    ) -> Result<(TreeNode, InodeRow), MetaError> {
        let (parts, leaf) = split_leaf(path)?;
        let parent = self.resolve_dir(&*txn, &parts)?;
        if self.child(&*txn, &parent, leaf)?.is_some() {
            return Err(MetaError::EntryExists {
                parent: parent.inode_id,
                name: leaf.to_string(),
            });
        }
        let is_dir = row.is_dir();
        let name_id = self.names.intern(txn, leaf.as_bytes())?;
        let inode = self.tables.inode.insert(txn, row)?;
        let node_id = self
            .tables
            .tree
            .insert(txn, self.subvol_id, Some(parent.id), name_id, inode.id)?;

        let mut parent_inode = self.tables.inode.get(&*txn, parent.inode_id)?;
        if is_dir {
            parent_inode.nlink += 1;
        }
        parent_inode.mtime = now;
        parent_inode.ctime = now;
        self.tables.inode.update(txn, &parent_inode)?;

        let node = TreeNode {
            id: node_id,
            subvol_id: self.subvol_id,
            parent_id: Some(parent.id),
            name_id,
            inode_id: inode.id,
        };
        Ok((node, inode))
    }

    /// Attributes of the inode at `path`.
    pub fn stat(&self, path: &str) -> Result<InodeRow, MetaError> {
        let txn = self.db.read();
        let node = self.resolve(&txn, path)?;
        self.tables.inode.get(&txn, node.inode_id)
    }

    /// Inode number at `path`.
    pub fn lookup(&self, path: &str) -> Result<InodeId, MetaError> {
        let txn = self.db.read();
        Ok(self.resolve(&txn, path)?.inode_id)
    }

    /// Entries of the directory at `path`.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, MetaError> {
        let txn = self.db.read();
        let dir = self.resolve_dir(&txn, &components(path))?;
        let mut entries = Vec::new();
        for node in self.tables.tree.get_children(&txn, dir.id)? {
            let inode = self.tables.inode.get(&txn, node.inode_id)?;
            entries.push(DirEntry {
                name: self.names.get(&txn, node.name_id)?,
                inode: node.inode_id,
                file_type: inode.file_type(),
            });
        }
        Ok(entries)
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &str, perm: u32) -> Result<InodeRow, MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let (uid, gid) = process_owner();
        let (_, inode) = self.add_entry(
            &mut txn,
            path,
            InodeRow::new(FileType::Directory, perm, uid, gid, now),
            now,
        )?;
        txn.commit()?;
        debug!(path, inode = %inode.id, "mkdir");
        Ok(inode)
    }

    /// Creates an empty regular file.
    pub fn create_file(&self, path: &str, perm: u32) -> Result<InodeRow, MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let (uid, gid) = process_owner();
        let (_, inode) = self.add_entry(
            &mut txn,
            path,
            InodeRow::new(FileType::RegularFile, perm, uid, gid, now),
            now,
        )?;
        txn.commit()?;
        Ok(inode)
    }

    /// Replaces the content of the file at `path`, creating it if needed.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<InodeRow, MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let mut inode = match self.resolve(&txn, path) {
            Ok(node) => self.tables.inode.get(&txn, node.inode_id)?,
            Err(MetaError::EntryNotFound { .. }) => {
                let (uid, gid) = process_owner();
                let row = InodeRow::new(FileType::RegularFile, 0o644, uid, gid, now);
                self.add_entry(&mut txn, path, row, now)?.1
            }
            Err(e) => return Err(e),
        };
        if inode.file_type() != Some(FileType::RegularFile) {
            return Err(MetaError::InvalidName(format!("{} is not a regular file", path)));
        }

        let mut count = 0u64;
        for (block, chunk) in data.chunks(self.block_size).enumerate() {
            self.blocks
                .write_block(&mut txn, &self.tables, inode.id, block as u64, chunk)?;
            count += 1;
        }
        self.blocks
            .truncate_blocks(&mut txn, &self.tables, inode.id, count)?;

        inode.size = data.len() as u64;
        inode.mtime = now;
        inode.ctime = now;
        self.tables.inode.update(&mut txn, &inode)?;
        txn.commit()?;
        debug!(path, inode = %inode.id, size = inode.size, blocks = count, "wrote file");
        Ok(inode)
    }

    /// Content of the file at `path`.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, MetaError> {
        let txn = self.db.read();
        let node = self.resolve(&txn, path)?;
        let inode = self.tables.inode.get(&txn, node.inode_id)?;
        let size = inode.size as usize;
        let mut out = Vec::with_capacity(size);
        let mut block = 0u64;
        while out.len() < size {
            let want = (size - out.len()).min(self.block_size);
            match self
                .blocks
                .read_block(&txn, &self.tables, inode.id, block)?
            {
                Some(data) => {
                    let take = data.len().min(want);
                    out.extend_from_slice(&data[..take]);
                    out.resize(out.len() + (want - take), 0);
                }
                None => out.resize(out.len() + want, 0),
            }
            block += 1;
        }
        Ok(out)
    }

    /// Sets the size of the file at `path`. Growing leaves a hole.
    pub fn truncate(&self, path: &str, size: u64) -> Result<InodeRow, MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let node = self.resolve(&txn, path)?;
        let mut inode = self.tables.inode.get(&txn, node.inode_id)?;
        if inode.file_type() != Some(FileType::RegularFile) {
            return Err(MetaError::InvalidName(format!("{} is not a regular file", path)));
        }
        let bs = self.block_size as u64;
        let keep = size.div_ceil(bs);
        self.blocks
            .truncate_blocks(&mut txn, &self.tables, inode.id, keep)?;
        let tail = (size % bs) as usize;
        if tail != 0 {
            let last = size / bs;
            if let Some(mut data) = self.blocks.read_block(&txn, &self.tables, inode.id, last)? {
                if data.len() > tail {
                    data.truncate(tail);
                    self.blocks
                        .write_block(&mut txn, &self.tables, inode.id, last, &data)?;
                }
            }
        }
        inode.size = size;
        inode.mtime = now;
        inode.ctime = now;
        self.tables.inode.update(&mut txn, &inode)?;
        txn.commit()?;
        Ok(inode)
    }

    /// Creates a symlink at `path` pointing at `target`.
    pub fn symlink(&self, path: &str, target: &[u8]) -> Result<InodeRow, MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let (uid, gid) = process_owner();
        let mut row = InodeRow::new(FileType::Symlink, 0o777, uid, gid, now);
        row.size = target.len() as u64;
        let (_, inode) = self.add_entry(&mut txn, path, row, now)?;
        self.tables.link.insert(&mut txn, inode.id, target)?;
        txn.commit()?;
        Ok(inode)
    }

    /// Target of the symlink at `path`.
    pub fn readlink(&self, path: &str) -> Result<Vec<u8>, MetaError> {
        let txn = self.db.read();
        let node = self.resolve(&txn, path)?;
        self.tables
            .link
            .find_by_inode(&txn, node.inode_id)?
            .ok_or_else(|| MetaError::InvalidName(format!("{} is not a symlink", path)))
    }

    /// Adds a hard link `new_path` to the file at `existing`.
    pub fn link(&self, existing: &str, new_path: &str) -> Result<InodeRow, MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let source = self.resolve(&txn, existing)?;
        let mut inode = self.tables.inode.get(&txn, source.inode_id)?;
        if inode.is_dir() {
            return Err(MetaError::InvalidName(format!(
                "{} is a directory and cannot be hard linked",
                existing
            )));
        }
        let (parts, leaf) = split_leaf(new_path)?;
        let parent = self.resolve_dir(&txn, &parts)?;
        if self.child(&txn, &parent, leaf)?.is_some() {
            return Err(MetaError::EntryExists {
                parent: parent.inode_id,
                name: leaf.to_string(),
            });
        }
        let name_id = self.names.intern(&mut txn, leaf.as_bytes())?;
        self.tables
            .tree
            .insert(&mut txn, self.subvol_id, Some(parent.id), name_id, inode.id)?;
        inode.nlink = self.tables.inode.adjust_nlink(&mut txn, inode.id, 1, now)?;
        inode.ctime = now;
        txn.commit()?;
        Ok(inode)
    }

    /// Removes the entry at `path`. Directories must be empty.
    pub fn unlink(&self, path: &str) -> Result<(), MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let node = self.resolve(&txn, path)?;
        if node.parent_id.is_none() {
            return Err(MetaError::InvalidName("cannot remove the root".to_string()));
        }
        let inode = self.tables.inode.get(&txn, node.inode_id)?;
        if inode.is_dir() && !self.tables.tree.get_children(&txn, node.id)?.is_empty() {
            return Err(MetaError::DirectoryNotEmpty(node.inode_id));
        }
        self.remove_node(&mut txn, &node, now)?;
        txn.commit()?;
        Ok(())
    }

    /// Removes `path` and everything below it. Returns the entries removed.
    pub fn remove_tree(&self, path: &str) -> Result<usize, MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let top = self.resolve(&txn, path)?;
        if top.parent_id.is_none() {
            return Err(MetaError::InvalidName("cannot remove the root".to_string()));
        }

        // Depth-first, children before their directory.
        let mut order = Vec::new();
        let mut stack = vec![(top, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            stack.push((node, true));
            for child in self.tables.tree.get_children(&txn, node.id)? {
                stack.push((child, false));
            }
        }
        for node in &order {
            self.remove_node(&mut txn, node, now)?;
        }
        txn.commit()?;
        debug!(path, removed = order.len(), "removed tree");
        Ok(order.len())
    }

    /// Drops one edge and, with the last link, its inode and everything
    /// hanging off it.
    fn remove_node(
        &self,
        txn: &mut WriteTxn<'_>,
        node: &TreeNode,
        now: Timestamp,
    ) -> Result<(), MetaError> {
        let inode = self.tables.inode.get(&*txn, node.inode_id)?;
        self.tables.tree.delete(txn, node.id)?;
        let remaining = if inode.is_dir() {
            0
        } else {
            self.tables.inode.adjust_nlink(txn, inode.id, -1, now)?
        };
        if remaining == 0 {
            self.blocks
                .delete_inode_blocks(txn, &self.tables, inode.id)?;
            self.tables.link.delete(txn, inode.id)?;
            self.tables.xattr.delete(txn, inode.id)?;
            self.tables.inode.delete(txn, inode.id)?;
        }
        if let Some(parent_id) = node.parent_id {
            if let Some(parent) = self.tables.tree.get(&*txn, parent_id)? {
                if let Some(mut dir) = self.tables.inode.find(&*txn, parent.inode_id)? {
                    if inode.is_dir() {
                        dir.nlink = dir.nlink.saturating_sub(1);
                    }
                    dir.mtime = now;
                    dir.ctime = now;
                    self.tables.inode.update(txn, &dir)?;
                }
            }
        }
        Ok(())
    }

    /// Sets one extended attribute.
    pub fn set_xattr(&self, path: &str, name: &[u8], value: &[u8]) -> Result<(), MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let node = self.resolve(&txn, path)?;
        let mut attrs = self.tables.xattr.find(&txn, node.inode_id)?;
        attrs.insert(name.to_vec(), value.to_vec());
        self.tables.xattr.insert(&mut txn, node.inode_id, &attrs)?;
        txn.commit()?;
        Ok(())
    }

    /// Value of one extended attribute.
    pub fn get_xattr(&self, path: &str, name: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let txn = self.db.read();
        let node = self.resolve(&txn, path)?;
        Ok(self.tables.xattr.find(&txn, node.inode_id)?.remove(name))
    }

    /// Every extended attribute.
    pub fn list_xattr(&self, path: &str) -> Result<XattrMap, MetaError> {
        let txn = self.db.read();
        let node = self.resolve(&txn, path)?;
        self.tables.xattr.find(&txn, node.inode_id)
    }

    /// Removes one extended attribute. Returns whether it was set.
    pub fn remove_xattr(&self, path: &str, name: &[u8]) -> Result<bool, MetaError> {
        let now = Timestamp::now();
        let mut txn = self.begin_write(now)?;
        let node = self.resolve(&txn, path)?;
        let mut attrs = self.tables.xattr.find(&txn, node.inode_id)?;
        let existed = attrs.remove(name).is_some();
        if existed {
            self.tables.xattr.insert(&mut txn, node.inode_id, &attrs)?;
            txn.commit()?;
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_skip_empty_and_dot() {
        assert_eq!(components("/a//b/./c/"), vec!["a", "b", "c"]);
        assert!(components("/").is_empty());
    }

    #[test]
    fn test_split_leaf() {
        let (parts, leaf) = split_leaf("/a/b/c").unwrap();
        assert_eq!(parts, vec!["a", "b"]);
        assert_eq!(leaf, "c");
        assert!(matches!(split_leaf("/"), Err(MetaError::InvalidName(_))));
        assert!(matches!(split_leaf("/a/.."), Err(MetaError::InvalidName(_))));
    }
}
