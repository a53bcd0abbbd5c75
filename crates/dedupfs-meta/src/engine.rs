//! Wiring of the store, block pool and subvolume manager into one handle.

use std::sync::Arc;

use tracing::{info, warn};

use dedupfs_reduce::CompressionRegistry;

use crate::block_store::BlockStore;
use crate::config::EngineConfig;
use crate::gc::GarbageCollector;
use crate::kvstore::Database;
use crate::namespace::Namespace;
use crate::subvolume::SubvolumeManager;
use crate::table::option::BLOCK_SIZE;
use crate::table::GlobalTables;
use crate::types::MetaError;

/// An opened dedupfs store.
pub struct Engine {
    config: EngineConfig,
    db: Arc<Database>,
    blocks: Arc<BlockStore>,
    subvolumes: SubvolumeManager,
}

impl Engine {
    /// Opens the store described by `config`, creating the global tables on
    /// first use.
    ///
    /// The block size is fixed when the store is created. Reopening with a
    /// different `block_size` keeps the stored one.
    pub fn open(mut config: EngineConfig) -> Result<Self, MetaError> {
        config.validate()?;
        let registry = CompressionRegistry::builtin();
        let plan = config.compression_plan(&registry)?;

        let db = Arc::new(match &config.data_path {
            Some(path) => Database::open(path)?,
            None => Database::in_memory(),
        });
        let tables = GlobalTables::new()?;
        let mut txn = db.write();
        tables.create_all(&mut txn)?;
        match tables.option.get_u64(&txn, BLOCK_SIZE)? {
            Some(stored) => {
                let stored = usize::try_from(stored)
                    .ok()
                    .filter(|size| *size > 0)
                    .ok_or_else(|| MetaError::InvalidConfig(format!("stored block_size {} unusable", stored)))?;
                if stored != config.block_size {
                    warn!(
                        configured = config.block_size,
                        stored, "block size is fixed at creation, using stored value"
                    );
                    config.block_size = stored;
                }
            }
            None => tables
                .option
                .set(&mut txn, BLOCK_SIZE, &config.block_size.to_string())?,
        }
        txn.commit()?;

        let blocks = Arc::new(BlockStore::new(registry, plan)?);
        let subvolumes = SubvolumeManager::new(Arc::clone(&db), Arc::clone(&blocks))?;
        info!(
            path = ?config.data_path,
            block_size = config.block_size,
            keys = db.key_count(),
            "opened store"
        );
        Ok(Self {
            config,
            db,
            blocks,
            subvolumes,
        })
    }

    /// In-memory store with default options.
    pub fn in_memory() -> Result<Self, MetaError> {
        Self::open(EngineConfig::default())
    }

    /// Options the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Underlying key-value store.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Shared block pool.
    pub fn blocks(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    /// Subvolume lifecycle operations.
    pub fn subvolumes(&self) -> &SubvolumeManager {
        &self.subvolumes
    }

    /// Path-level view of the subvolume `name`.
    pub fn namespace(&self, name: &[u8]) -> Result<Namespace, MetaError> {
        let record = self.subvolumes.get(name)?;
        Namespace::new(
            Arc::clone(&self.db),
            Arc::clone(&self.blocks),
            &record,
            self.config.block_size,
        )
    }

    /// Collector over this store.
    pub fn gc(&self) -> Result<GarbageCollector<'_>, MetaError> {
        GarbageCollector::new(&self.db, &self.blocks, &self.subvolumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;

    #[test]
    fn test_open_creates_global_tables() {
        let engine = Engine::in_memory().unwrap();
        let tables = GlobalTables::new().unwrap();
        let txn = engine.database().read();
        assert!(tables.subvolume.exists(&txn).unwrap());
        assert!(tables.tmp_ids.exists(&txn).unwrap());
    }

    #[test]
    fn test_invalid_config_refused() {
        let config = EngineConfig {
            compression: vec!["brotli".to_string()],
            ..Default::default()
        };
        assert!(Engine::open(config).is_err());
    }

    #[test]
    fn test_block_size_recorded_on_create() {
        let engine = Engine::open(EngineConfig {
            block_size: 4096,
            ..Default::default()
        })
        .unwrap();
        let tables = GlobalTables::new().unwrap();
        let txn = engine.database().read();
        assert_eq!(tables.option.get_u64(&txn, BLOCK_SIZE).unwrap(), Some(4096));
        assert_eq!(engine.config().block_size, 4096);
    }

    #[test]
    fn test_namespace_of_missing_subvolume() {
        let engine = Engine::in_memory().unwrap();
        assert!(matches!(
            engine.namespace(b"nope"),
            Err(MetaError::SubvolumeNotFound(_))
        ));
    }
}
