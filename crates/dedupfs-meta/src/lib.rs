#![warn(missing_docs)]

//! dedupfs metadata subsystem: transactional key-value store, relational tables, block store, subvolumes
//!
//! Write path: Namespace → Block split → BlockStore (fingerprint, dedupe, compress) → inode_hash_block index
//! Read path:  Namespace → inode_hash_block index → BlockStore (decompress, verify size) → Block

pub mod block_store;
pub mod config;
pub mod engine;
pub mod gc;
pub mod kvstore;
pub mod namespace;
pub mod subvolume;
pub mod table;
pub mod types;
pub mod usage;

pub use block_store::{BlockStore, BlockStoreStats, StoredBlock};
pub use config::{EngineConfig, DEFAULT_BLOCK_SIZE};
pub use engine::Engine;
pub use gc::{GarbageCollector, GcStats};
pub use kvstore::{Database, KvRead, ReadTxn, WriteTxn};
pub use namespace::{DirEntry, Namespace};
pub use subvolume::{
    RemoveReport, StepOutcome, SubvolumeListing, SubvolumeManager, TeardownStep, ROOT_PERMISSIONS,
};
pub use table::subvolume::SubvolumeRecord;
pub use table::{GlobalTables, SubvolumeTables, TableName};
pub use types::{
    ErrorKind, FileType, HashId, InodeId, MetaError, NameId, NodeId, SubvolumeId, Timestamp,
};
pub use usage::{compute_usage, UsageReport};
