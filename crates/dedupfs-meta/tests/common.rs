//! Shared fixtures for the dedupfs-meta integration tests.

#![allow(dead_code)]

use dedupfs_meta::table::Table;
use dedupfs_meta::{Engine, EngineConfig, GlobalTables, KvRead, SubvolumeTables};

/// Block size used by the fixtures; small enough to make multi-block files cheap.
pub const TEST_BLOCK_SIZE: usize = 4096;

/// In-memory engine with [`TEST_BLOCK_SIZE`] blocks.
pub fn engine() -> Engine {
    Engine::open(EngineConfig {
        block_size: TEST_BLOCK_SIZE,
        ..Default::default()
    })
    .unwrap()
}

/// Engine with one subvolume `name` already created.
pub fn engine_with(name: &[u8]) -> Engine {
    let engine = engine();
    engine.subvolumes().create(name).unwrap();
    engine
}

/// Deterministic, poorly compressible block content.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    let mut state = seed as u32 | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// Rows in the global `hash` table.
pub fn hash_count(engine: &Engine) -> usize {
    let tables = GlobalTables::new().unwrap();
    tables.hash.count(&engine.database().read()).unwrap()
}

/// Rows in the global `block` table.
pub fn block_count(engine: &Engine) -> usize {
    let tables = GlobalTables::new().unwrap();
    tables.block.count(&engine.database().read()).unwrap()
}

/// Keys stored under any of the subvolume's five tables, catalog entries
/// included.
pub fn subvolume_key_count(engine: &Engine, hash: &str) -> usize {
    let sv = SubvolumeTables::new(hash).unwrap();
    let txn = engine.database().read();
    let names = [
        sv.tree.name().to_string(),
        sv.inode.name().to_string(),
        sv.inode_hash_block.name().to_string(),
        sv.xattr.name().to_string(),
        sv.link.name().to_string(),
    ];
    names
        .iter()
        .map(|name| {
            let rows = txn.scan_prefix(format!("t/{}/", name).as_bytes()).unwrap().len();
            let catalog = txn.scan_prefix(format!("c/{}", name).as_bytes()).unwrap().len();
            rows + catalog
        })
        .sum()
}
