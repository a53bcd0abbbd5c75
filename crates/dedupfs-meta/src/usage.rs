//! Space accounting for one subvolume.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::block_store::BlockStore;
use crate::kvstore::KvRead;
use crate::table::hash_sizes::HashSizes;
use crate::table::SubvolumeTables;
use crate::types::{HashId, MetaError};

/// Space used by one subvolume.
///
/// `unique_size` counts each hash once per computation: it is the deduplicated
/// size of this subvolume's own working set, not space that would be freed by
/// removing it (other subvolumes may share the same hashes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    /// Sum of inode sizes
    pub apparent_size: u64,
    /// Sum of real sizes over every block reference
    pub data_size: u64,
    /// Sum of real sizes over distinct hashes
    pub unique_size: u64,
    /// `data_size - unique_size`
    pub dedup_size: u64,
    /// `apparent_size - data_size`; negative only for inconsistent metadata
    pub sparse_size: i64,
    /// Sum of stored sizes over every block reference
    pub compressed_size: u64,
    /// Sum of stored sizes over distinct hashes
    pub compressed_unique_size: u64,
    /// Block references per compression method, when requested
    pub compression_types: BTreeMap<String, u64>,
}

impl UsageReport {
    /// Total block references counted in `compression_types`.
    pub fn compression_types_total(&self) -> u64 {
        self.compression_types.values().sum()
    }

    /// Methods by descending block count, with their share in percent.
    pub fn compression_shares(&self) -> Vec<(String, f64)> {
        let total = self.compression_types_total();
        if total == 0 {
            return Vec::new();
        }
        let mut shares: Vec<(String, f64)> = self
            .compression_types
            .iter()
            .map(|(method, count)| (method.clone(), *count as f64 * 100.0 / total as f64))
            .collect();
        shares.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        shares
    }

    /// True when blocks account for more bytes than the inodes claim.
    pub fn is_inconsistent(&self) -> bool {
        self.sparse_size < 0
    }
}

/// Walks every block reference of a subvolume and sums the recorded sizes.
pub fn compute_usage(
    txn: &impl KvRead,
    blocks: &BlockStore,
    subvol: &SubvolumeTables,
    with_types: bool,
) -> Result<UsageReport, MetaError> {
    let mut sizes: HashMap<HashId, Option<HashSizes>> = HashMap::new();
    let mut methods: HashMap<HashId, String> = HashMap::new();
    let mut report = UsageReport::default();

    for hash_id in subvol.inode_hash_block.get_hash_ids(txn)? {
        if with_types {
            let method = match methods.get(&hash_id) {
                Some(method) => Some(method.clone()),
                None => match blocks.compression_method(txn, hash_id) {
                    Ok(method) => {
                        methods.insert(hash_id, method.clone());
                        Some(method)
                    }
                    Err(MetaError::HashNotFound(_)) => None,
                    Err(e) => return Err(e),
                },
            };
            if let Some(method) = method {
                *report.compression_types.entry(method).or_insert(0) += 1;
            }
        }

        let entry = match sizes.get(&hash_id) {
            Some(entry) => *entry,
            None => {
                let entry = blocks.hash_sizes(txn, hash_id)?;
                if let Some(s) = entry {
                    report.unique_size += s.real_size;
                    report.compressed_unique_size += s.compressed_size;
                }
                sizes.insert(hash_id, entry);
                entry
            }
        };
        if let Some(s) = entry {
            report.data_size += s.real_size;
            report.compressed_size += s.compressed_size;
        }
    }

    report.apparent_size = subvol.inode.get_sizes(txn)?;
    report.dedup_size = report.data_size - report.unique_size;
    report.sparse_size = report.apparent_size as i64 - report.data_size as i64;
    if report.is_inconsistent() {
        warn!(
            apparent = report.apparent_size,
            data = report.data_size,
            "block data exceeds apparent size"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shares_sorted_descending() {
        let mut report = UsageReport::default();
        report.compression_types.insert("lz4".into(), 1);
        report.compression_types.insert("zstd".into(), 3);
        let shares = report.compression_shares();
        assert_eq!(shares[0].0, "zstd");
        assert!((shares[0].1 - 75.0).abs() < 1e-9);
        assert_eq!(report.compression_types_total(), 4);
    }

    #[test]
    fn test_empty_report_has_no_shares() {
        assert!(UsageReport::default().compression_shares().is_empty());
        assert!(!UsageReport::default().is_inconsistent());
    }
}
